//! Cookie hand-off between the local app, the agent and the browser.
//!
//! Set-Cookie values ride in frame metadata (never in the payload), so they
//! survive whatever codec sealed the body.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::frame::META_COOKIES;

/// Attribute names that may follow a comma inside a single Set-Cookie value.
const ATTRIBUTES: &[&str] = &[
    "expires",
    "max-age",
    "path",
    "domain",
    "secure",
    "httponly",
    "samesite",
    "priority",
    "partitioned",
];

/// Split one or more raw `Set-Cookie` header values into individual cookies.
///
/// A combined value is split only at a comma that starts a new `name=` pair.
/// Commas inside `Expires=Wed, 09 Jun ...` or followed by an attribute keyword
/// stay with the cookie they belong to.
pub fn extract_set_cookies<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .flat_map(|v| split_set_cookie(v.as_ref()))
        .collect()
}

fn split_set_cookie(raw: &str) -> Vec<String> {
    let mut cookies: Vec<String> = Vec::new();
    let mut current = String::new();
    for (i, part) in raw.split(',').enumerate() {
        if i > 0 && starts_new_cookie(part) {
            push_trimmed(&mut cookies, &current);
            current.clear();
        } else if i > 0 {
            current.push(',');
        }
        current.push_str(part);
    }
    push_trimmed(&mut cookies, &current);
    cookies
}

fn push_trimmed(out: &mut Vec<String>, cookie: &str) {
    let cookie = cookie.trim();
    if !cookie.is_empty() {
        out.push(cookie.to_string());
    }
}

fn starts_new_cookie(segment: &str) -> bool {
    let segment = segment.trim_start();
    let Some((name, _)) = segment.split_once('=') else {
        return false;
    };
    let is_token = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && !matches!(b, b';' | b',' | b'"'));
    is_token && !ATTRIBUTES.contains(&name.to_ascii_lowercase().as_str())
}

/// `name=value` of a Set-Cookie string, without attributes.
pub fn cookie_pair(set_cookie: &str) -> Option<(&str, &str)> {
    let pair = set_cookie.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    (!name.is_empty()).then(|| (name, value.trim()))
}

/// Parse a `Cookie` request header into ordered pairs.
pub fn parse_cookie_header(header: &str) -> Vec<(&str, &str)> {
    header
        .split(';')
        .filter_map(|c| {
            let (name, value) = c.trim().split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name, value.trim()))
        })
        .collect()
}

/// Merge a forwarded `Cookie` header with cookies from the jar.
///
/// Jar cookies come first and win over same-named request cookies; every
/// name appears once.
pub fn merge_cookies(existing: Option<&str>, jar: &str) -> String {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for (name, value) in parse_cookie_header(jar)
        .into_iter()
        .chain(existing.map(parse_cookie_header).unwrap_or_default())
    {
        if seen.insert(name) {
            merged.push(format!("{name}={value}"));
        }
    }
    merged.join("; ")
}

/// Store Set-Cookie strings in frame metadata as a JSON array.
pub fn attach_to_metadata(metadata: &mut BTreeMap<String, String>, cookies: &[String]) {
    if cookies.is_empty() {
        return;
    }
    if let Ok(json) = serde_json::to_string(cookies) {
        metadata.insert(META_COOKIES.to_string(), json);
    }
}

/// Read Set-Cookie strings from frame metadata. A plain string (not a JSON
/// array) is treated as a combined header value.
pub fn from_metadata(metadata: &BTreeMap<String, String>) -> Vec<String> {
    let Some(raw) = metadata.get(META_COOKIES) else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(list) => list,
        Err(_) => extract_set_cookies([raw]),
    }
}

/// The agent's cookie store. Insertion order is kept so the `Cookie` header
/// it builds is stable.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    cookies: Vec<(String, String)>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: &str) {
        match self.cookies.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.cookies.push((name.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Record every cookie from a local-app response.
    pub fn store_all(&mut self, set_cookies: &[String]) {
        for raw in set_cookies {
            if let Some((name, value)) = cookie_pair(raw) {
                if !value.is_empty() {
                    self.set(name, value);
                }
            }
        }
        debug!(cookies = self.len(), "Cookie jar updated");
    }

    /// Copy the named cookies out of a browser's `Cookie` header.
    pub fn import(&mut self, cookie_header: &str, names: &[&str]) -> usize {
        let mut imported = 0;
        for (name, value) in parse_cookie_header(cookie_header) {
            if names.contains(&name) && !value.is_empty() {
                self.set(name, value);
                imported += 1;
            }
        }
        imported
    }

    /// `Cookie` header built from the jar, skipping placeholder values.
    pub fn header(&self) -> Option<String> {
        let parts: Vec<String> = self
            .cookies
            .iter()
            .filter(|(_, v)| !matches!(v.trim(), "" | "undefined" | "null"))
            .map(|(n, v)| format!("{n}={v}"))
            .collect();
        (!parts.is_empty()).then(|| parts.join("; "))
    }
}
