//! Replays relayed requests against the local app.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, COOKIE, SET_COOKIE};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use super::BoxError;
use crate::cookies::{self, CookieJar};
use crate::messages::{header_pairs, headers_to_json, HttpRequest, HttpResponse};

/// Browser cookies worth keeping across requests.
const SESSION_COOKIES: &[&str] = &["sessionid", "csrftoken"];

/// Request headers rebuilt or dropped before replay.
const SKIPPED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "accept-encoding",
    "cookie",
    "transfer-encoding",
];

pub type HttpClient = Client<HttpConnector, Full<Bytes>>;

pub fn http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// What the local app answered.
#[derive(Debug, Clone)]
pub struct LocalResponse {
    pub response: HttpResponse,
    /// Every `Set-Cookie` the app sent, one cookie per entry.
    pub set_cookies: Vec<String>,
}

pub struct LocalApp {
    client: HttpClient,
    base_url: String,
    timeout: Duration,
    jar: Mutex<CookieJar>,
}

impl LocalApp {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            jar: Mutex::new(CookieJar::new()),
        }
    }

    fn jar(&self) -> std::sync::MutexGuard<'_, CookieJar> {
        self.jar.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.jar().get(name).map(str::to_string)
    }

    /// The `Cookie` header sent upstream: jar cookies first, then whatever
    /// the browser sent that the jar does not override.
    fn cookie_header(&self, browser_cookies: Option<&str>) -> Option<String> {
        let mut jar = self.jar();
        if let Some(raw) = browser_cookies {
            let imported = jar.import(raw, SESSION_COOKIES);
            if imported > 0 {
                debug!(imported, "Session cookies taken from browser");
            }
        }
        let merged = cookies::merge_cookies(browser_cookies, &jar.header().unwrap_or_default());
        (!merged.is_empty()).then_some(merged)
    }

    /// Execute `request` against the local app. `meta_cookie` is the
    /// browser's `Cookie` header as carried in frame metadata, used when the
    /// request headers lack one.
    pub async fn execute(
        &self,
        request: &HttpRequest,
        meta_cookie: Option<&str>,
    ) -> Result<LocalResponse, BoxError> {
        let headers = header_pairs(&request.headers);
        let browser_cookies = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("cookie"))
            .map(|(_, v)| v.as_str())
            .or(meta_cookie);

        let uri = local_url(&self.base_url, &request.path, &request.query)?;
        let method = if request.method.is_empty() {
            "GET"
        } else {
            request.method.as_str()
        };
        let mut builder = hyper::Request::builder().method(method).uri(uri.as_str());
        for (name, value) in &headers {
            if SKIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => debug!(header = %name, "Skipped unrepresentable request header"),
            }
        }
        if let Some(cookie) = self.cookie_header(browser_cookies) {
            builder = builder.header(COOKIE, cookie);
        }
        let req = builder.body(Full::new(Bytes::from(request.body.clone())))?;

        debug!(request_id = %request.request_id, method, uri = %uri, "Replaying request locally");
        let resp = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| format!("local app did not answer within {:?}", self.timeout))??;

        let status = resp.status();
        let set_cookies = cookies::extract_set_cookies(
            resp.headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );
        let header_json = headers_to_json(
            resp.headers()
                .iter()
                .filter(|(name, _)| **name != SET_COOKIE)
                .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
        );
        let body = resp.into_body().collect().await?.to_bytes().to_vec();

        if !set_cookies.is_empty() {
            self.jar().store_all(&set_cookies);
        }

        Ok(LocalResponse {
            response: HttpResponse {
                request_id: request.request_id.clone(),
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                headers: header_json,
                body,
            },
            set_cookies,
        })
    }
}

fn local_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

/// Local app URL for `path`, with the query rebuilt from the JSON object
/// the relay sends.
fn local_url(base_url: &str, path: &str, query: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&format!("{base_url}{}", local_path(path)))?;
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(query) {
        let mut pairs = flatten(&map).peekable();
        if pairs.peek().is_some() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
    }
    Ok(url)
}

fn flatten(map: &Map<String, Value>) -> impl Iterator<Item = (&str, String)> {
    map.iter().flat_map(|(k, v)| {
        let values: Vec<String> = match v {
            Value::Array(items) => items.iter().map(scalar).collect(),
            other => vec![scalar(other)],
        };
        values.into_iter().map(move |v| (k.as_str(), v))
    })
}

fn scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;

    async fn echo(headers: HeaderMap, uri: axum::http::Uri) -> impl IntoResponse {
        let cookie = headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        (
            [
                ("set-cookie", "sessionid=fresh; Path=/; HttpOnly"),
                ("x-echo-uri", "yes"),
            ],
            format!("{}|{cookie}", uri),
        )
    }

    async fn serve_local_app() -> String {
        let app = Router::new().route("/{*path}", get(echo));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn query_rebuilt_from_json() {
        let url = |query| local_url("http://127.0.0.1:8000", "search", query).unwrap();
        assert_eq!(
            url(r#"{"page":"2","q":"a b&c=d"}"#).as_str(),
            "http://127.0.0.1:8000/search?page=2&q=a+b%26c%3Dd"
        );
        assert_eq!(
            url(r#"{"tag":["x","y"],"empty":null}"#).query(),
            Some("empty=&tag=x&tag=y")
        );
        assert_eq!(url("{}").as_str(), "http://127.0.0.1:8000/search");
        assert_eq!(url("").query(), None);
    }

    #[test]
    fn bad_base_url_is_an_error() {
        assert!(local_url("not a url", "/", "").is_err());
    }

    #[tokio::test]
    async fn replays_with_merged_cookies_and_collects_set_cookie() {
        let base = serve_local_app().await;
        let app = LocalApp::new(&base, Duration::from_secs(5));
        let request = HttpRequest {
            request_id: "req_1".to_string(),
            method: "GET".to_string(),
            path: "/notes/".to_string(),
            headers: headers_to_json([
                ("Cookie", "csrftoken=tok; theme=dark"),
                ("Host", "relay.example"),
            ]),
            body: Vec::new(),
            query: r#"{"page":"3"}"#.to_string(),
        };

        let local = app.execute(&request, None).await.unwrap();
        assert_eq!(local.response.request_id, "req_1");
        assert_eq!(local.response.status, 200);
        assert_eq!(local.set_cookies, vec!["sessionid=fresh; Path=/; HttpOnly"]);
        let body = String::from_utf8(local.response.body).unwrap();
        assert_eq!(body, "/notes/?page=3|csrftoken=tok; theme=dark");
        assert!(!header_pairs(&local.response.headers)
            .iter()
            .any(|(n, _)| n == "set-cookie"));
        assert_eq!(app.cookie("sessionid").as_deref(), Some("fresh"));

        // the jar now leads the Cookie header
        let again = app.execute(&request, None).await.unwrap();
        let body = String::from_utf8(again.response.body).unwrap();
        assert_eq!(body, "/notes/?page=3|csrftoken=tok; sessionid=fresh; theme=dark");
    }

    #[tokio::test]
    async fn metadata_cookie_is_used_when_headers_have_none() {
        let base = serve_local_app().await;
        let app = LocalApp::new(&base, Duration::from_secs(5));
        let request = HttpRequest {
            request_id: "req_2".to_string(),
            method: "GET".to_string(),
            path: "admin/".to_string(),
            ..Default::default()
        };
        let local = app.execute(&request, Some("sessionid=s9")).await.unwrap();
        let body = String::from_utf8(local.response.body).unwrap();
        assert_eq!(body, "/admin/|sessionid=s9");
    }

    #[tokio::test]
    async fn unreachable_app_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let app = LocalApp::new(&format!("http://{addr}"), Duration::from_secs(2));
        let request = HttpRequest {
            request_id: "req_3".to_string(),
            method: "GET".to_string(),
            path: "/".to_string(),
            ..Default::default()
        };
        assert!(app.execute(&request, None).await.is_err());
    }
}
