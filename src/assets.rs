//! Static asset helpers: content-type guessing and the placeholders served
//! when no agent can supply the real file.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Path prefixes the relay proxies as static assets.
pub const STATIC_PREFIXES: &[&str] = &["/static/", "/media/", "/admin/static/", "/files/"];

/// Extensions treated as static assets wherever they appear.
const STATIC_EXTENSIONS: &[&str] = &[
    "css", "js", "png", "jpg", "jpeg", "gif", "svg", "ico", "woff", "woff2", "ttf", "eot", "map",
    "webp", "avif",
];

const PIXEL_PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

pub fn is_static_path(path: &str) -> bool {
    STATIC_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Should a tunneled path go through the static proxy instead of the
/// request/response path?
pub fn is_static_asset(path: &str) -> bool {
    let lower = extension(path).to_ascii_lowercase();
    STATIC_EXTENSIONS.contains(&lower.as_str())
        || STATIC_PREFIXES.iter().any(|p| path.contains(p))
}

fn extension(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    path.rsplit_once('.')
        .filter(|(_, ext)| !ext.contains('/'))
        .map_or("", |(_, ext)| ext)
}

pub fn guess_content_type(path: &str) -> &'static str {
    match extension(path).to_ascii_lowercase().as_str() {
        "css" => "text/css; charset=utf-8",
        "js" => "application/javascript; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "eot" => "application/vnd.ms-fontobject",
        _ => "application/octet-stream",
    }
}

/// Stand-in response for an asset the agent could not deliver in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

pub fn placeholder(path: &str) -> Placeholder {
    let content_type = guess_content_type(path);
    let (status, body) = match extension(path).to_ascii_lowercase().as_str() {
        "css" => (
            200,
            b"/* Placeholder CSS */\nbody { visibility: visible !important; }".to_vec(),
        ),
        "js" => (
            200,
            b"// Placeholder JS\nconsole.log(\"Static placeholder\");".to_vec(),
        ),
        "png" | "jpg" | "jpeg" | "gif" | "svg" | "ico" => {
            (200, STANDARD.decode(PIXEL_PNG).unwrap_or_default())
        }
        _ => (404, b"Static file not available".to_vec()),
    };
    Placeholder {
        status,
        content_type,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(guess_content_type("/static/css/main.min.css"), "text/css; charset=utf-8");
        assert_eq!(guess_content_type("/media/a.JPEG?v=2"), "image/jpeg");
        assert_eq!(guess_content_type("/files/archive"), "application/octet-stream");
        assert_eq!(guess_content_type("/v1.2/file"), "application/octet-stream");
    }

    #[test]
    fn placeholders() {
        let css = placeholder("/static/site.css");
        assert_eq!(css.status, 200);
        assert!(css.body.starts_with(b"/* Placeholder CSS */"));

        let img = placeholder("/media/logo.png");
        assert_eq!(&img.body[1..4], b"PNG");

        assert_eq!(placeholder("/files/report.pdf").status, 404);
    }

    #[test]
    fn static_prefixes() {
        assert!(is_static_path("/admin/static/wagtailadmin/x.js"));
        assert!(!is_static_path("/admin/pages/"));
        assert!(is_static_asset("/cms/static/app.js"));
        assert!(is_static_asset("/bundle.js.map"));
        assert!(!is_static_asset("/admin/pages/"));
    }
}
