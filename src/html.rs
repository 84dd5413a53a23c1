//! Hook for rewriting dynamic HTML before it reaches the browser.
//!
//! The relay does not inject anything itself; deployments that bootstrap a
//! browser-side interceptor plug in their own [`HtmlRewriter`].

use std::sync::Arc;

pub trait HtmlRewriter: Send + Sync {
    fn rewrite(&self, html: &str, request_id: &str) -> String;
}

/// Returns the document unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl HtmlRewriter for PassThrough {
    fn rewrite(&self, html: &str, _request_id: &str) -> String {
        html.to_string()
    }
}

pub type SharedRewriter = Arc<dyn HtmlRewriter>;

pub fn pass_through() -> SharedRewriter {
    Arc::new(PassThrough)
}

/// Is this `Content-Type` an HTML document?
pub fn is_html(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_is_identity() {
        assert_eq!(PassThrough.rewrite("<p>hi</p>", "r1"), "<p>hi</p>");
    }

    #[test]
    fn html_detection_ignores_parameters() {
        assert!(is_html("text/html; charset=utf-8"));
        assert!(is_html("TEXT/HTML"));
        assert!(!is_html("application/json"));
    }
}
