//! HTTP surface of the relay.
//!
//! The three `tunnel.TunnelService` methods speak gRPC-Web framing around
//! JSON messages. Everything else is plain JSON or a relayed response.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use url::Url;

use super::{BrowserRequest, Relay, RelayError};
use crate::clock;
use crate::correlation::{RelayedResponse, SyncStatus};
use crate::messages::{
    grpc_web_error, grpc_web_unwrap, grpc_web_wrap, PollRequest, RegistrationRequest,
    SendFrameRequest, GRPC_WEB_CONTENT_TYPE,
};

/// Cookie carrying a browser's relay identity.
pub const SESSION_COOKIE: &str = "tunnel_client_id";
/// Header carrying a browser's relay identity.
pub const CLIENT_ID_HEADER: &str = "x-tunnel-client-id";

const SESSION_MAX_AGE_SECS: i64 = 24 * 60 * 60;

pub fn router(relay: Arc<Relay>, max_connections: usize) -> Router {
    Router::new()
        .route("/tunnel.TunnelService/Register", post(grpc_register))
        .route("/tunnel.TunnelService/SendFrame", post(grpc_send_frame))
        .route("/tunnel.TunnelService/PollFrames", post(grpc_poll_frames))
        .route("/api/register-browser", post(register_browser))
        .route("/api/restore-session", get(restore_session))
        .route("/api/sync-session", post(sync_session))
        .route("/api/sync-status/{request_id}", get(sync_status))
        .route("/tunnel", any(tunnel_proxy))
        .route("/tunnel/", any(tunnel_proxy))
        .route("/tunnel/{*path}", any(tunnel_proxy))
        .route("/static/{*path}", get(static_asset))
        .route("/media/{*path}", get(static_asset))
        .route("/admin/static/{*path}", get(static_asset))
        .route("/files/{*path}", get(static_asset))
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/favicon.ico", get(favicon))
        .layer(ConcurrencyLimitLayer::new(max_connections.max(1)))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

// --- gRPC-Web -------------------------------------------------------------

fn grpc_reply(body: Vec<u8>, status: u32) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, GRPC_WEB_CONTENT_TYPE)
        .header("grpc-status", status.to_string())
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn grpc_ok<T: Serialize>(message: &T) -> Response {
    match serde_json::to_vec(message) {
        Ok(bytes) => grpc_reply(grpc_web_wrap(&bytes), 0),
        Err(e) => grpc_reply(grpc_web_error(13, &e.to_string()), 13),
    }
}

fn grpc_failure(err: &RelayError) -> Response {
    let status = err.grpc_status();
    grpc_reply(grpc_web_error(status, &err.to_string()), status)
}

fn grpc_decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response> {
    serde_json::from_slice(grpc_web_unwrap(body)).map_err(|e| {
        warn!(error = %e, "Undecodable gRPC-Web message");
        grpc_failure(&RelayError::from(e))
    })
}

async fn grpc_register(State(relay): State<Arc<Relay>>, body: Bytes) -> Response {
    let req: RegistrationRequest = match grpc_decode(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    grpc_ok(&relay.register(req).await)
}

async fn grpc_send_frame(State(relay): State<Arc<Relay>>, body: Bytes) -> Response {
    let req: SendFrameRequest = match grpc_decode(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match relay.send_frame(req).await {
        Ok(ack) => grpc_ok(&ack),
        Err(e) => grpc_failure(&e),
    }
}

async fn grpc_poll_frames(State(relay): State<Arc<Relay>>, body: Bytes) -> Response {
    let req: PollRequest = match grpc_decode(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    grpc_ok(&relay.poll(req).await)
}

// --- browser sessions -----------------------------------------------------

/// Readable by page scripts, so no `HttpOnly`.
fn session_cookie(client_id: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, client_id))
        .path("/")
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(SESSION_MAX_AGE_SECS))
        .build()
}

fn cleared_session_cookie() -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .same_site(SameSite::Lax)
        .max_age(time::Duration::ZERO)
        .build()
}

fn session_id(jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE).map(|c| c.value().to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn register_browser(State(relay): State<Arc<Relay>>, jar: CookieJar) -> Response {
    let record = relay.register_browser().await;
    (
        jar.add(session_cookie(record.id.clone())),
        Json(json!({
            "clientId": record.id,
            "success": true,
            "message": "Browser registration successful",
            "timestamp": clock::unix_ms(),
        })),
    )
        .into_response()
}

async fn restore_session(
    State(relay): State<Arc<Relay>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Response {
    let Some(client_id) =
        session_id(&jar).or_else(|| header_value(&headers, CLIENT_ID_HEADER))
    else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "No session found", "code": "NO_SESSION"})),
        )
            .into_response();
    };

    match relay.restore_session(&client_id).await {
        Ok(record) => Json(json!({
            "success": true,
            "clientId": record.id,
            "type": record.role,
            "connectedAt": record.registered_at_ms,
            "timestamp": clock::unix_ms(),
        }))
        .into_response(),
        Err(e) => {
            debug!(client_id = %client_id, error = %e, "Session not restored");
            (
                StatusCode::NOT_FOUND,
                jar.add(cleared_session_cookie()),
                Json(json!({"error": "Session expired", "code": "SESSION_EXPIRED"})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct SyncSessionBody {
    #[serde(rename = "clientId", default)]
    client_id: Option<String>,
}

async fn sync_session(
    State(relay): State<Arc<Relay>>,
    Json(body): Json<SyncSessionBody>,
) -> Response {
    let Some(client_id) = body.client_id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "clientId is required", "code": "MISSING_CLIENT_ID"})),
        )
            .into_response();
    };
    match relay.sync_session(&client_id).await {
        Ok(started) => Json(json!({
            "success": true,
            "message": "Session sync initiated",
            "requestId": started.request_id,
            "laptopId": started.agent_id,
            "timestamp": clock::unix_ms(),
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn sync_status(
    State(relay): State<Arc<Relay>>,
    Path(request_id): Path<String>,
) -> Json<serde_json::Value> {
    let status = match relay.sync_status(&request_id) {
        SyncStatus::Pending => "pending",
        SyncStatus::Completed => "completed",
    };
    Json(json!({
        "requestId": request_id,
        "status": status,
        "timestamp": clock::unix_ms(),
    }))
}

// --- tunneled traffic -----------------------------------------------------

/// Where a `/tunnel/*` request's browser identity came from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Identity {
    Declared(String),
    /// No identity on the request; the most recent browser was assumed.
    Adopted(String),
}

impl Identity {
    fn id(&self) -> &str {
        match self {
            Self::Declared(id) | Self::Adopted(id) => id,
        }
    }
}

/// `client_id` from the query string of the `Referer` URL.
fn referer_client_id(headers: &HeaderMap) -> Option<String> {
    let referer = headers.get(header::REFERER)?.to_str().ok()?;
    Url::parse(referer)
        .ok()?
        .query_pairs()
        .find(|(name, _)| name == "client_id")
        .map(|(_, value)| value.into_owned())
}

async fn resolve_browser(
    relay: &Relay,
    jar: &CookieJar,
    headers: &HeaderMap,
    query: &[(String, String)],
) -> Result<Identity, RelayError> {
    let candidates = [
        header_value(headers, CLIENT_ID_HEADER),
        query
            .iter()
            .find(|(n, _)| n == "client_id")
            .map(|(_, v)| v.clone()),
        session_id(jar),
        referer_client_id(headers),
    ];
    if let Some(id) = candidates.into_iter().flatten().find(|id| !id.is_empty()) {
        return Ok(Identity::Declared(id));
    }
    match relay.registry().find_any_browser().await {
        Some(browser) => {
            info!(browser = %browser.id, "Anonymous tunnel request, adopting most recent browser");
            Ok(Identity::Adopted(browser.id))
        }
        None => Err(RelayError::NoBrowserClient),
    }
}

fn header_list(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn into_http(relayed: RelayedResponse) -> Response {
    let status = StatusCode::from_u16(relayed.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(relayed.body));
    *response.status_mut() = status;
    let out = response.headers_mut();
    for (name, value) in &relayed.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                out.append(name, value);
            }
            _ => debug!(header = %name, "Dropped unrepresentable response header"),
        }
    }
    response
}

/// Tell a browser which identity it was given so later requests declare it.
fn announce_identity(jar: CookieJar, mut response: Response, client_id: String) -> Response {
    if let Ok(value) = HeaderValue::from_str(&client_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(CLIENT_ID_HEADER), value);
    }
    (jar.add(session_cookie(client_id)), response).into_response()
}

async fn tunnel_proxy(
    State(relay): State<Arc<Relay>>,
    method: Method,
    uri: Uri,
    Query(query): Query<Vec<(String, String)>>,
    jar: CookieJar,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let identity = match resolve_browser(&relay, &jar, &headers, &query).await {
        Ok(identity) => identity,
        Err(RelayError::NoBrowserClient) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "No tunnel client",
                    "code": "NO_TUNNEL_CLIENT",
                    "message": "Please connect to tunnel first by visiting the homepage",
                    "action": "go_to_homepage",
                    "timestamp": clock::unix_ms(),
                })),
            )
                .into_response();
        }
        Err(e) => return e.into_response(),
    };

    let path = uri.path();
    let request = BrowserRequest {
        browser_id: identity.id().to_string(),
        method: method.to_string(),
        path: path.strip_prefix("/tunnel").unwrap_or(path).to_string(),
        query,
        headers: header_list(&headers),
        body: body.to_vec(),
    };

    let response = match relay.proxy_http(request).await {
        Ok(relayed) => into_http(relayed),
        Err(RelayError::NoAgentAvailable) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "No laptop connected",
                "code": "NO_AGENT",
                "message": "Please connect your laptop client first",
            })),
        )
            .into_response(),
        Err(RelayError::RequestExpired(request_id)) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({
                "error": "Gateway Timeout",
                "code": "TIMEOUT",
                "message": format!(
                    "No response from laptop within {} seconds",
                    relay.config().request_timeout_ms / 1000
                ),
                "requestId": request_id,
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Tunnel request failed");
            e.into_response()
        }
    };

    match identity {
        Identity::Adopted(id) => announce_identity(jar, response, id),
        Identity::Declared(_) => response,
    }
}

async fn static_asset(State(relay): State<Arc<Relay>>, uri: Uri, headers: HeaderMap) -> Response {
    let cookie = header_value(&headers, header::COOKIE.as_str());
    into_http(relay.fetch_static(uri.path(), cookie.as_deref()).await)
}

// --- service endpoints ----------------------------------------------------

async fn status(State(relay): State<Arc<Relay>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "server": "shroud relay",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": clock::unix_ms(),
        "stats": relay.status().await,
    }))
}

async fn health(State(relay): State<Arc<Relay>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "grpc": true,
        "polling": true,
        "timestamp": clock::unix_ms(),
        "uptime": relay.uptime().as_secs(),
    }))
}

async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::frame::{Frame, FrameType, META_REQUEST_ID};
    use crate::html::pass_through;
    use crate::messages::{
        headers_to_json, ClientType, HttpRequest, HttpResponse, PollResponse,
        RegistrationResponse,
    };

    fn relay() -> Arc<Relay> {
        let mut config = Config::default();
        config.obfuscation.aes_key =
            Some("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f".to_string());
        Arc::new(Relay::new(&config, clock::system(), pass_through()).unwrap())
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        (status, headers, body)
    }

    fn grpc(path: &str, message: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, GRPC_WEB_CONTENT_TYPE)
            .body(Body::from(grpc_web_wrap(message.to_string().as_bytes())))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_body(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn grpc_register_is_framed() {
        let app = router(relay(), 8);
        let (status, headers, body) = send(
            &app,
            grpc("/tunnel.TunnelService/Register", &json!({"client_type": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], GRPC_WEB_CONTENT_TYPE);
        assert_eq!(headers["grpc-status"], "0");
        assert_eq!(body[0], 0);
        let reg: RegistrationResponse = serde_json::from_slice(grpc_web_unwrap(&body)).unwrap();
        assert!(reg.client_id.starts_with("laptop_"));
        assert!(!reg.tunnel_id.is_empty());
    }

    #[tokio::test]
    async fn grpc_garbage_is_a_trailer_error() {
        let app = router(relay(), 8);
        let req = Request::builder()
            .method("POST")
            .uri("/tunnel.TunnelService/SendFrame")
            .body(Body::from(grpc_web_wrap(b"not json")))
            .unwrap();
        let (status, headers, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["grpc-status"], "3");
        assert_eq!(body[0], 0x80);
    }

    #[tokio::test]
    async fn browser_session_lifecycle() {
        let app = router(relay(), 8);
        let req = Request::builder()
            .method("POST")
            .uri("/api/register-browser")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let id = json_body(&body)["clientId"].as_str().unwrap().to_string();
        assert!(id.starts_with("browser_"));
        let cookie = headers[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with(&format!("tunnel_client_id={id};")));
        assert!(cookie.contains("Max-Age=86400"));
        assert!(!cookie.contains("HttpOnly"));

        let req = Request::builder()
            .uri("/api/restore-session")
            .header(header::COOKIE, format!("theme=dark; tunnel_client_id={id}"))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let restored = json_body(&body);
        assert_eq!(restored["clientId"], id.as_str());
        assert_eq!(restored["type"], "browser");

        let req = Request::builder()
            .uri("/api/restore-session")
            .header(CLIENT_ID_HEADER, "browser_gone")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(&body)["error"], "Session expired");
        assert!(headers[header::SET_COOKIE].to_str().unwrap().contains("Max-Age=0"));

        let (status, _, body) = send(&app, get_req("/api/restore-session")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(&body)["error"], "No session found");
    }

    #[tokio::test]
    async fn tunnel_without_browser_is_401() {
        let app = router(relay(), 8);
        let (status, _, body) = send(&app, get_req("/tunnel/dashboard/")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(&body)["action"], "go_to_homepage");
    }

    #[tokio::test]
    async fn tunnel_without_laptop_is_503() {
        let relay = relay();
        let browser = relay.register_browser().await;
        let app = router(Arc::clone(&relay), 8);
        let (status, _, body) = send(
            &app,
            get_req(&format!("/tunnel/dashboard/?client_id={}", browser.id)),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(&body)["error"], "No laptop connected");
        assert_eq!(relay.correlation().pending_count(), 0);
    }

    #[tokio::test]
    async fn anonymous_tunnel_request_adopts_browser_and_relays() {
        let relay = relay();
        let agent = relay
            .register(RegistrationRequest {
                client_type: ClientType::Laptop,
                ..Default::default()
            })
            .await;
        let browser = relay.register_browser().await;
        let app = router(Arc::clone(&relay), 8);

        let pending = {
            let app = app.clone();
            tokio::spawn(async move { send(&app, get_req("/tunnel/notes/?page=1")).await })
        };

        let mut cursor = String::new();
        let forwarded = loop {
            let PollResponse { frames, .. } = relay
                .poll(PollRequest {
                    client_id: agent.client_id.clone(),
                    tunnel_id: agent.tunnel_id.clone(),
                    last_frame_id: cursor.clone(),
                    timeout_ms: 5_000,
                })
                .await;
            assert!(!frames.is_empty());
            if let Some(f) = frames.iter().find(|f| f.frame_type == FrameType::HttpRequest) {
                break f.clone();
            }
            cursor = frames[frames.len() - 1].frame_id.clone();
        };
        let request: HttpRequest =
            serde_json::from_slice(&relay.codecs().open_frame(&forwarded).unwrap()).unwrap();
        assert_eq!(request.path, "/notes/");

        let response = HttpResponse {
            request_id: request.request_id.clone(),
            status: 201,
            status_text: String::new(),
            headers: headers_to_json([("content-type", "application/json")]),
            body: b"{\"ok\":true}".to_vec(),
        };
        let frame = Frame::new(
            "resp_notes",
            FrameType::HttpResponse,
            serde_json::to_vec(&response).unwrap(),
        )
        .with_meta(META_REQUEST_ID, request.request_id.as_str());
        relay
            .send_frame(SendFrameRequest {
                frame: relay.rotator().seal_frame(frame).unwrap(),
                client_id: agent.client_id.clone(),
                tunnel_id: agent.tunnel_id.clone(),
            })
            .await
            .unwrap();

        let (status, headers, body) = pending.await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, b"{\"ok\":true}");
        assert_eq!(headers[CLIENT_ID_HEADER], browser.id.as_str());
        assert!(headers[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .starts_with("tunnel_client_id="));
    }

    #[tokio::test]
    async fn static_routes_fall_back_to_placeholders() {
        let app = router(relay(), 8);
        let (status, headers, body) = send(&app, get_req("/static/css/site.css")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "text/css; charset=utf-8");
        assert!(body.starts_with(b"/* Placeholder CSS */"));

        let (status, _, _) = send(&app, get_req("/files/report.pdf")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_endpoints() {
        let relay = relay();
        let app = router(Arc::clone(&relay), 8);
        let req = Request::builder()
            .method("POST")
            .uri("/api/sync-session")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = Request::builder()
            .method("POST")
            .uri("/api/sync-session")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"clientId":"browser_1"}"#))
            .unwrap();
        let (status, _, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _, body) = send(&app, get_req("/api/sync-status/sync_session_1_x")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["status"], "completed");
    }

    #[tokio::test]
    async fn service_endpoints() {
        let app = router(relay(), 8);
        let (status, _, body) = send(&app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let health = json_body(&body);
        assert_eq!(health["grpc"], true);
        assert_eq!(health["polling"], true);

        let (_, _, body) = send(&app, get_req("/status")).await;
        let status = json_body(&body);
        assert_eq!(status["status"], "ok");
        assert_eq!(status["stats"]["clients"], 0);

        let (status, _, _) = send(&app, get_req("/favicon.ico")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[test]
    fn referer_identity() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::REFERER,
            HeaderValue::from_static("https://relay.example/tunnel/?page=2&client_id=browser_9#top"),
        );
        assert_eq!(referer_client_id(&headers).as_deref(), Some("browser_9"));

        headers.insert(
            header::REFERER,
            HeaderValue::from_static("https://relay.example/tunnel/?client_id=browser%5F9&q=a+b"),
        );
        assert_eq!(referer_client_id(&headers).as_deref(), Some("browser_9"));

        headers.insert(header::REFERER, HeaderValue::from_static("/tunnel/?client_id=x"));
        assert_eq!(referer_client_id(&headers), None);
    }

    #[tokio::test]
    async fn session_cookie_wins_over_referer() {
        let relay = relay();
        let browser = relay.register_browser().await;
        let jar = CookieJar::new().add(session_cookie(browser.id.clone()));
        let mut headers = HeaderMap::new();
        headers.insert(
            header::REFERER,
            HeaderValue::from_static("https://relay.example/tunnel/?client_id=browser_other"),
        );
        let identity = resolve_browser(&relay, &jar, &headers, &[]).await.unwrap();
        assert_eq!(identity, Identity::Declared(browser.id));
    }

    #[tokio::test]
    async fn expired_session_cookie_is_cleared() {
        let app = router(relay(), 8);
        let req = Request::builder()
            .uri("/api/restore-session")
            .header(header::COOKIE, "tunnel_client_id=browser_gone")
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let cookie = headers[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("tunnel_client_id=;"));
        assert!(cookie.contains("Max-Age=0"));
        assert!(cookie.contains("Path=/"));
    }
}
