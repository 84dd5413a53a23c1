//! The relay service.
//!
//! [`Relay`] ties the registry, the outbound queues, the correlation engine
//! and the codecs together and exposes one method per relay operation. The
//! HTTP layer in [`routes`] only decodes requests and encodes results.

pub mod routes;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::assets;
use crate::clock::SharedClock;
use crate::config::{Config, RelayConfig};
use crate::correlation::{
    Completion, CorrelationEngine, Forward, ForwardError, PendingSummary, RelayedResponse,
    Released, RequestClass, SyncStatus,
};
use crate::dedup::DedupWindow;
use crate::frame::{
    self, Frame, FrameError, FrameType, META_BROWSER_CLIENT_ID, META_COOKIE_HEADER,
    META_FORWARDED_VIA, META_IS_STATIC, META_ORIGINAL_PATH, META_REQUEST_ID,
};
use crate::html::SharedRewriter;
use crate::messages::{
    headers_to_json, HttpRequest, HttpResponse, PollRequest, PollResponse, RegistrationRequest,
    RegistrationResponse, SendFrameRequest, SendFrameResponse,
};
use crate::obfuscation::{CodecError, CodecSet, Rotator};
use crate::queue::{OutboundQueues, PollBatch, QueueError};
use crate::registry::{ClientInfo, ClientRecord, ClientRegistry, ClientRole, Liveness};

/// Clients heard from within this window are reported active.
const ACTIVE_WINDOW_MS: u64 = 30_000;

/// Upper bound on remembered inbound `(client, frame)` pairs.
const INBOUND_GUARD_ENTRIES: usize = 100_000;

/// Request headers never replayed to the local app.
const HOP_BY_HOP: &[&str] = &["host", "content-length", "connection", "accept-encoding"];

/// Why a relay operation failed.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no laptop client connected")]
    NoAgentAvailable,
    #[error("no tunnel client; connect through the homepage first")]
    NoBrowserClient,
    #[error("unknown client {0}")]
    UnknownClient(String),
    #[error("request {0} is already in flight")]
    DuplicateRequest(String),
    #[error("no response from laptop for request {0}")]
    RequestExpired(String),
    #[error("laptop {0} disconnected")]
    AgentDisconnected(String),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoAgentAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::NoBrowserClient => StatusCode::UNAUTHORIZED,
            Self::UnknownClient(_) => StatusCode::NOT_FOUND,
            Self::DuplicateRequest(_) => StatusCode::CONFLICT,
            Self::RequestExpired(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::AgentDisconnected(_) => StatusCode::BAD_GATEWAY,
            Self::Malformed(_) | Self::Frame(_) | Self::Codec(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NoAgentAvailable => "NO_AGENT",
            Self::NoBrowserClient => "NO_TUNNEL_CLIENT",
            Self::UnknownClient(_) => "UNKNOWN_CLIENT",
            Self::DuplicateRequest(_) => "DUPLICATE_REQUEST",
            Self::RequestExpired(_) => "TIMEOUT",
            Self::AgentDisconnected(_) => "AGENT_DISCONNECTED",
            Self::Malformed(_) | Self::Frame(_) => "MALFORMED",
            Self::Codec(CodecError::AuthenticationFailed) => "AUTHENTICATION_FAILED",
            Self::Codec(_) => "BAD_PAYLOAD",
        }
    }

    /// Matching gRPC status code for the gRPC-Web endpoints.
    pub fn grpc_status(&self) -> u32 {
        match self {
            Self::NoAgentAvailable | Self::AgentDisconnected(_) => 14,
            Self::NoBrowserClient => 16,
            Self::UnknownClient(_) => 5,
            Self::DuplicateRequest(_) => 6,
            Self::RequestExpired(_) => 4,
            Self::Malformed(_) | Self::Frame(_) | Self::Codec(_) => 3,
        }
    }
}

impl From<ForwardError> for RelayError {
    fn from(e: ForwardError) -> Self {
        match e {
            ForwardError::DuplicateInFlight(id) | ForwardError::Queue(QueueError::DuplicateFrame(id)) => {
                Self::DuplicateRequest(id)
            }
            ForwardError::Queue(QueueError::UnknownClient(agent)) => Self::AgentDisconnected(agent),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}

/// A `/tunnel/*` request as received from a browser.
#[derive(Debug, Clone, Default)]
pub struct BrowserRequest {
    pub browser_id: String,
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl BrowserRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Outcome of a session-sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStarted {
    pub request_id: String,
    pub agent_id: String,
}

/// What one housekeeping pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted_clients: usize,
    pub expired_requests: usize,
    pub rotated_to: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub id: String,
    pub role: ClientRole,
    pub liveness: Liveness,
    pub idle_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub clients: usize,
    pub tunnels: usize,
    pub message_queues: BTreeMap<String, usize>,
    pub pending_requests: usize,
    pub obfuscation_method: &'static str,
    pub client_details: Vec<ClientStatus>,
    pub pending: Vec<PendingSummary>,
}

pub struct Relay {
    registry: ClientRegistry,
    queues: Arc<OutboundQueues>,
    correlation: CorrelationEngine,
    inbound: DedupWindow,
    rotator: Rotator,
    clock: SharedClock,
    config: RelayConfig,
    started: Instant,
}

impl Relay {
    pub fn new(
        config: &Config,
        clock: SharedClock,
        rewriter: SharedRewriter,
    ) -> Result<Self, CodecError> {
        let obf = &config.obfuscation;
        let codecs = CodecSet::from_keys(obf.aes_key.as_deref(), &obf.xor_key)?;
        let rotator = Rotator::new(
            Arc::new(codecs),
            Rotator::parse_methods(&obf.methods),
            obf.rotation_secs.saturating_mul(1000),
            clock.clone(),
        );
        let relay = config.relay.clone();
        let retention_ms = relay.duplicate_retention_secs.saturating_mul(1000);
        let queues = Arc::new(OutboundQueues::new(
            clock.clone(),
            relay.resync_suffix,
            relay.max_queue_len,
        ));
        let correlation = CorrelationEngine::new(
            Arc::clone(&queues),
            clock.clone(),
            rewriter,
            retention_ms,
            relay.static_cache_max_age_secs,
        );
        Ok(Self {
            registry: ClientRegistry::new(
                clock.clone(),
                ACTIVE_WINDOW_MS,
                relay.client_idle_secs.saturating_mul(1000),
            ),
            queues,
            correlation,
            inbound: DedupWindow::new(retention_ms, INBOUND_GUARD_ENTRIES),
            rotator,
            clock,
            config: relay,
            started: Instant::now(),
        })
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn queues(&self) -> &OutboundQueues {
        &self.queues
    }

    pub fn correlation(&self) -> &CorrelationEngine {
        &self.correlation
    }

    pub fn rotator(&self) -> &Rotator {
        &self.rotator
    }

    pub fn codecs(&self) -> &CodecSet {
        self.rotator.codecs()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    // --- registration -----------------------------------------------------

    /// Register an agent or a browser. Agents get a tunnel and a welcome
    /// frame; a first registration starts from an empty queue.
    pub async fn register(&self, req: RegistrationRequest) -> RegistrationResponse {
        let role = ClientRole::from(req.client_type);
        let registration = self
            .registry
            .register(
                role,
                ClientInfo {
                    declared_id: Some(req.client_id).filter(|id| !id.is_empty()),
                    capabilities: req.capabilities,
                    local_app_url: req.local_app_url,
                },
            )
            .await;
        let client_id = registration.record.id.clone();

        if role == ClientRole::Agent && !registration.reconnected {
            self.queues.reset(&client_id).await;
        } else {
            self.queues.open(&client_id).await;
        }

        if role == ClientRole::Agent {
            let welcome = json!({
                "type": "welcome",
                "message": "Connected",
                "timestamp": self.clock.now_ms(),
            });
            let frame = Frame::new(
                frame::new_frame_id("welcome"),
                FrameType::Data,
                welcome.to_string().into_bytes(),
            );
            self.deliver(&client_id, frame).await;
        }

        let label = match role {
            ClientRole::Agent => "laptop",
            ClientRole::Browser => "browser",
        };
        RegistrationResponse {
            client_id,
            tunnel_id: registration.tunnel.map(|t| t.id).unwrap_or_default(),
            server_version: self.config.server_version.clone(),
            obfuscation_method: self.rotator.current().as_str().to_string(),
            server_time: self.clock.now_ms(),
            success: true,
            message: format!("Registration successful for {label}"),
        }
    }

    /// Register a browser with a relay-assigned id.
    pub async fn register_browser(&self) -> ClientRecord {
        let record = self
            .registry
            .register(ClientRole::Browser, ClientInfo::default())
            .await
            .record;
        self.queues.open(&record.id).await;
        record
    }

    /// Refresh a remembered browser session.
    pub async fn restore_session(&self, client_id: &str) -> Result<ClientRecord, RelayError> {
        if !self.registry.touch(client_id).await {
            return Err(RelayError::UnknownClient(client_id.to_string()));
        }
        self.registry
            .get(client_id)
            .await
            .ok_or_else(|| RelayError::UnknownClient(client_id.to_string()))
    }

    /// Forget a client: registry entry, queue, and every request still
    /// waiting on it if it was an agent.
    pub async fn unregister(&self, client_id: &str) -> bool {
        let Some(removed) = self.registry.unregister(client_id).await else {
            return false;
        };
        self.forget(&removed.record).await;
        true
    }

    async fn forget(&self, record: &ClientRecord) {
        let dropped = self.queues.remove(&record.id).await;
        if dropped > 0 {
            debug!(client_id = %record.id, dropped, "Queued frames discarded");
        }
        if record.role == ClientRole::Agent {
            self.correlation.release_for_agent(&record.id);
        }
    }

    // --- frames -----------------------------------------------------------

    /// Accept one frame from a client and dispatch it by type.
    ///
    /// Only registered clients may send, except for `HTTP_RESPONSE` frames,
    /// which are matched by request id alone. A frame is remembered as seen
    /// only once it was handled, so a failed attempt can be retried.
    pub async fn send_frame(
        self: &Arc<Self>,
        req: SendFrameRequest,
    ) -> Result<SendFrameResponse, RelayError> {
        let SendFrameRequest {
            frame, client_id, ..
        } = req;
        if frame.frame_id.is_empty() {
            return Err(FrameError::MissingId.into());
        }
        if !self.registry.touch(&client_id).await {
            if frame.frame_type != FrameType::HttpResponse {
                debug!(client_id = %client_id, frame_id = %frame.frame_id, "Frame from unregistered client rejected");
                return Err(RelayError::UnknownClient(client_id));
            }
            debug!(client_id = %client_id, "Response from unregistered client");
        }

        let key = format!("{client_id}_{}", frame.frame_id);
        if !self.inbound.check_and_insert(&key, self.clock.now_ms()) {
            debug!(client_id = %client_id, frame_id = %frame.frame_id, "Duplicate frame ignored");
            return Ok(self.ack("Duplicate frame ignored"));
        }

        match self.dispatch(&client_id, frame).await {
            Ok(message) => Ok(self.ack(message)),
            Err(e) => {
                self.inbound.forget(&key);
                Err(e)
            }
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        client_id: &str,
        frame: Frame,
    ) -> Result<&'static str, RelayError> {
        let frame_type = frame.frame_type;
        let message = match frame_type {
            FrameType::HttpRequest => {
                self.relay_browser_frame(client_id, frame).await?;
                "Request forwarded"
            }
            FrameType::HttpResponse => match self.accept_response(&frame)? {
                Completion::Delivered => "Response delivered",
                Completion::Unmatched => "No pending request",
                Completion::Duplicate => "Duplicate response ignored",
            },
            FrameType::Ping => {
                let pong = Frame::new(
                    format!("pong_{}_{}", self.clock.now_ms(), frame.frame_id),
                    FrameType::Pong,
                    Vec::new(),
                )
                .with_meta("original_frame", frame.frame_id.as_str());
                self.deliver(client_id, pong).await;
                "Pong queued"
            }
            FrameType::Heartbeat => "Heartbeat received",
            FrameType::Data => {
                debug!(client_id = %client_id, frame_id = %frame.frame_id, bytes = frame.payload.len(), "Data frame received");
                "Frame received"
            }
            FrameType::Error => {
                warn!(
                    client_id = %client_id,
                    frame_id = %frame.frame_id,
                    error = %String::from_utf8_lossy(&frame.payload),
                    "Client reported an error"
                );
                "Frame received"
            }
            FrameType::Register => {
                warn!(client_id = %client_id, "REGISTER frame sent as data, ignored");
                "Register frames are ignored here"
            }
            FrameType::Pong => "Frame received",
            FrameType::Unknown(_) => {
                frame.report_unknown_type();
                "Frame received"
            }
        };
        Ok(message)
    }

    fn ack(&self, message: &str) -> SendFrameResponse {
        SendFrameResponse {
            success: true,
            message: message.to_string(),
            timestamp: self.clock.now_ms(),
        }
    }

    /// Route an agent's `HTTP_RESPONSE` frame to the pending request.
    pub fn accept_response(&self, frame: &Frame) -> Result<Completion, RelayError> {
        let plain = self.codecs().open_frame(frame).inspect_err(|e| {
            warn!(frame_id = %frame.frame_id, error = %e, "Response payload rejected");
        })?;
        let mut response: HttpResponse = serde_json::from_slice(&plain)?;
        if response.request_id.is_empty() {
            if let Some(id) = frame.meta(META_REQUEST_ID) {
                response.request_id = id.to_string();
            }
        }
        Ok(self.correlation.complete(&response, frame))
    }

    /// A browser sent an `HTTP_REQUEST` frame through `SendFrame`. The answer
    /// goes back to the browser's queue as an `HTTP_RESPONSE` frame.
    async fn relay_browser_frame(
        self: &Arc<Self>,
        browser_id: &str,
        frame: Frame,
    ) -> Result<(), RelayError> {
        let plain = self.codecs().open_frame(&frame)?;
        let mut request: HttpRequest = serde_json::from_slice(&plain)?;
        if request.request_id.is_empty() {
            request.request_id = frame
                .meta(META_REQUEST_ID)
                .map_or_else(|| frame::new_frame_id("req"), str::to_string);
        }
        let request_id = request.request_id.clone();

        let Some(agent) = self.registry.find_any_agent().await else {
            warn!(request_id = %request_id, browser = browser_id, "No laptop for browser request");
            self.reply_to_browser(
                browser_id,
                error_response(&request_id, 503, "No laptop client connected"),
            )
            .await;
            return Ok(());
        };

        let path = request.path.clone();
        let forward_frame = Frame::new(
            format!("forward_{request_id}"),
            FrameType::HttpRequest,
            serde_json::to_vec(&request)?,
        )
        .with_metadata(frame.metadata)
        .with_meta(META_REQUEST_ID, request_id.as_str())
        .with_meta(META_BROWSER_CLIENT_ID, browser_id)
        .with_meta(META_FORWARDED_VIA, "relay");
        let forward_frame = self.rotator.seal_frame(forward_frame)?;

        let handle = self
            .correlation
            .forward(Forward {
                request_id: request_id.clone(),
                target_agent_id: agent.id,
                origin: Some(browser_id.to_string()),
                class: RequestClass::Dynamic,
                path,
                frame: forward_frame,
                timeout: self.config.request_timeout(),
            })
            .await?;

        let relay = Arc::clone(self);
        let browser_id = browser_id.to_string();
        tokio::spawn(async move {
            let response = match handle.wait().await {
                Released::Response(r) => HttpResponse {
                    request_id: request_id.clone(),
                    status: r.status,
                    status_text: String::new(),
                    headers: headers_to_json(
                        r.headers.iter().map(|(n, v)| (n.as_str(), v.as_str())),
                    ),
                    body: r.body,
                },
                Released::Expired => error_response(&request_id, 504, "Gateway Timeout"),
                Released::AgentGone(_) => {
                    error_response(&request_id, 502, "Laptop disconnected")
                }
            };
            relay.reply_to_browser(&browser_id, response).await;
        });
        Ok(())
    }

    async fn reply_to_browser(&self, browser_id: &str, response: HttpResponse) {
        let request_id = response.request_id.clone();
        let payload = match serde_json::to_vec(&response) {
            Ok(p) => p,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Failed to encode browser response");
                return;
            }
        };
        let frame = Frame::new(
            frame::new_frame_id("resp"),
            FrameType::HttpResponse,
            payload,
        )
        .with_meta(META_REQUEST_ID, request_id.as_str());
        match self.rotator.seal_frame(frame) {
            Ok(frame) => self.deliver(browser_id, frame).await,
            Err(e) => warn!(request_id = %request_id, error = %e, "Failed to seal browser response"),
        }
    }

    async fn deliver(&self, client_id: &str, frame: Frame) {
        let frame_id = frame.frame_id.clone();
        if let Err(e) = self.queues.enqueue(client_id, frame).await {
            warn!(client_id, frame_id = %frame_id, error = %e, "Frame not queued");
        }
    }

    // --- polling ----------------------------------------------------------

    /// Hand out queued frames. An unknown client or an agent polling with a
    /// tunnel that is not its own gets an empty batch, never an error.
    pub async fn poll(&self, req: PollRequest) -> PollResponse {
        let batch = self.poll_batch(&req).await;
        PollResponse {
            has_more: false,
            frames: batch.frames,
            next_poll_in: self.config.poll_interval_ms.to_string(),
        }
    }

    async fn poll_batch(&self, req: &PollRequest) -> PollBatch {
        let Some(record) = self.registry.get(&req.client_id).await else {
            debug!(client_id = %req.client_id, "Poll from unknown client");
            return PollBatch::default();
        };
        if record.role == ClientRole::Agent
            && !self
                .registry
                .validate_tunnel(&req.client_id, &req.tunnel_id)
                .await
        {
            warn!(client_id = %req.client_id, tunnel_id = %req.tunnel_id, "Poll with mismatched tunnel");
            return PollBatch::default();
        }
        self.registry.touch(&req.client_id).await;

        let wait = req.timeout_ms.min(self.config.max_poll_timeout_ms);
        let batch = if wait == 0 {
            self.queues.poll(&req.client_id, &req.last_frame_id).await
        } else {
            self.queues
                .wait_for_frames(&req.client_id, &req.last_frame_id, Duration::from_millis(wait))
                .await
        };
        if batch.resynced {
            debug!(client_id = %req.client_id, cursor = %req.last_frame_id, "Poller resynced");
        }
        batch
    }

    // --- browser-facing HTTP ----------------------------------------------

    /// Relay one `/tunnel/*` request to the agent and wait for its answer.
    pub async fn proxy_http(&self, req: BrowserRequest) -> Result<RelayedResponse, RelayError> {
        let path = normalize_path(&req.path);
        let cookie = req.header("cookie").map(str::to_string);
        if assets::is_static_asset(&path) {
            return Ok(self.fetch_static(&path, cookie.as_deref()).await);
        }

        let agent = self
            .registry
            .find_any_agent()
            .await
            .ok_or(RelayError::NoAgentAvailable)?;
        self.registry.touch(&req.browser_id).await;

        let request_id = frame::new_frame_id("req");
        let headers = headers_to_json(
            req.headers
                .iter()
                .filter(|(n, _)| !HOP_BY_HOP.contains(&n.to_ascii_lowercase().as_str()))
                .map(|(n, v)| (n.as_str(), v.as_str())),
        );
        let mut query = Map::new();
        for (name, value) in req.query.iter().filter(|(n, _)| n != "client_id") {
            query.insert(name.clone(), Value::String(value.clone()));
        }
        let http = HttpRequest {
            request_id: request_id.clone(),
            method: req.method.to_ascii_uppercase(),
            path: path.clone(),
            headers,
            body: req.body,
            query: Value::Object(query).to_string(),
        };

        let mut frame = Frame::new(
            format!("http_{request_id}"),
            FrameType::HttpRequest,
            serde_json::to_vec(&http)?,
        )
        .with_meta(META_REQUEST_ID, request_id.as_str())
        .with_meta(META_BROWSER_CLIENT_ID, req.browser_id.as_str());
        if let Some(cookie) = &cookie {
            frame = frame.with_meta(META_COOKIE_HEADER, cookie.as_str());
        }
        let frame = self.rotator.seal_frame(frame)?;

        info!(request_id = %request_id, method = %http.method, path = %path, "Tunnel request");
        let handle = self
            .correlation
            .forward(Forward {
                request_id: request_id.clone(),
                target_agent_id: agent.id,
                origin: Some(req.browser_id),
                class: RequestClass::Dynamic,
                path,
                frame,
                timeout: self.config.request_timeout(),
            })
            .await?;

        match handle.wait().await {
            Released::Response(response) => Ok(response),
            Released::Expired => Err(RelayError::RequestExpired(request_id)),
            Released::AgentGone(agent) => Err(RelayError::AgentDisconnected(agent)),
        }
    }

    /// Fetch a static asset through the agent. Never fails: with no agent,
    /// or no answer in time, a placeholder is served.
    pub async fn fetch_static(&self, path: &str, cookie: Option<&str>) -> RelayedResponse {
        let Some(agent) = self.registry.find_any_agent().await else {
            debug!(path, "No laptop for static asset, serving placeholder");
            return placeholder_response(path);
        };

        let request_id = frame::new_frame_id("static");
        let mut headers = vec![("Accept", "*/*"), ("User-Agent", "Tunnel-Static/1.0")];
        if let Some(cookie) = cookie {
            headers.push(("Cookie", cookie));
        }
        let http = HttpRequest {
            request_id: request_id.clone(),
            method: "GET".to_string(),
            path: path.to_string(),
            headers: headers_to_json(headers),
            body: Vec::new(),
            query: "{}".to_string(),
        };
        let Ok(payload) = serde_json::to_vec(&http) else {
            return placeholder_response(path);
        };
        let frame = Frame::new(format!("frame_{request_id}"), FrameType::HttpRequest, payload)
            .with_meta(META_REQUEST_ID, request_id.as_str())
            .with_meta(META_IS_STATIC, "true")
            .with_meta(META_ORIGINAL_PATH, path);
        let frame = match self.rotator.seal_frame(frame) {
            Ok(f) => f,
            Err(e) => {
                warn!(path, error = %e, "Failed to seal static request");
                return placeholder_response(path);
            }
        };

        let forwarded = self
            .correlation
            .forward(Forward {
                request_id: request_id.clone(),
                target_agent_id: agent.id,
                origin: None,
                class: RequestClass::Static {
                    content_type: assets::guess_content_type(path).to_string(),
                },
                path: path.to_string(),
                frame,
                timeout: self.config.static_timeout(),
            })
            .await;
        let handle = match forwarded {
            Ok(h) => h,
            Err(e) => {
                warn!(path, error = %e, "Static request not forwarded");
                return placeholder_response(path);
            }
        };
        match handle.wait().await {
            Released::Response(response) => response,
            Released::Expired | Released::AgentGone(_) => {
                debug!(path, request_id = %request_id, "Static asset unavailable, serving placeholder");
                placeholder_response(path)
            }
        }
    }

    /// Ask the agent to load `/` so its local app issues a session. Nobody
    /// waits for the answer; poll [`sync_status`](Self::sync_status).
    pub async fn sync_session(&self, browser_id: &str) -> Result<SyncStarted, RelayError> {
        let agent = self
            .registry
            .find_any_agent()
            .await
            .ok_or(RelayError::NoAgentAvailable)?;
        let request_id = frame::new_frame_id("sync_session");
        let http = HttpRequest {
            request_id: request_id.clone(),
            method: "GET".to_string(),
            path: "/".to_string(),
            headers: headers_to_json([
                ("User-Agent", "Tunnel-Session-Sync/1.0"),
                ("Accept", "text/html"),
                ("Connection", "close"),
            ]),
            body: Vec::new(),
            query: "{}".to_string(),
        };
        let frame = Frame::new(
            format!("frame_{request_id}"),
            FrameType::HttpRequest,
            serde_json::to_vec(&http)?,
        )
        .with_meta(META_REQUEST_ID, request_id.as_str())
        .with_meta(META_BROWSER_CLIENT_ID, browser_id);
        let frame = self.rotator.seal_frame(frame)?;

        self.correlation
            .forward_detached(Forward {
                request_id: request_id.clone(),
                target_agent_id: agent.id.clone(),
                origin: Some(browser_id.to_string()),
                class: RequestClass::SessionSync,
                path: "/".to_string(),
                frame,
                timeout: self.config.sync_timeout(),
            })
            .await?;
        info!(request_id = %request_id, browser = browser_id, agent = %agent.id, "Session sync started");
        Ok(SyncStarted {
            request_id,
            agent_id: agent.id,
        })
    }

    pub fn sync_status(&self, request_id: &str) -> SyncStatus {
        self.correlation.sync_status(request_id)
    }

    // --- housekeeping -----------------------------------------------------

    /// One housekeeping pass: idle clients, overdue leases, codec rotation.
    pub async fn sweep(&self) -> SweepReport {
        let evicted = self.registry.sweep_idle().await;
        for removed in &evicted {
            self.forget(&removed.record).await;
        }
        let expired_requests = self.correlation.sweep_expired();
        let now = self.clock.now_ms();
        let guard_evicted = self.inbound.sweep(now);
        if guard_evicted > 0 {
            debug!(evicted = guard_evicted, "Inbound frame guard trimmed");
        }
        SweepReport {
            evicted_clients: evicted.len(),
            expired_requests,
            rotated_to: self.rotator.tick().map(|m| m.as_str()),
        }
    }

    pub async fn status(&self) -> RelayStatus {
        let (clients, tunnels) = self.registry.counts().await;
        let now = self.clock.now_ms();
        let mut client_details = Vec::new();
        for record in self.registry.snapshot().await {
            let tunnel_id = match record.role {
                ClientRole::Agent => self.registry.tunnel_of(&record.id).await.map(|t| t.id),
                ClientRole::Browser => None,
            };
            client_details.push(ClientStatus {
                liveness: self.registry.liveness(&record),
                idle_ms: now.saturating_sub(record.last_seen_ms),
                id: record.id,
                role: record.role,
                tunnel_id,
            });
        }
        RelayStatus {
            clients,
            tunnels,
            message_queues: self.queues.depths().await.into_iter().collect(),
            pending_requests: self.correlation.pending_count(),
            obfuscation_method: self.rotator.current().as_str(),
            client_details,
            pending: self.correlation.summaries(),
        }
    }
}

/// Collapse leading slashes so `//admin` and `admin` both become `/admin`.
pub fn normalize_path(raw: &str) -> String {
    format!("/{}", raw.trim_start_matches('/'))
}

fn error_response(request_id: &str, status: u16, message: &str) -> HttpResponse {
    HttpResponse {
        request_id: request_id.to_string(),
        status,
        status_text: message.to_string(),
        headers: headers_to_json([("content-type", "application/json")]),
        body: json!({"error": message}).to_string().into_bytes(),
    }
}

fn placeholder_response(path: &str) -> RelayedResponse {
    let placeholder = assets::placeholder(path);
    RelayedResponse {
        status: placeholder.status,
        headers: vec![
            ("content-type".to_string(), placeholder.content_type.to_string()),
            ("cache-control".to_string(), "no-cache".to_string()),
        ],
        body: placeholder.body,
    }
}
