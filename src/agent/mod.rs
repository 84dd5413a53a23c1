//! Agent: the relay client that runs next to the private local app.
//!
//! Registers as a laptop, short-polls for frames with its cursor, replays
//! each `HTTP_REQUEST` against the local app and sends the sealed answer
//! back. If polling fails, or the relay stops answering pings, the agent
//! re-registers with exponential backoff.

pub mod local;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{self, SharedClock};
use crate::config::{AgentConfig, ObfuscationConfig};
use crate::cookies;
use crate::dedup::DedupWindow;
use crate::frame::{self, Frame, FrameType, META_COOKIE_HEADER, META_REQUEST_ID};
use crate::messages::{
    grpc_web_unwrap, grpc_web_wrap, ClientType, HttpRequest, HttpResponse, PollRequest,
    PollResponse, RegistrationRequest, RegistrationResponse, SendFrameRequest, SendFrameResponse,
    GRPC_WEB_CONTENT_TYPE,
};
use crate::obfuscation::{CodecError, CodecSet, Rotator};
use local::{HttpClient, LocalApp};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How long received frame and request ids are remembered.
const SEEN_RETENTION_MS: u64 = 10 * 60 * 1000;
const SEEN_MAX_ENTRIES: usize = 10_000;

/// Missed pings before the relay is assumed to have forgotten us.
const MISSED_PINGS: u32 = 3;

/// gRPC-Web client for the relay's `tunnel.TunnelService`.
pub struct RelayClient {
    http: HttpClient,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: local::http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn call<Req, Resp>(&self, method: &str, message: &Req) -> Result<Resp, BoxError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = grpc_web_wrap(&serde_json::to_vec(message)?);
        let req = hyper::Request::post(format!("{}/tunnel.TunnelService/{method}", self.base_url))
            .header(CONTENT_TYPE, GRPC_WEB_CONTENT_TYPE)
            .body(Full::new(Bytes::from(body)))?;
        let resp = self.http.request(req).await?;
        if !resp.status().is_success() {
            return Err(format!("{method}: relay answered HTTP {}", resp.status()).into());
        }
        let grpc_status = resp
            .headers()
            .get("grpc-status")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("0")
            .to_string();
        let bytes = resp.into_body().collect().await?.to_bytes();
        if grpc_status != "0" {
            return Err(format!(
                "{method}: grpc-status {grpc_status}: {}",
                String::from_utf8_lossy(grpc_web_unwrap(&bytes))
            )
            .into());
        }
        Ok(serde_json::from_slice(grpc_web_unwrap(&bytes))?)
    }
}

/// Identity handed out by the relay for one registration.
#[derive(Debug, Clone)]
struct Session {
    client_id: String,
    tunnel_id: String,
}

pub struct Agent {
    relay: RelayClient,
    local: LocalApp,
    rotator: Rotator,
    config: AgentConfig,
    clock: SharedClock,
    seen_frames: DedupWindow,
    seen_requests: DedupWindow,
    /// Id assigned by the relay, reused on re-registration.
    client_id: Mutex<Option<String>>,
}

impl Agent {
    pub fn new(config: AgentConfig, obfuscation: &ObfuscationConfig) -> Result<Self, CodecError> {
        let clock = clock::system();
        let codecs = CodecSet::from_keys(obfuscation.aes_key.as_deref(), &obfuscation.xor_key)?;
        let rotator = Rotator::new(
            Arc::new(codecs),
            Rotator::parse_methods(&obfuscation.methods),
            obfuscation.rotation_secs.saturating_mul(1000),
            clock.clone(),
        );
        Ok(Self {
            relay: RelayClient::new(&config.relay_url),
            local: LocalApp::new(
                &config.local_app_url,
                Duration::from_millis(config.request_timeout_ms),
            ),
            rotator,
            client_id: Mutex::new(config.client_id.clone().filter(|id| !id.is_empty())),
            config,
            clock,
            seen_frames: DedupWindow::new(SEEN_RETENTION_MS, SEEN_MAX_ENTRIES),
            seen_requests: DedupWindow::new(SEEN_RETENTION_MS, SEEN_MAX_ENTRIES),
        })
    }

    pub fn local(&self) -> &LocalApp {
        &self.local
    }

    /// Run until the task is cancelled.
    pub async fn run(self: Arc<Self>) {
        let initial = Duration::from_secs(self.config.reconnect_delay_secs.max(1));
        let max_delay = Duration::from_secs(self.config.reconnect_max_delay_secs).max(initial);
        let mut delay = initial;
        loop {
            info!(relay = %self.config.relay_url, "Connecting to relay");
            match Arc::clone(&self).connect_and_run().await {
                Ok(()) => {
                    info!("Relay stopped answering, re-registering");
                    delay = initial;
                }
                Err(e) => {
                    warn!(error = %e, retry_secs = delay.as_secs(), "Relay connection failed");
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(max_delay);
        }
    }

    async fn register(&self) -> Result<Session, BoxError> {
        let declared = self
            .client_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let reg: RegistrationResponse = self
            .relay
            .call(
                "Register",
                &RegistrationRequest {
                    client_id: declared.unwrap_or_default(),
                    client_type: ClientType::Laptop,
                    capabilities: vec!["http_proxy".to_string(), "cookies".to_string()],
                    local_app_url: Some(self.config.local_app_url.clone()),
                },
            )
            .await?;
        if !reg.success || reg.tunnel_id.is_empty() {
            return Err(format!("registration refused: {}", reg.message).into());
        }
        info!(
            client_id = %reg.client_id,
            tunnel_id = %reg.tunnel_id,
            method = %reg.obfuscation_method,
            server_version = %reg.server_version,
            "Registered with relay"
        );
        *self.client_id.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(reg.client_id.clone());
        Ok(Session {
            client_id: reg.client_id,
            tunnel_id: reg.tunnel_id,
        })
    }

    /// One registration: poll until an error or until the relay goes quiet.
    async fn connect_and_run(self: Arc<Self>) -> Result<(), BoxError> {
        let session = self.register().await?;
        let ping_every = Duration::from_secs(self.config.ping_interval_secs.max(1));
        let poll_every = Duration::from_millis(self.config.poll_interval_ms.max(10));

        let ping_task = {
            let agent = Arc::clone(&self);
            let session = session.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(ping_every);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let ping = Frame::new(frame::new_frame_id("ping"), FrameType::Ping, Vec::new());
                    if let Err(e) = agent.send(&session, ping).await {
                        warn!(error = %e, "Ping failed");
                    }
                }
            })
        };

        let result = self.poll_loop(&session, ping_every, poll_every).await;
        ping_task.abort();
        result
    }

    async fn poll_loop(
        self: &Arc<Self>,
        session: &Session,
        ping_every: Duration,
        poll_every: Duration,
    ) -> Result<(), BoxError> {
        #[allow(clippy::cast_possible_truncation)]
        let quiet_limit_ms = (ping_every * MISSED_PINGS).as_millis() as u64;
        let mut last_heard = self.clock.now_ms();
        let mut cursor = String::new();
        loop {
            let PollResponse { frames, .. } = self
                .relay
                .call(
                    "PollFrames",
                    &PollRequest {
                        client_id: session.client_id.clone(),
                        tunnel_id: session.tunnel_id.clone(),
                        last_frame_id: cursor.clone(),
                        timeout_ms: 0,
                    },
                )
                .await?;

            let now = self.clock.now_ms();
            if let Some(last) = frames.last() {
                cursor.clone_from(&last.frame_id);
                last_heard = now;
            } else if now.saturating_sub(last_heard) > quiet_limit_ms {
                warn!(client_id = %session.client_id, "No frames or pongs from relay");
                return Ok(());
            }

            let received = frames.len();
            for frame in frames {
                self.dispatch(session, frame);
            }
            if received == 0 {
                tokio::time::sleep(poll_every).await;
            }
        }
    }

    fn dispatch(self: &Arc<Self>, session: &Session, frame: Frame) {
        if !self
            .seen_frames
            .check_and_insert(&frame.frame_id, self.clock.now_ms())
        {
            debug!(frame_id = %frame.frame_id, "Frame already handled");
            return;
        }
        match frame.frame_type {
            FrameType::HttpRequest => {
                let agent = Arc::clone(self);
                let session = session.clone();
                tokio::spawn(async move { agent.handle_request(&session, frame).await });
            }
            FrameType::Pong => debug!(frame_id = %frame.frame_id, "Pong"),
            FrameType::Data => {
                debug!(frame_id = %frame.frame_id, payload = %String::from_utf8_lossy(&frame.payload), "Relay message");
            }
            FrameType::Error => {
                warn!(frame_id = %frame.frame_id, error = %String::from_utf8_lossy(&frame.payload), "Relay reported an error");
            }
            other => debug!(frame_id = %frame.frame_id, frame_type = %other, "Ignored frame"),
        }
    }

    async fn handle_request(&self, session: &Session, frame: Frame) {
        let request: HttpRequest = match self.open_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(frame_id = %frame.frame_id, error = %e, "Unreadable request frame");
                if let Some(request_id) = frame.meta(META_REQUEST_ID) {
                    let failure = error_response(request_id, &format!("Bad request frame: {e}"));
                    self.respond(session, failure, &[]).await;
                }
                return;
            }
        };
        if !self
            .seen_requests
            .check_and_insert(&request.request_id, self.clock.now_ms())
        {
            debug!(request_id = %request.request_id, "Request already handled");
            return;
        }

        let started = std::time::Instant::now();
        match self
            .local
            .execute(&request, frame.meta(META_COOKIE_HEADER))
            .await
        {
            Ok(local) => {
                info!(
                    request_id = %request.request_id,
                    method = %request.method,
                    path = %request.path,
                    status = local.response.status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request served"
                );
                self.respond(session, local.response, &local.set_cookies).await;
            }
            Err(e) => {
                warn!(request_id = %request.request_id, path = %request.path, error = %e, "Local app request failed");
                let failure = error_response(&request.request_id, &format!("Local app error: {e}"));
                self.respond(session, failure, &[]).await;
            }
        }
    }

    fn open_request(&self, frame: &Frame) -> Result<HttpRequest, BoxError> {
        let plain = self.rotator.codecs().open_frame(frame)?;
        let mut request: HttpRequest = serde_json::from_slice(&plain)?;
        if request.request_id.is_empty() {
            request.request_id = frame
                .meta(META_REQUEST_ID)
                .ok_or("request frame carries no request id")?
                .to_string();
        }
        Ok(request)
    }

    async fn respond(&self, session: &Session, response: HttpResponse, set_cookies: &[String]) {
        let request_id = response.request_id.clone();
        if let Err(e) = self.try_respond(session, &response, set_cookies).await {
            warn!(request_id = %request_id, error = %e, "Response not delivered to relay");
        }
    }

    async fn try_respond(
        &self,
        session: &Session,
        response: &HttpResponse,
        set_cookies: &[String],
    ) -> Result<(), BoxError> {
        let mut frame = Frame::new(
            frame::new_frame_id("resp"),
            FrameType::HttpResponse,
            serde_json::to_vec(response)?,
        )
        .with_meta(META_REQUEST_ID, response.request_id.as_str());
        cookies::attach_to_metadata(&mut frame.metadata, set_cookies);
        let frame = self.rotator.seal_frame(frame)?;
        let ack = self.send(session, frame).await?;
        debug!(request_id = %response.request_id, message = %ack.message, "Response sent");
        Ok(())
    }

    async fn send(&self, session: &Session, frame: Frame) -> Result<SendFrameResponse, BoxError> {
        self.relay
            .call(
                "SendFrame",
                &SendFrameRequest {
                    frame,
                    client_id: session.client_id.clone(),
                    tunnel_id: session.tunnel_id.clone(),
                },
            )
            .await
    }
}

fn error_response(request_id: &str, message: &str) -> HttpResponse {
    HttpResponse {
        request_id: request_id.to_string(),
        status: 500,
        status_text: "Internal Server Error".to_string(),
        headers: crate::messages::headers_to_json([("content-type", "text/plain; charset=utf-8")]),
        body: message.as_bytes().to_vec(),
    }
}
