//! Request/response correlation.
//!
//! [`CorrelationEngine::forward`] queues an `HTTP_REQUEST` frame for an agent
//! and records a [`PendingRequest`] lease keyed by request id. Exactly one of
//! three things then ends the lease: a matching response
//! ([`complete`](CorrelationEngine::complete)), the deadline
//! ([`expire`](CorrelationEngine::expire) / [`sweep_expired`](CorrelationEngine::sweep_expired)),
//! or the agent going away ([`release_for_agent`](CorrelationEngine::release_for_agent)).
//! Whoever removes the entry from the table owns the release; everyone else
//! sees a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::cookies;
use crate::dedup::DedupWindow;
use crate::frame::Frame;
use crate::html::{self, SharedRewriter};
use crate::messages::{header_pairs, HttpResponse};
use crate::queue::{OutboundQueues, QueueError};

/// Prefix of request ids used for fire-and-forget session syncs.
pub const SYNC_REQUEST_PREFIX: &str = "sync_session_";

/// Headers from the local app that must not be replayed to the browser.
const DROPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
];

/// What kind of caller is waiting, which decides how the response is shaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestClass {
    /// Asset fetched by the relay's static proxy; body is returned verbatim.
    Static { content_type: String },
    /// Page or API call from a browser.
    Dynamic,
    /// Session sync; nobody waits for the body.
    SessionSync,
}

impl RequestClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static { .. } => "static",
            Self::Dynamic => "dynamic",
            Self::SessionSync => "session_sync",
        }
    }
}

/// Response handed back to the original caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RelayedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }
}

/// How a lease ended, as seen by the waiting caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Released {
    Response(RelayedResponse),
    Expired,
    /// The target agent disconnected before answering.
    AgentGone(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Delivered,
    /// No lease for this request id (expired, released, or never forwarded).
    Unmatched,
    /// This `(request_id, frame_id)` response was already processed.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Completed,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("request {0} is already in flight")]
    DuplicateInFlight(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Everything needed to forward one request.
#[derive(Debug, Clone)]
pub struct Forward {
    pub request_id: String,
    pub target_agent_id: String,
    /// Browser the request came from, if any.
    pub origin: Option<String>,
    pub class: RequestClass,
    /// Path as the browser asked for it; drives response header defaults.
    pub path: String,
    /// Ready-to-queue `HTTP_REQUEST` frame.
    pub frame: Frame,
    pub timeout: Duration,
}

/// Relay-side record bridging a forwarded request to its response.
#[derive(Debug)]
pub struct PendingRequest {
    pub request_id: String,
    pub origin: Option<String>,
    pub target_agent_id: String,
    pub created_at_ms: u64,
    pub deadline_ms: u64,
    pub class: RequestClass,
    pub path: String,
    /// Distinguishes this lease from later ones reusing the same request id.
    lease: u64,
    responder: Option<oneshot::Sender<Released>>,
}

impl PendingRequest {
    fn release(self, outcome: Released) {
        if let Some(tx) = self.responder {
            if tx.send(outcome).is_err() {
                debug!(request_id = %self.request_id, "Caller already gone");
            }
        }
    }
}

/// Summary row for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingSummary {
    pub request_id: String,
    pub class: &'static str,
    pub target_agent_id: String,
    pub age_ms: u64,
}

type Table = Arc<Mutex<HashMap<String, PendingRequest>>>;

fn lock(table: &Table) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove `request_id` only while it still holds `lease`.
fn remove_lease(table: &Table, request_id: &str, lease: u64) -> bool {
    let mut table = lock(table);
    if table.get(request_id).is_some_and(|p| p.lease == lease) {
        table.remove(request_id);
        true
    } else {
        false
    }
}

/// Caller's side of a forwarded request.
///
/// Dropping the handle before the lease ends (the browser hung up) removes
/// the pending entry so nothing leaks.
pub struct PendingHandle {
    request_id: String,
    lease: u64,
    rx: oneshot::Receiver<Released>,
    timeout: Duration,
    table: Table,
}

impl PendingHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response or the deadline, whichever comes first.
    pub async fn wait(mut self) -> Released {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Released::Expired,
            Err(_) => {
                // A completion may have landed right at the deadline.
                if let Ok(outcome) = self.rx.try_recv() {
                    return outcome;
                }
                if remove_lease(&self.table, &self.request_id, self.lease) {
                    warn!(request_id = %self.request_id, "Request expired waiting for agent");
                }
                Released::Expired
            }
        }
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        if remove_lease(&self.table, &self.request_id, self.lease) {
            debug!(request_id = %self.request_id, "Caller left, pending request dropped");
        }
    }
}

pub struct CorrelationEngine {
    pending: Table,
    next_lease: AtomicU64,
    queues: Arc<OutboundQueues>,
    processed: DedupWindow,
    clock: SharedClock,
    rewriter: SharedRewriter,
    static_max_age_secs: u64,
}

impl CorrelationEngine {
    pub fn new(
        queues: Arc<OutboundQueues>,
        clock: SharedClock,
        rewriter: SharedRewriter,
        response_retention_ms: u64,
        static_max_age_secs: u64,
    ) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_lease: AtomicU64::new(1),
            queues,
            processed: DedupWindow::new(response_retention_ms, 100_000),
            clock,
            rewriter,
            static_max_age_secs,
        }
    }

    /// Queue the request frame for the agent and open a lease.
    ///
    /// A second forward under an id that is still pending is rejected and
    /// queues nothing.
    pub async fn forward(&self, fwd: Forward) -> Result<PendingHandle, ForwardError> {
        let (tx, rx) = oneshot::channel();
        let timeout = fwd.timeout;
        let request_id = fwd.request_id.clone();
        let lease = self.open_lease(&fwd, Some(tx))?;
        self.enqueue_or_close(fwd, lease).await?;
        Ok(PendingHandle {
            request_id,
            lease,
            rx,
            timeout,
            table: Arc::clone(&self.pending),
        })
    }

    /// Forward without a waiting caller. The lease still expires on its deadline.
    pub async fn forward_detached(&self, fwd: Forward) -> Result<(), ForwardError> {
        let lease = self.open_lease(&fwd, None)?;
        self.enqueue_or_close(fwd, lease).await
    }

    fn open_lease(
        &self,
        fwd: &Forward,
        responder: Option<oneshot::Sender<Released>>,
    ) -> Result<u64, ForwardError> {
        let now = self.clock.now_ms();
        let mut table = lock(&self.pending);
        if table.contains_key(&fwd.request_id) {
            warn!(request_id = %fwd.request_id, "Duplicate forward rejected");
            return Err(ForwardError::DuplicateInFlight(fwd.request_id.clone()));
        }
        #[allow(clippy::cast_possible_truncation)]
        let deadline_ms = now + fwd.timeout.as_millis() as u64;
        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        table.insert(
            fwd.request_id.clone(),
            PendingRequest {
                request_id: fwd.request_id.clone(),
                origin: fwd.origin.clone(),
                target_agent_id: fwd.target_agent_id.clone(),
                created_at_ms: now,
                deadline_ms,
                class: fwd.class.clone(),
                path: fwd.path.clone(),
                lease,
                responder,
            },
        );
        Ok(lease)
    }

    async fn enqueue_or_close(&self, fwd: Forward, lease: u64) -> Result<(), ForwardError> {
        let Forward {
            request_id,
            target_agent_id,
            class,
            path,
            frame,
            ..
        } = fwd;
        if let Err(e) = self.queues.enqueue(&target_agent_id, frame).await {
            remove_lease(&self.pending, &request_id, lease);
            return Err(e.into());
        }
        info!(
            request_id = %request_id,
            agent = %target_agent_id,
            class = class.as_str(),
            path = %path,
            "Forwarded request to agent"
        );
        Ok(())
    }

    /// Route an agent's response to whoever is waiting for it.
    pub fn complete(&self, response: &HttpResponse, response_frame: &Frame) -> Completion {
        let request_id = response.request_id.as_str();
        let key = format!("{request_id}_{}", response_frame.frame_id);
        if !self.processed.check_and_insert(&key, self.clock.now_ms()) {
            debug!(request_id, frame_id = %response_frame.frame_id, "Duplicate response frame ignored");
            return Completion::Duplicate;
        }

        let Some(pending) = lock(&self.pending).remove(request_id) else {
            warn!(request_id, status = response.status, "No pending request for response");
            return Completion::Unmatched;
        };

        let set_cookies = cookies::from_metadata(&response_frame.metadata);
        if pending.class == RequestClass::SessionSync {
            let has_session = set_cookies.iter().any(|c| c.starts_with("sessionid="));
            info!(
                request_id,
                status = response.status,
                cookies = set_cookies.len(),
                has_session,
                "Session sync completed"
            );
            return Completion::Delivered;
        }

        let shaped = self.shape(&pending, response, &set_cookies);
        debug!(
            request_id,
            status = shaped.status,
            bytes = shaped.body.len(),
            cookies = set_cookies.len(),
            "Response delivered"
        );
        pending.release(Released::Response(shaped));
        Completion::Delivered
    }

    fn shape(
        &self,
        pending: &PendingRequest,
        response: &HttpResponse,
        set_cookies: &[String],
    ) -> RelayedResponse {
        let mut out = RelayedResponse {
            status: response.status,
            headers: header_pairs(&response.headers)
                .into_iter()
                .filter(|(n, _)| !DROPPED_RESPONSE_HEADERS.contains(&n.to_ascii_lowercase().as_str()))
                .collect(),
            body: response.body.clone(),
        };

        if let RequestClass::Static { content_type } = &pending.class {
            out.set_header("content-type", content_type.as_str());
            out.set_header(
                "cache-control",
                format!("public, max-age={}", self.static_max_age_secs),
            );
            out.set_header("access-control-allow-origin", "*");
            out.set_header("access-control-allow-credentials", "true");
            return out;
        }

        if out.header("content-type").is_none() {
            out.set_header("content-type", default_dynamic_content_type(&pending.path));
        }
        out.set_header("access-control-allow-origin", "*");
        out.set_header(
            "access-control-allow-methods",
            "GET, POST, PUT, DELETE, OPTIONS",
        );
        out.set_header(
            "access-control-allow-headers",
            "Content-Type, x-tunnel-client-id, cookie, authorization, x-requested-with",
        );
        out.set_header(
            "access-control-expose-headers",
            "Content-Length, Content-Type, set-cookie, location",
        );
        out.set_header("access-control-allow-credentials", "true");

        if pending.path.contains("/accounts/") || pending.path.contains("/admin/") {
            out.set_header(
                "cache-control",
                "no-store, no-cache, must-revalidate, max-age=0",
            );
            out.set_header("pragma", "no-cache");
            out.set_header("expires", "0");
        }

        if !set_cookies.is_empty() {
            out.headers
                .retain(|(n, _)| !n.eq_ignore_ascii_case("set-cookie"));
            for cookie in set_cookies {
                out.headers.push(("set-cookie".to_string(), cookie.clone()));
            }
        }

        let is_html = out.header("content-type").is_some_and(html::is_html);
        if is_html && !out.body.is_empty() {
            let page = String::from_utf8_lossy(&out.body);
            out.body = self
                .rewriter
                .rewrite(&page, &pending.request_id)
                .into_bytes();
        }
        out
    }

    /// End a lease because its deadline passed. No-op if already ended.
    pub fn expire(&self, request_id: &str) -> bool {
        let Some(pending) = lock(&self.pending).remove(request_id) else {
            return false;
        };
        warn!(
            request_id,
            class = pending.class.as_str(),
            path = %pending.path,
            "Request expired"
        );
        pending.release(Released::Expired);
        true
    }

    /// Expire every lease whose deadline is at or before now.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let overdue: Vec<PendingRequest> = {
            let mut table = lock(&self.pending);
            let ids: Vec<String> = table
                .values()
                .filter(|p| p.deadline_ms <= now)
                .map(|p| p.request_id.clone())
                .collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        let count = overdue.len();
        for pending in overdue {
            warn!(request_id = %pending.request_id, class = pending.class.as_str(), "Lease expired");
            pending.release(Released::Expired);
        }
        let evicted = self.processed.sweep(now);
        if evicted > 0 {
            debug!(evicted, "Processed-response guard trimmed");
        }
        count
    }

    /// Release every lease targeting `agent_id`.
    pub fn release_for_agent(&self, agent_id: &str) -> usize {
        let gone: Vec<PendingRequest> = {
            let mut table = lock(&self.pending);
            let ids: Vec<String> = table
                .values()
                .filter(|p| p.target_agent_id == agent_id)
                .map(|p| p.request_id.clone())
                .collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        let count = gone.len();
        for pending in gone {
            pending.release(Released::AgentGone(agent_id.to_string()));
        }
        if count > 0 {
            warn!(agent = agent_id, released = count, "Released requests of departed agent");
        }
        count
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        lock(&self.pending).contains_key(request_id)
    }

    pub fn sync_status(&self, request_id: &str) -> SyncStatus {
        if self.is_pending(request_id) {
            SyncStatus::Pending
        } else {
            SyncStatus::Completed
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn summaries(&self) -> Vec<PendingSummary> {
        let now = self.clock.now_ms();
        let mut rows: Vec<PendingSummary> = lock(&self.pending)
            .values()
            .map(|p| PendingSummary {
                request_id: p.request_id.clone(),
                class: p.class.as_str(),
                target_agent_id: p.target_agent_id.clone(),
                age_ms: now.saturating_sub(p.created_at_ms),
            })
            .collect();
        rows.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        rows
    }
}

/// `Content-Type` for a dynamic response that did not declare one.
pub fn default_dynamic_content_type(path: &str) -> &'static str {
    let path = path.split('?').next().unwrap_or(path);
    if path.ends_with(".css") {
        "text/css; charset=utf-8"
    } else if path.ends_with(".js") {
        "application/javascript; charset=utf-8"
    } else if path.ends_with(".html") || path.contains("/accounts/") {
        "text/html; charset=utf-8"
    } else {
        "text/plain; charset=utf-8"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::frame::{FrameType, META_COOKIES};
    use crate::html::HtmlRewriter;

    struct Marker;

    impl HtmlRewriter for Marker {
        fn rewrite(&self, html: &str, request_id: &str) -> String {
            format!("{html}<!--{request_id}-->")
        }
    }

    async fn engine(clock: &Arc<ManualClock>) -> (CorrelationEngine, Arc<OutboundQueues>) {
        let queues = Arc::new(OutboundQueues::new(clock.clone(), 3, 64));
        queues.open("agent").await;
        let engine = CorrelationEngine::new(
            Arc::clone(&queues),
            clock.clone(),
            Arc::new(Marker),
            300_000,
            300,
        );
        (engine, queues)
    }

    fn forward(id: &str, class: RequestClass, path: &str) -> Forward {
        Forward {
            request_id: id.to_string(),
            target_agent_id: "agent".to_string(),
            origin: Some("browser".to_string()),
            class,
            path: path.to_string(),
            frame: Frame::new(format!("frame_{id}"), FrameType::HttpRequest, Vec::new()),
            timeout: Duration::from_secs(10),
        }
    }

    fn response(id: &str, status: u16, headers: &str, body: &[u8]) -> HttpResponse {
        HttpResponse {
            request_id: id.to_string(),
            status,
            headers: headers.to_string(),
            body: body.to_vec(),
            ..HttpResponse::default()
        }
    }

    fn response_frame(id: &str) -> Frame {
        Frame::new(id, FrameType::HttpResponse, Vec::new())
    }

    #[tokio::test]
    async fn response_reaches_the_caller_and_duplicates_are_ignored() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, queues) = engine(&clock).await;
        let handle = engine
            .forward(forward("r1", RequestClass::Dynamic, "/x"))
            .await
            .unwrap();
        assert_eq!(queues.len("agent").await, 1);
        assert!(engine.is_pending("r1"));

        let resp = response("r1", 201, r#"{"content-type":"application/json"}"#, b"{\"ok\":1}");
        assert_eq!(engine.complete(&resp, &response_frame("resp_1")), Completion::Delivered);
        assert_eq!(engine.complete(&resp, &response_frame("resp_1")), Completion::Duplicate);
        assert_eq!(engine.complete(&resp, &response_frame("resp_2")), Completion::Unmatched);

        let Released::Response(out) = handle.wait().await else {
            panic!("expected a response");
        };
        assert_eq!(out.status, 201);
        assert_eq!(out.body, b"{\"ok\":1}");
        assert_eq!(out.header("content-type"), Some("application/json"));
        assert_eq!(out.header("access-control-allow-origin"), Some("*"));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn second_forward_is_rejected_and_queues_nothing() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, queues) = engine(&clock).await;
        let _first = engine
            .forward(forward("r1", RequestClass::Dynamic, "/x"))
            .await
            .unwrap();
        let mut again = forward("r1", RequestClass::Dynamic, "/x");
        again.frame.frame_id = "frame_r1_retry".into();
        assert!(matches!(
            engine.forward(again).await,
            Err(ForwardError::DuplicateInFlight(id)) if id == "r1"
        ));
        assert_eq!(queues.len("agent").await, 1);
        assert!(engine.is_pending("r1"));
    }

    #[tokio::test]
    async fn complete_after_expire_is_unmatched() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, _queues) = engine(&clock).await;
        let handle = engine
            .forward(forward("r1", RequestClass::Dynamic, "/x"))
            .await
            .unwrap();
        assert!(engine.expire("r1"));
        assert!(!engine.expire("r1"));
        assert_eq!(handle.wait().await, Released::Expired);

        let resp = response("r1", 200, "{}", b"late");
        assert_eq!(engine.complete(&resp, &response_frame("late")), Completion::Unmatched);
        assert!(!engine.is_pending("r1"));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_caller_times_out() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, _queues) = engine(&clock).await;
        let mut fwd = forward("r1", RequestClass::Dynamic, "/x");
        fwd.timeout = Duration::from_millis(50);
        let handle = engine.forward(fwd).await.unwrap();
        assert_eq!(handle.wait().await, Released::Expired);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn sweep_expires_overdue_leases_only() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, _queues) = engine(&clock).await;
        let mut short = forward("short", RequestClass::SessionSync, "/");
        short.timeout = Duration::from_millis(100);
        engine.forward_detached(short).await.unwrap();
        let _long = engine
            .forward(forward("long", RequestClass::Dynamic, "/x"))
            .await
            .unwrap();

        clock.advance(100);
        assert_eq!(engine.sweep_expired(), 1);
        assert!(!engine.is_pending("short"));
        assert!(engine.is_pending("long"));
    }

    #[tokio::test]
    async fn dropped_handle_leaves_nothing_behind() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, _queues) = engine(&clock).await;
        let handle = engine
            .forward(forward("r1", RequestClass::Dynamic, "/x"))
            .await
            .unwrap();
        drop(handle);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn agent_departure_releases_its_requests() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, _queues) = engine(&clock).await;
        let handle = engine
            .forward(forward("r1", RequestClass::Dynamic, "/x"))
            .await
            .unwrap();
        assert_eq!(engine.release_for_agent("agent"), 1);
        assert_eq!(handle.wait().await, Released::AgentGone("agent".into()));
    }

    #[tokio::test]
    async fn static_responses_are_cached_and_never_rewritten() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, _queues) = engine(&clock).await;
        let class = RequestClass::Static {
            content_type: "text/css; charset=utf-8".into(),
        };
        let handle = engine
            .forward(forward("s1", class, "/static/site.css"))
            .await
            .unwrap();
        let resp = response("s1", 200, r#"{"content-type":"text/html","content-length":"9"}"#, b"body{}");
        engine.complete(&resp, &response_frame("rs1"));

        let Released::Response(out) = handle.wait().await else {
            panic!("expected a response");
        };
        assert_eq!(out.body, b"body{}");
        assert_eq!(out.header("content-type"), Some("text/css; charset=utf-8"));
        assert_eq!(out.header("cache-control"), Some("public, max-age=300"));
        assert_eq!(out.header("content-length"), None);
    }

    #[tokio::test]
    async fn dynamic_html_is_rewritten_and_gets_cookies() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, _queues) = engine(&clock).await;
        let handle = engine
            .forward(forward("d1", RequestClass::Dynamic, "/admin/login/"))
            .await
            .unwrap();
        let resp = response(
            "d1",
            200,
            r#"{"content-type":"text/html; charset=utf-8","set-cookie":"stale=1"}"#,
            b"<html></html>",
        );
        let frame = response_frame("rd1").with_meta(
            META_COOKIES,
            r#"["sessionid=abc; HttpOnly","csrftoken=t; Path=/"]"#,
        );
        engine.complete(&resp, &frame);

        let Released::Response(out) = handle.wait().await else {
            panic!("expected a response");
        };
        assert_eq!(out.body, b"<html></html><!--d1-->");
        let cookies: Vec<&str> = out.header_values("set-cookie").collect();
        assert_eq!(cookies, ["sessionid=abc; HttpOnly", "csrftoken=t; Path=/"]);
        assert_eq!(
            out.header("cache-control"),
            Some("no-store, no-cache, must-revalidate, max-age=0")
        );
    }

    #[tokio::test]
    async fn session_sync_is_fire_and_forget() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, queues) = engine(&clock).await;
        let id = format!("{SYNC_REQUEST_PREFIX}1");
        engine
            .forward_detached(forward(&id, RequestClass::SessionSync, "/"))
            .await
            .unwrap();
        assert_eq!(engine.sync_status(&id), SyncStatus::Pending);
        assert_eq!(queues.len("agent").await, 1);

        let resp = response(&id, 200, "{}", b"<html>");
        assert_eq!(engine.complete(&resp, &response_frame("sync_r")), Completion::Delivered);
        assert_eq!(engine.sync_status(&id), SyncStatus::Completed);
    }

    #[tokio::test]
    async fn finished_lease_does_not_end_a_reused_request_id() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, _queues) = engine(&clock).await;
        let first = engine
            .forward(forward("r1", RequestClass::Dynamic, "/x"))
            .await
            .unwrap();
        let resp = response("r1", 200, "{}", b"one");
        assert_eq!(engine.complete(&resp, &response_frame("resp_a")), Completion::Delivered);

        let mut again = forward("r1", RequestClass::Dynamic, "/x");
        again.frame.frame_id = "frame_r1_again".into();
        let second = engine.forward(again).await.unwrap();

        assert!(matches!(first.wait().await, Released::Response(r) if r.body == b"one"));
        assert!(engine.is_pending("r1"));

        let resp = response("r1", 200, "{}", b"two");
        assert_eq!(engine.complete(&resp, &response_frame("resp_b")), Completion::Delivered);
        assert!(matches!(second.wait().await, Released::Response(r) if r.body == b"two"));
    }

    #[tokio::test]
    async fn dropping_an_expired_handle_keeps_the_newer_lease() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, _queues) = engine(&clock).await;
        let stale = engine
            .forward(forward("r1", RequestClass::Dynamic, "/x"))
            .await
            .unwrap();
        assert!(engine.expire("r1"));

        let mut again = forward("r1", RequestClass::Dynamic, "/x");
        again.frame.frame_id = "frame_r1_again".into();
        let _fresh = engine.forward(again).await.unwrap();
        drop(stale);
        assert!(engine.is_pending("r1"));
    }

    #[tokio::test]
    async fn forwarding_to_an_agent_without_a_queue_leaves_no_lease() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, _queues) = engine(&clock).await;
        let mut fwd = forward("r1", RequestClass::Dynamic, "/x");
        fwd.target_agent_id = "gone".into();
        assert!(matches!(
            engine.forward(fwd).await,
            Err(ForwardError::Queue(QueueError::UnknownClient(id))) if id == "gone"
        ));
        assert!(!engine.is_pending("r1"));
    }

    #[test]
    fn dynamic_content_type_defaults() {
        assert_eq!(default_dynamic_content_type("/a.css"), "text/css; charset=utf-8");
        assert_eq!(default_dynamic_content_type("/accounts/login/"), "text/html; charset=utf-8");
        assert_eq!(default_dynamic_content_type("/api/x"), "text/plain; charset=utf-8");
    }
}
