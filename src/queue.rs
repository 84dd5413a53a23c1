//! Per-client outbound frame queues and the poll cursor.
//!
//! Each client owns a FIFO of undelivered frames behind its own lock, so
//! traffic for one client never contends with another. Waiters (long polls)
//! are woken through a per-queue [`Notify`] the moment a frame is enqueued.
//!
//! Cursor rules for [`OutboundQueues::poll`]:
//! - empty cursor: the whole queue
//! - cursor naming a queued frame: every frame after it
//! - cursor naming the last acknowledged frame: every frame still queued
//! - anything else: the client is out of sync and gets the most recent
//!   `resync_suffix` frames
//!
//! A successful poll acknowledges through the last frame it returned.
//!
//! Queues exist only for registered clients: [`OutboundQueues::open`] or
//! [`OutboundQueues::reset`] creates one, [`OutboundQueues::remove`] drops it,
//! and enqueueing for anyone else fails.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::frame::Frame;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub frame: Frame,
    pub enqueued_at_ms: u64,
    /// Position in the client's queue, strictly increasing.
    pub seq: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("frame {0} is already queued for this client")]
    DuplicateFrame(String),
    #[error("no queue for client {0}")]
    UnknownClient(String),
}

/// Frames handed out by one poll.
#[derive(Debug, Clone, Default)]
pub struct PollBatch {
    pub frames: Vec<Frame>,
    /// Id of the last frame returned; the cursor for the next poll.
    pub cursor: Option<String>,
    /// The supplied cursor was unknown and only a recent suffix was returned.
    pub resynced: bool,
}

impl PollBatch {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Default)]
struct Buffer {
    entries: VecDeque<QueueEntry>,
    next_seq: u64,
    /// Last acknowledged frame and its sequence number.
    acked: Option<(String, u64)>,
}

impl Buffer {
    fn position(&self, frame_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.frame.frame_id == frame_id)
    }

    fn select(&self, cursor: &str, resync_suffix: usize) -> (Vec<&QueueEntry>, bool) {
        if cursor.is_empty() {
            return (self.entries.iter().collect(), false);
        }
        if let Some(pos) = self.position(cursor) {
            return (self.entries.iter().skip(pos + 1).collect(), false);
        }
        if let Some((acked_id, acked_seq)) = &self.acked {
            if acked_id == cursor {
                let after = self.entries.iter().filter(|e| e.seq > *acked_seq).collect();
                return (after, false);
            }
        }
        let skip = self.entries.len().saturating_sub(resync_suffix);
        (self.entries.iter().skip(skip).collect(), true)
    }

    /// Trim through `frame_id`. Unknown ids (already trimmed or never queued)
    /// are a no-op, so acknowledgment can only move forward.
    fn acknowledge(&mut self, frame_id: &str) -> usize {
        let Some(pos) = self.position(frame_id) else {
            return 0;
        };
        let seq = self.entries[pos].seq;
        self.entries.drain(..=pos);
        self.acked = Some((frame_id.to_string(), seq));
        pos + 1
    }
}

struct ClientQueue {
    buffer: Mutex<Buffer>,
    notify: Notify,
}

impl ClientQueue {
    fn new() -> Self {
        Self {
            buffer: Mutex::new(Buffer::default()),
            notify: Notify::new(),
        }
    }
}

pub struct OutboundQueues {
    queues: RwLock<HashMap<String, Arc<ClientQueue>>>,
    clock: SharedClock,
    resync_suffix: usize,
    max_len: usize,
}

impl OutboundQueues {
    pub fn new(clock: SharedClock, resync_suffix: usize, max_len: usize) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            clock,
            resync_suffix: resync_suffix.max(1),
            max_len: max_len.max(1),
        }
    }

    async fn queue(&self, client_id: &str) -> Option<Arc<ClientQueue>> {
        self.queues.read().await.get(client_id).cloned()
    }

    /// Make sure `client_id` has a queue, keeping any frames already in it.
    pub async fn open(&self, client_id: &str) {
        self.queues
            .write()
            .await
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(ClientQueue::new()));
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.queues.read().await.contains_key(client_id)
    }

    /// Start `client_id` with an empty queue, discarding anything left over.
    /// Pollers blocked on the old queue are woken.
    pub async fn reset(&self, client_id: &str) {
        let old = self
            .queues
            .write()
            .await
            .insert(client_id.to_string(), Arc::new(ClientQueue::new()));
        if let Some(old) = old {
            old.notify.notify_waiters();
        }
    }

    /// Drop a client's queue. Returns how many undelivered frames were discarded.
    pub async fn remove(&self, client_id: &str) -> usize {
        let Some(queue) = self.queues.write().await.remove(client_id) else {
            return 0;
        };
        queue.notify.notify_waiters();
        let dropped = queue.buffer.lock().await.entries.len();
        if dropped > 0 {
            debug!(client_id, dropped, "Discarded undelivered frames");
        }
        dropped
    }

    /// Append a frame and wake any blocked poller. The same `frame_id` may not
    /// be queued twice for one client, and the client must have a queue.
    pub async fn enqueue(&self, client_id: &str, frame: Frame) -> Result<u64, QueueError> {
        let queue = self
            .queue(client_id)
            .await
            .ok_or_else(|| QueueError::UnknownClient(client_id.to_string()))?;
        let seq = {
            let mut buf = queue.buffer.lock().await;
            if buf.position(&frame.frame_id).is_some() {
                return Err(QueueError::DuplicateFrame(frame.frame_id));
            }
            if buf.entries.len() >= self.max_len {
                if let Some(evicted) = buf.entries.pop_front() {
                    warn!(
                        client_id,
                        frame_id = %evicted.frame.frame_id,
                        "Queue full, dropped oldest undelivered frame"
                    );
                }
            }
            let seq = buf.next_seq;
            buf.next_seq += 1;
            buf.entries.push_back(QueueEntry {
                frame,
                enqueued_at_ms: self.clock.now_ms(),
                seq,
            });
            seq
        };
        queue.notify.notify_waiters();
        Ok(seq)
    }

    /// Return pending frames for `cursor` and acknowledge through the last one.
    /// Never waits.
    pub async fn poll(&self, client_id: &str, cursor: &str) -> PollBatch {
        let Some(queue) = self.queue(client_id).await else {
            return PollBatch::default();
        };
        let mut buf = queue.buffer.lock().await;
        self.take(client_id, &mut buf, cursor)
    }

    fn take(&self, client_id: &str, buf: &mut Buffer, cursor: &str) -> PollBatch {
        let (selected, resynced) = buf.select(cursor, self.resync_suffix);
        let frames: Vec<Frame> = selected.into_iter().map(|e| e.frame.clone()).collect();
        if resynced {
            warn!(
                client_id,
                cursor,
                returned = frames.len(),
                "Unknown poll cursor, resynchronizing with recent frames"
            );
        }
        let cursor = frames.last().map(|f| f.frame_id.clone());
        if let Some(last) = &cursor {
            buf.acknowledge(last);
        }
        PollBatch {
            frames,
            cursor,
            resynced,
        }
    }

    /// Like [`poll`](Self::poll), but if nothing is pending waits up to
    /// `timeout` for a frame to arrive. A client without a queue, or whose
    /// queue is removed mid-wait, gets an empty batch. Dropping the future
    /// abandons the wait without side effects.
    pub async fn wait_for_frames(
        &self,
        client_id: &str,
        cursor: &str,
        timeout: Duration,
    ) -> PollBatch {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let Some(queue) = self.queue(client_id).await else {
                return PollBatch::default();
            };
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            // Register before checking so an enqueue in between is not missed.
            notified.as_mut().enable();

            {
                let mut buf = queue.buffer.lock().await;
                let batch = self.take(client_id, &mut buf, cursor);
                if !batch.is_empty() {
                    return batch;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return PollBatch::default();
            }
        }
    }

    /// Trim through `frame_id`. Returns the number of frames removed; unknown
    /// or already-trimmed ids remove nothing.
    pub async fn acknowledge(&self, client_id: &str, frame_id: &str) -> usize {
        match self.queue(client_id).await {
            Some(queue) => queue.buffer.lock().await.acknowledge(frame_id),
            None => 0,
        }
    }

    pub async fn len(&self, client_id: &str) -> usize {
        match self.queue(client_id).await {
            Some(queue) => queue.buffer.lock().await.entries.len(),
            None => 0,
        }
    }

    /// Undelivered frame count per client, sorted by client id.
    pub async fn depths(&self) -> Vec<(String, usize)> {
        let queues: Vec<(String, Arc<ClientQueue>)> = self
            .queues
            .read()
            .await
            .iter()
            .map(|(id, q)| (id.clone(), Arc::clone(q)))
            .collect();
        let mut out = Vec::with_capacity(queues.len());
        for (id, q) in queues {
            let depth = q.buffer.lock().await.entries.len();
            out.push((id, depth));
        }
        out.sort();
        out
    }
}
