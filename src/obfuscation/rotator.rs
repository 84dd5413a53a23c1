//! Clock-driven rotation of the default obfuscation method.
//!
//! The current method is an index into an ordered list, advanced one step per
//! elapsed period (wrapping). State is two atomics, so rotating never waits
//! on an in-flight obfuscate or deobfuscate; envelopes name their own method
//! and stay decodable after any number of rotations.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use super::{CodecError, CodecSet, Envelope, Method};
use crate::clock::SharedClock;
use crate::frame::Frame;

/// Repository default rotation period.
pub const DEFAULT_ROTATION_MS: u64 = 5 * 60 * 1000;

pub struct Rotator {
    codecs: Arc<CodecSet>,
    methods: Vec<Method>,
    index: AtomicUsize,
    period_ms: u64,
    last_rotation_ms: AtomicU64,
    clock: SharedClock,
}

impl Rotator {
    /// `methods` is the rotation order; the first entry is current at start.
    /// An empty list falls back to [`Method::ALL`].
    pub fn new(
        codecs: Arc<CodecSet>,
        methods: Vec<Method>,
        period_ms: u64,
        clock: SharedClock,
    ) -> Self {
        let methods = if methods.is_empty() {
            Method::ALL.to_vec()
        } else {
            methods
        };
        let now = clock.now_ms();
        Self {
            codecs,
            methods,
            index: AtomicUsize::new(0),
            period_ms: period_ms.max(1),
            last_rotation_ms: AtomicU64::new(now),
            clock,
        }
    }

    /// Parse configured method names, skipping (and logging) unknown ones.
    pub fn parse_methods(names: &[String]) -> Vec<Method> {
        names
            .iter()
            .filter_map(|n| match n.parse() {
                Ok(m) => Some(m),
                Err(_) => {
                    warn!(method = %n, "Ignoring unknown obfuscation method in rotation list");
                    None
                }
            })
            .collect()
    }

    pub fn codecs(&self) -> &CodecSet {
        &self.codecs
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// Method new envelopes are sealed with right now.
    pub fn current(&self) -> Method {
        self.methods[self.index.load(Ordering::Acquire) % self.methods.len()]
    }

    /// Advance to the next method immediately and restart the period.
    pub fn rotate(&self) -> Method {
        self.last_rotation_ms
            .store(self.clock.now_ms(), Ordering::Release);
        self.advance(1)
    }

    /// Apply every rotation whose period has elapsed. Returns the new method
    /// if at least one step was taken.
    pub fn tick(&self) -> Option<Method> {
        let now = self.clock.now_ms();
        let last = self.last_rotation_ms.load(Ordering::Acquire);
        let elapsed = now.saturating_sub(last);
        let steps = elapsed / self.period_ms;
        if steps == 0 {
            return None;
        }
        let next_mark = last + steps * self.period_ms;
        // Only one caller wins a given period boundary.
        if self
            .last_rotation_ms
            .compare_exchange(last, next_mark, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let steps = (steps % self.methods.len() as u64) as usize;
        Some(self.advance(steps))
    }

    fn advance(&self, steps: usize) -> Method {
        let len = self.methods.len();
        let prev = self
            .index
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| {
                Some((i % len + steps) % len)
            })
            .unwrap_or(0);
        let method = self.methods[(prev % len + steps) % len];
        info!(method = %method, "Rotated obfuscation method");
        method
    }

    /// Seal with the current method (after applying any due rotation).
    pub fn obfuscate(&self, data: &[u8]) -> Result<Envelope, CodecError> {
        self.tick();
        self.codecs.codec(self.current()).seal(data)
    }

    /// Seal with an explicitly named method; unknown names fall back to base64.
    pub fn obfuscate_with(&self, data: &[u8], method: &str) -> Result<Envelope, CodecError> {
        self.codecs.obfuscate(data, method)
    }

    pub fn deobfuscate(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        self.codecs.deobfuscate(envelope)
    }

    /// Replace a frame's plain payload with an envelope sealed by the current
    /// method, recording the method on the frame.
    pub fn seal_frame(&self, mut frame: Frame) -> Result<Frame, CodecError> {
        let envelope = self.obfuscate(&frame.payload)?;
        frame.obfuscation_method.clone_from(&envelope.method);
        frame.payload = envelope.to_bytes()?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn rotator(clock: Arc<ManualClock>) -> Rotator {
        let codecs = Arc::new(CodecSet::from_keys(Some(&"11".repeat(32)), "k").unwrap());
        Rotator::new(codecs, Method::ALL.to_vec(), 1_000, clock)
    }

    #[test]
    fn rotation_follows_the_clock_and_wraps() {
        let clock = Arc::new(ManualClock::new(0));
        let r = rotator(clock.clone());
        assert_eq!(r.current(), Method::Xor);
        assert_eq!(r.tick(), None);

        clock.advance(999);
        assert_eq!(r.tick(), None);
        clock.advance(1);
        assert_eq!(r.tick(), Some(Method::Aes));
        assert_eq!(r.tick(), None);

        // Two periods elapsed at once: two steps, wrapping back to the start.
        clock.advance(2_000);
        assert_eq!(r.tick(), Some(Method::Xor));
    }

    #[test]
    fn manual_rotate_restarts_the_period() {
        let clock = Arc::new(ManualClock::new(0));
        let r = rotator(clock.clone());
        clock.advance(900);
        assert_eq!(r.rotate(), Method::Aes);
        clock.advance(900);
        assert_eq!(r.tick(), None);
        assert_eq!(r.current(), Method::Aes);
    }

    #[test]
    fn envelopes_survive_rotation() {
        let clock = Arc::new(ManualClock::new(0));
        let r = rotator(clock.clone());
        let sealed: Vec<Envelope> = (0..3)
            .map(|_| {
                let env = r.obfuscate(b"in flight").unwrap();
                clock.advance(1_000);
                env
            })
            .collect();
        let methods: Vec<&str> = sealed.iter().map(|e| e.method.as_str()).collect();
        assert_eq!(methods, ["xor", "aes", "base64"]);
        for env in &sealed {
            assert_eq!(r.deobfuscate(env).unwrap(), b"in flight");
        }
    }

    #[test]
    fn sealed_frames_open_with_the_shared_codecs() {
        use crate::frame::FrameType;

        let clock = Arc::new(ManualClock::new(0));
        let r = rotator(clock);
        let frame = Frame::new("f", FrameType::HttpResponse, b"{\"status\":200}".to_vec());
        let sealed = r.seal_frame(frame).unwrap();
        assert_eq!(sealed.obfuscation_method, "xor");
        assert_ne!(sealed.payload, b"{\"status\":200}");
        assert_eq!(r.codecs().open_frame(&sealed).unwrap(), b"{\"status\":200}");
    }

    #[test]
    fn unknown_names_are_skipped() {
        let parsed = Rotator::parse_methods(&["aes".into(), "bogus".into(), "xor".into()]);
        assert_eq!(parsed, vec![Method::Aes, Method::Xor]);
    }

    #[test]
    fn empty_list_uses_all_methods() {
        let codecs = Arc::new(CodecSet::from_keys(None, "").unwrap());
        let r = Rotator::new(codecs, Vec::new(), 10, Arc::new(ManualClock::new(0)));
        assert_eq!(r.methods(), &Method::ALL);
    }
}
