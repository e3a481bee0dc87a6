#![cfg_attr(test, allow(clippy::unwrap_used))]

//! A bounded pool of frame buffers with an elastic overflow region.
//!
//! The pool caps how many frames the dataplane keeps in flight: once
//! [`HIGH_THRESHOLD`] buffers are committed, [`FrameCache::acquire`] reports
//! backpressure and the dispatch loop stops posting new TAP reads. The
//! overflow region exists so that paths which must not fail (a frame already
//! received from a peer, a synthetic ICC message) can still get a buffer; it
//! grows the pool and is kept afterwards.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use eth_frame::{FrameBuffer, FrameError};
use parking_lot::{Condvar, Mutex};

/// Frames the pool provisions up front.
pub const CACHE_IO_MAX: usize = 32;

/// Committed-buffer count at which `acquire` starts failing.
pub const HIGH_THRESHOLD: usize = CACHE_IO_MAX - 1;

#[derive(Clone)]
pub struct FrameCache {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    reclaimed: Condvar,
}

struct Inner {
    free: Vec<FrameBuffer>,
    /// Buffers ever allocated, pooled or out.
    total: usize,
    /// Buffers currently handed out.
    committed: usize,
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCache {
    pub fn new() -> Self {
        let free = std::iter::repeat_with(FrameBuffer::new)
            .take(CACHE_IO_MAX)
            .collect();

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    free,
                    total: CACHE_IO_MAX,
                    committed: 0,
                }),
                reclaimed: Condvar::new(),
            }),
        }
    }

    /// Takes a buffer unless the pool is at its high-water mark.
    ///
    /// `None` is the backpressure signal: the caller drops the source event
    /// instead of queueing more work.
    pub fn acquire(&self) -> Option<Frame> {
        let mut inner = self.shared.inner.lock();
        if inner.committed >= HIGH_THRESHOLD {
            return None;
        }

        Some(self.take(&mut inner))
    }

    /// Takes a buffer, growing the pool if necessary. Never fails.
    pub fn acquire_or_grow(&self) -> Frame {
        let mut inner = self.shared.inner.lock();
        if inner.free.is_empty() {
            inner.free.push(FrameBuffer::new());
            inner.total += 1;
            tracing::debug!(total = inner.total, "Frame cache grew beyond its provisioned size");
        }

        self.take(&mut inner)
    }

    /// Like [`FrameCache::acquire_or_grow`] but initialised with wire bytes
    /// (overlay header included) as received from a peer link.
    pub fn acquire_with_data(&self, bytes: &[u8]) -> Result<Frame, FrameError> {
        let mut frame = self.acquire_or_grow();
        frame.load_wire(bytes)?;

        Ok(frame)
    }

    /// Blocks the calling thread until the pool is below the high-water
    /// mark or the timeout elapses. For the TAP reader thread, which must
    /// keep checking its shutdown flag; dispatch paths use the non-blocking
    /// variants.
    pub fn acquire_timeout(&self, timeout: std::time::Duration) -> Option<Frame> {
        let deadline = std::time::Instant::now() + timeout;

        let mut inner = self.shared.inner.lock();
        while inner.committed >= HIGH_THRESHOLD {
            if self
                .shared
                .reclaimed
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return None;
            }
        }

        Some(self.take(&mut inner))
    }

    pub fn is_over_provisioned(&self) -> bool {
        self.shared.inner.lock().committed >= HIGH_THRESHOLD
    }

    /// Buffers currently handed out.
    pub fn committed(&self) -> usize {
        self.shared.inner.lock().committed
    }

    /// Buffers ever allocated, pooled or out.
    pub fn allocated(&self) -> usize {
        self.shared.inner.lock().total
    }

    fn take(&self, inner: &mut Inner) -> Frame {
        let mut buf = inner
            .free
            .pop()
            .unwrap_or_else(FrameBuffer::new); // committed < total implies a free buffer; belt for the invariant
        buf.initialize();
        inner.committed += 1;

        Frame {
            buf: Some(buf),
            shared: self.shared.clone(),
        }
    }
}

/// A pooled frame buffer; returns to its cache on drop.
pub struct Frame {
    buf: Option<FrameBuffer>,
    shared: Arc<Shared>,
}

impl Deref for Frame {
    type Target = FrameBuffer;

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for Frame {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.buf {
            Some(buf) => buf.fmt(f),
            None => f.debug_struct("Frame").finish_non_exhaustive(),
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        let Some(buf) = self.buf.take() else {
            return;
        };

        let mut inner = self.shared.inner.lock();
        inner.free.push(buf);
        inner.committed -= 1;
        drop(inner);

        self.shared.reclaimed.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_reclaim_leaves_commitment_unchanged() {
        let cache = FrameCache::new();
        assert_eq!(cache.committed(), 0);

        let frame = cache.acquire().unwrap();
        assert_eq!(cache.committed(), 1);

        drop(frame);
        assert_eq!(cache.committed(), 0);
        assert_eq!(cache.allocated(), CACHE_IO_MAX);
    }

    #[test]
    fn acquire_fails_at_high_water_mark() {
        let cache = FrameCache::new();

        let frames: Vec<_> = std::iter::repeat_with(|| cache.acquire())
            .take_while(Option::is_some)
            .flatten()
            .collect();

        assert_eq!(frames.len(), HIGH_THRESHOLD);
        assert!(cache.is_over_provisioned());
        assert!(cache.acquire().is_none());

        drop(frames);
        assert!(!cache.is_over_provisioned());
        assert!(cache.acquire().is_some());
    }

    #[test]
    fn acquire_or_grow_never_fails() {
        let cache = FrameCache::new();

        let frames: Vec<_> = std::iter::repeat_with(|| cache.acquire_or_grow())
            .take(CACHE_IO_MAX * 2)
            .collect();

        assert_eq!(frames.len(), CACHE_IO_MAX * 2);
        assert_eq!(cache.allocated(), CACHE_IO_MAX * 2);

        // The elastic region is kept after reclaim.
        drop(frames);
        assert_eq!(cache.allocated(), CACHE_IO_MAX * 2);
        assert_eq!(cache.committed(), 0);
    }

    #[test]
    fn acquire_with_data_copies_wire_bytes() {
        let cache = FrameCache::new();
        let wire = [&[0x0A, 0x01][..], &[0xEE; 60][..]].concat();

        let frame = cache.acquire_with_data(&wire).unwrap();

        assert_eq!(frame.wire(), &wire[..]);
        assert_eq!(frame.len(), 60);
    }

    #[test]
    fn acquire_with_data_rejects_oversize() {
        let cache = FrameCache::new();
        let wire = vec![0u8; eth_frame::FRAME_CAPACITY + 1];

        assert!(cache.acquire_with_data(&wire).is_err());
        // The buffer taken for the failed copy is returned.
        assert_eq!(cache.committed(), 0);
    }

    #[test]
    fn timed_acquire_wakes_on_reclaim() {
        let cache = FrameCache::new();
        let frames: Vec<_> = std::iter::repeat_with(|| cache.acquire())
            .take_while(Option::is_some)
            .flatten()
            .collect();
        assert!(cache.is_over_provisioned());

        let waiter = {
            let cache = cache.clone();
            std::thread::spawn(move || cache.acquire_timeout(std::time::Duration::from_secs(5)))
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(frames);

        let frame = waiter.join().unwrap().expect("reclaim should wake the waiter");
        assert!(frame.is_empty());
    }

    #[test]
    fn timed_acquire_gives_up_when_saturated() {
        let cache = FrameCache::new();
        let _frames: Vec<_> = std::iter::repeat_with(|| cache.acquire())
            .take_while(Option::is_some)
            .flatten()
            .collect();

        let acquired = cache.acquire_timeout(std::time::Duration::from_millis(10));

        assert!(acquired.is_none());
    }
}
