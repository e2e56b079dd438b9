//! Version tokens for volatile constant buffers and upload chunks.
//!
//! A version is one 64-bit word:
//!
//! ```text
//! bit  63     submitted flag
//! bits 60:56  queue index
//! bits 55:0   instance id (recording id before submit, submission id after)
//! ```
//!
//! Zero means *available*. Tokens are claimed and promoted with atomic
//! compare-exchange so writes from multiple command lists on multiple queues
//! never hand out the same version twice.

use crate::types::{QueueKind, MAX_QUEUES};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const VERSION_SUBMITTED_FLAG: u64 = 1 << 63;
pub const VERSION_QUEUE_SHIFT: u32 = 56;
pub const VERSION_QUEUE_MASK: u64 = 0x1f;
pub const VERSION_ID_MASK: u64 = (1 << 56) - 1;

#[inline]
pub fn make_version(id: u64, queue: QueueKind, submitted: bool) -> u64 {
    let mut version =
        (id & VERSION_ID_MASK) | ((queue.index() as u64 & VERSION_QUEUE_MASK) << VERSION_QUEUE_SHIFT);
    if submitted {
        version |= VERSION_SUBMITTED_FLAG;
    }
    version
}

#[inline]
pub fn version_id(version: u64) -> u64 {
    version & VERSION_ID_MASK
}

#[inline]
pub fn version_queue(version: u64) -> usize {
    ((version >> VERSION_QUEUE_SHIFT) & VERSION_QUEUE_MASK) as usize
}

#[inline]
pub fn version_submitted(version: u64) -> bool {
    version & VERSION_SUBMITTED_FLAG != 0
}

/// Whether a token's storage may be handed out again, given a snapshot of
/// each queue's last-finished submission id.
#[inline]
pub fn version_available(version: u64, last_finished: &[u64; MAX_QUEUES]) -> bool {
    if version == 0 {
        return true;
    }
    if !version_submitted(version) {
        return false;
    }
    let queue = version_queue(version);
    match last_finished.get(queue) {
        Some(finished) => version_id(version) <= *finished,
        // Queue index does not decode to a live queue; never recycle.
        None => false,
    }
}

/// The per-buffer array of version tokens plus a rotating probe cursor.
pub struct VersionTracking {
    tokens: Vec<AtomicU64>,
    search_start: AtomicU32,
}

impl VersionTracking {
    pub fn new(max_versions: u32) -> Self {
        Self {
            tokens: (0..max_versions).map(|_| AtomicU64::new(0)).collect(),
            search_start: AtomicU32::new(0),
        }
    }

    pub fn max_versions(&self) -> u32 {
        self.tokens.len() as u32
    }

    /// Claims the first available version for a pending (unsubmitted) write.
    ///
    /// Linear-probes from the rotating cursor; a lost compare-exchange race
    /// restarts the probe. Returns `None` when every version is in use.
    pub fn claim(
        &self,
        queue: QueueKind,
        recording_id: u64,
        last_finished: &[u64; MAX_QUEUES],
    ) -> Option<u32> {
        let count = self.tokens.len() as u32;
        if count == 0 {
            return None;
        }
        let pending = make_version(recording_id, queue, false);

        'probe: loop {
            let start = self.search_start.load(Ordering::Relaxed);
            for step in 0..count {
                let slot = (start + step) % count;
                let current = self.tokens[slot as usize].load(Ordering::Acquire);
                if version_available(current, last_finished) {
                    match self.tokens[slot as usize].compare_exchange(
                        current,
                        pending,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            self.search_start.store((slot + 1) % count, Ordering::Relaxed);
                            return Some(slot);
                        }
                        // Another thread touched this slot; rescan.
                        Err(_) => continue 'probe,
                    }
                }
            }
            return None;
        }
    }

    /// Promotes a pending token to submitted at submission time. Tokens that
    /// were changed by another path since the claim are left alone.
    pub fn mark_submitted(
        &self,
        version: u32,
        queue: QueueKind,
        recording_id: u64,
        submission_id: u64,
    ) {
        let pending = make_version(recording_id, queue, false);
        let submitted = make_version(submission_id, queue, true);
        let _ = self.tokens[version as usize].compare_exchange(
            pending,
            submitted,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    #[cfg(test)]
    fn raw(&self, version: u32) -> u64 {
        self.tokens[version as usize].load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: [u64; MAX_QUEUES] = [0; MAX_QUEUES];

    #[test]
    fn token_bit_layout() {
        let v = make_version(0x1234, QueueKind::Compute, true);
        assert!(version_submitted(v));
        assert_eq!(version_queue(v), QueueKind::Compute.index());
        assert_eq!(version_id(v), 0x1234);

        let v = make_version(VERSION_ID_MASK + 5, QueueKind::Graphics, false);
        // Ids wrap inside the 56-bit field.
        assert_eq!(version_id(v), 4);
        assert!(!version_submitted(v));
    }

    #[test]
    fn exhausts_after_max_versions() {
        let t = VersionTracking::new(2);
        assert!(t.claim(QueueKind::Graphics, 1, &IDLE).is_some());
        assert!(t.claim(QueueKind::Graphics, 1, &IDLE).is_some());
        assert!(t.claim(QueueKind::Graphics, 1, &IDLE).is_none());
    }

    #[test]
    fn submitted_versions_recycle_once_queue_finishes() {
        let t = VersionTracking::new(4);
        for _ in 0..4 {
            t.claim(QueueKind::Graphics, 7, &IDLE).unwrap();
        }
        for v in 0..4 {
            t.mark_submitted(v, QueueKind::Graphics, 7, 42);
        }
        // Queue has not reached submission 42 yet.
        assert!(t.claim(QueueKind::Graphics, 8, &IDLE).is_none());

        let mut finished = IDLE;
        finished[QueueKind::Graphics.index()] = 42;
        // Probe resumes after the last claimed slot and wraps to version 0.
        assert_eq!(t.claim(QueueKind::Graphics, 8, &finished), Some(0));
    }

    #[test]
    fn pending_tokens_are_never_recycled() {
        let t = VersionTracking::new(1);
        t.claim(QueueKind::Graphics, 3, &IDLE).unwrap();
        let mut finished = IDLE;
        finished[QueueKind::Graphics.index()] = u32::MAX as u64;
        // Still recorded, never submitted.
        assert!(t.claim(QueueKind::Graphics, 4, &finished).is_none());
    }

    #[test]
    fn mark_submitted_skips_foreign_tokens() {
        let t = VersionTracking::new(1);
        let slot = t.claim(QueueKind::Graphics, 3, &IDLE).unwrap();
        // A different recording id does not match; the token is untouched.
        t.mark_submitted(slot, QueueKind::Graphics, 99, 1000);
        assert_eq!(t.raw(slot), make_version(3, QueueKind::Graphics, false));

        t.mark_submitted(slot, QueueKind::Graphics, 3, 1000);
        assert_eq!(t.raw(slot), make_version(1000, QueueKind::Graphics, true));
    }
}
