// Sliding-window success tracking for one stream.
//
// Each slot records whether a segment emerged from the segmenter and whether
// it was eventually transcoded. A slot only counts toward the success rate
// once it is resolved: transcoded, failed, or older than the grace window.

use std::collections::VecDeque;
use std::time::Instant;

use crate::{SUCCESS_WINDOW, TIME_TO_WAIT_FOR_ERROR};

#[derive(Debug, Clone, Copy)]
struct SegmentSlot {
    seq_no: u64,
    emerged_at: Instant,
    emerged: bool,
    transcoded: bool,
    failed: bool,
}

impl SegmentSlot {
    fn resolved(&self, now: Instant) -> bool {
        self.transcoded
            || self.failed
            || now.duration_since(self.emerged_at) > TIME_TO_WAIT_FOR_ERROR
    }
}

/// Ring of the last [`SUCCESS_WINDOW`] segment outcomes for one stream.
///
/// Inserting a fresh sequence number into a full ring evicts the oldest
/// slot; re-recording a sequence number already in the window updates its
/// slot in place.
#[derive(Debug)]
pub struct SuccessAverager {
    slots: VecDeque<SegmentSlot>,
    removed_at: Option<Instant>,
}

impl SuccessAverager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: VecDeque::with_capacity(SUCCESS_WINDOW),
            removed_at: None,
        }
    }

    /// Record that the segment `seq_no` emerged from the segmenter at `now`.
    pub fn add_emerged(&mut self, seq_no: u64, now: Instant) {
        let slot = self.slot_mut(seq_no, now);
        slot.emerged = true;
        slot.transcoded = false;
        slot.failed = false;
        slot.emerged_at = now;
    }

    /// Record a terminal transcode outcome for `seq_no`.
    ///
    /// A slot that was never seen emerging is created with `emerged = false`
    /// so it cannot inflate the denominator.
    pub fn add_transcoded(&mut self, seq_no: u64, failed: bool, now: Instant) {
        let slot = self.slot_mut(seq_no, now);
        slot.failed = failed;
        if !failed {
            slot.transcoded = true;
        }
    }

    /// Rolling success rate over the resolved slots in the window.
    ///
    /// Returns `(rate, had_data)`; when no resolved slot emerged yet the
    /// rate defaults to `1.0` with `had_data = false`. Segments still inside
    /// the grace window are indeterminate and excluded from both sums.
    #[must_use]
    pub fn success_rate(&self, now: Instant) -> (f64, bool) {
        let mut emerged = 0u64;
        let mut transcoded = 0u64;
        for slot in &self.slots {
            if slot.resolved(now) {
                emerged += u64::from(slot.emerged);
                transcoded += u64::from(slot.transcoded);
            }
        }
        if emerged > 0 {
            (transcoded as f64 / emerged as f64, true)
        } else {
            (1.0, false)
        }
    }

    /// True when every slot in the window is resolved.
    #[must_use]
    pub fn can_be_removed(&self, now: Instant) -> bool {
        self.slots.iter().all(|slot| slot.resolved(now))
    }

    /// Flag the averager for deferred removal once its stream has ended.
    pub fn mark_removed(&mut self, now: Instant) {
        self.removed_at = Some(now);
    }

    /// True once the stream ended and the post-end retention period elapsed.
    #[must_use]
    pub fn reapable(&self, now: Instant) -> bool {
        self.removed_at
            .is_some_and(|at| now.duration_since(at) > 2 * TIME_TO_WAIT_FOR_ERROR)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot_mut(&mut self, seq_no: u64, now: Instant) -> &mut SegmentSlot {
        if let Some(pos) = self.slots.iter().position(|s| s.seq_no == seq_no) {
            return &mut self.slots[pos];
        }
        if self.slots.len() == SUCCESS_WINDOW {
            self.slots.pop_front();
        }
        self.slots.push_back(SegmentSlot {
            seq_no,
            emerged_at: now,
            emerged: false,
            transcoded: false,
            failed: false,
        });
        self.slots.back_mut().expect("slot just pushed")
    }
}

impl Default for SuccessAverager {
    fn default() -> Self {
        Self::new()
    }
}
