//! Per-peer reordering buffer.

use std::collections::VecDeque;

use crate::proto::Level;

/// What happened to an inserted sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Buffered,
    /// Buffered, but the buffer was full and its oldest sample was dropped.
    BufferedEvictingOldest,
    /// Too old: behind an already released sample, or further than the reorder window
    /// behind the newest one. Dropped.
    Late,
    /// Already buffered. Dropped.
    Duplicate,
    /// Buffered after the peer's sequence numbers jumped: everything buffered before
    /// was dropped and ordering restarts from this sample.
    Resynced,
}

impl InsertOutcome {
    #[inline(always)]
    pub const fn is_buffered(self) -> bool {
        matches!(
            self,
            Self::Buffered | Self::BufferedEvictingOldest | Self::Resynced
        )
    }
}

/// A bounded, sequence-ordered buffer of recently received samples from one peer.
///
/// Samples arriving out of order are put back in order, as long as they are at most
/// `reorder_window` sequence numbers behind the newest sample seen. Once a sample has
/// left the buffer (played or evicted) nothing older is ever accepted again, so
/// samples always come out in strictly ascending order.
///
/// The exception is a sequence jump. After [`RESYNC_AFTER`] consecutive samples
/// arriving further than `depth + reorder_window` behind the newest one, the buffer
/// assumes the numbering restarted (or that the newest sample was bogus), forgets
/// its history and accepts the sample.
#[derive(Debug, Clone)]
pub struct JitterBuffer {
    // sorted by ascending sequence number, no duplicates
    samples: VecDeque<(u64, Level)>,
    depth: usize,
    reorder_window: u64,
    newest: Option<u64>,
    released: Option<u64>,
    // consecutive samples dropped for being far behind
    stale_streak: u32,
}

/// Consecutive far-behind samples after which a [`JitterBuffer`] resyncs.
pub const RESYNC_AFTER: u32 = 3;

impl JitterBuffer {
    pub fn new(depth: usize, reorder_window: u64) -> Self {
        Self {
            samples: VecDeque::with_capacity(depth.saturating_add(1)),
            depth: depth.max(1),
            reorder_window,
            newest: None,
            released: None,
            stale_streak: 0,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The highest sequence number seen so far, buffered or not.
    #[inline(always)]
    pub const fn newest(&self) -> Option<u64> {
        self.newest
    }

    pub fn insert(&mut self, sequence: u64, level: Level) -> InsertOutcome {
        let late = self.released.is_some_and(|released| sequence <= released)
            || self
                .newest
                .is_some_and(|newest| newest.saturating_sub(sequence) > self.reorder_window);

        if late {
            let far_behind = self.newest.is_some_and(|newest| {
                newest.saturating_sub(sequence)
                    > (self.depth as u64).saturating_add(self.reorder_window)
            });

            if !far_behind {
                return InsertOutcome::Late;
            }

            self.stale_streak += 1;

            if self.stale_streak < RESYNC_AFTER {
                return InsertOutcome::Late;
            }

            self.reset();
            self.samples.push_back((sequence, level));
            self.newest = Some(sequence);
            return InsertOutcome::Resynced;
        }

        self.stale_streak = 0;

        let Err(idx) = self
            .samples
            .binary_search_by_key(&sequence, |&(seq, _)| seq)
        else {
            return InsertOutcome::Duplicate;
        };

        // it would be evicted right away
        if idx == 0 && self.samples.len() >= self.depth {
            return InsertOutcome::Late;
        }

        self.samples.insert(idx, (sequence, level));
        self.newest = Some(self.newest.map_or(sequence, |newest| newest.max(sequence)));

        if self.samples.len() > self.depth {
            self.pop();
            InsertOutcome::BufferedEvictingOldest
        } else {
            InsertOutcome::Buffered
        }
    }

    /// Removes and returns the oldest buffered sample.
    pub fn pop(&mut self) -> Option<(u64, Level)> {
        let (sequence, level) = self.samples.pop_front()?;
        self.released = Some(sequence);
        Some((sequence, level))
    }

    /// Drops every buffered sample and all sequence bookkeeping.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.newest = None;
        self.released = None;
        self.stale_streak = 0;
    }

    /// Drops every buffered sample. Sequence bookkeeping is kept.
    pub fn clear(&mut self) {
        if let Some(&(last, _)) = self.samples.back() {
            self.released = Some(last);
        }
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buffer: &mut JitterBuffer) -> Vec<u64> {
        core::iter::from_fn(|| buffer.pop()).map(|(seq, _)| seq).collect()
    }

    #[test]
    fn reorders_within_the_window() {
        let mut buffer = JitterBuffer::new(8, 3);

        for seq in [2, 1, 3] {
            assert_eq!(buffer.insert(seq, seq as f32 / 10.), InsertOutcome::Buffered);
        }

        assert_eq!(drain(&mut buffer), [1, 2, 3]);
    }

    #[test]
    fn drops_samples_older_than_the_window() {
        let mut buffer = JitterBuffer::new(8, 3);

        buffer.insert(10, 1.);
        assert_eq!(buffer.insert(7, 1.), InsertOutcome::Buffered);
        assert_eq!(buffer.insert(6, 1.), InsertOutcome::Late);

        assert_eq!(drain(&mut buffer), [7, 10]);
    }

    #[test]
    fn never_goes_back_after_releasing() {
        let mut buffer = JitterBuffer::new(8, 3);

        buffer.insert(5, 1.);
        assert_eq!(buffer.pop(), Some((5, 1.)));

        assert_eq!(buffer.insert(4, 1.), InsertOutcome::Late);
        assert_eq!(buffer.insert(5, 1.), InsertOutcome::Late);
        assert_eq!(buffer.insert(6, 1.), InsertOutcome::Buffered);
    }

    #[test]
    fn rejects_duplicates() {
        let mut buffer = JitterBuffer::new(8, 3);

        buffer.insert(1, 0.1);
        assert_eq!(buffer.insert(1, 0.9), InsertOutcome::Duplicate);
        assert_eq!(buffer.pop(), Some((1, 0.1)));
    }

    #[test]
    fn evicts_the_oldest_when_full() {
        let mut buffer = JitterBuffer::new(2, 3);

        buffer.insert(1, 1.);
        buffer.insert(2, 1.);
        assert_eq!(buffer.insert(3, 1.), InsertOutcome::BufferedEvictingOldest);
        assert_eq!(buffer.len(), 2);

        // 1 was released by the eviction
        assert_eq!(buffer.insert(1, 1.), InsertOutcome::Late);
        assert_eq!(drain(&mut buffer), [2, 3]);
    }

    #[test]
    fn resyncs_after_a_sequence_jump() {
        let mut buffer = JitterBuffer::new(8, 3);

        buffer.insert(0, 0.1);
        buffer.pop();
        buffer.insert(1_000_000, 0.9);
        buffer.pop();

        assert_eq!(buffer.insert(2, 0.2), InsertOutcome::Late);
        assert_eq!(buffer.insert(3, 0.3), InsertOutcome::Late);
        assert_eq!(buffer.insert(4, 0.4), InsertOutcome::Resynced);
        assert_eq!(buffer.newest(), Some(4));

        assert_eq!(buffer.insert(5, 0.5), InsertOutcome::Buffered);
        assert_eq!(drain(&mut buffer), [4, 5]);
    }

    #[test]
    fn a_lone_straggler_does_not_resync() {
        let mut buffer = JitterBuffer::new(8, 3);

        for seq in 0..=20 {
            buffer.insert(seq, 1.);
            buffer.pop();
        }

        assert_eq!(buffer.insert(2, 1.), InsertOutcome::Late);
        assert_eq!(buffer.insert(3, 1.), InsertOutcome::Late);
        assert_eq!(buffer.insert(21, 1.), InsertOutcome::Buffered);
        assert_eq!(buffer.insert(4, 1.), InsertOutcome::Late);
        assert_eq!(buffer.insert(5, 1.), InsertOutcome::Late);
        assert_eq!(buffer.insert(22, 1.), InsertOutcome::Buffered);

        assert_eq!(drain(&mut buffer), [21, 22]);
    }

    #[test]
    fn samples_just_behind_never_resync() {
        let mut buffer = JitterBuffer::new(8, 3);

        buffer.insert(10, 1.);
        buffer.pop();

        for _ in 0..2 * RESYNC_AFTER {
            assert_eq!(buffer.insert(9, 1.), InsertOutcome::Late);
        }
        assert_eq!(buffer.newest(), Some(10));
    }
}
