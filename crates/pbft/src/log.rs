//! Bounded ring log ordered by sequence number.
//!
//! Holds a fixed window of `max_size` consecutive slots starting at `head`;
//! slot storage is reused modulo the (power-of-two) size. Truncation resets
//! everything below the new head and advances it.

use palisade_types::Seqno;
use std::fmt::Write as _;

/// A slot that can live in a [`SeqLog`].
pub trait LogEntry {
    /// Return the entry to its empty state, keeping configuration (e.g.
    /// certificate thresholds).
    fn reset(&mut self);

    /// Whether the entry holds no protocol state, for debug dumps.
    fn is_empty(&self) -> bool;
}

/// Log of `T` ordered by sequence number, maintaining entries in
/// `[head, head + max_size)`.
#[derive(Debug)]
pub struct SeqLog<T> {
    head: Seqno,
    max_size: u64,
    mask: u64,
    entries: Vec<T>,
}

impl<T: LogEntry> SeqLog<T> {
    /// Create a log of `size` slots (a power of two) with head at `h`.
    pub fn new(size: u64, h: Seqno, mut init: impl FnMut() -> T) -> Self {
        debug_assert!(size.is_power_of_two());
        SeqLog {
            head: h,
            max_size: size,
            mask: size - 1,
            entries: (0..size).map(|_| init()).collect(),
        }
    }

    fn index(&self, seqno: Seqno) -> usize {
        (seqno & self.mask) as usize
    }

    pub fn head(&self) -> Seqno {
        self.head
    }

    /// Highest seqno the log can currently hold.
    pub fn max_seqno(&self) -> Seqno {
        self.head + self.max_size - 1
    }

    pub fn within_range(&self, seqno: Seqno) -> bool {
        seqno >= self.head && seqno < self.head + self.max_size
    }

    pub fn get(&self, seqno: Seqno) -> Option<&T> {
        self.within_range(seqno).then(|| &self.entries[self.index(seqno)])
    }

    pub fn get_mut(&mut self, seqno: Seqno) -> Option<&mut T> {
        if self.within_range(seqno) {
            let i = self.index(seqno);
            Some(&mut self.entries[i])
        } else {
            None
        }
    }

    /// Reset every entry and move the head to `h`.
    pub fn clear(&mut self, h: Seqno) {
        for e in &mut self.entries {
            e.reset();
        }
        self.head = h;
    }

    /// Truncate the log, resetting all entries below `new_head`. A no-op
    /// when `new_head` does not advance; resets everything when the jump
    /// exceeds the window.
    pub fn truncate(&mut self, new_head: Seqno) {
        if new_head <= self.head {
            return;
        }
        if new_head - self.head >= self.max_size {
            for e in &mut self.entries {
                e.reset();
            }
        } else {
            for s in self.head..new_head {
                let i = self.index(s);
                self.entries[i].reset();
            }
        }
        self.head = new_head;
    }

    /// Iterate the window in seqno order.
    pub fn iter(&self) -> impl Iterator<Item = (Seqno, &T)> {
        (self.head..self.head + self.max_size).map(move |s| (s, &self.entries[self.index(s)]))
    }

    /// Debugging view of non-empty slots.
    pub fn dump_state(&self) -> String
    where
        T: std::fmt::Debug,
    {
        let mut out = String::new();
        let _ = writeln!(out, "head: {}", self.head);
        for (s, e) in self.iter() {
            if !e.is_empty() {
                let _ = writeln!(out, "seqno {}: {:?}", s, e);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Cell(Option<u64>);

    impl LogEntry for Cell {
        fn reset(&mut self) {
            self.0 = None;
        }
        fn is_empty(&self) -> bool {
            self.0.is_none()
        }
    }

    fn log() -> SeqLog<Cell> {
        SeqLog::new(8, 1, Cell::default)
    }

    #[test]
    fn range_and_fetch() {
        let mut l = log();
        assert_eq!(l.head(), 1);
        assert_eq!(l.max_seqno(), 8);
        assert!(l.within_range(1));
        assert!(l.within_range(8));
        assert!(!l.within_range(0));
        assert!(!l.within_range(9));
        assert!(l.get(9).is_none());

        l.get_mut(3).unwrap().0 = Some(30);
        assert_eq!(l.get(3), Some(&Cell(Some(30))));
    }

    #[test]
    fn truncate_clears_below_new_head() {
        let mut l = log();
        for s in 1..=8 {
            l.get_mut(s).unwrap().0 = Some(s * 10);
        }
        l.truncate(5);
        assert_eq!(l.head(), 5);
        assert_eq!(l.max_seqno(), 12);
        // Surviving slots keep their values.
        for s in 5..=8 {
            assert_eq!(l.get(s).unwrap().0, Some(s * 10));
        }
        // Reused slots start empty.
        for s in 9..=12 {
            assert!(l.get(s).unwrap().is_empty());
        }
    }

    #[test]
    fn truncate_backwards_is_noop() {
        let mut l = log();
        l.get_mut(2).unwrap().0 = Some(2);
        l.truncate(1);
        l.truncate(0);
        assert_eq!(l.head(), 1);
        assert_eq!(l.get(2).unwrap().0, Some(2));
    }

    #[test]
    fn truncate_past_window_clears_everything() {
        let mut l = log();
        for s in 1..=8 {
            l.get_mut(s).unwrap().0 = Some(s);
        }
        l.truncate(100);
        assert_eq!(l.head(), 100);
        for (_, e) in l.iter() {
            assert!(e.is_empty());
        }
    }

    #[test]
    fn dump_state_lists_only_nonempty() {
        let mut l = log();
        l.get_mut(4).unwrap().0 = Some(4);
        let dump = l.dump_state();
        assert!(dump.contains("seqno 4"));
        assert!(!dump.contains("seqno 5"));
    }
}
