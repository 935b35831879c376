use std::fmt;

use zerocopy::byteorder::little_endian::U64;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// A 128-bit monotonic logical clock: `(term, index)`, ordered lexicographically with
/// `term` dominant. `term == 0` is a reserved sentinel for "no index" / "skip to next frame".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateIndex {
    pub term: u64,
    pub index: u64,
}

/// On-disk little-endian mirror of [`StateIndex`], 16 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct RawStateIndex {
    term: U64,
    index: U64,
}

pub const STATE_INDEX_SIZE: usize = 16;

impl StateIndex {
    pub const ZERO: StateIndex = StateIndex { term: 0, index: 0 };

    pub fn new(term: u64, index: u64) -> Self {
        StateIndex { term, index }
    }

    /// `true` for the sentinel value that marks "skip to next frame" in the log.
    pub fn is_sentinel(&self) -> bool {
        self.term == 0
    }

    /// Bumps the index only, keeping the term.
    pub fn inc_index(self) -> Self {
        StateIndex {
            term: self.term,
            index: self.index + 1,
        }
    }

    /// Bumps the term and resets the index, as on a leadership change.
    pub fn inc_term(self) -> Self {
        StateIndex {
            term: self.term + 1,
            index: 0,
        }
    }

    fn raw(self) -> RawStateIndex {
        RawStateIndex {
            term: U64::new(self.term),
            index: U64::new(self.index),
        }
    }

    pub fn encode(self, buf: &mut [u8; STATE_INDEX_SIZE]) {
        buf.copy_from_slice(self.raw().as_bytes());
    }

    pub fn to_bytes(self) -> [u8; STATE_INDEX_SIZE] {
        let mut buf = [0u8; STATE_INDEX_SIZE];
        self.encode(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let raw = RawStateIndex::read_from_prefix(buf)?;
        Some(StateIndex {
            term: raw.term.get(),
            index: raw.index.get(),
        })
    }
}

impl fmt::Display for StateIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}-{:08x}", self.term, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_term_dominant() {
        assert!(StateIndex::new(1, 100) < StateIndex::new(2, 0));
        assert!(StateIndex::new(1, 0) < StateIndex::new(1, 1));
    }

    #[test]
    fn inc_helpers() {
        let idx = StateIndex::new(3, 7);
        assert_eq!(idx.inc_index(), StateIndex::new(3, 8));
        assert_eq!(idx.inc_term(), StateIndex::new(4, 0));
    }

    #[test]
    fn round_trips_through_bytes() {
        let idx = StateIndex::new(0xdead_beef, 0x1234_5678_9abc_def0);
        let bytes = idx.to_bytes();
        assert_eq!(StateIndex::decode(&bytes), Some(idx));
    }

    #[test]
    fn zero_term_is_sentinel() {
        assert!(StateIndex::new(0, 5).is_sentinel());
        assert!(!StateIndex::new(1, 0).is_sentinel());
    }

    #[test]
    fn decode_rejects_short_input() {
        assert_eq!(StateIndex::decode(&[0u8; 8]), None);
    }
}
