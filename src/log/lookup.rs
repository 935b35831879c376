//! Binary-search lookup over a closed (or fully flushed) log file, addressed by
//! `(term, index)`.
//!
//! The canonical implementation runs the search over a read-only `memmap2` mapping of
//! the file rather than seeking a file handle back and forth, so the frame-index
//! bisection below touches the page cache directly.

use memmap2::Mmap;

use crate::error::Result;
use crate::state_index::StateIndex;

use super::iterator::{Iterator as LogIterator, IteratorOptions};
use super::HEADER_SIZE;

/// Outcome of [`lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// `id` is present in the log, at this byte offset.
    Found(u64),
    /// `id` is not present. Carries the nearest neighbors straddling where it would be.
    Missing {
        last_before_id: Option<StateIndex>,
        last_before_offset: Option<u64>,
        next_id: Option<StateIndex>,
        next_offset: Option<u64>,
    },
}

/// Maps `file` read-only and bisects its frames for `id`.
///
/// Frames are bisected first (each frame's leading id is decoded directly from the
/// map), then the winning frame is scanned linearly with [`LogIterator`], since a
/// frame is small and its events are not independently indexed.
pub fn lookup(mmap: &Mmap, frame_size: u64, id: StateIndex) -> Result<LookupResult> {
    let data: &[u8] = mmap;
    if data.len() as u64 <= HEADER_SIZE {
        return Ok(LookupResult::Missing {
            last_before_id: None,
            last_before_offset: None,
            next_id: None,
            next_offset: None,
        });
    }

    let frame_count = (data.len() as u64 - HEADER_SIZE).div_ceil(frame_size);
    if frame_count == 0 {
        return Ok(LookupResult::Missing {
            last_before_id: None,
            last_before_offset: None,
            next_id: None,
            next_offset: None,
        });
    }

    // Bisect on each frame's first non-sentinel event id.
    let mut lo = 0u64;
    let mut hi = frame_count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match frame_leading_id(data, frame_size, mid) {
            Some(frame_id) if frame_id <= id => lo = mid + 1,
            _ => hi = mid,
        }
    }
    // `lo` is the first frame whose leading id is > id (or frame_count if none).
    // The frame that might contain `id` is `lo - 1`, scanned linearly from there
    // so an exact match or its straddling neighbors can be recovered.
    let start_frame = lo.saturating_sub(1);
    let start_offset = HEADER_SIZE + start_frame * frame_size;

    let mut it = LogIterator::new(data, IteratorOptions { start: Some(start_offset), read_before: None })?;
    let mut last_before_id = None;
    let mut last_before_offset = None;
    while let Some(ev) = it.next()? {
        if ev.id == id {
            // `lookup` locates the offset of the event *after* `id`, crossing into the
            // next frame if the match was the last event of this one.
            return Ok(match it.next()? {
                Some(next_ev) => LookupResult::Found(next_ev.offset),
                None => LookupResult::Found(data.len() as u64),
            });
        }
        if ev.id < id {
            last_before_id = Some(ev.id);
            last_before_offset = Some(ev.offset);
        } else {
            return Ok(LookupResult::Missing {
                last_before_id,
                last_before_offset,
                next_id: Some(ev.id),
                next_offset: Some(ev.offset),
            });
        }
    }

    Ok(LookupResult::Missing {
        last_before_id,
        last_before_offset,
        next_id: None,
        next_offset: None,
    })
}

fn frame_leading_id(data: &[u8], frame_size: u64, frame_idx: u64) -> Option<StateIndex> {
    let start = HEADER_SIZE + frame_idx * frame_size;
    let mut it = LogIterator::new(data, IteratorOptions { start: Some(start), read_before: None }).ok()?;
    it.next().ok().flatten().map(|ev| ev.id)
}
