//! In-memory bookkeeping for every log, snapshot, merge, fixed-delay, and temporary
//! file on disk: per-kind descriptor arrays, a flat unused set ordered by last use, and
//! a `Stats` aggregate kept in sync with every mutation (spec §4.4).
//!
//! Grounded on the Go original's `internal/fileregistry` package: a handful of small
//! fixed-size descriptor arrays rather than a hash map, since `n` is expected to stay
//! in the tens per process.

pub mod dump;

use crate::error::{Error, Result};
use crate::state_index::StateIndex;

/// Which of the five file kinds a descriptor or handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Log,
    Snapshot,
    Merge,
    Fixed,
    Temporary,
}

impl Kind {
    pub(crate) fn to_i32(self) -> i32 {
        match self {
            Kind::Log => 0,
            Kind::Snapshot => 1,
            Kind::Merge => 2,
            Kind::Fixed => 3,
            Kind::Temporary => 4,
        }
    }

    pub(crate) fn from_i32(v: i32) -> Result<Kind> {
        match v {
            0 => Ok(Kind::Log),
            1 => Ok(Kind::Snapshot),
            2 => Ok(Kind::Merge),
            3 => Ok(Kind::Fixed),
            4 => Ok(Kind::Temporary),
            _ => Err(Error::invalid_encoding(0, "unrecognized file registry kind")),
        }
    }
}

/// A lightweight token identifying one in-use file. Cheap to copy and hold alongside
/// the file's own open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub kind: Kind,
    pub id: StateIndex,
}

#[derive(Debug, Clone)]
pub(crate) struct LogDescriptor {
    pub(crate) id: StateIndex,
    pub(crate) first_id: StateIndex,
    pub(crate) last_id: StateIndex,
    pub(crate) read: u64,
    pub(crate) write: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct SnapshotDescriptor {
    pub(crate) id: StateIndex,
    pub(crate) read: u64,
    pub(crate) read_area: u64,
    pub(crate) size: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct MergeDescriptor {
    pub(crate) id: StateIndex,
    pub(crate) read: u64,
    pub(crate) size: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct FixedDescriptor {
    pub(crate) id: StateIndex,
    pub(crate) read: u64,
    pub(crate) write: u64,
    pub(crate) delay: i32,
}

#[derive(Debug, Clone)]
pub(crate) struct TemporaryDescriptor {
    pub(crate) id: StateIndex,
}

/// A descriptor that has finished its active life and is waiting out the recovery
/// horizon before its backing file can be deleted.
#[derive(Debug, Clone)]
pub(crate) struct UnusedDescriptor {
    pub(crate) kind: Kind,
    pub(crate) id: StateIndex,
    pub(crate) last_used: StateIndex,
    pub(crate) size: u64,
    /// Only meaningful for `Kind::Fixed`.
    pub(crate) delay: Option<i32>,
}

/// Aggregate counts kept in lockstep with every registry mutation, so callers (mainly
/// the storage facade's logging) don't need to walk the descriptor arrays to report
/// gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub logs: usize,
    pub snapshots: usize,
    pub merges: usize,
    pub fixeds: usize,
    pub temporaries: usize,
    pub unused: usize,
    pub unused_size: u64,
}

/// The file registry: every live and recently-retired file this process knows about.
#[derive(Debug, Clone, Default)]
pub struct FileRegistry {
    pub(crate) logs: Vec<LogDescriptor>,
    pub(crate) snapshots: Vec<SnapshotDescriptor>,
    pub(crate) merges: Vec<MergeDescriptor>,
    pub(crate) fixeds: Vec<FixedDescriptor>,
    pub(crate) temporaries: Vec<TemporaryDescriptor>,
    pub(crate) unused: Vec<UnusedDescriptor>,
    stats: Stats,
}

impl FileRegistry {
    pub fn new() -> Self {
        FileRegistry::default()
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn new_log(&mut self, id: StateIndex) -> Handle {
        self.logs.push(LogDescriptor {
            id,
            first_id: id,
            last_id: id,
            read: 0,
            write: 0,
        });
        self.stats.logs += 1;
        Handle { kind: Kind::Log, id }
    }

    pub fn new_snapshot(&mut self, id: StateIndex) -> Handle {
        self.snapshots.push(SnapshotDescriptor {
            id,
            read: 0,
            read_area: 0,
            size: 0,
        });
        self.stats.snapshots += 1;
        Handle {
            kind: Kind::Snapshot,
            id,
        }
    }

    pub fn new_merge(&mut self, id: StateIndex) -> Handle {
        self.merges.push(MergeDescriptor { id, read: 0, size: 0 });
        self.stats.merges += 1;
        Handle { kind: Kind::Merge, id }
    }

    pub fn new_fixed(&mut self, id: StateIndex, delay: i32) -> Handle {
        self.fixeds.push(FixedDescriptor {
            id,
            read: 0,
            write: 0,
            delay,
        });
        self.stats.fixeds += 1;
        Handle { kind: Kind::Fixed, id }
    }

    pub fn new_temporary(&mut self, id: StateIndex) -> Handle {
        self.temporaries.push(TemporaryDescriptor { id });
        self.stats.temporaries += 1;
        Handle {
            kind: Kind::Temporary,
            id,
        }
    }

    /// Advances `read` by `n` bytes, returning the new cursor.
    pub fn next_read(&mut self, h: Handle, n: u64) -> Result<u64> {
        let read = match h.kind {
            Kind::Log => &mut self.find_log_mut(h.id)?.read,
            Kind::Snapshot => &mut self.find_snapshot_mut(h.id)?.read,
            Kind::Merge => &mut self.find_merge_mut(h.id)?.read,
            Kind::Fixed => &mut self.find_fixed_mut(h.id)?.read,
            Kind::Temporary => {
                return Err(Error::internal("temporary files have no read cursor"))
            }
        };
        *read += n;
        Ok(*read)
    }

    /// Advances `write` (or, for snapshots/merges, `size`) by `n` bytes. The log form
    /// additionally takes the id of the event just written so it can keep
    /// `first_id`/`last_id` current.
    pub fn next_write(&mut self, h: Handle, n: u64, event_id: Option<StateIndex>) -> Result<u64> {
        match h.kind {
            Kind::Log => {
                let d = self.find_log_mut(h.id)?;
                let first_write = d.write == 0;
                d.write += n;
                if let Some(id) = event_id {
                    if first_write {
                        d.first_id = id;
                    }
                    d.last_id = id;
                }
                Ok(d.write)
            }
            Kind::Snapshot => {
                let d = self.find_snapshot_mut(h.id)?;
                d.size += n;
                Ok(d.size)
            }
            Kind::Merge => {
                let d = self.find_merge_mut(h.id)?;
                d.size += n;
                Ok(d.size)
            }
            Kind::Fixed => {
                let d = self.find_fixed_mut(h.id)?;
                d.write += n;
                Ok(d.write)
            }
            Kind::Temporary => {
                Err(Error::internal("temporary files have no write cursor"))
            }
        }
    }

    /// Moves a descriptor from in-use to the unused set, recording its final size.
    pub fn remove(&mut self, h: Handle, last_used: StateIndex) -> Result<()> {
        let (size, delay) = match h.kind {
            Kind::Log => {
                let idx = self.index_of_log(h.id)?;
                let d = self.logs.remove(idx);
                self.stats.logs -= 1;
                (d.write, None)
            }
            Kind::Snapshot => {
                let idx = self.index_of_snapshot(h.id)?;
                let d = self.snapshots.remove(idx);
                self.stats.snapshots -= 1;
                (d.size, None)
            }
            Kind::Merge => {
                let idx = self.index_of_merge(h.id)?;
                let d = self.merges.remove(idx);
                self.stats.merges -= 1;
                (d.size, None)
            }
            Kind::Fixed => {
                let idx = self.index_of_fixed(h.id)?;
                let d = self.fixeds.remove(idx);
                self.stats.fixeds -= 1;
                (d.write, Some(d.delay))
            }
            Kind::Temporary => {
                return Err(Error::internal(
                    "temporary files are removed via unreg_temporary, not remove",
                ))
            }
        };

        self.unused.push(UnusedDescriptor {
            kind: h.kind,
            id: h.id,
            last_used,
            size,
            delay,
        });
        self.stats.unused += 1;
        self.stats.unused_size += size;
        Ok(())
    }

    /// Removes a temporary file's descriptor outright: it never enters the unused set
    /// because it is about to be renamed into a different kind, not deleted.
    pub fn unreg_temporary(&mut self, h: Handle) -> Result<()> {
        if h.kind != Kind::Temporary {
            return Err(Error::internal("unreg_temporary called on a non-temporary handle"));
        }
        let idx = self.index_of_temporary(h.id)?;
        self.temporaries.remove(idx);
        self.stats.temporaries -= 1;
        Ok(())
    }

    /// Indices into the unused set whose `last_used < horizon`, oldest first.
    pub fn unused_old(&self, horizon: StateIndex) -> Vec<usize> {
        self.unused
            .iter()
            .enumerate()
            .filter(|(_, d)| d.last_used < horizon)
            .map(|(i, _)| i)
            .collect()
    }

    /// Commits an `unused_old` iteration: deletes the named unused descriptors and
    /// adjusts stats. `indices` must be indices previously returned by `unused_old`
    /// against the *current* state of `self`.
    pub fn remove_unused(&mut self, indices: &[usize]) {
        let mut sorted = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        for &idx in sorted.iter().rev() {
            let d = self.unused.remove(idx);
            self.stats.unused -= 1;
            self.stats.unused_size -= d.size;
        }
    }

    /// A deep copy suitable for a background snapshotting coroutine: the snapshotter
    /// mutates its own copy while the live registry keeps accepting writes.
    pub fn deep_clone(&self) -> FileRegistry {
        self.clone()
    }

    fn index_of_log(&self, id: StateIndex) -> Result<usize> {
        self.logs
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| Error::internal(format!("no log descriptor for {id}")))
    }

    fn find_log_mut(&mut self, id: StateIndex) -> Result<&mut LogDescriptor> {
        let idx = self.index_of_log(id)?;
        Ok(&mut self.logs[idx])
    }

    fn index_of_snapshot(&self, id: StateIndex) -> Result<usize> {
        self.snapshots
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| Error::internal(format!("no snapshot descriptor for {id}")))
    }

    fn find_snapshot_mut(&mut self, id: StateIndex) -> Result<&mut SnapshotDescriptor> {
        let idx = self.index_of_snapshot(id)?;
        Ok(&mut self.snapshots[idx])
    }

    fn index_of_merge(&self, id: StateIndex) -> Result<usize> {
        self.merges
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| Error::internal(format!("no merge descriptor for {id}")))
    }

    fn find_merge_mut(&mut self, id: StateIndex) -> Result<&mut MergeDescriptor> {
        let idx = self.index_of_merge(id)?;
        Ok(&mut self.merges[idx])
    }

    fn index_of_fixed(&self, id: StateIndex) -> Result<usize> {
        self.fixeds
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| Error::internal(format!("no fixed descriptor for {id}")))
    }

    fn find_fixed_mut(&mut self, id: StateIndex) -> Result<&mut FixedDescriptor> {
        let idx = self.index_of_fixed(id)?;
        Ok(&mut self.fixeds[idx])
    }

    fn index_of_temporary(&self, id: StateIndex) -> Result<usize> {
        self.temporaries
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| Error::internal(format!("no temporary descriptor for {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_write_tracks_first_and_last_log_ids() {
        let mut reg = FileRegistry::new();
        let h = reg.new_log(StateIndex::new(1, 0));
        reg.next_write(h, 10, Some(StateIndex::new(1, 0))).unwrap();
        reg.next_write(h, 10, Some(StateIndex::new(1, 1))).unwrap();
        let d = &reg.logs[reg.index_of_log(h.id).unwrap()];
        assert_eq!(d.first_id, StateIndex::new(1, 0));
        assert_eq!(d.last_id, StateIndex::new(1, 1));
        assert_eq!(d.write, 20);
    }

    #[test]
    fn remove_moves_descriptor_into_unused_with_final_size() {
        let mut reg = FileRegistry::new();
        let h = reg.new_snapshot(StateIndex::new(1, 0));
        reg.next_write(h, 128, None).unwrap();
        reg.remove(h, StateIndex::new(2, 0)).unwrap();

        assert_eq!(reg.stats().snapshots, 0);
        assert_eq!(reg.stats().unused, 1);
        assert_eq!(reg.unused[0].size, 128);
    }

    #[test]
    fn unused_old_and_remove_unused_respect_the_horizon() {
        let mut reg = FileRegistry::new();
        let old = reg.new_merge(StateIndex::new(1, 0));
        let recent = reg.new_merge(StateIndex::new(5, 0));
        reg.remove(old, StateIndex::new(1, 0)).unwrap();
        reg.remove(recent, StateIndex::new(5, 0)).unwrap();

        let horizon = StateIndex::new(3, 0);
        let stale = reg.unused_old(horizon);
        assert_eq!(stale.len(), 1);
        reg.remove_unused(&stale);

        assert_eq!(reg.stats().unused, 1);
        assert_eq!(reg.unused[0].id, StateIndex::new(5, 0));
    }

    #[test]
    fn unreg_temporary_does_not_enter_unused() {
        let mut reg = FileRegistry::new();
        let h = reg.new_temporary(StateIndex::new(1, 0));
        reg.unreg_temporary(h).unwrap();
        assert_eq!(reg.stats().temporaries, 0);
        assert_eq!(reg.stats().unused, 0);
    }

    #[test]
    fn deep_clone_does_not_share_state_with_the_source() {
        let mut reg = FileRegistry::new();
        reg.new_log(StateIndex::new(1, 0));
        let mut clone = reg.deep_clone();
        clone.new_log(StateIndex::new(2, 0));
        assert_eq!(reg.stats().logs, 1);
        assert_eq!(clone.stats().logs, 2);
    }
}
