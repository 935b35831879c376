//! Tunables for the storage engine, validated at construction time rather than
//! discovered mid-operation.

use crate::error::{Error, Result};

/// Hard ceiling on `frame_size`: 32 MiB.
pub const FRAME_SIZE_HARD_LIMIT: u64 = 32 * 1024 * 1024;

/// Smallest legal event-on-disk header: 16-byte id + 1-byte minimal uvarint + 1 byte payload.
pub const MIN_EVENT_ON_DISK_SIZE: u64 = 18;

const DEFAULT_FRAME_SIZE: u64 = 1024 * 1024;
const DEFAULT_EVLIM: u32 = 1024;
const DEFAULT_WRITER_BUFFER_CAPACITY: usize = 256 * 1024;
const DEFAULT_READER_BUFFER_CAPACITY: usize = 64 * 1024;
const DEFAULT_RECOVERY_HORIZON_SECS: u64 = 600;
const DEFAULT_MAX_CONCURRENT_JOBS_PER_KIND: usize = 1;

#[derive(Debug, Clone)]
pub struct Config {
    /// Size of a log frame in bytes. An event never straddles a frame boundary.
    pub frame_size: u64,
    /// Maximum event payload size for a given log file.
    pub evlim: u32,
    /// Capacity of the concurrent-file writer's in-memory buffer.
    pub writer_buffer_capacity: usize,
    /// Capacity of a concurrent-file reader's local buffer.
    pub reader_buffer_capacity: usize,
    /// Age, in seconds, after which an unused file becomes eligible for deletion.
    pub recovery_horizon_secs: u64,
    /// Maximum number of background jobs of a given kind (snapshot, merge, rotation)
    /// allowed in flight at once.
    pub max_concurrent_jobs_per_kind: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            frame_size: DEFAULT_FRAME_SIZE,
            evlim: DEFAULT_EVLIM,
            writer_buffer_capacity: DEFAULT_WRITER_BUFFER_CAPACITY,
            reader_buffer_capacity: DEFAULT_READER_BUFFER_CAPACITY,
            recovery_horizon_secs: DEFAULT_RECOVERY_HORIZON_SECS,
            max_concurrent_jobs_per_kind: DEFAULT_MAX_CONCURRENT_JOBS_PER_KIND,
        }
    }
}

impl Config {
    /// Validates the combination of tunables, rejecting out-of-range or incompatible
    /// values before any file is touched.
    pub fn validate(&self) -> Result<()> {
        if self.evlim < MIN_EVENT_ON_DISK_SIZE as u32 {
            return Err(Error::internal(format!(
                "evlim {} is below the minimum of {}",
                self.evlim, MIN_EVENT_ON_DISK_SIZE
            )));
        }
        if self.frame_size > FRAME_SIZE_HARD_LIMIT {
            return Err(Error::internal(format!(
                "frame_size {} exceeds the hard limit of {}",
                self.frame_size, FRAME_SIZE_HARD_LIMIT
            )));
        }
        let min_frame = MIN_EVENT_ON_DISK_SIZE
            + crate::uvarint::encoded_len(self.evlim as u64) as u64
            + self.evlim as u64;
        if self.frame_size < min_frame {
            return Err(Error::internal(format!(
                "frame_size {} cannot hold a single max-size event ({} bytes)",
                self.frame_size, min_frame
            )));
        }
        if self.writer_buffer_capacity == 0 {
            return Err(Error::internal("writer_buffer_capacity must be non-zero"));
        }
        let max_event_on_disk = crate::state_index::STATE_INDEX_SIZE as u64
            + crate::uvarint::encoded_len(self.evlim as u64) as u64
            + self.evlim as u64;
        if (self.writer_buffer_capacity as u64) < max_event_on_disk {
            return Err(Error::internal(format!(
                "writer_buffer_capacity {} cannot hold a single max-size event ({} bytes); \
                 write_event issues the whole padding+event as one write and would fail with \
                 write_overgrows_buffer",
                self.writer_buffer_capacity, max_event_on_disk
            )));
        }
        if self.reader_buffer_capacity == 0 {
            return Err(Error::internal("reader_buffer_capacity must be non-zero"));
        }
        if self.max_concurrent_jobs_per_kind == 0 {
            return Err(Error::internal(
                "max_concurrent_jobs_per_kind must be non-zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_evlim_below_minimum() {
        let mut cfg = Config::default();
        cfg.evlim = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_frame_size_above_hard_limit() {
        let mut cfg = Config::default();
        cfg.frame_size = FRAME_SIZE_HARD_LIMIT + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_frame_size_too_small_for_evlim() {
        let mut cfg = Config::default();
        cfg.frame_size = 8;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_writer_buffer_too_small_for_a_max_size_event() {
        let mut cfg = Config::default();
        cfg.evlim = 512 * 1024;
        cfg.frame_size = cfg.evlim as u64 * 2;
        assert!(cfg.validate().is_err());
    }
}
