use std::path::PathBuf;

use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::io::concurrent_file::{self, ConcurrentWriter};
use crate::io::file::FileExt;
use crate::logging::Logger;
use crate::state_index::StateIndex;
use crate::uvarint;

use super::iterator::{Iterator as LogIterator, IteratorOptions};
use super::lookup::LookupResult;
use super::{event_on_disk_size, HEADER_SIZE, MIN_EVENT_ON_DISK_SIZE};

struct WriterState {
    pos: u64,
    last_id: StateIndex,
}

/// The write side of a log file: header validation/creation, frame-aligned event
/// writes, and recovery of `last_id` on reopen.
pub struct LogWriter<F> {
    path: Option<PathBuf>,
    writer: ConcurrentWriter<F>,
    frame_size: u64,
    evlim: u32,
    state: Mutex<WriterState>,
    last_flushed_id: RwLock<StateIndex>,
}

impl<F: FileExt> LogWriter<F> {
    /// Creates a brand new log file, writing the 16-byte header.
    ///
    /// Sizes the writer's buffer from `frame_size` alone; callers that want the
    /// configured [`crate::config::Config::writer_buffer_capacity`] honored should use
    /// [`Self::create_with_buffer_capacity`].
    pub fn create(file: F, frame_size: u64, evlim: u32) -> Result<Self> {
        Self::create_with_buffer_capacity(file, frame_size, evlim, writer_buffer_capacity(frame_size))
    }

    /// Like [`Self::create`], but with an explicit writer buffer capacity rather than
    /// the `frame_size`-derived default.
    pub fn create_with_buffer_capacity(
        file: F,
        frame_size: u64,
        evlim: u32,
        buffer_capacity: usize,
    ) -> Result<Self> {
        validate_params(frame_size, evlim)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..8].copy_from_slice(&frame_size.to_le_bytes());
        header[8..16].copy_from_slice(&(evlim as u64).to_le_bytes());
        file.write_all_at(&header, 0)?;
        file.sync_all()?;

        let writer = concurrent_file::reopen(file, buffer_capacity, HEADER_SIZE);

        Ok(LogWriter {
            path: None,
            writer,
            frame_size,
            evlim,
            state: Mutex::new(WriterState {
                pos: HEADER_SIZE,
                last_id: StateIndex::ZERO,
            }),
            last_flushed_id: RwLock::new(StateIndex::ZERO),
        })
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Reopens an existing log file for append, recovering `last_id` by scanning the
    /// last (possibly partial) frame forward until a zero-term id or the end of
    /// written bytes is reached.
    pub fn open_for_append(file: F, path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_for_append_with_buffer_capacity(file, path, None)
    }

    /// Like [`Self::open_for_append`], but with an explicit writer buffer capacity
    /// rather than the `frame_size`-derived default.
    pub fn open_for_append_with_buffer_capacity(
        file: F,
        path: impl Into<PathBuf>,
        buffer_capacity: Option<usize>,
    ) -> Result<Self> {
        let path = path.into();
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact_at(&mut header, 0).map_err(Error::from)?;
        let frame_size = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let evlim = u32::try_from(u64::from_le_bytes(header[8..16].try_into().unwrap()))
            .map_err(|_| Error::integrity_compromised(path.clone(), 8, "evlim does not fit in u32"))?;
        validate_params(frame_size, evlim)?;

        let file_len = file.len()?;
        let frames_complete = (file_len - HEADER_SIZE) / frame_size;
        let last_frame_start = HEADER_SIZE + frames_complete * frame_size;

        let mut scan_buf = vec![0u8; (file_len - last_frame_start) as usize];
        file.read_exact_at(&mut scan_buf, last_frame_start)
            .map_err(Error::from)?;

        let mut last_id = StateIndex::ZERO;
        {
            // Build a throwaway header-shaped prefix so the iterator's frame-relative
            // arithmetic lines up with `last_frame_start`, not byte 0.
            let mut probe = vec![0u8; HEADER_SIZE as usize];
            probe[0..8].copy_from_slice(&frame_size.to_le_bytes());
            probe.extend_from_slice(&scan_buf);
            let mut it = LogIterator::new(&probe, IteratorOptions::default())?;
            while let Some(ev) = it.next()? {
                last_id = ev.id;
            }
        }

        let cap = buffer_capacity.unwrap_or_else(|| writer_buffer_capacity(frame_size));
        let writer = concurrent_file::reopen(file, cap, file_len);

        Ok(LogWriter {
            path: Some(path),
            writer,
            frame_size,
            evlim,
            state: Mutex::new(WriterState {
                pos: file_len,
                last_id,
            }),
            last_flushed_id: RwLock::new(last_id),
        })
    }

    pub fn frame_size(&self) -> u64 {
        self.frame_size
    }

    pub fn evlim(&self) -> u32 {
        self.evlim
    }

    pub fn last_id(&self) -> StateIndex {
        self.state.lock().last_id
    }

    pub fn last_flushed_id(&self) -> StateIndex {
        *self.last_flushed_id.read()
    }

    /// Writes one event, returning the number of bytes it added to the file
    /// (including any frame padding).
    pub fn write_event(&self, id: StateIndex, payload: &[u8]) -> Result<u64> {
        if payload.len() > self.evlim as usize {
            return Err(Error::EventTooLarge {
                id,
                len: payload.len(),
                evlim: self.evlim,
            });
        }

        let mut state = self.state.lock();
        let rel = (state.pos - HEADER_SIZE) % self.frame_size;
        let frame_rest = self.frame_size - rel;
        let event_size = event_on_disk_size(payload.len());

        let mut delta = 0u64;
        if frame_rest < event_size.max(MIN_EVENT_ON_DISK_SIZE) {
            let padding = vec![0u8; frame_rest as usize];
            self.writer.write(&padding)?;
            delta += frame_rest;
        }

        let mut encoded = Vec::with_capacity(event_size as usize);
        encoded.extend_from_slice(&id.to_bytes());
        uvarint::write(&mut encoded, payload.len() as u64)?;
        encoded.extend_from_slice(payload);
        self.writer.write(&encoded)?;
        delta += encoded.len() as u64;

        state.pos += delta;
        state.last_id = id;

        if self.writer.flushed_size() == state.pos {
            *self.last_flushed_id.write() = id;
        }

        Ok(delta)
    }

    /// Forces the buffered tail to disk and publishes `last_flushed_id`.
    pub fn flush(&self) -> Result<()> {
        self.writer.flush()?;
        let last_id = self.state.lock().last_id;
        *self.last_flushed_id.write() = last_id;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.writer.close()
    }

    /// Locates the file offset of the event immediately after `id`. Lookup operates on
    /// the file, not the writer's in-memory buffer, so a flush is forced first if `id`
    /// has not yet been durably written.
    pub fn lookup_next(&self, id: StateIndex, logger: &dyn Logger) -> Result<LookupResult> {
        if self.last_flushed_id() < id {
            if let Err(err) = self.flush() {
                logger.snapshot_log_failed_to_append(&err);
                return Err(err);
            }
        }
        let mmap = self
            .writer
            .file()
            .mmap_ro()
            .map_err(|e| Error::io(self.path.clone(), e))?;
        super::lookup::lookup(&mmap, self.frame_size, id)
    }

    /// Reads the full file content (header included) into memory. Used by tests and
    /// by recovery paths that want to iterate a closed or fully-flushed file.
    pub fn read_all_bytes(&self) -> Result<Vec<u8>> {
        self.writer.read_all()
    }
}

fn validate_params(frame_size: u64, evlim: u32) -> Result<()> {
    Config {
        frame_size,
        evlim,
        ..Config::default()
    }
    .validate()
}

fn writer_buffer_capacity(frame_size: u64) -> usize {
    (frame_size as usize).min(256 * 1024).max(4096)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NoopLogger;

    #[test]
    fn lookup_next_forces_a_flush_of_unflushed_events() {
        let file = tempfile::tempfile().unwrap();
        let writer = LogWriter::create(file, 256, 32).unwrap();
        for i in (0..10u64).step_by(2) {
            writer.write_event(StateIndex::new(1, i), b"v").unwrap();
        }
        // Not flushed yet: lookup_next must force one before reading the file.
        assert_eq!(writer.last_flushed_id(), StateIndex::ZERO);

        let result = writer.lookup_next(StateIndex::new(1, 4), &NoopLogger).unwrap();
        assert_eq!(writer.last_flushed_id(), StateIndex::new(1, 8));
        match result {
            LookupResult::Found(_) => {}
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn reopen_recovers_last_id_from_the_final_frame() {
        let file = tempfile::tempfile().unwrap();
        {
            let writer = LogWriter::create(
                file.try_clone().unwrap(),
                256,
                32,
            )
            .unwrap();
            for i in 0..5u64 {
                writer.write_event(StateIndex::new(1, i), b"v").unwrap();
            }
            writer.close().unwrap();
        }

        let reopened = LogWriter::open_for_append(file, "log-test").unwrap();
        assert_eq!(reopened.last_id(), StateIndex::new(1, 4));
    }
}
