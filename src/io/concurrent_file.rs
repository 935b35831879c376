//! Single-writer / many-reader concurrent file primitive.
//!
//! Ported from the Go original's `SimWriter`/`SimReader` (`mpio/sim_writer.go`,
//! `mpio/sim_reader.go`): one mutex-protected writer buffer plus atomics for
//! `flushed_size`/`total_size`, so readers can observe the buffered tail of a file that
//! is still being written without a second round of buffering.
//!
//! Unlike the Go original, reads and writes here go through [`FileExt`]'s positional
//! `pread`/`pwrite`, so there is no OS file cursor to track and no `needseek` bookkeeping:
//! every read and write names its own offset.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::io::file::FileExt;

struct WriterState {
    buf: Vec<u8>,
}

struct Inner<F> {
    file: F,
    cap: usize,
    writer: Mutex<WriterState>,
    flushed_size: AtomicU64,
    total_size: AtomicU64,
    done: AtomicBool,
    failed: AtomicBool,
}

/// The write half of a concurrent file. Cheap to clone (shares the same [`Inner`]).
pub struct ConcurrentWriter<F> {
    inner: Arc<Inner<F>>,
}

impl<F> Clone for ConcurrentWriter<F> {
    fn clone(&self) -> Self {
        ConcurrentWriter {
            inner: self.inner.clone(),
        }
    }
}

/// Creates a fresh concurrent file backed by `file`, with a writer buffer of `cap` bytes.
pub fn create<F: FileExt>(file: F, cap: usize) -> ConcurrentWriter<F> {
    let inner = Arc::new(Inner {
        file,
        cap,
        writer: Mutex::new(WriterState {
            buf: Vec::with_capacity(cap),
        }),
        flushed_size: AtomicU64::new(0),
        total_size: AtomicU64::new(0),
        done: AtomicBool::new(false),
        failed: AtomicBool::new(false),
    });
    ConcurrentWriter { inner }
}

/// Wraps an already partially-written file: `flushed_size` bytes of `file` are already
/// durable on disk (used when reopening a log for append).
pub fn reopen<F: FileExt>(file: F, cap: usize, flushed_size: u64) -> ConcurrentWriter<F> {
    let w = create(file, cap);
    w.inner.flushed_size.store(flushed_size, Ordering::Release);
    w.inner.total_size.store(flushed_size, Ordering::Release);
    w
}

/// Wraps a file that is already complete and will never receive another write (a
/// finished snapshot/merge/fixed-delay file being reopened purely for replay). Unlike
/// [`reopen`], this marks the file `done` so a tailing reader sees `EOF` once it
/// catches up, instead of waiting forever on `EOD` for writes that will never come.
pub fn reopen_closed<F: FileExt>(file: F, cap: usize, size: u64) -> ConcurrentWriter<F> {
    let w = reopen(file, cap, size);
    w.inner.done.store(true, Ordering::Release);
    w
}

impl<F: FileExt> ConcurrentWriter<F> {
    /// Direct access to the backing file, for operations (like mmap) that need it.
    pub fn file(&self) -> &F {
        &self.inner.file
    }

    /// Total bytes ever written (flushed + buffered), as observed right now.
    pub fn total_size(&self) -> u64 {
        self.inner.total_size.load(Ordering::Acquire)
    }

    /// Bytes durably written to disk, as observed right now.
    pub fn flushed_size(&self) -> u64 {
        self.inner.flushed_size.load(Ordering::Acquire)
    }

    /// Writes `p` atomically: it ends up entirely in the buffer or entirely flushed to
    /// disk, never split across the two.
    pub fn write(&self, p: &[u8]) -> Result<()> {
        if p.len() > self.inner.cap {
            return Err(Error::WriteOvergrowsBuffer {
                len: p.len(),
                cap: self.inner.cap,
            });
        }
        if self.inner.failed.load(Ordering::Acquire) {
            return Err(Error::internal("concurrent file previously failed"));
        }

        let mut guard = self.inner.writer.lock();
        if guard.buf.len() + p.len() > self.inner.cap {
            self.flush_locked(&mut guard)?;
        }
        guard.buf.extend_from_slice(p);
        self.inner.total_size.fetch_add(p.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Forces the buffer to disk and fsyncs.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.inner.writer.lock();
        self.flush_locked(&mut guard)?;
        self.inner
            .file
            .sync_all()
            .map_err(|e| self.mark_failed(e.into()))?;
        Ok(())
    }

    /// Flushes and marks the file done; subsequent reads past the end observe `EOF`.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.inner.done.store(true, Ordering::Release);
        Ok(())
    }

    fn flush_locked(&self, guard: &mut WriterState) -> Result<()> {
        if guard.buf.is_empty() {
            return Ok(());
        }
        let offset = self.inner.flushed_size.load(Ordering::Acquire);
        if let Err(e) = self.inner.file.write_all_at(&guard.buf, offset) {
            return Err(self.mark_failed(e.into()));
        }
        self.inner
            .flushed_size
            .fetch_add(guard.buf.len() as u64, Ordering::AcqRel);
        guard.buf.clear();
        Ok(())
    }

    fn mark_failed(&self, err: Error) -> Error {
        self.inner.failed.store(true, Ordering::Release);
        err
    }

    /// Flushes, then reads the entire file (offset 0 through `total_size`) into memory.
    /// Intended for tests and small recovery reads, not hot paths.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.flush()?;
        let len = self.total_size();
        let mut buf = vec![0u8; len as usize];
        self.inner
            .file
            .read_exact_at(&mut buf, 0)
            .map_err(Error::from)?;
        Ok(buf)
    }

    pub fn reader(&self) -> ConcurrentReader<F> {
        ConcurrentReader {
            inner: self.inner.clone(),
            rpos: 0,
            buf: Vec::new(),
            bpos: 0,
        }
    }

    pub fn reader_from(&self, rpos: u64) -> ConcurrentReader<F> {
        ConcurrentReader {
            inner: self.inner.clone(),
            rpos,
            buf: Vec::new(),
            bpos: 0,
        }
    }
}

/// Outcome of a read attempt against a concurrent file.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` bytes were copied into the caller's buffer.
    Ready(usize),
    /// No bytes are available yet, but the writer has not closed: try again later.
    Eod,
    /// The writer closed and every byte has been consumed.
    Eof,
}

/// The read half of a concurrent file: a logical cursor `rpos` plus a local buffer.
pub struct ConcurrentReader<F> {
    inner: Arc<Inner<F>>,
    rpos: u64,
    buf: Vec<u8>,
    bpos: usize,
}

enum Ensure {
    HasData,
    Eod,
    Eof,
}

impl<F: FileExt> ConcurrentReader<F> {
    pub fn pos(&self) -> u64 {
        self.rpos
    }

    /// Resets the reader to `offset`. Fails if `offset` is beyond everything written
    /// so far.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        let total = self.inner.total_size.load(Ordering::Acquire);
        if offset > total {
            return Err(Error::internal(format!(
                "seek offset {offset} is beyond the file size {total}"
            )));
        }
        self.buf.clear();
        self.bpos = 0;
        self.rpos = offset;
        Ok(())
    }

    pub fn read(&mut self, out: &mut [u8]) -> Result<ReadStatus> {
        match self.ensure_read_buffer()? {
            Ensure::Eod => Ok(ReadStatus::Eod),
            Ensure::Eof => Ok(ReadStatus::Eof),
            Ensure::HasData => {
                let available = self.buf.len() - self.bpos;
                let n = available.min(out.len());
                out[..n].copy_from_slice(&self.buf[self.bpos..self.bpos + n]);
                self.bpos += n;
                self.rpos += n as u64;
                Ok(ReadStatus::Ready(n))
            }
        }
    }

    /// Reads a single byte. `Ok(None)` means `EOF`; `Err` with [`Error::is_not_ready`]
    /// true means `EOD`.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        match self.ensure_read_buffer()? {
            Ensure::Eof => Ok(None),
            Ensure::Eod => Err(Error::ReaderNotReady {
                path: None,
                pos: self.rpos,
            }),
            Ensure::HasData => {
                let b = self.buf[self.bpos];
                self.bpos += 1;
                self.rpos += 1;
                Ok(Some(b))
            }
        }
    }

    fn ensure_read_buffer(&mut self) -> Result<Ensure> {
        if self.bpos < self.buf.len() {
            return Ok(Ensure::HasData);
        }

        let flushed = self.inner.flushed_size.load(Ordering::Acquire);
        if flushed > self.rpos {
            let lim = self.data_size_limit(flushed);
            self.fill_from_file(lim)?;
            return Ok(Ensure::HasData);
        }

        let total = self.inner.total_size.load(Ordering::Acquire);
        if total == self.rpos {
            return if self.inner.done.load(Ordering::Acquire) {
                Ok(Ensure::Eof)
            } else {
                Ok(Ensure::Eod)
            };
        }

        let guard = self.inner.writer.lock();
        let flushed_again = self.inner.flushed_size.load(Ordering::Acquire);
        if flushed_again > self.rpos {
            drop(guard);
            let lim = self.data_size_limit(flushed_again);
            self.fill_from_file(lim)?;
            return Ok(Ensure::HasData);
        }

        let d_full = (total - self.rpos) as usize;
        let start = guard.buf.len() - d_full;
        let d = d_full.min(self.inner.cap);
        self.buf.clear();
        self.buf.extend_from_slice(&guard.buf[start..start + d]);
        self.bpos = 0;
        Ok(Ensure::HasData)
    }

    fn data_size_limit(&self, flushed: u64) -> usize {
        ((flushed - self.rpos) as usize).min(self.inner.cap)
    }

    fn fill_from_file(&mut self, lim: usize) -> Result<()> {
        self.buf.resize(lim, 0);
        let n = self
            .inner
            .file
            .read_at(&mut self.buf, self.rpos)
            .map_err(Error::from)?;
        if n == 0 {
            return Err(Error::internal(
                "file claims flushed data exists but read returned zero bytes",
            ));
        }
        self.buf.truncate(n);
        self.bpos = 0;
        Ok(())
    }
}

impl<F: FileExt> crate::ackio::Source for ConcurrentReader<F> {
    fn fill(&mut self, buf: &mut [u8]) -> Result<crate::ackio::Fill> {
        match self.read(buf)? {
            ReadStatus::Ready(n) => Ok(crate::ackio::Fill::Ready(n)),
            ReadStatus::Eod => Ok(crate::ackio::Fill::Eod),
            ReadStatus::Eof => Ok(crate::ackio::Fill::Eof),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn write_flushes_when_buffer_would_overflow() {
        let file = tempfile().unwrap();
        let w = create(file, 4);
        w.write(b"He").unwrap();
        w.write(b"llo").unwrap();
        assert_eq!(w.total_size(), 5);
        w.flush().unwrap();
        assert_eq!(w.flushed_size(), 5);
    }

    #[test]
    fn write_larger_than_capacity_is_rejected() {
        let file = tempfile().unwrap();
        let w = create(file, 2);
        assert!(w.write(b"abc").is_err());
    }

    #[test]
    fn reader_sees_buffered_tail_then_eod_then_eof() {
        let file = tempfile().unwrap();
        let w = create(file, 64);
        w.write(b"hello").unwrap();

        let mut r = w.reader();
        let mut out = [0u8; 5];
        assert_eq!(r.read(&mut out).unwrap(), ReadStatus::Ready(5));
        assert_eq!(&out, b"hello");

        let mut tail = [0u8; 1];
        assert_eq!(r.read(&mut tail).unwrap(), ReadStatus::Eod);

        w.close().unwrap();
        assert_eq!(r.read(&mut tail).unwrap(), ReadStatus::Eof);
    }

    // Scenario 5 from the testable-properties list: three concurrent readers over a
    // small writer buffer all observe the same byte stream.
    #[test]
    fn three_readers_observe_the_same_stream_through_a_small_buffer() {
        let file = tempfile().unwrap();
        let w = create(file, 4);
        let mut readers: Vec<_> = (0..3).map(|_| w.reader()).collect();

        for chunk in [&b"He"[..], b"llo", b" Wor", b"ld!"] {
            w.write(chunk).unwrap();
        }
        w.close().unwrap();

        for r in &mut readers {
            let mut collected = Vec::new();
            let mut buf = [0u8; 3];
            loop {
                match r.read(&mut buf).unwrap() {
                    ReadStatus::Ready(n) => collected.extend_from_slice(&buf[..n]),
                    ReadStatus::Eod => continue,
                    ReadStatus::Eof => break,
                }
            }
            assert_eq!(collected, b"Hello World!");
        }
    }

    #[test]
    fn seek_resets_reader_position() {
        let file = tempfile().unwrap();
        let w = create(file, 64);
        w.write(b"0123456789").unwrap();
        w.close().unwrap();

        let mut r = w.reader();
        r.seek(5).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(r.read(&mut buf).unwrap(), ReadStatus::Ready(5));
        assert_eq!(&buf, b"56789");
    }
}
