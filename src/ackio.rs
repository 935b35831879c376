//! Framed byte reader with speculative reads and commit-point rewind.
//!
//! Ported from the Go original's `ackio/reader.go`: a buffer with three watermarks —
//! `ur` (unread/unacknowledged low-water), `r` (current read cursor) and `lim`
//! (buffered high-water) — that supports reading ahead speculatively, rolling back to
//! the last acknowledged point, and acknowledging (compacting away) bytes once a
//! caller is sure it has consumed a complete record.

use std::io::Read;

use crate::error::{Error, Result};

const DEFAULT_FILL_SIZE: usize = 4096;

/// What a single fill attempt against the underlying source produced.
pub enum Fill {
    /// `n` more bytes landed in the source's own buffer.
    Ready(usize),
    /// Nothing available right now, but the source is not done.
    Eod,
    /// The source is permanently exhausted.
    Eof,
}

/// A byte source that can distinguish "nothing yet" from "nothing ever again",
/// unlike `std::io::Read` where both are a `0`-byte read.
pub trait Source {
    fn fill(&mut self, buf: &mut [u8]) -> Result<Fill>;
}

/// Adapts a plain blocking `std::io::Read` into a [`Source`] where a `0`-byte read
/// always means `Eof` (a blocking reader has no "not ready yet" state of its own).
pub struct Blocking<R>(pub R);

impl<R: Read> Source for Blocking<R> {
    fn fill(&mut self, buf: &mut [u8]) -> Result<Fill> {
        let n = self.0.read(buf)?;
        Ok(if n == 0 { Fill::Eof } else { Fill::Ready(n) })
    }
}

pub struct Reader<S> {
    src: S,
    buf: Vec<u8>,
    fill_size: usize,
    pos: u64,
    ur: usize,
    r: usize,
    lim: usize,
    eof: bool,
}

impl<S: Source> Reader<S> {
    pub fn new(src: S) -> Self {
        Self::with_fill_size(src, DEFAULT_FILL_SIZE)
    }

    /// `fill_size` is a hint for how much to read ahead at a time (typically the log's
    /// frame size).
    pub fn with_fill_size(src: S, fill_size: usize) -> Self {
        Reader {
            src,
            buf: Vec::new(),
            fill_size,
            pos: 0,
            ur: 0,
            r: 0,
            lim: 0,
            eof: false,
        }
    }

    fn exhausted(&self) -> bool {
        self.r == self.lim
    }

    /// Position just past the last acknowledged byte.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.exhausted()
    }

    /// Reads into `out`, returning the number of bytes copied.
    ///
    /// `Ok(0)` means the source has no more data *right now* but may produce more
    /// later; check [`Reader::is_eof`] to tell that apart from permanent exhaustion.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.exhausted() {
            self.fulfill(self.fill_size)?;
        }

        let n = (self.lim - self.r).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.r..self.r + n]);
        self.r += n;
        Ok(n)
    }

    /// Acknowledges `n` bytes past the last ack point, compacting the buffer.
    pub fn ack(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(Error::internal("ack of zero bytes"));
        }
        if self.ur + n > self.lim {
            return Err(Error::internal(format!(
                "ack of {n} bytes exceeds buffered high-water mark"
            )));
        }
        self.ur += n;
        self.pos += n as u64;
        self.buf.copy_within(self.ur..self.lim, 0);
        self.lim -= self.ur;
        self.r = self.r.saturating_sub(self.ur);
        self.ur = 0;
        Ok(())
    }

    /// Rewinds the read cursor back to the last acknowledged point, so the next reads
    /// replay the same bytes.
    pub fn rollback(&mut self) {
        self.r = self.ur;
    }

    /// A child view with its own read cursor (`count`), for tentatively reading a
    /// single record one byte at a time before deciding whether to commit or discard.
    pub fn byte_reader(&mut self) -> ByteReader<'_, S> {
        ByteReader {
            parent: self,
            count: 0,
        }
    }

    fn fulfill(&mut self, want: usize) -> Result<()> {
        if self.eof {
            return Ok(());
        }

        let trailing_cap = self.buf.capacity() - self.lim;
        if trailing_cap < want {
            let mut grown = Vec::with_capacity(self.lim - self.ur + want);
            grown.extend_from_slice(&self.buf[self.ur..self.lim]);
            let shift = self.ur;
            self.r -= shift;
            self.lim -= shift;
            self.ur = 0;
            self.buf = grown;
        }

        let start = self.lim;
        self.buf.resize(start + want, 0);
        let outcome = self.src.fill(&mut self.buf[start..start + want])?;
        match outcome {
            Fill::Ready(n) => {
                self.buf.truncate(start + n);
                self.lim += n;
            }
            Fill::Eod => {
                self.buf.truncate(start);
            }
            Fill::Eof => {
                self.buf.truncate(start);
                self.eof = true;
            }
        }

        Ok(())
    }
}

/// A tentative, single-cursor view into the parent [`Reader`]'s buffer.
pub struct ByteReader<'a, S> {
    parent: &'a mut Reader<S>,
    count: usize,
}

impl<'a, S: Source> ByteReader<'a, S> {
    /// Reads the next byte.
    ///
    /// `Ok(None)` means the source is permanently exhausted. `Err` with
    /// [`Error::is_not_ready`] true means no byte is available yet but the source may
    /// still produce more.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut abs = self.parent.r + self.count;
        if abs >= self.parent.lim {
            self.parent.fulfill(self.parent.fill_size)?;
            abs = self.parent.r + self.count;
            if abs >= self.parent.lim {
                if self.parent.eof {
                    return Ok(None);
                }
                return Err(Error::ReaderNotReady {
                    path: None,
                    pos: self.parent.pos + self.count as u64,
                });
            }
        }
        let b = self.parent.buf[abs];
        self.count += 1;
        Ok(Some(b))
    }

    /// Folds the bytes consumed through this child view back into the parent's read
    /// cursor.
    pub fn commit(self) {
        self.parent.r += self.count;
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_ack_and_rollback_scenario() {
        // Scenario 6 from the testable-properties list.
        let src = Blocking(Cursor::new(b"Hello World!".to_vec()));
        let mut r = Reader::with_fill_size(src, 5);

        let mut buf = [0u8; 6];
        let mut total = 0;
        while total < 6 {
            total += r.read(&mut buf[total..]).unwrap();
        }
        assert_eq!(&buf, b"Hello ");
        r.ack(6).unwrap();

        let mut buf2 = [0u8; 6];
        let mut total = 0;
        while total < 6 {
            total += r.read(&mut buf2[total..]).unwrap();
        }
        assert_eq!(&buf2, b"World!");

        r.rollback();

        let mut buf3 = [0u8; 6];
        let mut total = 0;
        while total < 6 {
            total += r.read(&mut buf3[total..]).unwrap();
        }
        assert_eq!(&buf3, b"World!");
        assert_eq!(r.pos(), 6);
    }

    #[test]
    fn ack_rejects_zero_and_out_of_range() {
        let src = Blocking(Cursor::new(b"abc".to_vec()));
        let mut r = Reader::new(src);
        let mut buf = [0u8; 3];
        r.read(&mut buf).unwrap();
        assert!(r.ack(0).is_err());
        assert!(r.ack(100).is_err());
        assert!(r.ack(3).is_ok());
    }

    #[test]
    fn byte_reader_reads_then_reports_eof() {
        let src = Blocking(Cursor::new(b"xy".to_vec()));
        let mut r = Reader::with_fill_size(src, 1);
        {
            let mut br = r.byte_reader();
            assert_eq!(br.read_byte().unwrap(), Some(b'x'));
            br.commit();
        }
        r.ack(1).unwrap();
        {
            let mut br = r.byte_reader();
            assert_eq!(br.read_byte().unwrap(), Some(b'y'));
            assert_eq!(br.read_byte().unwrap(), None);
        }
    }

    /// A source that reports `Eod` once, then produces its last byte.
    struct StallsOnce {
        data: Vec<u8>,
        pos: usize,
        stalled: bool,
    }

    impl Source for StallsOnce {
        fn fill(&mut self, buf: &mut [u8]) -> Result<Fill> {
            if self.pos >= self.data.len() {
                return Ok(Fill::Eof);
            }
            if !self.stalled {
                self.stalled = true;
                return Ok(Fill::Eod);
            }
            let n = (self.data.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(Fill::Ready(n))
        }
    }

    #[test]
    fn byte_reader_reports_not_ready_before_data_arrives() {
        let src = StallsOnce {
            data: b"z".to_vec(),
            pos: 0,
            stalled: false,
        };
        let mut r = Reader::with_fill_size(src, 1);
        let mut br = r.byte_reader();
        let err = br.read_byte().unwrap_err();
        assert!(err.is_not_ready());
        assert_eq!(br.read_byte().unwrap(), Some(b'z'));
    }
}
