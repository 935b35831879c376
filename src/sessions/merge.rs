//! Background merge of two already-ordered session sources into a single new,
//! strictly-ordered file (spec §4.6/§9).

use crate::error::{Error, Result};
use crate::io::concurrent_file::{self, ConcurrentWriter};
use crate::io::file::FileExt;
use crate::sessions::session::Session;
use crate::sessions::source::{SessionSource, SourceRead};
use crate::uvarint;

/// Writes the flat `repeat_at: u64 LE || uvarint(len) || session bytes` record stream
/// that [`crate::sessions::source::FileSessionSource`] reads back.
pub struct MergeWriter<F> {
    writer: ConcurrentWriter<F>,
}

impl<F: FileExt> MergeWriter<F> {
    pub fn create(file: F, buffer_capacity: usize) -> Self {
        MergeWriter {
            writer: concurrent_file::create(file, buffer_capacity),
        }
    }

    pub fn write_record(&self, repeat_at: u64, session: &Session) -> Result<()> {
        let mut body = Vec::new();
        session.encode(&mut body)?;

        let mut record = Vec::with_capacity(8 + uvarint::MAX_LEN + body.len());
        record.extend_from_slice(&repeat_at.to_le_bytes());
        uvarint::write(&mut record, body.len() as u64)?;
        record.extend_from_slice(&body);

        self.writer.write(&record)
    }

    pub fn flush(&self) -> Result<()> {
        self.writer.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.writer.close()
    }

    /// Total bytes written so far (flushed + buffered), as observed right now.
    pub fn total_size(&self) -> u64 {
        self.writer.total_size()
    }
}

/// Drains two ordered sources into a [`MergeWriter`], interleaving by `repeat_at`.
///
/// Both inputs must already be closed, finite streams (snapshot/merge/fixed files that
/// are done being written) — a source reporting [`SourceRead::Pending`] mid-merge is a
/// programming error, not a transient condition to retry.
pub struct MergeSources<A, B> {
    a: A,
    b: B,
}

impl<A: SessionSource, B: SessionSource> MergeSources<A, B> {
    pub fn new(a: A, b: B) -> Self {
        MergeSources { a, b }
    }

    /// Runs the merge to completion, writing every record into `writer` in
    /// non-decreasing `repeat_at` order.
    ///
    /// On a tie, `a` always sorts first: `b`'s key is compared as `repeat_at + 1`
    /// (saturating), which breaks the tie deterministically without disturbing the
    /// `repeat_at` value actually written to the output file.
    pub fn merge_into<F: FileExt>(mut self, writer: &MergeWriter<F>) -> Result<()> {
        loop {
            let a_read = self.a.read()?;
            let b_read = self.b.read()?;

            match (a_read, b_read) {
                (SourceRead::Eof, SourceRead::Eof) => break,
                (SourceRead::Pending, _) | (_, SourceRead::Pending) => {
                    return Err(Error::internal(
                        "merge sources must be closed, finite streams",
                    ));
                }
                (SourceRead::Item(ar, asess), SourceRead::Eof) => {
                    writer.write_record(ar, &asess)?;
                    self.a.commit()?;
                }
                (SourceRead::Eof, SourceRead::Item(br, bsess)) => {
                    writer.write_record(br, &bsess)?;
                    self.b.commit()?;
                }
                (SourceRead::Item(ar, asess), SourceRead::Item(br, bsess)) => {
                    let b_key = if br == ar { br.saturating_add(1) } else { br };
                    if ar <= b_key {
                        writer.write_record(ar, &asess)?;
                        self.a.commit()?;
                    } else {
                        writer.write_record(br, &bsess)?;
                        self.b.commit()?;
                    }
                }
            }
        }
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::saved::SavedSessions;
    use crate::sessions::source::{FileSessionSource, MemorySource, SourceKindTag};
    use crate::state_index::StateIndex;
    use bytes::Bytes;

    fn session(tag: &str) -> Session {
        Session::new(StateIndex::new(1, 0), 0, Bytes::from(tag.as_bytes().to_vec()))
    }

    #[test]
    fn merges_two_memory_sources_in_repeat_order_with_tie_break() {
        let mut a = SavedSessions::new();
        a.add(1, session("a1"));
        a.add(5, session("a2"));
        let mut b = SavedSessions::new();
        b.add(5, session("b1"));
        b.add(9, session("b2"));

        let file = tempfile::tempfile().unwrap();
        let out_writer = MergeWriter::create(file.try_clone().unwrap(), 4096);

        MergeSources::new(MemorySource::new(a), MemorySource::new(b))
            .merge_into(&out_writer)
            .unwrap();
        out_writer.close().unwrap();
        let total = out_writer.total_size();

        let mut reader = FileSessionSource::new(
            concurrent_file::reopen_closed(file, 4096, total).reader(),
            4096,
            SourceKindTag::Merge,
        );
        let mut order = Vec::new();
        loop {
            match reader.read().unwrap() {
                SourceRead::Item(repeat_at, s) => {
                    order.push((repeat_at, s.data.to_vec()));
                    reader.commit().unwrap();
                }
                SourceRead::Eof => break,
                SourceRead::Pending => panic!("a fully written file must never report Pending"),
            }
        }

        assert_eq!(
            order,
            vec![
                (1, b"a1".to_vec()),
                (5, b"a2".to_vec()),
                (5, b"b1".to_vec()),
                (9, b"b2".to_vec()),
            ]
        );
    }
}
