//! Session source reader: pulling `(repeat_at, Session)` pairs in non-decreasing
//! `repeat_at` order from one of a closed set of backends (spec §4.6/§9).
//!
//! The backend set — memory, snapshot file, merge file, fixed-delay file — is fixed at
//! compile time, so it is modeled as a tagged union rather than an open trait-object
//! hierarchy; every variant still implements the same small [`SessionSource`]
//! interface so the [`GlobalSourceReader`] can treat them uniformly.

use crate::ackio;
use crate::error::Result;
use crate::io::concurrent_file::ConcurrentReader;
use crate::io::file::FileExt;
use crate::sessions::saved::SavedSessions;
use crate::sessions::session::Session;
use crate::uvarint;

/// What a single [`SessionSource::read`] produced.
#[derive(Clone)]
pub enum SourceRead {
    Item(u64, Session),
    /// No data yet — only possible for a fixed-delay source still being written
    /// concurrently by the leader.
    Pending,
    /// The source is exhausted.
    Eof,
}

/// Which backend a [`SessionRepeatEvent`] came from, for replay bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKindTag {
    Memory,
    Snapshot,
    Merge,
    Fixed,
}

/// The `SessionRepeat` log event a source emits once its current value is about to be
/// committed. `serialized_len` is set for file-backed sources currently being
/// merged/snapshotted, so replay can skip the equivalent bytes in the new file.
#[derive(Debug, Clone)]
pub struct SessionRepeatEvent {
    pub repeat_at: u64,
    pub session: Session,
    pub source: SourceKindTag,
    pub serialized_len: Option<usize>,
}

/// The shared contract every backend implements.
pub trait SessionSource {
    fn read(&mut self) -> Result<SourceRead>;
    /// Advances the read cursor past the last value returned by `read`.
    fn commit(&mut self) -> Result<()>;
    /// The `SessionRepeat` event describing the value currently pending commit, if any.
    fn make_log(&self) -> Option<SessionRepeatEvent>;
    fn close(&mut self) -> Result<()>;
}

/// Reads sessions out of the in-memory saved-sessions store (typically a `Clone()`
/// handed to a background snapshotter).
pub struct MemorySource {
    store: SavedSessions,
    pending: Option<(u64, Session)>,
}

impl MemorySource {
    pub fn new(store: SavedSessions) -> Self {
        MemorySource {
            store,
            pending: None,
        }
    }
}

impl SessionSource for MemorySource {
    fn read(&mut self) -> Result<SourceRead> {
        if let Some((k, s)) = &self.pending {
            return Ok(SourceRead::Item(*k, s.clone()));
        }
        match self.store.first() {
            Some((k, s)) => {
                let s = s.clone();
                self.pending = Some((k, s.clone()));
                Ok(SourceRead::Item(k, s))
            }
            None => Ok(SourceRead::Eof),
        }
    }

    fn commit(&mut self) -> Result<()> {
        if self.pending.take().is_some() {
            self.store.first_commit();
        }
        Ok(())
    }

    fn make_log(&self) -> Option<SessionRepeatEvent> {
        self.pending.as_ref().map(|(k, s)| SessionRepeatEvent {
            repeat_at: *k,
            session: s.clone(),
            source: SourceKindTag::Memory,
            serialized_len: None,
        })
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Reads length-tagged session records (`repeat_at: u64 LE || uvarint(len) ||
/// bytes`) out of a snapshot, merge, or fixed-delay file, tailing a concurrently
/// written file via [`ackio`] speculative reads.
pub struct FileSessionSource<F: FileExt> {
    reader: ackio::Reader<ConcurrentReader<F>>,
    kind: SourceKindTag,
    pending: Option<(u64, Session, usize)>,
}

impl<F: FileExt> FileSessionSource<F> {
    pub fn new(reader: ConcurrentReader<F>, fill_size: usize, kind: SourceKindTag) -> Self {
        FileSessionSource {
            reader: ackio::Reader::with_fill_size(reader, fill_size),
            kind,
            pending: None,
        }
    }

    fn try_decode_one(&mut self) -> Result<Option<(u64, Session, usize)>> {
        let mut br = self.reader.byte_reader();

        let mut repeat_buf = [0u8; 8];
        for slot in repeat_buf.iter_mut() {
            match br.read_byte()? {
                Some(b) => *slot = b,
                None => return Ok(None),
            }
        }
        let repeat_at = u64::from_le_bytes(repeat_buf);

        let len = match read_uvarint_streaming(&mut br)? {
            Some(v) => v,
            None => return Ok(None),
        };

        let mut payload = vec![0u8; len as usize];
        for slot in payload.iter_mut() {
            match br.read_byte()? {
                Some(b) => *slot = b,
                None => return Ok(None),
            }
        }

        let consumed = br.count();
        br.commit();

        let (session, rest) = Session::decode(&payload)?;
        if !rest.is_empty() {
            return Err(crate::error::Error::invalid_encoding(
                0,
                "trailing bytes after a saved-session record",
            ));
        }
        Ok(Some((repeat_at, session, consumed)))
    }
}

impl<F: FileExt> SessionSource for FileSessionSource<F> {
    fn read(&mut self) -> Result<SourceRead> {
        if let Some((repeat_at, session, _)) = &self.pending {
            return Ok(SourceRead::Item(*repeat_at, session.clone()));
        }
        match self.try_decode_one() {
            Ok(Some((repeat_at, session, len))) => {
                let item = SourceRead::Item(repeat_at, session.clone());
                self.pending = Some((repeat_at, session, len));
                Ok(item)
            }
            Ok(None) => {
                if self.reader.is_eof() {
                    Ok(SourceRead::Eof)
                } else {
                    Ok(SourceRead::Pending)
                }
            }
            Err(e) if e.is_not_ready() => Ok(SourceRead::Pending),
            Err(e) => Err(e),
        }
    }

    fn commit(&mut self) -> Result<()> {
        if let Some((_, _, len)) = self.pending.take() {
            self.reader.ack(len)?;
        }
        Ok(())
    }

    fn make_log(&self) -> Option<SessionRepeatEvent> {
        self.pending.as_ref().map(|(repeat_at, session, len)| SessionRepeatEvent {
            repeat_at: *repeat_at,
            session: session.clone(),
            source: self.kind,
            serialized_len: Some(*len),
        })
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Streaming ULEB128 decode over an [`ackio::ByteReader`], so a length field that
/// straddles a not-yet-filled buffer boundary can be retried from scratch rather than
/// consuming partial bytes.
fn read_uvarint_streaming<S: ackio::Source>(
    br: &mut ackio::ByteReader<'_, S>,
) -> Result<Option<u64>> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    for i in 0..uvarint::MAX_LEN {
        let b = match br.read_byte()? {
            Some(b) => b,
            None => return Ok(None),
        };
        if b < 0x80 {
            if i == uvarint::MAX_LEN - 1 && b > 1 {
                return Err(crate::error::Error::invalid_encoding(
                    0,
                    "uvarint overlong final byte",
                ));
            }
            x |= (b as u64) << s;
            return Ok(Some(x));
        }
        x |= ((b & 0x7f) as u64) << s;
        s += 7;
    }
    Err(crate::error::Error::invalid_encoding(
        0,
        "uvarint exceeds 10 bytes",
    ))
}

/// The tagged union of every source kind in the fixed variant set.
pub enum AnySource<F: FileExt> {
    Memory(MemorySource),
    File(FileSessionSource<F>),
}

impl<F: FileExt> SessionSource for AnySource<F> {
    fn read(&mut self) -> Result<SourceRead> {
        match self {
            AnySource::Memory(m) => m.read(),
            AnySource::File(f) => f.read(),
        }
    }

    fn commit(&mut self) -> Result<()> {
        match self {
            AnySource::Memory(m) => m.commit(),
            AnySource::File(f) => f.commit(),
        }
    }

    fn make_log(&self) -> Option<SessionRepeatEvent> {
        match self {
            AnySource::Memory(m) => m.make_log(),
            AnySource::File(f) => f.make_log(),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            AnySource::Memory(m) => m.close(),
            AnySource::File(f) => f.close(),
        }
    }
}

/// Pulls `(repeat_at, Session)` in non-decreasing order out of a set of sources: each
/// `read` asks every live source for its head, drops any that reported `Eof`, and
/// returns the smallest-`repeat_at` value among the rest.
pub struct GlobalSourceReader<S> {
    sources: Vec<S>,
    current: Option<usize>,
}

impl<S: SessionSource> GlobalSourceReader<S> {
    pub fn new(sources: Vec<S>) -> Self {
        GlobalSourceReader {
            sources,
            current: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Commits whichever source produced the last returned value.
    pub fn commit(&mut self) -> Result<()> {
        if let Some(idx) = self.current.take() {
            self.sources[idx].commit()?;
        }
        Ok(())
    }

    pub fn read(&mut self) -> Result<SourceRead> {
        self.current = None;

        let mut best: Option<(usize, u64, Session)> = None;
        let mut i = 0;
        while i < self.sources.len() {
            match self.sources[i].read()? {
                SourceRead::Eof => {
                    self.sources[i].close()?;
                    self.sources.remove(i);
                    continue;
                }
                SourceRead::Pending => {}
                SourceRead::Item(repeat_at, session) => {
                    let replace = match &best {
                        None => true,
                        Some((_, best_repeat, _)) => repeat_at < *best_repeat,
                    };
                    if replace {
                        best = Some((i, repeat_at, session));
                    }
                }
            }
            i += 1;
        }

        match best {
            Some((idx, repeat_at, session)) => {
                self.current = Some(idx);
                Ok(SourceRead::Item(repeat_at, session))
            }
            None if self.sources.is_empty() => Ok(SourceRead::Eof),
            None => Ok(SourceRead::Pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_index::StateIndex;
    use bytes::Bytes;

    fn session(tag: &str) -> Session {
        Session::new(StateIndex::new(1, 0), 0, Bytes::from(tag.as_bytes().to_vec()))
    }

    #[test]
    fn memory_source_reads_in_repeat_order_then_eof() {
        let mut store = SavedSessions::new();
        store.add(5, session("b"));
        store.add(1, session("a"));

        let mut src = MemorySource::new(store);
        match src.read().unwrap() {
            SourceRead::Item(1, s) => assert_eq!(s.data, Bytes::from_static(b"a")),
            other => panic!("unexpected {other:?}"),
        }
        src.commit().unwrap();

        match src.read().unwrap() {
            SourceRead::Item(5, s) => assert_eq!(s.data, Bytes::from_static(b"b")),
            other => panic!("unexpected {other:?}"),
        }
        src.commit().unwrap();

        matches!(src.read().unwrap(), SourceRead::Eof);
    }

    #[test]
    fn global_reader_merges_two_memory_sources_by_repeat_time() {
        let mut a = SavedSessions::new();
        a.add(1, session("a1"));
        a.add(10, session("a2"));
        let mut b = SavedSessions::new();
        b.add(5, session("b1"));

        let mut reader = GlobalSourceReader::new(vec![
            AnySource::Memory(MemorySource::new(a)),
            AnySource::Memory(MemorySource::new(b)),
        ]);

        let mut order = Vec::new();
        loop {
            match reader.read().unwrap() {
                SourceRead::Item(repeat_at, _) => {
                    order.push(repeat_at);
                    reader.commit().unwrap();
                }
                SourceRead::Eof => break,
                SourceRead::Pending => unreachable!("memory sources never report Pending"),
            }
        }
        assert_eq!(order, vec![1, 5, 10]);
    }
}

impl std::fmt::Debug for SourceRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceRead::Item(r, _) => write!(f, "Item({r})"),
            SourceRead::Pending => write!(f, "Pending"),
            SourceRead::Eof => write!(f, "Eof"),
        }
    }
}
