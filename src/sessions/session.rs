//! The `Session` record and its on-disk chunked-data encoding (spec §3/§6).

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::state_index::{StateIndex, STATE_INDEX_SIZE};
use crate::uvarint;

/// A single chunk is capped so that a pathological `n_chunks`/`chunk_len` pair read
/// from a corrupt file cannot force an unbounded allocation before the length is even
/// validated against the remaining input.
const MAX_CHUNKS: u64 = 1 << 20;

/// A user-facing object awaiting its next replay.
///
/// `id` is fixed at creation; `change_id` advances on every mutation; `repeats`
/// increments on each replay; `theme` is an opaque tag interpreted by the policy
/// layer, not the storage core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: StateIndex,
    pub change_id: StateIndex,
    pub repeats: u32,
    pub theme: u32,
    pub data: Bytes,
}

impl Session {
    pub fn new(id: StateIndex, theme: u32, data: Bytes) -> Self {
        Session {
            id,
            change_id: id,
            repeats: 0,
            theme,
            data,
        }
    }

    /// Bumps `change_id` and returns the updated session, as on any mutation.
    pub fn with_change(mut self, change_id: StateIndex) -> Self {
        self.change_id = change_id;
        self
    }

    /// Bumps the replay counter, as on a successful repeat.
    pub fn record_repeat(mut self) -> Self {
        self.repeats += 1;
        self
    }

    /// Encodes this session's body (without the `repeat_at` wrapper) into `out`:
    /// `id(16) || change_id(16) || uvarint(repeats) || uvarint(theme) || data(chunked)`.
    ///
    /// `data` is written as a single chunk; readers must handle an arbitrary chunk
    /// count for forward compatibility with a writer that splits large payloads.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.id.to_bytes());
        out.extend_from_slice(&self.change_id.to_bytes());
        uvarint::write(out, self.repeats as u64)?;
        uvarint::write(out, self.theme as u64)?;
        if self.data.is_empty() {
            uvarint::write(out, 0)?;
        } else {
            uvarint::write(out, 1)?;
            uvarint::write(out, self.data.len() as u64)?;
            out.extend_from_slice(&self.data);
        }
        Ok(())
    }

    /// Decodes a session body from the head of `buf`, returning the session and the
    /// unread tail.
    pub fn decode(buf: &[u8]) -> Result<(Session, &[u8])> {
        let (id_bytes, rest) = crate::byteop::split(buf, STATE_INDEX_SIZE)?;
        let id = StateIndex::decode(id_bytes)
            .ok_or_else(|| Error::invalid_encoding(0, "truncated session id"))?;
        let (change_bytes, rest) = crate::byteop::split(rest, STATE_INDEX_SIZE)?;
        let change_id = StateIndex::decode(change_bytes)
            .ok_or_else(|| Error::invalid_encoding(0, "truncated session change_id"))?;

        let (repeats, rest) = uvarint::read(rest)?;
        let repeats = u32::try_from(repeats)
            .map_err(|_| Error::invalid_encoding(0, "repeats overflows u32"))?;
        let (theme, rest) = uvarint::read(rest)?;
        let theme =
            u32::try_from(theme).map_err(|_| Error::invalid_encoding(0, "theme overflows u32"))?;

        let (n_chunks, mut rest) = uvarint::read(rest)?;
        if n_chunks > MAX_CHUNKS {
            return Err(Error::invalid_encoding(0, "implausible chunk count"));
        }
        let mut data = Vec::new();
        for _ in 0..n_chunks {
            let (chunk_len, after_len) = uvarint::read(rest)?;
            let (chunk, after_chunk) = crate::byteop::split(after_len, chunk_len as usize)?;
            data.extend_from_slice(chunk);
            rest = after_chunk;
        }

        Ok((
            Session {
                id,
                change_id,
                repeats,
                theme,
                data: Bytes::from(data),
            },
            rest,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let s = Session::new(StateIndex::new(1, 2), 7, Bytes::from_static(b"payload"))
            .with_change(StateIndex::new(1, 3))
            .record_repeat();

        let mut buf = Vec::new();
        s.encode(&mut buf).unwrap();
        let (decoded, rest) = Session::decode(&buf).unwrap();
        assert_eq!(decoded, s);
        assert!(rest.is_empty());
    }

    #[test]
    fn round_trips_empty_data() {
        let s = Session::new(StateIndex::new(1, 0), 0, Bytes::new());
        let mut buf = Vec::new();
        s.encode(&mut buf).unwrap();
        let (decoded, _) = Session::decode(&buf).unwrap();
        assert_eq!(decoded.data.len(), 0);
    }

    #[test]
    fn decode_reassembles_multiple_chunks() {
        // Hand-build a two-chunk encoding to exercise the reader side of chunking,
        // which a writer never produces on its own but must still be able to read.
        let mut buf = Vec::new();
        buf.extend_from_slice(&StateIndex::new(1, 1).to_bytes());
        buf.extend_from_slice(&StateIndex::new(1, 1).to_bytes());
        uvarint::write(&mut buf, 0).unwrap(); // repeats
        uvarint::write(&mut buf, 0).unwrap(); // theme
        uvarint::write(&mut buf, 2).unwrap(); // n_chunks
        uvarint::write(&mut buf, 3).unwrap();
        buf.extend_from_slice(b"abc");
        uvarint::write(&mut buf, 2).unwrap();
        buf.extend_from_slice(b"de");

        let (decoded, rest) = Session::decode(&buf).unwrap();
        assert_eq!(decoded.data, Bytes::from_static(b"abcde"));
        assert!(rest.is_empty());
    }

    #[test]
    fn decode_rejects_truncated_chunk() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&StateIndex::new(1, 1).to_bytes());
        buf.extend_from_slice(&StateIndex::new(1, 1).to_bytes());
        uvarint::write(&mut buf, 0).unwrap();
        uvarint::write(&mut buf, 0).unwrap();
        uvarint::write(&mut buf, 1).unwrap();
        uvarint::write(&mut buf, 100).unwrap(); // claims 100 bytes, has none
        assert!(Session::decode(&buf).is_err());
    }
}
