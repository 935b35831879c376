//! Forward iteration over a log's frame-structured event stream.

use crate::error::{Error, Result};
use crate::state_index::StateIndex;
use crate::uvarint;

use super::HEADER_SIZE;

#[derive(Debug, Clone, Copy, Default)]
pub struct IteratorOptions {
    /// Byte offset to start at; must be `>= HEADER_SIZE`. Defaults to `HEADER_SIZE`.
    pub start: Option<u64>,
    /// Stop (as if at EOF) on the first event whose id is not strictly before this bound.
    pub read_before: Option<StateIndex>,
}

impl IteratorOptions {
    /// Stop on the first event strictly after `id`, i.e. include `id` itself.
    pub fn read_to(id: StateIndex) -> Self {
        IteratorOptions {
            start: None,
            read_before: Some(id.inc_index()),
        }
    }
}

/// One decoded event: its id, payload, and total on-disk size including any padding
/// consumed to reach it.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: StateIndex,
    pub payload: Vec<u8>,
    /// Byte offset of this event's id within the log file (header included).
    pub offset: u64,
    pub bytes_consumed: usize,
}

/// Iterates forward over the events in `data`, a full log file's bytes (header included).
pub struct Iterator<'a> {
    data: &'a [u8],
    frame_size: u64,
    pos: u64,
    options: IteratorOptions,
    done: bool,
}

impl<'a> Iterator<'a> {
    /// `data` must contain at least the 16-byte header.
    pub fn new(data: &'a [u8], options: IteratorOptions) -> Result<Self> {
        if data.len() < HEADER_SIZE as usize {
            return Err(Error::integrity_compromised(
                "<log>",
                0,
                "file shorter than the fixed header",
            ));
        }
        let frame_size = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let start = options.start.unwrap_or(HEADER_SIZE);
        if start < HEADER_SIZE {
            return Err(Error::internal("iterator start must be >= header size"));
        }
        Ok(Iterator {
            data,
            frame_size,
            pos: start,
            options,
            done: false,
        })
    }

    fn frame_rest(&self) -> u64 {
        self.frame_size - ((self.pos - HEADER_SIZE) % self.frame_size)
    }

    /// Advances past any frame-padding at the current position.
    fn skip_padding_if_needed(&mut self) -> bool {
        if self.frame_rest() < super::MIN_EVENT_ON_DISK_SIZE {
            self.pos += self.frame_rest();
        }
        self.pos < self.data.len() as u64
    }

    pub fn next(&mut self) -> Result<Option<Event>> {
        if self.done {
            return Ok(None);
        }

        loop {
            if !self.skip_padding_if_needed() {
                self.done = true;
                return Ok(None);
            }

            let offset = self.pos as usize;
            if offset + 16 > self.data.len() {
                self.done = true;
                return Ok(None);
            }

            let id = StateIndex::decode(&self.data[offset..offset + 16]).unwrap();
            if id.is_sentinel() {
                // Skip to the next frame.
                self.pos += self.frame_rest();
                if self.pos >= self.data.len() as u64 {
                    self.done = true;
                    return Ok(None);
                }
                continue;
            }

            if let Some(bound) = self.options.read_before {
                if id >= bound {
                    self.done = true;
                    return Ok(None);
                }
            }

            let (len, rest) = uvarint::read(&self.data[offset + 16..])?;
            let len_field_size = (self.data.len() - offset - 16) - rest.len();
            let payload_start = offset + 16 + len_field_size;
            let payload_end = payload_start + len as usize;
            if payload_end > self.data.len() {
                return Err(Error::integrity_compromised(
                    "<log>",
                    self.pos,
                    "event payload runs past end of file",
                ));
            }
            let payload = self.data[payload_start..payload_end].to_vec();
            let consumed = payload_end - offset;
            self.pos += consumed as u64;

            return Ok(Some(Event {
                id,
                payload,
                offset: offset as u64,
                bytes_consumed: consumed,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::writer::LogWriter;

    #[test]
    fn yields_events_in_order() {
        // Scenario 1 from the testable-properties list.
        let file = tempfile::tempfile().unwrap();
        let writer = LogWriter::create(file, 512, 40).unwrap();
        for i in 0..40u64 {
            let payload = i.to_string().into_bytes();
            writer.write_event(StateIndex::new(1, i), &payload).unwrap();
        }
        writer.flush().unwrap();

        let bytes = writer.read_all_bytes().unwrap();
        let mut it = Iterator::new(&bytes, IteratorOptions::default()).unwrap();
        for i in 0..40u64 {
            let ev = it.next().unwrap().unwrap();
            assert_eq!(ev.id, StateIndex::new(1, i));
            assert_eq!(ev.payload, i.to_string().into_bytes());
        }
        assert!(it.next().unwrap().is_none());
    }
}
