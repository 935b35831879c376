//! Saved sessions: the ordered-by-repeat-time record type, its in-memory store, and
//! the source/merge machinery that replays it across memory, snapshot, merge, and
//! fixed-delay files (spec §3, §4.5, §4.6).

pub mod merge;
pub mod saved;
pub mod session;
pub mod source;

pub use merge::{MergeSources, MergeWriter};
pub use saved::SavedSessions;
pub use session::Session;
pub use source::{
    AnySource, FileSessionSource, GlobalSourceReader, MemorySource, SessionRepeatEvent,
    SessionSource, SourceKindTag, SourceRead,
};
