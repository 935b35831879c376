use std::path::PathBuf;

use crate::state_index::StateIndex;

pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy for the storage engine.
///
/// Every fallible boundary in this crate returns one of these variants rather than a
/// free-form string so that the storage facade can annotate and forward structured
/// context to the logging sink.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reader not ready at {path:?} (logical position {pos})")]
    ReaderNotReady { path: Option<PathBuf>, pos: u64 },

    #[error("event of {len} bytes exceeds evlim {evlim} for id {id}")]
    EventTooLarge {
        id: StateIndex,
        len: usize,
        evlim: u32,
    },

    #[error("integrity compromised in {path:?} at offset {offset}: {reason}")]
    IntegrityCompromised {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("invalid encoding at offset {offset}: {reason}")]
    InvalidEncoding { offset: u64, reason: String },

    #[error("write of {len} bytes overgrows buffer of capacity {cap}")]
    WriteOvergrowsBuffer { len: usize, cap: usize },

    #[error("internal error: {reason}")]
    Internal { reason: String },

    #[error("io error on {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn internal(reason: impl Into<String>) -> Self {
        Error::Internal {
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<Option<PathBuf>>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_encoding(offset: u64, reason: impl Into<String>) -> Self {
        Error::InvalidEncoding {
            offset,
            reason: reason.into(),
        }
    }

    pub fn integrity_compromised(
        path: impl Into<PathBuf>,
        offset: u64,
        reason: impl Into<String>,
    ) -> Self {
        Error::IntegrityCompromised {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }

    /// True for `EOD`/`reader_not_ready`: not a failure, just "no data yet".
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::ReaderNotReady { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::Io { path: None, source }
    }
}

/// The small numeric policy-code mapping exposed to the outer RPC/policy layer.
///
/// This owns no behavior beyond the mapping itself: it takes whatever the engine raised
/// and reduces it to the handful of codes the outer layer is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PolicyCode {
    Ok = 200,
    Internal = 1000,
    SessionLengthOverflow = 2000,
    /// Reserved for the policy provider's repeat-limit check (spec §1: out of scope
    /// for this core). No `Error` variant here ever maps to it; kept so the outer
    /// RPC layer's three translated codes line up with this enum without the core
    /// needing to know what the limit is.
    SessionRepeatLimitReached = 2001,
    SessionInvalidRequest = 4000,
}

pub fn policy_code(err: Option<&Error>) -> PolicyCode {
    match err {
        None => PolicyCode::Ok,
        Some(Error::EventTooLarge { .. }) => PolicyCode::SessionLengthOverflow,
        Some(Error::InvalidEncoding { .. }) => PolicyCode::SessionInvalidRequest,
        Some(_) => PolicyCode::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_has_no_error() {
        assert_eq!(policy_code(None), PolicyCode::Ok);
    }

    #[test]
    fn event_too_large_maps_to_session_length_overflow() {
        let err = Error::EventTooLarge {
            id: StateIndex::new(1, 0),
            len: 100,
            evlim: 10,
        };
        assert_eq!(policy_code(Some(&err)), PolicyCode::SessionLengthOverflow);
    }

    #[test]
    fn unmapped_errors_fall_back_to_internal() {
        let err = Error::internal("boom");
        assert_eq!(policy_code(Some(&err)), PolicyCode::Internal);
    }
}
