//! The abstraction layer for the handful of decision points the core itself must report.
//!
//! This does not prescribe a sink: the default production implementation forwards to
//! `tracing`; tests may use [`NoopLogger`] or a channel-backed logger that records events
//! for assertions.

use std::path::Path;
use std::sync::mpsc::Sender;

use crate::error::Error;
use crate::state_index::StateIndex;

pub trait Logger: Send + Sync + 'static {
    fn snapshot_log_failed_to_init(&self, path: &Path, err: &Error);
    fn snapshot_log_failed_to_append(&self, err: &Error);
    fn snapshot_log_failed_to_rotate(&self, err: &Error);
    fn integrity_compromised(&self, path: &Path, offset: u64, err: &Error);
    fn background_job_finished(&self, kind: &str, id: StateIndex, result: &Result<(), Error>);
}

/// Production logger: forwards every event to `tracing` as a structured event with
/// named fields rather than a formatted string.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn snapshot_log_failed_to_init(&self, path: &Path, err: &Error) {
        tracing::error!(path = %path.display(), error = %err, "snapshot log failed to initialize");
    }

    fn snapshot_log_failed_to_append(&self, err: &Error) {
        tracing::error!(error = %err, "snapshot log failed to append");
    }

    fn snapshot_log_failed_to_rotate(&self, err: &Error) {
        tracing::error!(error = %err, "snapshot log failed to rotate");
    }

    fn integrity_compromised(&self, path: &Path, offset: u64, err: &Error) {
        tracing::error!(path = %path.display(), offset, error = %err, "integrity compromised");
    }

    fn background_job_finished(&self, kind: &str, id: StateIndex, result: &Result<(), Error>) {
        match result {
            Ok(()) => tracing::debug!(kind, %id, "background job finished"),
            Err(err) => tracing::warn!(kind, %id, error = %err, "background job aborted"),
        }
    }
}

/// A logger that discards everything; used by tests that don't assert on log output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn snapshot_log_failed_to_init(&self, _path: &Path, _err: &Error) {}
    fn snapshot_log_failed_to_append(&self, _err: &Error) {}
    fn snapshot_log_failed_to_rotate(&self, _err: &Error) {}
    fn integrity_compromised(&self, _path: &Path, _offset: u64, _err: &Error) {}
    fn background_job_finished(&self, _kind: &str, _id: StateIndex, _result: &Result<(), Error>) {}
}

/// Recorded form of a [`Logger`] call, used by [`ChannelLogger`] for test assertions.
#[derive(Debug)]
pub enum LoggedEvent {
    SnapshotLogFailedToInit,
    SnapshotLogFailedToAppend,
    SnapshotLogFailedToRotate,
    IntegrityCompromised { offset: u64 },
    BackgroundJobFinished { kind: String, ok: bool },
}

/// A logger backed by an `mpsc` channel, for tests that assert on which events fired.
pub struct ChannelLogger {
    tx: Sender<LoggedEvent>,
}

impl ChannelLogger {
    pub fn new(tx: Sender<LoggedEvent>) -> Self {
        ChannelLogger { tx }
    }
}

impl Logger for ChannelLogger {
    fn snapshot_log_failed_to_init(&self, _path: &Path, _err: &Error) {
        let _ = self.tx.send(LoggedEvent::SnapshotLogFailedToInit);
    }

    fn snapshot_log_failed_to_append(&self, _err: &Error) {
        let _ = self.tx.send(LoggedEvent::SnapshotLogFailedToAppend);
    }

    fn snapshot_log_failed_to_rotate(&self, _err: &Error) {
        let _ = self.tx.send(LoggedEvent::SnapshotLogFailedToRotate);
    }

    fn integrity_compromised(&self, _path: &Path, offset: u64, _err: &Error) {
        let _ = self.tx.send(LoggedEvent::IntegrityCompromised { offset });
    }

    fn background_job_finished(&self, kind: &str, _id: StateIndex, result: &Result<(), Error>) {
        let _ = self.tx.send(LoggedEvent::BackgroundJobFinished {
            kind: kind.to_string(),
            ok: result.is_ok(),
        });
    }
}
