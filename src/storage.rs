//! The storage facade: wires the file registry, log writer, and saved-sessions store
//! together, serializes incoming mutations into log events, and schedules the
//! background snapshot/merge/rotation jobs that run against a point-in-time clone of
//! the leader's state (spec §2, §4 intro, §5, §6).
//!
//! The background job scheduler is a direct generalization of the teacher's
//! `Checkpointer<P>` (`checkpointer.rs`): an `mpsc` request channel, a `JoinSet` of
//! outstanding task handles, and a map tracking how many of each `JobKind` are
//! in-flight, with job completion feeding back as a log event rather than a shared
//! callback.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::dir;
use crate::error::{Error, Result};
use crate::io::file::FileExt;
use crate::io::Io;
use crate::log::{LogWriter, LookupResult};
use crate::logging::Logger;
use crate::registry::{FileRegistry, Handle as RegistryHandle};
use crate::sessions::{SavedSessions, Session};
use crate::state_index::StateIndex;
use crate::uvarint;

mod event_tag {
    pub const SESSION_REPEAT: u8 = 1;
    pub const SNAPSHOT_START: u8 = 2;
    pub const SNAPSHOT_COMMIT: u8 = 3;
    pub const SNAPSHOT_ABORT: u8 = 4;
    pub const MERGE_START: u8 = 5;
    pub const MERGE_COMMIT: u8 = 6;
    pub const MERGE_ABORT: u8 = 7;
    pub const ROTATION_START: u8 = 8;
    pub const ROTATION_COMMIT: u8 = 9;
}

/// Everything the facade appends to the log: incoming mutations, plus the
/// start/commit/abort bracket around every background async operation.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    SessionRepeat { repeat_at: u64, session: Session },
    SnapshotStart { id: StateIndex },
    SnapshotCommit { id: StateIndex },
    SnapshotAbort { id: StateIndex },
    MergeStart { a: StateIndex, b: StateIndex, out: StateIndex },
    MergeCommit { out: StateIndex },
    MergeAbort { out: StateIndex },
    RotationStart { new_log: StateIndex },
    RotationCommit { new_log: StateIndex },
}

impl LogEvent {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            LogEvent::SessionRepeat { repeat_at, session } => {
                out.push(event_tag::SESSION_REPEAT);
                out.extend_from_slice(&repeat_at.to_le_bytes());
                session.encode(&mut out)?;
            }
            LogEvent::SnapshotStart { id } => {
                out.push(event_tag::SNAPSHOT_START);
                out.extend_from_slice(&id.to_bytes());
            }
            LogEvent::SnapshotCommit { id } => {
                out.push(event_tag::SNAPSHOT_COMMIT);
                out.extend_from_slice(&id.to_bytes());
            }
            LogEvent::SnapshotAbort { id } => {
                out.push(event_tag::SNAPSHOT_ABORT);
                out.extend_from_slice(&id.to_bytes());
            }
            LogEvent::MergeStart { a, b, out: out_id } => {
                out.push(event_tag::MERGE_START);
                out.extend_from_slice(&a.to_bytes());
                out.extend_from_slice(&b.to_bytes());
                out.extend_from_slice(&out_id.to_bytes());
            }
            LogEvent::MergeCommit { out: out_id } => {
                out.push(event_tag::MERGE_COMMIT);
                out.extend_from_slice(&out_id.to_bytes());
            }
            LogEvent::MergeAbort { out: out_id } => {
                out.push(event_tag::MERGE_ABORT);
                out.extend_from_slice(&out_id.to_bytes());
            }
            LogEvent::RotationStart { new_log } => {
                out.push(event_tag::ROTATION_START);
                out.extend_from_slice(&new_log.to_bytes());
            }
            LogEvent::RotationCommit { new_log } => {
                out.push(event_tag::ROTATION_COMMIT);
                out.extend_from_slice(&new_log.to_bytes());
            }
        }
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<LogEvent> {
        let (tag, rest) = crate::byteop::split(buf, 1)?;
        match tag[0] {
            event_tag::SESSION_REPEAT => {
                let (repeat_bytes, rest) = crate::byteop::split(rest, 8)?;
                let repeat_at = u64::from_le_bytes(repeat_bytes.try_into().unwrap());
                let (session, rest) = Session::decode(rest)?;
                if !rest.is_empty() {
                    return Err(Error::invalid_encoding(
                        0,
                        "trailing bytes after a SessionRepeat event",
                    ));
                }
                Ok(LogEvent::SessionRepeat { repeat_at, session })
            }
            event_tag::SNAPSHOT_START => Ok(LogEvent::SnapshotStart { id: decode_id(rest)? }),
            event_tag::SNAPSHOT_COMMIT => Ok(LogEvent::SnapshotCommit { id: decode_id(rest)? }),
            event_tag::SNAPSHOT_ABORT => Ok(LogEvent::SnapshotAbort { id: decode_id(rest)? }),
            event_tag::MERGE_START => {
                let (a_bytes, rest) = crate::byteop::split(rest, 16)?;
                let a = StateIndex::decode(a_bytes)
                    .ok_or_else(|| Error::invalid_encoding(0, "truncated merge_start.a"))?;
                let (b_bytes, rest) = crate::byteop::split(rest, 16)?;
                let b = StateIndex::decode(b_bytes)
                    .ok_or_else(|| Error::invalid_encoding(0, "truncated merge_start.b"))?;
                Ok(LogEvent::MergeStart {
                    a,
                    b,
                    out: decode_id(rest)?,
                })
            }
            event_tag::MERGE_COMMIT => Ok(LogEvent::MergeCommit { out: decode_id(rest)? }),
            event_tag::MERGE_ABORT => Ok(LogEvent::MergeAbort { out: decode_id(rest)? }),
            event_tag::ROTATION_START => Ok(LogEvent::RotationStart { new_log: decode_id(rest)? }),
            event_tag::ROTATION_COMMIT => Ok(LogEvent::RotationCommit { new_log: decode_id(rest)? }),
            other => Err(Error::invalid_encoding(
                0,
                format!("unrecognized log event tag {other}"),
            )),
        }
    }
}

fn decode_id(buf: &[u8]) -> Result<StateIndex> {
    StateIndex::decode(buf).ok_or_else(|| Error::invalid_encoding(0, "truncated state index"))
}

/// A point-in-time clone of everything a background snapshot needs, produced
/// synchronously on the leader thread by [`Storage::begin_snapshot`].
pub struct SnapshotJob {
    pub id: StateIndex,
    pub handle: RegistryHandle,
    pub registry: FileRegistry,
    pub saved: SavedSessions,
}

impl SnapshotJob {
    /// The combined snapshot payload: `uvarint(registry_dump_len) || registry_dump ||
    /// saved_sessions_dump`. Not itself part of the bit-exact formats in spec §6 (which
    /// specifies the two halves individually); this is the facade's choice of how to
    /// combine them into one file.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut registry_dump = Vec::new();
        crate::registry::dump::encode(&self.registry, &mut registry_dump)?;

        let mut out = Vec::with_capacity(registry_dump.len() + uvarint::MAX_LEN);
        uvarint::write(&mut out, registry_dump.len() as u64)?;
        out.extend_from_slice(&registry_dump);
        self.saved.encode(&mut out)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<(FileRegistry, SavedSessions)> {
        let (registry_len, rest) = uvarint::read(buf)?;
        let (registry_bytes, rest) = crate::byteop::split(rest, registry_len as usize)?;
        let registry = crate::registry::dump::decode(registry_bytes)?;
        let saved = SavedSessions::decode(rest)?;
        Ok((registry, saved))
    }
}

/// Bookkeeping for a background merge of two already-ordered session sources.
pub struct MergeJob {
    pub out_id: StateIndex,
    pub out_handle: RegistryHandle,
    pub a: StateIndex,
    pub b: StateIndex,
}

/// Bookkeeping for rotating onto a fresh log file once the current one grows past a
/// size/age threshold decided by the caller.
pub struct RotationJob {
    pub new_log_id: StateIndex,
    pub new_log_handle: RegistryHandle,
}

/// The storage facade.
pub struct Storage<IO: Io> {
    io: IO,
    dir: PathBuf,
    config: Config,
    registry: FileRegistry,
    log_handle: RegistryHandle,
    log: LogWriter<IO::File>,
    saved: SavedSessions,
    logger: Arc<dyn Logger>,
    /// The last `StateIndex` handed out by [`Self::next_id`]. Kept separately from the
    /// log's own `last_id()` because that starts at the reserved all-zero sentinel
    /// before any event has been written, and `inc_index()` on it would hand out a
    /// `term == 0` id indistinguishable from the log's "skip to next frame" marker.
    issued: StateIndex,
}

impl<IO: Io> Storage<IO> {
    /// Creates a brand new persisted-state directory with a fresh log file.
    pub fn create(io: IO, dir: impl Into<PathBuf>, config: Config, logger: Arc<dyn Logger>) -> Result<Self> {
        config.validate()?;
        let dir = dir.into();
        io.create_dir_all(&dir).map_err(Error::from)?;

        let log_id = StateIndex::new(1, 0);
        let log_path = dir.join(dir::log_file_name(log_id));
        let file = io
            .open(true, true, true, &log_path)
            .map_err(Error::from)?;
        let log = LogWriter::create_with_buffer_capacity(
            file,
            config.frame_size,
            config.evlim,
            config.writer_buffer_capacity,
        )?
        .with_path(log_path);

        let mut registry = FileRegistry::new();
        let log_handle = registry.new_log(log_id);

        Ok(Storage {
            io,
            dir,
            config,
            registry,
            log_handle,
            log,
            saved: SavedSessions::new(),
            logger,
            issued: log_id,
        })
    }

    /// Reopens a persisted-state directory previously built by [`Self::create`]: loads
    /// the most recent snapshot named by the snapshot-log file, then replays every log
    /// event written since that snapshot was taken (following rotations to their
    /// successor log file as they're encountered) to bring the registry and
    /// saved-sessions store back up to date before handing back a live facade.
    pub fn open(io: IO, dir: impl Into<PathBuf>, config: Config, logger: Arc<dyn Logger>) -> Result<Self> {
        config.validate()?;
        let dir = dir.into();

        let snapshot_name = current_snapshot_name(&io, &dir)?;
        let snapshot_path = dir.join(&snapshot_name);
        let snapshot_bytes = read_whole_file(&io, &snapshot_path)?;
        let (mut registry, mut saved) = SnapshotJob::decode(&snapshot_bytes)?;

        if registry.logs.len() != 1 {
            return Err(Error::integrity_compromised(
                snapshot_path,
                0,
                format!(
                    "snapshot registry names {} active logs, expected exactly one",
                    registry.logs.len()
                ),
            ));
        }
        let mut log_id = registry.logs[0].id;
        let mut log_handle = RegistryHandle {
            kind: crate::registry::Kind::Log,
            id: log_id,
        };
        let mut after = registry.logs[0].last_id;
        let mut pending_rotation_away: Option<RegistryHandle> = None;

        loop {
            let log_path = dir.join(dir::log_file_name(log_id));
            let bytes = read_whole_file(&io, &log_path)?;

            let mut it = crate::log::LogIterator::new(&bytes, crate::log::IteratorOptions::default())?;
            let mut rotated_to = None;
            let mut first_new_id = None;
            while let Some(ev) = it.next()? {
                if ev.id <= after {
                    continue;
                }
                if first_new_id.is_none() {
                    first_new_id = Some(ev.id);
                }
                match LogEvent::decode(&ev.payload)? {
                    LogEvent::SessionRepeat { repeat_at, session } => {
                        saved.add(repeat_at, session);
                    }
                    LogEvent::SnapshotStart { id } => {
                        registry.new_snapshot(id);
                    }
                    LogEvent::SnapshotCommit { id } | LogEvent::SnapshotAbort { id } => {
                        let h = RegistryHandle {
                            kind: crate::registry::Kind::Snapshot,
                            id,
                        };
                        registry.remove(h, ev.id)?;
                    }
                    LogEvent::MergeStart { out, .. } => {
                        registry.new_merge(out);
                    }
                    LogEvent::MergeCommit { out } | LogEvent::MergeAbort { out } => {
                        let h = RegistryHandle {
                            kind: crate::registry::Kind::Merge,
                            id: out,
                        };
                        registry.remove(h, ev.id)?;
                    }
                    LogEvent::RotationStart { new_log } => {
                        registry.new_log(new_log);
                        pending_rotation_away = Some(log_handle);
                        rotated_to = Some(new_log);
                    }
                    LogEvent::RotationCommit { .. } => {
                        if let Some(old_handle) = pending_rotation_away.take() {
                            registry.remove(old_handle, ev.id)?;
                        }
                    }
                }
                after = ev.id;
            }

            // Patch the log descriptor's byte-level bookkeeping directly from the file's
            // actual size rather than accumulating per-event deltas: the iterator's
            // per-event `bytes_consumed` excludes frame padding, which `write_event`'s
            // live accounting includes, so deriving it from the whole file avoids
            // drifting away from the invariant that descriptor size matches disk usage.
            if let Some(d) = registry.logs.iter_mut().find(|d| d.id == log_id) {
                d.write = bytes.len() as u64 - crate::log::HEADER_SIZE;
                if let Some(first) = first_new_id {
                    d.first_id = first;
                }
                d.last_id = after;
            }

            match rotated_to {
                Some(new_log) => {
                    log_id = new_log;
                    log_handle = RegistryHandle {
                        kind: crate::registry::Kind::Log,
                        id: log_id,
                    };
                }
                None => break,
            }
        }

        let log_path = dir.join(dir::log_file_name(log_id));
        let file = io.open(false, true, true, &log_path).map_err(Error::from)?;
        let log = LogWriter::open_for_append_with_buffer_capacity(
            file,
            log_path,
            Some(config.writer_buffer_capacity),
        )?;
        let issued = log.last_id();

        Ok(Storage {
            io,
            dir,
            config,
            registry,
            log_handle,
            log,
            saved,
            logger,
            issued,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn registry_stats(&self) -> crate::registry::Stats {
        self.registry.stats()
    }

    pub fn saved_sessions_len(&self) -> usize {
        self.saved.len()
    }

    fn next_id(&mut self) -> StateIndex {
        self.issued = self.issued.inc_index();
        self.issued
    }

    fn write_log_event(&mut self, id: StateIndex, event: &LogEvent) -> Result<()> {
        let payload = event.encode()?;
        let delta = self.log.write_event(id, &payload)?;
        self.registry.next_write(self.log_handle, delta, Some(id))?;
        Ok(())
    }

    /// Appends a `SessionRepeat` event and applies it to the in-memory saved-sessions
    /// store, the way any other log event mutates leader state as it is written.
    pub fn append_session_repeat(&mut self, repeat_at: u64, session: Session) -> Result<StateIndex> {
        let id = self.next_id();
        self.write_log_event(
            id,
            &LogEvent::SessionRepeat {
                repeat_at,
                session: session.clone(),
            },
        )?;
        self.saved.add(repeat_at, session);
        Ok(id)
    }

    pub fn flush(&self) -> Result<()> {
        self.log.flush()
    }

    pub fn lookup_next(&self, id: StateIndex) -> Result<LookupResult> {
        self.log.lookup_next(id, self.logger.as_ref())
    }

    /// The current log file's full bytes, header included. Used by recovery and by
    /// tests that want to replay every event the facade has appended so far.
    pub fn current_log_bytes(&self) -> Result<Vec<u8>> {
        self.log.read_all_bytes()
    }

    /// Announces a snapshot and returns a point-in-time clone for a background task to
    /// work from, leaving the live leader state free to keep accepting writes.
    pub fn begin_snapshot(&mut self) -> Result<SnapshotJob> {
        let id = self.next_id();
        self.write_log_event(id, &LogEvent::SnapshotStart { id })?;
        let handle = self.registry.new_snapshot(id);
        Ok(SnapshotJob {
            id,
            handle,
            registry: self.registry.deep_clone(),
            saved: self.saved.deep_clone(),
        })
    }

    pub fn commit_snapshot(&mut self, job: &SnapshotJob, written_bytes: u64) -> Result<()> {
        let id = self.next_id();
        self.write_log_event(id, &LogEvent::SnapshotCommit { id: job.id })?;
        self.registry.next_write(job.handle, written_bytes, None)?;
        // The completed snapshot file stays on disk as "the current snapshot" via the
        // snapshot-log (§6), but the registry's own active-write bookkeeping for it is
        // done; it retires into `unused` until the recovery horizon clears it.
        self.registry.remove(job.handle, id)?;
        self.logger.background_job_finished("snapshot", job.id, &Ok(()));
        Ok(())
    }

    pub fn abort_snapshot(&mut self, job: &SnapshotJob, err: Error) -> Result<()> {
        let id = self.next_id();
        self.write_log_event(id, &LogEvent::SnapshotAbort { id: job.id })?;
        self.registry.remove(job.handle, id)?;
        self.logger
            .background_job_finished("snapshot", job.id, &Err(err));
        Ok(())
    }

    /// Announces a merge of the already-ordered sources named by `a`/`b`. Actual byte
    /// work is delegated to [`crate::sessions::merge::MergeSources`]; this only brackets
    /// it with log events and registry bookkeeping.
    pub fn begin_merge(&mut self, a: StateIndex, b: StateIndex) -> Result<MergeJob> {
        let out_id = self.next_id();
        self.write_log_event(
            out_id,
            &LogEvent::MergeStart {
                a,
                b,
                out: out_id,
            },
        )?;
        let out_handle = self.registry.new_merge(out_id);
        Ok(MergeJob {
            out_id,
            out_handle,
            a,
            b,
        })
    }

    pub fn commit_merge(&mut self, job: &MergeJob, written_bytes: u64) -> Result<()> {
        let id = self.next_id();
        self.write_log_event(id, &LogEvent::MergeCommit { out: job.out_id })?;
        self.registry.next_write(job.out_handle, written_bytes, None)?;
        self.registry.remove(job.out_handle, id)?;
        self.logger
            .background_job_finished("merge", job.out_id, &Ok(()));
        Ok(())
    }

    pub fn abort_merge(&mut self, job: &MergeJob, err: Error) -> Result<()> {
        let id = self.next_id();
        self.write_log_event(id, &LogEvent::MergeAbort { out: job.out_id })?;
        self.registry.remove(job.out_handle, id)?;
        self.logger
            .background_job_finished("merge", job.out_id, &Err(err));
        Ok(())
    }

    /// Rotates onto a fresh log file once the caller decides the current one has grown
    /// large enough; the old log's descriptor is left for the recovery-horizon GC to
    /// eventually reclaim once every reader has moved past it.
    pub fn begin_rotation(&mut self) -> Result<RotationJob> {
        let new_log_id = self.next_id();
        self.write_log_event(new_log_id, &LogEvent::RotationStart { new_log: new_log_id })?;
        let new_log_handle = self.registry.new_log(new_log_id);
        Ok(RotationJob {
            new_log_id,
            new_log_handle,
        })
    }

    pub fn commit_rotation(&mut self, job: RotationJob, new_log: LogWriter<IO::File>) -> Result<()> {
        let old_handle = self.log_handle;
        self.log = new_log;
        self.log_handle = job.new_log_handle;

        let id = self.next_id();
        self.write_log_event(id, &LogEvent::RotationCommit { new_log: job.new_log_id })?;
        self.registry.remove(old_handle, id)?;
        self.logger
            .background_job_finished("rotation", job.new_log_id, &Ok(()));
        Ok(())
    }

    /// Deletes every unused descriptor whose `last_used` has aged out past the
    /// configured recovery horizon.
    pub fn collect_unused(&mut self, horizon: StateIndex) -> Vec<StateIndex> {
        let stale = self.registry.unused_old(horizon);
        let ids = stale.iter().map(|&i| self.registry.unused[i].id).collect();
        self.registry.remove_unused(&stale);
        ids
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Writes `snapshot_name` as the sole current entry of the snapshot-log file, via
/// temp-file-plus-rename so a reader never observes a half-written file (spec §6).
pub fn rotate_snapshot_log<IO: Io>(io: &IO, dir: &Path, snapshot_name: &str, logger: &dyn Logger) -> Result<()> {
    let path = dir::snapshot_log_path(dir);
    let tmp_path = dir.join(format!("{}.tmp", snapshot_name));

    let result = (|| -> Result<()> {
        let tmp = io.open(true, false, true, &tmp_path).map_err(Error::from)?;
        let mut line = Vec::with_capacity(snapshot_name.len() + 1);
        line.extend_from_slice(snapshot_name.as_bytes());
        line.push(b'\n');
        tmp.write_all_at(&line, 0).map_err(Error::from)?;
        tmp.sync_all().map_err(Error::from)?;
        std::fs::rename(&tmp_path, &path).map_err(Error::from)?;
        Ok(())
    })();

    if let Err(err) = &result {
        logger.snapshot_log_failed_to_rotate(err);
    }
    result
}

/// Appends `snapshot_name` as a new line to the snapshot-log file, creating the file
/// if it doesn't exist yet. Since [`Io::open`] has no create-if-missing mode, this
/// reads whatever is already there (if anything) and rewrites the whole file via the
/// same temp-file-plus-rename swap `rotate_snapshot_log` uses, so a concurrent reader
/// never observes a partially-appended line.
pub fn append_snapshot_log<IO: Io>(io: &IO, dir: &Path, snapshot_name: &str, logger: &dyn Logger) -> Result<()> {
    let path = dir::snapshot_log_path(dir);
    let result = (|| -> Result<()> {
        let mut existing = Vec::new();
        if let Ok(file) = io.open(false, true, false, &path) {
            let len = file.len().map_err(Error::from)?;
            existing = vec![0u8; len as usize];
            file.read_exact_at(&mut existing, 0).map_err(Error::from)?;
        }
        existing.extend_from_slice(snapshot_name.as_bytes());
        existing.push(b'\n');

        let tmp_path = dir.join(format!("{snapshot_name}.append.tmp"));
        let tmp = io.open(true, false, true, &tmp_path).map_err(Error::from)?;
        tmp.write_all_at(&existing, 0).map_err(Error::from)?;
        tmp.sync_all().map_err(Error::from)?;
        std::fs::rename(&tmp_path, &path).map_err(Error::from)
    })();

    if let Err(err) = &result {
        logger.snapshot_log_failed_to_append(err);
    }
    result
}

/// Reads a whole file into memory, used by recovery paths that want to iterate a
/// closed or fully-flushed file's bytes directly rather than through a live writer.
fn read_whole_file<IO: Io>(io: &IO, path: &Path) -> Result<Vec<u8>> {
    let file = io.open(false, true, false, path).map_err(Error::from)?;
    let len = file.len().map_err(Error::from)?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact_at(&mut buf, 0).map_err(Error::from)?;
    Ok(buf)
}

/// The last non-empty line of the snapshot-log file: the name of the snapshot file to
/// restore from (spec §6).
fn current_snapshot_name<IO: Io>(io: &IO, dir: &Path) -> Result<String> {
    let path = dir::snapshot_log_path(dir);
    let bytes = read_whole_file(io, &path)?;
    let text = std::str::from_utf8(&bytes)
        .map_err(|_| Error::integrity_compromised(path.clone(), 0, "snapshot-log is not valid UTF-8"))?;
    text.lines()
        .rev()
        .find(|line| !line.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| Error::integrity_compromised(path, 0, "snapshot-log has no snapshot name"))
}

/// Which background job kind this request is for. Used to enforce "at most one of
/// each kind in flight at a time" (spec §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Snapshot,
    Merge,
    Rotation,
}

/// A fully self-contained unit of background work: everything the job needs to run
/// without touching the live leader state.
pub enum PendingJob {
    Snapshot(SnapshotJob),
    Merge(MergeJob),
    Rotation(RotationJob),
}

impl PendingJob {
    fn kind(&self) -> JobKind {
        match self {
            PendingJob::Snapshot(_) => JobKind::Snapshot,
            PendingJob::Merge(_) => JobKind::Merge,
            PendingJob::Rotation(_) => JobKind::Rotation,
        }
    }

    fn id(&self) -> StateIndex {
        match self {
            PendingJob::Snapshot(j) => j.id,
            PendingJob::Merge(j) => j.out_id,
            PendingJob::Rotation(j) => j.new_log_id,
        }
    }
}

pub enum JobMessage {
    Run(PendingJob),
    Shutdown,
}

/// Executes one [`PendingJob`] to completion. Implemented by whatever owns the actual
/// filesystem access (the facade, in production; a fake in tests).
pub trait PerformJob: Send + Sync + 'static {
    fn perform(&self, job: PendingJob) -> impl Future<Output = (JobKind, StateIndex, Result<()>)> + Send;
}

const JOB_ERROR_THRESHOLD: usize = 16;

/// Background job runner: an `mpsc` request queue plus a `JoinSet` of outstanding
/// tasks, at most [`Config::max_concurrent_jobs_per_kind`] per [`JobKind`] running at a
/// time. Modeled directly on the teacher's `Checkpointer<P>`.
pub struct JobRunner<P> {
    perform: Arc<P>,
    scheduled: Vec<PendingJob>,
    running: HashMap<JobKind, usize>,
    max_per_kind: usize,
    recv: mpsc::Receiver<JobMessage>,
    shutting_down: bool,
    join_set: JoinSet<(JobKind, StateIndex, Result<()>)>,
    errors: usize,
}

impl<P> JobRunner<P>
where
    P: PerformJob,
{
    pub fn new(perform: Arc<P>, recv: mpsc::Receiver<JobMessage>) -> Self {
        Self::with_max_per_kind(perform, recv, 1)
    }

    pub fn with_max_per_kind(perform: Arc<P>, recv: mpsc::Receiver<JobMessage>, max_per_kind: usize) -> Self {
        JobRunner {
            perform,
            scheduled: Vec::new(),
            running: HashMap::new(),
            max_per_kind: max_per_kind.max(1),
            recv,
            shutting_down: false,
            join_set: JoinSet::new(),
            errors: 0,
        }
    }

    pub async fn run(mut self) {
        loop {
            if self.should_exit() {
                tracing::info!("job runner exited cleanly");
                return;
            }
            if self.errors > JOB_ERROR_THRESHOLD {
                tracing::error!("job runner saw {} consecutive errors", self.errors);
            }
            self.step().await;
        }
    }

    fn should_exit(&self) -> bool {
        self.shutting_down
            && self.recv.is_empty()
            && self.scheduled.is_empty()
            && self.running.is_empty()
            && self.join_set.is_empty()
    }

    async fn step(&mut self) {
        tokio::select! {
            biased;
            result = self.join_set.join_next(), if !self.join_set.is_empty() => {
                match result {
                    Some(Ok((kind, id, result))) => {
                        if let Some(count) = self.running.get_mut(&kind) {
                            *count -= 1;
                            if *count == 0 {
                                self.running.remove(&kind);
                            }
                        }
                        if result.is_err() {
                            self.errors += 1;
                        } else {
                            self.errors = 0;
                        }
                        tracing::debug!(?kind, %id, ok = result.is_ok(), "background job finished");
                    }
                    Some(Err(e)) => panic!("background job task panicked: {e}"),
                    None => unreachable!("got None, but join set is not empty"),
                }
            }
            received = self.recv.recv(), if !self.shutting_down => {
                match received {
                    Some(JobMessage::Run(job)) => self.scheduled.push(job),
                    Some(JobMessage::Shutdown) | None => {
                        tracing::info!("job runner shutting down");
                        self.shutting_down = true;
                    }
                }
            }
            _ = std::future::ready(()), if self.has_runnable_work() => (),
        }

        let mut remaining = Vec::new();
        for job in self.scheduled.drain(..) {
            let kind = job.kind();
            let count = self.running.get(&kind).copied().unwrap_or(0);
            if count >= self.max_per_kind {
                remaining.push(job);
                continue;
            }
            *self.running.entry(kind).or_insert(0) += 1;
            let perform = self.perform.clone();
            self.join_set.spawn(async move { perform.perform(job).await });
        }
        self.scheduled = remaining;
    }

    fn has_runnable_work(&self) -> bool {
        self.scheduled
            .iter()
            .any(|j| self.running.get(&j.kind()).copied().unwrap_or(0) < self.max_per_kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::StdIo;
    use crate::logging::NoopLogger;
    use crate::state_index::StateIndex;
    use bytes::Bytes;

    fn session() -> Session {
        Session::new(StateIndex::new(1, 0), 0, Bytes::from_static(b"hi"))
    }

    #[test]
    fn log_event_round_trips_every_variant() {
        let events = vec![
            LogEvent::SessionRepeat {
                repeat_at: 5,
                session: session(),
            },
            LogEvent::SnapshotStart {
                id: StateIndex::new(1, 1),
            },
            LogEvent::SnapshotCommit {
                id: StateIndex::new(1, 1),
            },
            LogEvent::SnapshotAbort {
                id: StateIndex::new(1, 1),
            },
            LogEvent::MergeStart {
                a: StateIndex::new(1, 1),
                b: StateIndex::new(1, 2),
                out: StateIndex::new(1, 3),
            },
            LogEvent::MergeCommit {
                out: StateIndex::new(1, 3),
            },
            LogEvent::MergeAbort {
                out: StateIndex::new(1, 3),
            },
            LogEvent::RotationStart {
                new_log: StateIndex::new(2, 0),
            },
            LogEvent::RotationCommit {
                new_log: StateIndex::new(2, 0),
            },
        ];
        for event in events {
            let encoded = event.encode().unwrap();
            let decoded = LogEvent::decode(&encoded).unwrap();
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn append_session_repeat_updates_log_and_saved_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::create(
            StdIo::default(),
            dir.path(),
            Config::default(),
            Arc::new(NoopLogger),
        )
        .unwrap();

        storage.append_session_repeat(10, session()).unwrap();
        assert_eq!(storage.saved_sessions_len(), 1);
        assert_eq!(storage.registry_stats().logs, 1);
    }

    #[test]
    fn snapshot_lifecycle_moves_descriptor_through_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::create(
            StdIo::default(),
            dir.path(),
            Config::default(),
            Arc::new(NoopLogger),
        )
        .unwrap();
        storage.append_session_repeat(1, session()).unwrap();

        let job = storage.begin_snapshot().unwrap();
        assert_eq!(storage.registry_stats().snapshots, 1);

        let payload = job.encode().unwrap();
        let (restored_registry, restored_saved) = SnapshotJob::decode(&payload).unwrap();
        assert_eq!(restored_saved.len(), 1);
        assert_eq!(restored_registry.stats().logs, 1);

        storage.commit_snapshot(&job, payload.len() as u64).unwrap();
        assert_eq!(storage.registry_stats().snapshots, 0);
        assert_eq!(storage.registry_stats().unused, 1);
    }

    #[test]
    fn open_restores_snapshotted_state_plus_events_written_since() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::create(
            StdIo::default(),
            dir.path(),
            Config::default(),
            Arc::new(NoopLogger),
        )
        .unwrap();

        storage.append_session_repeat(1, session()).unwrap();
        let job = storage.begin_snapshot().unwrap();
        let payload = job.encode().unwrap();
        std::fs::write(dir.path().join("snapshot-0"), &payload).unwrap();
        append_snapshot_log(&StdIo::default(), dir.path(), "snapshot-0", &NoopLogger).unwrap();
        storage.commit_snapshot(&job, payload.len() as u64).unwrap();

        // Written after the snapshot was taken; `open` must pick these up by replay.
        storage.append_session_repeat(2, session()).unwrap();
        storage.append_session_repeat(3, session()).unwrap();
        storage.flush().unwrap();
        drop(storage);

        let restored = Storage::open(
            StdIo::default(),
            dir.path(),
            Config::default(),
            Arc::new(NoopLogger),
        )
        .unwrap();

        assert_eq!(restored.saved_sessions_len(), 3);
        assert_eq!(restored.registry_stats().logs, 1);
        assert_eq!(restored.registry_stats().snapshots, 0);
        assert_eq!(restored.registry_stats().unused, 1);
    }

    #[test]
    fn open_follows_a_rotation_that_happened_after_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::create(
            StdIo::default(),
            dir.path(),
            Config::default(),
            Arc::new(NoopLogger),
        )
        .unwrap();

        storage.append_session_repeat(1, session()).unwrap();
        let job = storage.begin_snapshot().unwrap();
        let payload = job.encode().unwrap();
        std::fs::write(dir.path().join("snapshot-0"), &payload).unwrap();
        append_snapshot_log(&StdIo::default(), dir.path(), "snapshot-0", &NoopLogger).unwrap();
        storage.commit_snapshot(&job, payload.len() as u64).unwrap();

        let rotation = storage.begin_rotation().unwrap();
        let new_log_path = dir.path().join(dir::log_file_name(rotation.new_log_id));
        let new_log_file = StdIo::default()
            .open(true, true, true, &new_log_path)
            .unwrap();
        let new_log = LogWriter::create_with_buffer_capacity(
            new_log_file,
            storage.config().frame_size,
            storage.config().evlim,
            storage.config().writer_buffer_capacity,
        )
        .unwrap()
        .with_path(new_log_path);
        storage.commit_rotation(rotation, new_log).unwrap();
        storage.append_session_repeat(2, session()).unwrap();
        storage.flush().unwrap();
        drop(storage);

        let restored = Storage::open(
            StdIo::default(),
            dir.path(),
            Config::default(),
            Arc::new(NoopLogger),
        )
        .unwrap();

        assert_eq!(restored.saved_sessions_len(), 2);
        assert_eq!(restored.registry_stats().logs, 1);
        assert_eq!(restored.registry_stats().unused, 2);
    }

    #[test]
    fn snapshot_abort_moves_descriptor_to_unused_without_a_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::create(
            StdIo::default(),
            dir.path(),
            Config::default(),
            Arc::new(NoopLogger),
        )
        .unwrap();

        let job = storage.begin_snapshot().unwrap();
        storage
            .abort_snapshot(&job, Error::internal("disk full"))
            .unwrap();
        assert_eq!(storage.registry_stats().snapshots, 0);
        assert_eq!(storage.registry_stats().unused, 1);
    }

    /// Never finishes inside a test's lifetime, the way `checkpointer.rs`'s own tests
    /// use a 1000-second sleep: it lets a test inspect the runner's intermediate
    /// `scheduled`/`running` state deterministically, without racing a real completion.
    struct SleepForever;

    impl PerformJob for SleepForever {
        async fn perform(&self, job: PendingJob) -> (JobKind, StateIndex, Result<()>) {
            tokio::time::sleep(tokio::time::Duration::from_secs(1000)).await;
            (job.kind(), job.id(), Ok(()))
        }
    }

    fn rotation_job(id: u64) -> PendingJob {
        PendingJob::Rotation(RotationJob {
            new_log_id: StateIndex::new(id, 0),
            new_log_handle: RegistryHandle {
                kind: crate::registry::Kind::Log,
                id: StateIndex::new(id, 0),
            },
        })
    }

    #[tokio::test]
    async fn job_runner_holds_back_a_second_job_of_the_same_kind() {
        let (tx, rx) = mpsc::channel(8);
        let mut runner = JobRunner::new(Arc::new(SleepForever), rx);

        tx.send(JobMessage::Run(rotation_job(1))).await.unwrap();
        tx.send(JobMessage::Run(rotation_job(2))).await.unwrap();

        runner.step().await;
        assert_eq!(runner.running.len(), 1);
        assert!(runner.scheduled.is_empty());

        runner.step().await;
        assert_eq!(runner.running.len(), 1);
        assert_eq!(runner.scheduled.len(), 1);
    }

    #[tokio::test]
    async fn job_runner_exits_once_shutdown_finds_nothing_left_to_do() {
        let (tx, rx) = mpsc::channel(8);
        let mut runner = JobRunner::new(Arc::new(SleepForever), rx);

        tx.send(JobMessage::Shutdown).await.unwrap();
        runner.step().await;
        assert!(runner.should_exit());
    }
}
