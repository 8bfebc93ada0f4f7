//! # replica-storage
//!
//! why: make a replica's term, vote and log durable before its answers reach the network
//! relations: persists replica-core's ReplicaState; drives its handlers through DurableReplica
//! what: Storage trait, FileStorage, InMemoryStorage, sync, DurableReplica

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use replica_core::{
    AppendEntriesRequest, AppendEntriesResponse, HardState, Log, LogEntry, Replica, ReplicaConfig,
    ReplicaError, ReplicaState, VoteRequest, VoteResponse,
};
use thiserror::Error;
use tracing::{debug, info};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors raised while persisting or restoring replica state
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

/// trait for durable storage of replica state
///
/// log indices are positions: index 0 is the first entry ever written
pub trait Storage {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<&str>) -> StorageResult<()>;

    /// load the persisted term and voted_for
    fn load_term_and_vote(&self) -> StorageResult<(u64, Option<String>)>;

    /// append entries to the end of the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> StorageResult<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> StorageResult<Vec<LogEntry>>;

    /// drop the entry at `from_index` and everything after it
    fn truncate_log_from(&mut self, from_index: u64) -> StorageResult<()>;

    /// clear all persisted state
    fn clear(&mut self) -> StorageResult<()>;
}

/// Write the replica's pending durable changes to `storage`
///
/// The pending set is cleared only once every write succeeded, so a failed
/// sync is repeated in full by the next one.
pub fn sync<S: Storage + ?Sized>(storage: &mut S, state: &mut ReplicaState) -> StorageResult<()> {
    let pending = state.pending_writes();
    if pending.is_empty() {
        return Ok(());
    }

    if pending.hard_state {
        storage.save_term_and_vote(state.current_term(), state.voted_for())?;
    }
    if let Some(from) = pending.log_from {
        storage.truncate_log_from(from)?;
        storage.append_entries(state.log().entries_from(from))?;
    }

    debug!(
        id = state.id(),
        term = state.current_term(),
        log_from = ?pending.log_from,
        "replica state synced"
    );
    state.mark_synced();
    Ok(())
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores replica state in a directory with:
/// - meta.json: term and voted_for
/// - log.json: array of log entries
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.json")
    }

    /// atomic write: write to temp file, fsync, then rename over the target
    fn write_atomic(&self, target: PathBuf, temp_name: &str, contents: &[u8]) -> StorageResult<()> {
        let temp_path = self.dir.join(temp_name);
        let mut file = File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&temp_path, target)?;
        Ok(())
    }

    fn read_if_exists(path: &Path) -> StorageResult<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(Some(contents))
    }

    fn write_log(&self, log: &[LogEntry]) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(log)?;
        self.write_atomic(self.log_path(), "log.tmp", &json)
    }
}

/// metadata structure for term and vote
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct MetaData {
    term: u64,
    voted_for: Option<String>,
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<&str>) -> StorageResult<()> {
        let meta = MetaData {
            term,
            voted_for: voted_for.map(str::to_string),
        };
        let json = serde_json::to_vec_pretty(&meta)?;
        self.write_atomic(self.meta_path(), "meta.tmp", &json)
    }

    fn load_term_and_vote(&self) -> StorageResult<(u64, Option<String>)> {
        let Some(contents) = Self::read_if_exists(&self.meta_path())? else {
            return Ok((0, None)); // default for new replicas
        };
        let meta: MetaData = serde_json::from_str(&contents)?;
        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        // whole-file rewrite keeps the log file a single json document
        let mut log = self.load_log()?;
        log.extend(entries.iter().cloned());
        self.write_log(&log)
    }

    fn load_log(&self) -> StorageResult<Vec<LogEntry>> {
        let Some(contents) = Self::read_if_exists(&self.log_path())? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_str(&contents)?)
    }

    fn truncate_log_from(&mut self, from_index: u64) -> StorageResult<()> {
        let mut log = self.load_log()?;
        if from_index >= log.len() as u64 {
            return Ok(());
        }
        log.truncate(from_index as usize);
        self.write_log(&log)
    }

    fn clear(&mut self) -> StorageResult<()> {
        for path in [self.meta_path(), self.log_path()] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    term: u64,
    voted_for: Option<String>,
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<&str>) -> StorageResult<()> {
        self.term = term;
        self.voted_for = voted_for.map(str::to_string);
        Ok(())
    }

    fn load_term_and_vote(&self) -> StorageResult<(u64, Option<String>)> {
        Ok((self.term, self.voted_for.clone()))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> StorageResult<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> StorageResult<()> {
        if let Ok(len) = usize::try_from(from_index) {
            self.log.truncate(len);
        }
        Ok(())
    }

    fn clear(&mut self) -> StorageResult<()> {
        self.term = 0;
        self.voted_for = None;
        self.log.clear();
        Ok(())
    }
}

// -- durable replica --

/// A replica whose durable fields reach storage before any response is returned
///
/// Storage is written while the replica lock is held, so no other request can
/// observe state that is not yet durable.
pub struct DurableReplica<S: Storage> {
    replica: Replica,
    storage: parking_lot::Mutex<S>,
}

impl<S: Storage> DurableReplica<S> {
    /// Restore from `storage`, or start fresh when it holds nothing
    pub fn open(config: &ReplicaConfig, mut storage: S) -> StorageResult<Self> {
        let (current_term, voted_for) = storage.load_term_and_vote()?;
        let log = storage.load_log()?;

        let mut state = if current_term == 0 && voted_for.is_none() && log.is_empty() {
            info!(id = %config.id, "no persisted state, starting fresh");
            ReplicaState::from_config(config)?
        } else {
            // a crash before the first log write leaves only meta.json behind
            let log = if log.is_empty() {
                storage.append_entries(&[LogEntry::sentinel()])?;
                vec![LogEntry::sentinel()]
            } else {
                log
            };
            info!(
                id = %config.id,
                term = current_term,
                log_len = log.len(),
                "restoring persisted state"
            );
            ReplicaState::restore(
                config,
                HardState {
                    current_term,
                    voted_for,
                    log: Log::from(log),
                },
            )?
        };
        sync(&mut storage, &mut state)?;

        Ok(Self {
            replica: Replica::new(state),
            storage: parking_lot::Mutex::new(storage),
        })
    }

    /// The in-memory replica; reads through it never touch storage
    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn append_entries(&self, req: &AppendEntriesRequest) -> StorageResult<AppendEntriesResponse> {
        self.replica
            .append_entries_with(req, |state| sync(&mut *self.storage.lock(), state))
    }

    pub fn request_vote(&self, req: &VoteRequest) -> StorageResult<VoteResponse> {
        self.replica
            .request_vote_with(req, |state| sync(&mut *self.storage.lock(), state))
    }

    /// Start an election with the new term and self-vote made durable first
    pub fn become_candidate(&self) -> StorageResult<VoteRequest> {
        self.update(|state| Ok(state.become_candidate()?))
    }

    /// Append a command on the leader and make it durable
    pub fn propose(&self, command: impl Into<Vec<u8>>) -> StorageResult<u64> {
        let command = command.into();
        self.update(|state| Ok(state.propose(command)?))
    }

    /// Run any collaborator setter, then sync, all under the replica lock
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut ReplicaState) -> StorageResult<R>,
    ) -> StorageResult<R> {
        self.replica.update(|state| {
            let out = f(state)?;
            sync(&mut *self.storage.lock(), state)?;
            Ok(out)
        })
    }

    /// Give the storage back, e.g. to reopen it
    pub fn into_storage(self) -> S {
        self.storage.into_inner()
    }
}
