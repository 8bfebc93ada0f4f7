//! # comprehensive storage tests
//!
//! why: verify replica state is durable before responses are released
//! relations: tests replica-storage against replica-core
//! what: backends, sync of pending writes, crash recovery, durable replica behaviour

use std::fs;
use std::io;

use replica_core::{
    AppendEntriesRequest, LogEntry, ReplicaConfig, ReplicaState, Role, VoteRequest,
};
use replica_storage::{
    sync, DurableReplica, FileStorage, InMemoryStorage, Storage, StorageError, StorageResult,
};
use tempfile::tempdir;

fn config() -> ReplicaConfig {
    ReplicaConfig::new("n1", ["n2", "n3"])
}

fn append(
    term: u64,
    prev_log_index: u64,
    prev_log_term: u64,
    entries: Vec<LogEntry>,
    leader_commit: u64,
) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term,
        leader_id: "n2".into(),
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit,
    }
}

fn vote(candidate: &str, term: u64) -> VoteRequest {
    VoteRequest {
        candidate_id: candidate.into(),
        term,
        last_log_index: 0,
        last_log_term: 0,
    }
}

/// in-memory storage that fails every write while `failing` is set
#[derive(Default)]
struct FlakyStorage {
    inner: InMemoryStorage,
    failing: bool,
}

impl FlakyStorage {
    fn check(&self) -> StorageResult<()> {
        if self.failing {
            return Err(io::Error::new(io::ErrorKind::Other, "disk unavailable").into());
        }
        Ok(())
    }
}

impl Storage for FlakyStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<&str>) -> StorageResult<()> {
        self.check()?;
        self.inner.save_term_and_vote(term, voted_for)
    }

    fn load_term_and_vote(&self) -> StorageResult<(u64, Option<String>)> {
        self.inner.load_term_and_vote()
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        self.check()?;
        self.inner.append_entries(entries)
    }

    fn load_log(&self) -> StorageResult<Vec<LogEntry>> {
        self.inner.load_log()
    }

    fn truncate_log_from(&mut self, from_index: u64) -> StorageResult<()> {
        self.check()?;
        self.inner.truncate_log_from(from_index)
    }

    fn clear(&mut self) -> StorageResult<()> {
        self.inner.clear()
    }
}

// =============================================================================
// SECTION 1: STORAGE BACKENDS
// =============================================================================

mod backends {
    use super::*;

    fn exercise<S: Storage>(storage: &mut S) {
        // defaults
        assert_eq!(storage.load_term_and_vote().unwrap(), (0, None));
        assert!(storage.load_log().unwrap().is_empty());

        // term and vote
        storage.save_term_and_vote(5, Some("n3")).unwrap();
        storage.save_term_and_vote(6, None).unwrap();
        assert_eq!(storage.load_term_and_vote().unwrap(), (6, None));

        // log in batches
        storage.append_entries(&[LogEntry::new(1, "a")]).unwrap();
        storage
            .append_entries(&[LogEntry::new(1, "b"), LogEntry::new(2, "c")])
            .unwrap();
        storage.append_entries(&[]).unwrap();
        assert_eq!(storage.load_log().unwrap().len(), 3);

        // truncation by position, past-the-end is a no-op
        storage.truncate_log_from(5).unwrap();
        assert_eq!(storage.load_log().unwrap().len(), 3);
        storage.truncate_log_from(1).unwrap();
        assert_eq!(storage.load_log().unwrap(), vec![LogEntry::new(1, "a")]);

        storage.clear().unwrap();
        assert_eq!(storage.load_term_and_vote().unwrap(), (0, None));
        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn in_memory_implements_trait() {
        exercise(&mut InMemoryStorage::new());
    }

    #[test]
    fn file_storage_implements_trait() {
        let dir = tempdir().unwrap();
        exercise(&mut FileStorage::new(dir.path()).unwrap());
    }

    #[test]
    fn file_storage_creates_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let storage = FileStorage::new(&nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(storage.dir(), nested.as_path());
    }

    #[test]
    fn files_are_valid_json_and_no_temp_files_remain() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(5, Some("n2")).unwrap();
        storage.append_entries(&[LogEntry::new(1, vec![0u8, 255, 7])]).unwrap();

        let meta = fs::read_to_string(dir.path().join("meta.json")).unwrap();
        let meta: serde_json::Value = serde_json::from_str(&meta).unwrap();
        assert_eq!(meta["voted_for"], "n2");

        let log = fs::read_to_string(dir.path().join("log.json")).unwrap();
        let _: Vec<LogEntry> = serde_json::from_str(&log).unwrap();

        assert!(!dir.path().join("meta.tmp").exists());
        assert!(!dir.path().join("log.tmp").exists());
    }

    #[test]
    fn corrupt_meta_is_a_codec_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("meta.json"), "{ not json").unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        assert!(matches!(
            storage.load_term_and_vote(),
            Err(StorageError::Codec(_))
        ));
    }
}

// =============================================================================
// SECTION 2: SYNCING PENDING WRITES
// =============================================================================

mod syncing {
    use super::*;

    #[test]
    fn fresh_state_writes_sentinel_and_term() {
        let mut storage = InMemoryStorage::new();
        let mut state = ReplicaState::from_config(&config()).unwrap();

        sync(&mut storage, &mut state).unwrap();

        assert_eq!(storage.load_log().unwrap(), vec![LogEntry::sentinel()]);
        assert!(state.pending_writes().is_empty());
    }

    #[test]
    fn truncation_reaches_storage() {
        let mut storage = InMemoryStorage::new();
        let mut state = ReplicaState::from_config(&config()).unwrap();
        state.handle_append_entries(&append(
            1,
            0,
            0,
            vec![LogEntry::new(1, "a"), LogEntry::new(1, "stale")],
            0,
        ));
        sync(&mut storage, &mut state).unwrap();
        assert_eq!(storage.load_log().unwrap().len(), 3);

        // new leader replaces index 2
        state.handle_append_entries(&append(2, 1, 1, vec![LogEntry::new(2, "b")], 0));
        sync(&mut storage, &mut state).unwrap();

        assert_eq!(storage.load_log().unwrap(), state.log().as_slice());
        assert_eq!(storage.load_term_and_vote().unwrap(), (2, None));
    }

    #[test]
    fn failed_sync_is_retried_in_full() {
        let mut storage = FlakyStorage::default();
        let mut state = ReplicaState::from_config(&config()).unwrap();
        sync(&mut storage, &mut state).unwrap();

        state.handle_append_entries(&append(1, 0, 0, vec![LogEntry::new(1, "a")], 0));
        storage.failing = true;
        assert!(sync(&mut storage, &mut state).is_err());
        assert!(!state.pending_writes().is_empty());

        storage.failing = false;
        sync(&mut storage, &mut state).unwrap();
        assert_eq!(storage.load_log().unwrap(), state.log().as_slice());
        assert_eq!(storage.load_term_and_vote().unwrap(), (1, None));
    }
}

// =============================================================================
// SECTION 3: DURABLE REPLICA
// =============================================================================

mod durable_replica {
    use super::*;

    #[test]
    fn fresh_storage_starts_with_sentinel() {
        let durable = DurableReplica::open(&config(), InMemoryStorage::new()).unwrap();

        let status = durable.replica().status();
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.log_len, 1);

        let storage = durable.into_storage();
        assert_eq!(storage.load_log().unwrap(), vec![LogEntry::sentinel()]);
    }

    #[test]
    fn vote_is_durable_before_response() {
        let durable = DurableReplica::open(&config(), InMemoryStorage::new()).unwrap();

        let resp = durable.request_vote(&vote("n2", 3)).unwrap();
        assert!(resp.vote_granted);

        let storage = durable.into_storage();
        assert_eq!(
            storage.load_term_and_vote().unwrap(),
            (3, Some("n2".to_string()))
        );
    }

    #[test]
    fn failed_write_withholds_response() {
        let mut storage = FlakyStorage::default();
        storage.failing = false;
        let durable = DurableReplica::open(&config(), storage).unwrap();

        // nothing fails while the storage is healthy
        assert!(durable.request_vote(&vote("n2", 1)).unwrap().vote_granted);

        let mut storage = durable.into_storage();
        storage.failing = true;
        let durable = DurableReplica::open(&config(), storage).unwrap();

        let result = durable.append_entries(&append(2, 0, 0, vec![LogEntry::new(2, "x")], 0));
        assert!(matches!(result, Err(StorageError::Io(_))));
    }

    #[test]
    fn restart_recovers_term_vote_and_log() {
        let dir = tempdir().unwrap();

        // first "session": follow a leader, then vote in a later term
        {
            let durable =
                DurableReplica::open(&config(), FileStorage::new(dir.path()).unwrap()).unwrap();
            let resp = durable
                .append_entries(&append(
                    1,
                    0,
                    0,
                    vec![LogEntry::new(1, "set x 1"), LogEntry::new(1, "set y 2")],
                    1,
                ))
                .unwrap();
            assert!(resp.success);
            assert!(durable.request_vote(&VoteRequest {
                candidate_id: "n3".into(),
                term: 2,
                last_log_index: 2,
                last_log_term: 1,
            })
            .unwrap()
            .vote_granted);
        }

        // "restart"
        {
            let durable =
                DurableReplica::open(&config(), FileStorage::new(dir.path()).unwrap()).unwrap();
            let status = durable.replica().status();

            assert_eq!(status.current_term, 2);
            assert_eq!(status.voted_for.as_deref(), Some("n3"));
            assert_eq!(status.log_len, 3);
            // commit and apply cursors are volatile
            assert_eq!(status.commit_index, 0);
            assert_eq!(status.last_applied, 0);

            // the recorded vote still blocks a rival in term 2
            assert!(!durable.request_vote(&vote("n2", 2)).unwrap().vote_granted);
        }
    }

    #[test]
    fn meta_without_log_gets_a_sentinel() {
        let mut storage = InMemoryStorage::new();
        storage.save_term_and_vote(4, None).unwrap();

        let durable = DurableReplica::open(&config(), storage).unwrap();
        let resp = durable
            .append_entries(&append(4, 0, 0, vec![LogEntry::new(4, "a")], 0))
            .unwrap();
        assert!(resp.success);

        let storage = durable.into_storage();
        assert_eq!(
            storage.load_log().unwrap(),
            vec![LogEntry::sentinel(), LogEntry::new(4, "a")]
        );
    }

    #[test]
    fn leadership_changes_are_durable() {
        let durable = DurableReplica::open(
            &ReplicaConfig::new("solo", Vec::<String>::new()),
            InMemoryStorage::new(),
        )
        .unwrap();

        let req = durable.become_candidate().unwrap();
        assert_eq!(req.term, 1);
        durable.update(|s| Ok(s.become_leader()?)).unwrap();
        let index = durable.propose(b"cmd".to_vec()).unwrap();
        assert_eq!(index, 1);

        let storage = durable.into_storage();
        assert_eq!(
            storage.load_term_and_vote().unwrap(),
            (1, Some("solo".to_string()))
        );
        assert_eq!(storage.load_log().unwrap().len(), 2);
    }

    #[test]
    fn follower_cannot_propose() {
        let durable = DurableReplica::open(&config(), InMemoryStorage::new()).unwrap();
        let err = durable.propose(b"cmd".to_vec()).unwrap_err();
        assert!(matches!(err, StorageError::Replica(_)));
    }
}
