//! # replica
//!
//! why: serialize every rpc handler call against one replica behind a single exclusive lock
//! relations: wraps node.rs ReplicaState; used by transports and by replica-storage's DurableReplica
//! what: Replica handle, sync-under-lock handler variants, message dispatch, status snapshot

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, ReplicaResult};
use crate::log::LogEntry;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RaftMessage, VoteRequest, VoteResponse,
};
use crate::node::{ReplicaState, Role};
use crate::NodeId;

/// Point-in-time view of a replica for drivers and diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub id: NodeId,
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub log_len: u64,
    pub commit_index: u64,
    pub last_applied: u64,
}

/// Shared handle to one replica
///
/// Cloning is cheap; all clones guard the same state. Reads take the same
/// exclusive lock as the handlers.
#[derive(Debug, Clone)]
pub struct Replica {
    state: Arc<Mutex<ReplicaState>>,
}

impl Replica {
    pub fn new(state: ReplicaState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn from_config(config: &ReplicaConfig) -> ReplicaResult<Self> {
        Ok(Self::new(ReplicaState::from_config(config)?))
    }

    /// Handle AppendEntries
    pub fn append_entries(&self, req: &AppendEntriesRequest) -> AppendEntriesResponse {
        self.state.lock().handle_append_entries(req)
    }

    /// Handle AppendEntries, then run `sync` before the lock is released
    ///
    /// If `sync` fails the error is returned instead of the response.
    pub fn append_entries_with<E, F>(
        &self,
        req: &AppendEntriesRequest,
        sync: F,
    ) -> Result<AppendEntriesResponse, E>
    where
        F: FnOnce(&mut ReplicaState) -> Result<(), E>,
    {
        let mut state = self.state.lock();
        let resp = state.handle_append_entries(req);
        sync(&mut state)?;
        Ok(resp)
    }

    /// Handle RequestVote
    pub fn request_vote(&self, req: &VoteRequest) -> VoteResponse {
        self.state.lock().handle_vote_request(req)
    }

    /// Handle RequestVote, then run `sync` before the lock is released
    pub fn request_vote_with<E, F>(&self, req: &VoteRequest, sync: F) -> Result<VoteResponse, E>
    where
        F: FnOnce(&mut ReplicaState) -> Result<(), E>,
    {
        let mut state = self.state.lock();
        let resp = state.handle_vote_request(req);
        sync(&mut state)?;
        Ok(resp)
    }

    /// Answer a request message with its response message
    pub fn handle_message(&self, msg: RaftMessage) -> ReplicaResult<RaftMessage> {
        match msg {
            RaftMessage::AppendEntries(req) => Ok(self.append_entries(&req).into()),
            RaftMessage::VoteRequest(req) => Ok(self.request_vote(&req).into()),
            other => Err(ReplicaError::UnexpectedMessage(other.kind())),
        }
    }

    /// Run a read-only closure under the lock
    pub fn read<R>(&self, f: impl FnOnce(&ReplicaState) -> R) -> R {
        f(&self.state.lock())
    }

    /// Run a closure with mutable access under the lock; for the collaborator setters
    pub fn update<R>(&self, f: impl FnOnce(&mut ReplicaState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Committed entries not yet applied, advancing `last_applied`
    pub fn take_committed(&self) -> Vec<(u64, LogEntry)> {
        self.state.lock().take_committed()
    }

    pub fn status(&self) -> ReplicaStatus {
        self.read(|s| ReplicaStatus {
            id: s.id().to_string(),
            role: s.role(),
            current_term: s.current_term(),
            voted_for: s.voted_for().map(str::to_string),
            leader_id: s.leader_id().map(str::to_string),
            log_len: s.log().len(),
            commit_index: s.commit_index(),
            last_applied: s.last_applied(),
        })
    }
}
