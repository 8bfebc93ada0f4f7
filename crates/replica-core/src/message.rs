//! # message
//!
//! why: define the rpc payloads a replica accepts and answers
//! relations: consumed by node.rs handlers, dispatched by replica.rs, encoded by the transport
//! what: AppendEntries and RequestVote request/response structs, RaftMessage envelope, json codec

use serde::{Deserialize, Serialize};

use crate::error::ReplicaError;
use crate::log::LogEntry;
use crate::NodeId;

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    /// A heartbeat carrying no entries
    pub fn heartbeat(
        term: u64,
        leader_id: impl Into<NodeId>,
        prev_log_index: u64,
        prev_log_term: u64,
        leader_commit: u64,
    ) -> Self {
        Self {
            term,
            leader_id: leader_id.into(),
            prev_log_index,
            prev_log_term,
            entries: Vec::new(),
            leader_commit,
        }
    }

    /// Index of the last entry this request carries, or `prev_log_index` for a heartbeat
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }
}

/// Response to AppendEntries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
}

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate_id: NodeId,
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Response to a vote request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// All messages exchanged between replicas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaftMessage {
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
}

impl RaftMessage {
    /// short name used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AppendEntries(_) => "append_entries",
            Self::AppendEntriesResponse(_) => "append_entries_response",
            Self::VoteRequest(_) => "vote_request",
            Self::VoteResponse(_) => "vote_response",
        }
    }

    /// The term carried by the message
    pub fn term(&self) -> u64 {
        match self {
            Self::AppendEntries(m) => m.term,
            Self::AppendEntriesResponse(m) => m.term,
            Self::VoteRequest(m) => m.term,
            Self::VoteResponse(m) => m.term,
        }
    }

    /// Encode to json bytes
    pub fn encode(&self) -> Result<Vec<u8>, ReplicaError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from json bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, ReplicaError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl From<AppendEntriesRequest> for RaftMessage {
    fn from(m: AppendEntriesRequest) -> Self {
        Self::AppendEntries(m)
    }
}

impl From<AppendEntriesResponse> for RaftMessage {
    fn from(m: AppendEntriesResponse) -> Self {
        Self::AppendEntriesResponse(m)
    }
}

impl From<VoteRequest> for RaftMessage {
    fn from(m: VoteRequest) -> Self {
        Self::VoteRequest(m)
    }
}

impl From<VoteResponse> for RaftMessage {
    fn from(m: VoteResponse) -> Self {
        Self::VoteResponse(m)
    }
}
