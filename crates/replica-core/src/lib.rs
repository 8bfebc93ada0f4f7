//! # replica-core
//!
//! why: decide, for a single raft replica, whether to accept an append and whether to grant a vote
//! relations: persisted by replica-storage; timers, transport and state machine live outside
//! what: replica state, AppendEntries/RequestVote handlers, leadership setters, locking wrapper

pub mod config;
pub mod error;
mod leadership;
pub mod log;
pub mod message;
pub mod node;
pub mod replica;

/// Identifier of a replica in the cluster
pub type NodeId = String;

pub use config::ReplicaConfig;
pub use error::{ReplicaError, ReplicaResult};
pub use log::{Log, LogEntry};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, RaftMessage, VoteRequest, VoteResponse,
};
pub use node::{HardState, PendingWrites, ReplicaState, Role};
pub use replica::{Replica, ReplicaStatus};
