//! # error
//!
//! why: separate faults from protocol outcomes; a rejected append or vote is never an error
//! relations: returned by node.rs collaborator setters, replica.rs dispatch, config.rs, message.rs
//! what: ReplicaError

use thiserror::Error;

use crate::node::Role;
use crate::NodeId;

/// Result type for replica operations
pub type ReplicaResult<T> = std::result::Result<T, ReplicaError>;

/// Faults raised by the collaborator-facing side of a replica
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// A role change the state machine does not allow
    #[error("invalid role transition from {from:?} to {to:?}")]
    InvalidTransition { from: Role, to: Role },

    /// A leader-only operation was invoked on a non-leader
    #[error("replica is not the leader (role {0:?})")]
    NotLeader(Role),

    /// The peer is not part of this replica's cluster
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),

    /// A response message was handed to the request dispatcher
    #[error("unexpected message {0}, only requests can be handled")]
    UnexpectedMessage(&'static str),

    /// Invalid replica configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Message encoding or decoding failed
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
