//! # config
//!
//! why: describe which replica this is and who its peers are
//! relations: consumed by node.rs (ReplicaState::from_config) and replica-storage
//! what: ReplicaConfig, json loading, validation

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{ReplicaError, ReplicaResult};
use crate::NodeId;

/// Identity and membership of one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// This replica's id
    pub id: NodeId,
    /// The other members of the cluster
    #[serde(default)]
    pub peers: BTreeSet<NodeId>,
}

impl ReplicaConfig {
    pub fn new<I, P>(id: impl Into<NodeId>, peers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<NodeId>,
    {
        Self {
            id: id.into(),
            peers: peers.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse and validate a json config
    pub fn from_json(json: &str) -> ReplicaResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs that would confuse vote accounting
    pub fn validate(&self) -> ReplicaResult<()> {
        if self.id.is_empty() {
            return Err(ReplicaError::Config("replica id must not be empty".into()));
        }
        if self.peers.iter().any(|p| p.is_empty()) {
            return Err(ReplicaError::Config("peer ids must not be empty".into()));
        }
        if self.peers.contains(&self.id) {
            return Err(ReplicaError::Config(format!(
                "replica {} lists itself as a peer",
                self.id
            )));
        }
        Ok(())
    }
}
