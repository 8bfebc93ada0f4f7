//! # leadership
//!
//! why: give the election driver, replication driver and applier a narrow way to move the replica
//! relations: extends ReplicaState from node.rs; the drivers themselves live outside this crate
//! what: candidate/leader promotion, vote tally, proposals, replication bookkeeping, applying

use tracing::{debug, info};

use crate::error::{ReplicaError, ReplicaResult};
use crate::log::LogEntry;
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::node::{ReplicaState, Role};

impl ReplicaState {
    /// Votes needed to win an election or commit an entry (self included)
    pub fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Whether the votes collected in the current term form a majority
    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    /// Start an election: new term, vote for self, return the request to broadcast
    pub fn become_candidate(&mut self) -> ReplicaResult<VoteRequest> {
        if self.role == Role::Leader {
            return Err(ReplicaError::InvalidTransition {
                from: Role::Leader,
                to: Role::Candidate,
            });
        }

        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id.clone());
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id.clone());
        self.pending.hard_state = true;

        info!(id = %self.id, term = self.current_term, "starting election");

        Ok(VoteRequest {
            candidate_id: self.id.clone(),
            term: self.current_term,
            last_log_index: self.log.last_index().unwrap_or(0),
            last_log_term: self.log.last_term().unwrap_or(0),
        })
    }

    /// Tally a vote response; returns true once the current term's votes form a quorum
    pub fn record_vote(&mut self, from: &str, resp: &VoteResponse) -> ReplicaResult<bool> {
        if !self.peers.contains(from) {
            return Err(ReplicaError::UnknownPeer(from.to_string()));
        }
        if resp.term > self.current_term {
            self.step_down(resp.term);
            return Ok(false);
        }
        // stale responses and responses after the election ended
        if self.role != Role::Candidate || resp.term != self.current_term {
            return Ok(false);
        }
        if resp.vote_granted {
            self.votes_received.insert(from.to_string());
            debug!(
                id = %self.id,
                from,
                votes = self.votes_received.len(),
                quorum = self.quorum_size(),
                "vote received"
            );
        }
        Ok(self.has_quorum())
    }

    /// Take leadership after winning the current term's election
    pub fn become_leader(&mut self) -> ReplicaResult<()> {
        if self.role != Role::Candidate {
            return Err(ReplicaError::InvalidTransition {
                from: self.role,
                to: Role::Leader,
            });
        }

        self.role = Role::Leader;
        self.leader_id = Some(self.id.clone());
        self.votes_received.clear();

        let next = self.log.len();
        self.next_index = self.peers.iter().map(|p| (p.clone(), next)).collect();
        self.match_index = self.peers.iter().map(|p| (p.clone(), 0)).collect();

        info!(id = %self.id, term = self.current_term, "became leader");
        Ok(())
    }

    /// Append a client command to the leader's log and return its index
    pub fn propose(&mut self, command: impl Into<Vec<u8>>) -> ReplicaResult<u64> {
        if self.role != Role::Leader {
            return Err(ReplicaError::NotLeader(self.role));
        }
        let index = self.log.push(LogEntry::new(self.current_term, command));
        self.mark_log_changed(index);
        self.advance_leader_commit();
        Ok(index)
    }

    /// Build the AppendEntries a peer needs next, starting at its `next_index`
    pub fn replication_request(&self, peer: &str) -> ReplicaResult<AppendEntriesRequest> {
        if self.role != Role::Leader {
            return Err(ReplicaError::NotLeader(self.role));
        }
        let next = self
            .next_index
            .get(peer)
            .copied()
            .ok_or_else(|| ReplicaError::UnknownPeer(peer.to_string()))?
            .clamp(1, self.log.len().max(1));
        let prev_log_index = next - 1;

        Ok(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next).to_vec(),
            leader_commit: self.commit_index,
        })
    }

    /// Update a peer's progress from the answer to a request built by `replication_request`
    pub fn record_replication(
        &mut self,
        peer: &str,
        req: &AppendEntriesRequest,
        resp: &AppendEntriesResponse,
    ) -> ReplicaResult<()> {
        if !self.peers.contains(peer) {
            return Err(ReplicaError::UnknownPeer(peer.to_string()));
        }
        if resp.term > self.current_term {
            self.step_down(resp.term);
            return Ok(());
        }
        if self.role != Role::Leader || req.term != self.current_term {
            return Ok(());
        }

        let matched = self.match_index.get(peer).copied().unwrap_or(0);
        let next = self.next_index.get(peer).copied().unwrap_or(1);

        if resp.success {
            let matched = matched.max(req.last_index());
            self.match_index.insert(peer.to_string(), matched);
            self.next_index.insert(peer.to_string(), next.max(matched + 1));
            self.advance_leader_commit();
        } else {
            let retry = next.min(req.prev_log_index).max(matched + 1).max(1);
            debug!(id = %self.id, peer, next_index = retry, "peer rejected entries, backing off");
            self.next_index.insert(peer.to_string(), retry);
        }
        Ok(())
    }

    /// Commit the highest current-term entry held by a majority
    fn advance_leader_commit(&mut self) {
        let Some(last) = self.log.last_index() else {
            return;
        };
        let quorum = self.quorum_size();
        let mut candidate = last;
        while candidate > self.commit_index {
            if self.log.term_at(candidate) == Some(self.current_term) {
                let replicas = 1 + self.match_index.values().filter(|m| **m >= candidate).count();
                if replicas >= quorum {
                    debug!(
                        id = %self.id,
                        old_commit = self.commit_index,
                        new_commit = candidate,
                        "leader advancing commit index"
                    );
                    self.commit_index = candidate;
                    return;
                }
            }
            candidate -= 1;
        }
    }

    /// Hand the committed-but-unapplied entries to the state machine applier
    pub fn take_committed(&mut self) -> Vec<(u64, LogEntry)> {
        if self.commit_index <= self.last_applied {
            return Vec::new();
        }
        let entries = self.log.range_after(self.last_applied, self.commit_index);
        self.last_applied = self.commit_index;
        entries
    }
}
