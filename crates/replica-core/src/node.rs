//! # node
//!
//! why: hold one replica's consensus state and decide every append and vote against it
//! relations: uses message.rs for rpc types, log.rs for entries, guarded by replica.rs
//! what: Role enum, ReplicaState, PendingWrites, AppendEntries and RequestVote handlers

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ReplicaConfig;
use crate::error::ReplicaResult;
use crate::log::Log;
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::NodeId;

/// The three possible roles a replica can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Role {
    /// Passive state - accepts entries from the leader, votes when asked
    #[default]
    Follower,
    /// Requesting votes to become leader
    Candidate,
    /// Drives replication to the followers
    Leader,
}

/// The durable part of a replica: what must survive a restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: Log,
}

/// Durable fields changed since the last successful sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingWrites {
    /// term or vote changed
    pub hard_state: bool,
    /// lowest log index whose contents changed
    pub log_from: Option<u64>,
}

impl PendingWrites {
    pub fn is_empty(&self) -> bool {
        !self.hard_state && self.log_from.is_none()
    }
}

/// The full state of one replica
///
/// Fields are private: every mutation goes through the handlers below or
/// through the collaborator setters in `leadership.rs`.
#[derive(Debug, Clone)]
pub struct ReplicaState {
    pub(crate) id: NodeId,
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) log: Log,
    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,
    pub(crate) next_index: BTreeMap<NodeId, u64>,
    pub(crate) match_index: BTreeMap<NodeId, u64>,
    pub(crate) role: Role,
    pub(crate) peers: BTreeSet<NodeId>,
    pub(crate) leader_id: Option<NodeId>,
    pub(crate) votes_received: BTreeSet<NodeId>,
    pub(crate) pending: PendingWrites,
}

impl ReplicaState {
    /// Create a fresh follower whose log holds only the sentinel entry
    pub fn new<I, P>(id: impl Into<NodeId>, peers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<NodeId>,
    {
        let id = id.into();
        let peers = peers
            .into_iter()
            .map(Into::into)
            .filter(|p: &NodeId| *p != id)
            .collect();
        Self {
            id,
            current_term: 0,
            voted_for: None,
            log: Log::with_sentinel(),
            commit_index: 0,
            last_applied: 0,
            next_index: BTreeMap::new(),
            match_index: BTreeMap::new(),
            role: Role::Follower,
            peers,
            leader_id: None,
            votes_received: BTreeSet::new(),
            // the sentinel and the zero term have never been written
            pending: PendingWrites {
                hard_state: true,
                log_from: Some(0),
            },
        }
    }

    /// Create a fresh follower from a validated config
    pub fn from_config(config: &ReplicaConfig) -> ReplicaResult<Self> {
        config.validate()?;
        Ok(Self::new(config.id.clone(), config.peers.iter().cloned()))
    }

    /// Rebuild a follower from persisted state; the log is taken verbatim
    pub fn restore(config: &ReplicaConfig, hard_state: HardState) -> ReplicaResult<Self> {
        config.validate()?;
        let mut state = Self::new(config.id.clone(), config.peers.iter().cloned());
        state.current_term = hard_state.current_term;
        state.voted_for = hard_state.voted_for;
        state.log = hard_state.log;
        state.pending = PendingWrites::default();
        Ok(state)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.voted_for.as_deref()
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peers(&self) -> &BTreeSet<NodeId> {
        &self.peers
    }

    /// The leader this replica last accepted entries from (or itself when leading)
    pub fn leader_id(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    pub fn next_index(&self, peer: &str) -> Option<u64> {
        self.next_index.get(peer).copied()
    }

    pub fn match_index(&self, peer: &str) -> Option<u64> {
        self.match_index.get(peer).copied()
    }

    /// Copy of the durable fields
    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            log: self.log.clone(),
        }
    }

    pub fn pending_writes(&self) -> PendingWrites {
        self.pending
    }

    /// Called by the persistence collaborator once the pending writes are durable
    pub fn mark_synced(&mut self) {
        self.pending = PendingWrites::default();
    }

    pub(crate) fn mark_log_changed(&mut self, from: u64) {
        self.pending.log_from = Some(match self.pending.log_from {
            Some(existing) => existing.min(from),
            None => from,
        });
    }

    /// Adopt a newer term and revert to follower
    pub(crate) fn step_down(&mut self, term: u64) {
        info!(
            id = %self.id,
            old_term = self.current_term,
            new_term = term,
            role = ?self.role,
            "observed newer term, stepping down to follower"
        );
        self.current_term = term;
        self.voted_for = None;
        self.role = Role::Follower;
        self.leader_id = None;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.pending.hard_state = true;
    }

    fn append_response(&self, success: bool) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
        }
    }

    fn vote_response(&self, vote_granted: bool) -> VoteResponse {
        VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Decide an AppendEntries request from a (claimed) leader
    ///
    /// 1. Reply `false` if `term` is older than ours.
    /// 2. Adopt a newer term before anything else, so a newer leader is recognised
    ///    even if its entries are rejected below.
    /// 3. Reply `false` if there is no entry at `prev_log_index`.
    /// 4. If that entry's term differs, drop it and everything after it, reply `false`.
    /// 5. Append the entries, replacing any conflicting suffix.
    /// 6. Advance `commit_index` towards `leader_commit`.
    pub fn handle_append_entries(&mut self, req: &AppendEntriesRequest) -> AppendEntriesResponse {
        if req.term < self.current_term {
            debug!(
                id = %self.id,
                leader_id = %req.leader_id,
                req_term = req.term,
                current_term = self.current_term,
                "AppendEntries rejected: request term is older than current term"
            );
            return self.append_response(false);
        }

        if req.term > self.current_term {
            self.step_down(req.term);
        } else if self.role != Role::Follower {
            if self.role == Role::Leader {
                warn!(
                    id = %self.id,
                    leader_id = %req.leader_id,
                    term = req.term,
                    "another leader claims the current term"
                );
            }
            self.role = Role::Follower;
            self.votes_received.clear();
            self.next_index.clear();
            self.match_index.clear();
        }
        self.leader_id = Some(req.leader_id.clone());

        let Some(local_prev_term) = self.log.term_at(req.prev_log_index) else {
            debug!(
                id = %self.id,
                prev_log_index = req.prev_log_index,
                log_len = self.log.len(),
                "AppendEntries rejected: missing entry at prev_log_index"
            );
            return self.append_response(false);
        };

        if local_prev_term != req.prev_log_term {
            if req.prev_log_index <= self.commit_index {
                warn!(
                    id = %self.id,
                    prev_log_index = req.prev_log_index,
                    commit_index = self.commit_index,
                    "AppendEntries rejected: conflict inside the committed prefix"
                );
                return self.append_response(false);
            }
            debug!(
                id = %self.id,
                prev_log_index = req.prev_log_index,
                prev_log_term = req.prev_log_term,
                local_term = local_prev_term,
                "AppendEntries rejected: prev_log_term mismatch, truncating"
            );
            self.log.truncate(req.prev_log_index);
            self.mark_log_changed(req.prev_log_index);
            return self.append_response(false);
        }

        let mut appended = 0usize;
        for (offset, entry) in req.entries.iter().enumerate() {
            let index = req.prev_log_index + 1 + offset as u64;
            match self.log.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(term) => {
                    if index <= self.commit_index {
                        warn!(
                            id = %self.id,
                            index,
                            commit_index = self.commit_index,
                            "AppendEntries rejected: entry conflicts with a committed entry"
                        );
                        return self.append_response(false);
                    }
                    debug!(
                        id = %self.id,
                        index,
                        old_term = term,
                        new_term = entry.term,
                        "truncating conflicting suffix"
                    );
                    self.log.truncate(index);
                }
                None => {}
            }
            self.log.push(entry.clone());
            self.mark_log_changed(index);
            appended += 1;
        }

        if appended > 0 {
            debug!(
                id = %self.id,
                leader_id = %req.leader_id,
                prev_log_index = req.prev_log_index,
                entries_received = req.entries.len(),
                entries_appended = appended,
                log_len = self.log.len(),
                "appended entries from leader"
            );
        }

        if req.leader_commit > self.commit_index {
            // never past what this request proved to match
            let new_commit = req.leader_commit.min(req.last_index());
            if new_commit > self.commit_index {
                debug!(
                    id = %self.id,
                    old_commit = self.commit_index,
                    new_commit,
                    "advancing commit index"
                );
                self.commit_index = new_commit;
            }
        }

        self.append_response(true)
    }

    /// Decide a RequestVote from a candidate
    ///
    /// 1. Reply `false` to an older term.
    /// 2. Adopt a newer term (clearing the vote) before looking at anything else.
    /// 3. Reply `false` if the vote of this term already went to someone else.
    /// 4. Grant only if the candidate's log is at least as up-to-date as ours.
    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> VoteResponse {
        if req.candidate_id.is_empty() {
            warn!(id = %self.id, term = req.term, "RequestVote rejected: empty candidate id");
            return self.vote_response(false);
        }

        if req.term < self.current_term {
            debug!(
                id = %self.id,
                candidate_id = %req.candidate_id,
                req_term = req.term,
                current_term = self.current_term,
                "RequestVote rejected: candidate term is older"
            );
            return self.vote_response(false);
        }

        if req.term > self.current_term {
            self.step_down(req.term);
        }

        if let Some(voted_for) = &self.voted_for {
            if *voted_for != req.candidate_id {
                debug!(
                    id = %self.id,
                    candidate_id = %req.candidate_id,
                    voted_for = %voted_for,
                    "RequestVote rejected: already voted for another candidate"
                );
                return self.vote_response(false);
            }
        }

        let up_to_date = match (self.log.last_term(), self.log.last_index()) {
            (Some(last_term), Some(last_index)) => {
                if req.last_log_term != last_term {
                    req.last_log_term > last_term
                } else {
                    req.last_log_index >= last_index
                }
            }
            _ => true,
        };

        if !up_to_date {
            debug!(
                id = %self.id,
                candidate_id = %req.candidate_id,
                req_last_log_term = req.last_log_term,
                req_last_log_index = req.last_log_index,
                last_log_term = ?self.log.last_term(),
                last_log_index = ?self.log.last_index(),
                "RequestVote rejected: candidate's log is not up-to-date"
            );
            return self.vote_response(false);
        }

        if self.voted_for.is_none() {
            info!(
                id = %self.id,
                candidate_id = %req.candidate_id,
                term = self.current_term,
                "granting vote"
            );
            self.voted_for = Some(req.candidate_id.clone());
            self.pending.hard_state = true;
        }
        self.vote_response(true)
    }
}
