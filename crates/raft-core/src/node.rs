//! # node
//!
//! why: the raft state machine itself, free of clocks, threads and i/o
//! relations: uses message.rs for rpc types, log.rs for entries, state.rs for persistence;
//!            driven by raft-runtime which owns timers, locking and the network
//! what: NodeState, RaftNode, election, replication and commit rules

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::RaftConfig;
use crate::log::{LogEntry, RaftLog};
use crate::message::{AppendEntriesArgs, AppendEntriesReply, ConflictHint, RequestVoteArgs, RequestVoteReply};
use crate::state::PersistentState;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

/// What the leader remembers about an AppendEntries it sent, so the reply
/// can be checked against the state it was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendSummary {
    pub term: u64,
    pub prev_log_index: u64,
    pub entry_count: u64,
}

impl AppendSummary {
    pub fn of(args: &AppendEntriesArgs) -> Self {
        Self {
            term: args.term,
            prev_log_index: args.prev_log_index,
            entry_count: args.entries.len() as u64,
        }
    }
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: u64,
    /// Every member of the cluster, this node included
    pub cluster_nodes: Vec<u64>,
    pub config: RaftConfig,

    // persistent
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: RaftLog,

    // volatile
    pub state: NodeState,
    pub commit_index: u64,
    pub last_applied: u64,
    /// Leader of the current term, once known
    pub leader_id: Option<u64>,
    /// Votes collected while Candidate, own vote included
    pub votes_received: Vec<u64>,

    // leader only, rebuilt on every election win
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    /// set whenever term, vote or log changed since the last `take_persist`
    persist_pending: bool,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: u64, cluster_nodes: Vec<u64>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: u64, cluster_nodes: Vec<u64>, config: RaftConfig) -> Self {
        Self::restore(id, cluster_nodes, config, PersistentState::default())
    }

    /// Resume from durable state; volatile state always starts fresh
    pub fn restore(id: u64, cluster_nodes: Vec<u64>, config: RaftConfig, persisted: PersistentState) -> Self {
        Self {
            id,
            cluster_nodes,
            config,
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            log: persisted.log,
            state: NodeState::Follower,
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            persist_pending: false,
        }
    }

    // -- membership --

    /// ⌊N/2⌋+1
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    /// every member except this node
    pub fn peers(&self) -> impl Iterator<Item = u64> + '_ {
        self.cluster_nodes.iter().copied().filter(move |&p| p != self.id)
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    /// (current_term, is_leader)
    pub fn get_state(&self) -> (u64, bool) {
        (self.current_term, self.is_leader())
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.get(index)
    }

    /// term at `index`, 0 when there is no such entry
    pub fn get_term_at(&self, index: u64) -> u64 {
        self.log.term_at(index).unwrap_or(0)
    }

    // -- persistence --

    pub fn persistent_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        }
    }

    /// the state to write if anything durable changed, clearing the mark
    pub fn take_persist(&mut self) -> Option<PersistentState> {
        if !self.persist_pending {
            return None;
        }
        self.persist_pending = false;
        Some(self.persistent_state())
    }

    pub fn needs_persist(&self) -> bool {
        self.persist_pending
    }

    // -- role transitions --

    /// Step down, adopting `term` if it is newer.
    ///
    /// The vote is only cleared when the term actually moves, a candidate
    /// that steps down to a same-term leader keeps its vote for itself.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.persist_pending = true;
        }
        if self.state != NodeState::Follower {
            info!(node = self.id, term = self.current_term, "became follower");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Election timer fired: start a new term and ask for votes
    pub fn start_election(&mut self) -> RequestVoteArgs {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id);
        self.votes_received = vec![self.id];
        self.leader_id = None;
        self.next_index.clear();
        self.match_index.clear();
        self.persist_pending = true;

        info!(node = self.id, term = self.current_term, "became candidate");

        if self.has_quorum() {
            self.become_leader();
        }

        RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }

    fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        let peers: Vec<u64> = self.peers().collect();
        self.next_index = peers.iter().map(|&p| (p, next)).collect();
        self.match_index = peers.iter().map(|&p| (p, 0)).collect();

        info!(node = self.id, term = self.current_term, last_index = next - 1, "became leader");
    }

    // -- election --

    /// RequestVote handler, returns the reply and whether the election
    /// timer should be reset (only when the vote was granted)
    pub fn handle_vote_request(&mut self, args: &RequestVoteArgs) -> (RequestVoteReply, bool) {
        if args.term > self.current_term {
            self.become_follower(args.term);
        }

        let vote_free = self.voted_for.is_none() || self.voted_for == Some(args.candidate_id);
        let granted = args.term == self.current_term
            && vote_free
            && self.log.is_up_to_date(args.last_log_index, args.last_log_term);

        if granted && self.voted_for != Some(args.candidate_id) {
            self.voted_for = Some(args.candidate_id);
            self.persist_pending = true;
        }

        debug!(
            node = self.id,
            term = self.current_term,
            candidate = args.candidate_id,
            granted,
            "vote request"
        );

        (
            RequestVoteReply {
                term: self.current_term,
                vote_granted: granted,
            },
            granted,
        )
    }

    /// Tally a vote reply for the election started in `sent_term`.
    /// Returns true exactly when this reply made the node leader.
    pub fn handle_vote_response(&mut self, from: u64, sent_term: u64, reply: &RequestVoteReply) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return false;
        }
        if self.state != NodeState::Candidate || self.current_term != sent_term || reply.term != sent_term {
            return false;
        }
        if reply.vote_granted && !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    // -- replication, leader side --

    /// Start(): append a client command if this node leads
    pub fn append_entry(&mut self, command: Vec<u8>) -> Option<LogEntry> {
        if !self.is_leader() {
            return None;
        }
        let entry = LogEntry::new(self.current_term, self.last_log_index() + 1, command);
        self.log.push(entry.clone());
        self.persist_pending = true;
        // a lone node is its own majority
        self.advance_commit_index();
        Some(entry)
    }

    /// AppendEntries for `peer`, carrying everything from its next_index on
    pub fn create_append_entries(&self, peer: u64) -> Option<AppendEntriesArgs> {
        if !self.is_leader() {
            return None;
        }
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.last_log_index() + 1)
            .clamp(1, self.last_log_index() + 1);
        let prev_log_index = next - 1;
        Some(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries: self.log.entries_from(next),
            leader_commit: self.commit_index,
        })
    }

    /// Process a reply to an AppendEntries described by `sent`.
    /// Returns true if the commit index advanced.
    pub fn handle_append_entries_response(&mut self, from: u64, sent: AppendSummary, reply: &AppendEntriesReply) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return false;
        }
        if !self.is_leader() || self.current_term != sent.term {
            return false;
        }

        let matched = self.match_index.get(&from).copied().unwrap_or(0);
        let next = self.next_index.get(&from).copied().unwrap_or(1);

        if reply.success {
            let replicated = sent.prev_log_index + sent.entry_count;
            // replies can arrive out of order, never move match_index back
            let matched = matched.max(replicated);
            self.match_index.insert(from, matched);
            self.next_index.insert(from, next.max(matched + 1));
            return self.advance_commit_index();
        }

        // only the reply to the request sent at the current next_index may move it
        if sent.prev_log_index + 1 != next {
            return false;
        }
        // skip the whole conflicting term: past our own last entry of it
        // when we hold that term, otherwise to where the follower's run began
        let hinted = reply.conflict.map(|hint| {
            match hint.term.and_then(|term| self.log.last_index_of_term(term)) {
                Some(last) if last + 1 < next => last + 1,
                _ => hint.first_index,
            }
        });
        let backed_off = match hinted {
            Some(index) if index < next => index,
            _ => next.saturating_sub(1),
        };
        let backed_off = backed_off.max(matched + 1).max(1);
        debug!(node = self.id, term = self.current_term, peer = from, from_index = next, to_index = backed_off, "next_index backoff");
        self.next_index.insert(from, backed_off);
        false
    }

    /// Commit rule: the highest N replicated on a majority whose entry is
    /// from the current term. Older entries commit only underneath such an N.
    pub fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let mut n = self.last_log_index();
        while n > self.commit_index {
            let term = self.get_term_at(n);
            if term < self.current_term {
                break;
            }
            if term == self.current_term {
                let replicas = 1 + self.match_index.values().filter(|&&m| m >= n).count();
                if replicas >= self.quorum_size() {
                    debug!(node = self.id, term = self.current_term, from = self.commit_index, to = n, "commit advanced");
                    self.commit_index = n;
                    return true;
                }
            }
            n -= 1;
        }
        false
    }

    // -- replication, follower side --

    /// AppendEntries handler, returns the reply and whether the election
    /// timer should be reset (any message from the current leader)
    pub fn handle_append_entries(&mut self, args: AppendEntriesArgs) -> (AppendEntriesReply, bool) {
        if args.term < self.current_term {
            return (
                AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                    conflict: None,
                },
                false,
            );
        }

        if args.term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(args.term);
        }
        self.leader_id = Some(args.leader_id);

        if !self.log.matches(args.prev_log_index, args.prev_log_term) {
            let conflict = match self.log.term_at(args.prev_log_index) {
                None => ConflictHint {
                    term: None,
                    first_index: self.last_log_index() + 1,
                },
                Some(term) => ConflictHint {
                    term: Some(term),
                    first_index: self.log.first_index_of_term(term, args.prev_log_index),
                },
            };
            return (
                AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                    conflict: Some(conflict),
                },
                true,
            );
        }

        let last_new = args.prev_log_index + args.entries.len() as u64;
        for (offset, entry) in args.entries.into_iter().enumerate() {
            let index = args.prev_log_index + 1 + offset as u64;
            match self.log.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if index <= self.commit_index {
                        error!(
                            node = self.id,
                            term = self.current_term,
                            index,
                            commit = self.commit_index,
                            "leader asked to overwrite a committed entry"
                        );
                        // no hint: nothing the leader could retry from is valid
                        return (
                            AppendEntriesReply {
                                term: self.current_term,
                                success: false,
                                conflict: None,
                            },
                            true,
                        );
                    }
                    debug!(node = self.id, term = self.current_term, from = index, "truncating conflicting suffix");
                    self.log.truncate_from(index);
                    self.log.push(entry);
                    self.persist_pending = true;
                }
                None => {
                    self.log.push(entry);
                    self.persist_pending = true;
                }
            }
        }

        if args.leader_commit > self.commit_index {
            let commit = args.leader_commit.min(last_new).min(self.last_log_index());
            if commit > self.commit_index {
                self.commit_index = commit;
            }
        }

        (
            AppendEntriesReply {
                term: self.current_term,
                success: true,
                conflict: None,
            },
            true,
        )
    }

    // -- application --

    /// committed entries not yet handed to the application, in order
    pub fn entries_to_apply(&self) -> Vec<LogEntry> {
        self.log.slice(self.last_applied + 1, self.commit_index)
    }

    /// record that `index` was accepted by the application
    pub fn mark_applied(&mut self, index: u64) {
        if index == self.last_applied + 1 && index <= self.commit_index {
            self.last_applied = index;
        }
    }
}
