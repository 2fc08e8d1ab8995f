//! # message
//!
//! why: define the raft rpc messages exchanged between nodes
//! relations: produced and consumed by node.rs, carried by raft-runtime transports
//! what: RequestVote and AppendEntries arguments/replies, tagged request/response enums

use serde::{Deserialize, Serialize};

use crate::LogEntry;

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Response to a vote request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// Where a follower's log diverged from the leader's `prev_log_index`.
///
/// `term` is `None` when the follower's log simply ends before
/// `prev_log_index`; `first_index` is then one past its last entry.
/// Otherwise `term` is the follower's term at `prev_log_index` and
/// `first_index` the first index it holds with that term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictHint {
    pub term: Option<u64>,
    pub first_index: u64,
}

/// Response to AppendEntries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub conflict: Option<ConflictHint>,
}

/// Every rpc a node can receive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
}

/// The reply paired with each `RaftRequest` variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftResponse {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
}

impl RaftRequest {
    pub fn term(&self) -> u64 {
        match self {
            RaftRequest::RequestVote(args) => args.term,
            RaftRequest::AppendEntries(args) => args.term,
        }
    }

    /// short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            RaftRequest::RequestVote(_) => "RequestVote",
            RaftRequest::AppendEntries(_) => "AppendEntries",
        }
    }
}

impl RaftResponse {
    pub fn term(&self) -> u64 {
        match self {
            RaftResponse::RequestVote(reply) => reply.term,
            RaftResponse::AppendEntries(reply) => reply.term,
        }
    }
}
