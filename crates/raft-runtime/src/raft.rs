//! # raft
//!
//! why: drive a raft-core state machine with real time, real storage and a network
//! relations: owns a RaftNode plus a Storage behind one lock, talks to peers through a Transport
//! what: Raft handle, election timer, leader replication loop, apply loop
//!
//! every mutation of the node happens under `Inner::core`. the lock is never
//! held across an await: outbound rpcs are built under it, sent without it,
//! and their replies are re-validated under it once they come back.

use std::future::Future;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use raft_core::{
    AppendEntriesArgs, AppendSummary, NodeState, PersistentState, RaftConfig, RaftNode, RaftRequest, RaftResponse,
    RequestVoteArgs,
};
use raft_storage::Storage;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::error::RaftError;
use crate::transport::{Transport, TransportError};

/// A committed command handed to the application, in index order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub index: u64,
    pub command: Vec<u8>,
}

/// Where an accepted proposal landed. Acceptance is not commitment: the
/// entry shows up on the apply channel once a majority holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
}

/// Point-in-time view of a node, for tests and operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    pub id: u64,
    pub term: u64,
    pub state: NodeState,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Handle to one running raft peer.
///
/// Cheap to clone; all clones drive the same node. Background tasks keep
/// running until [`Raft::shutdown`] is called.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    config: RaftConfig,
    transport: Arc<dyn Transport>,
    core: Mutex<Core>,
    /// commit index moved
    apply_ready: Notify,
    /// a proposal is waiting to be replicated
    replicate_now: Notify,
    shutdown_tx: watch::Sender<bool>,
}

struct Core {
    node: RaftNode,
    storage: Box<dyn Storage>,
    election_deadline: Instant,
    killed: bool,
}

impl Raft {
    /// Create a peer and start its background tasks.
    ///
    /// `peers` is the full cluster including `me`. Durable state is read
    /// from `storage` once; a node that never saved starts at term 0 with an
    /// empty log. Must be called from within a tokio runtime.
    pub fn new(
        peers: Vec<u64>,
        me: u64,
        storage: impl Storage + 'static,
        apply_tx: mpsc::Sender<ApplyMsg>,
        transport: Arc<dyn Transport>,
        config: RaftConfig,
    ) -> Result<Raft, RaftError> {
        config.validate()?;
        if !peers.contains(&me) {
            return Err(RaftError::NotAMember(me));
        }

        let persisted = storage.load_state()?;
        check_against_peers(&persisted, &peers)?;

        info!(
            node = me,
            term = persisted.current_term,
            log_len = persisted.log.len(),
            "starting raft node"
        );

        let node = RaftNode::restore(me, peers, config.clone(), persisted);
        let (shutdown_tx, _) = watch::channel(false);
        let election_deadline = Instant::now() + config.random_election_timeout();

        let inner = Arc::new(Inner {
            id: me,
            config,
            transport,
            core: Mutex::new(Core {
                node,
                storage: Box::new(storage),
                election_deadline,
                killed: false,
            }),
            apply_ready: Notify::new(),
            replicate_now: Notify::new(),
            shutdown_tx,
        });

        tokio::spawn(inner.clone().run_election_timer());
        tokio::spawn(inner.clone().run_applier(apply_tx));

        Ok(Raft { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Propose a command. Only the leader accepts; the entry is durable
    /// locally before this returns.
    pub fn start(&self, command: Vec<u8>) -> Result<Proposal, RaftError> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        if core.killed {
            return Err(RaftError::Shutdown);
        }

        let Some(entry) = core.node.append_entry(command) else {
            return Err(RaftError::NotLeader {
                leader_hint: core.node.leader_id,
            });
        };
        inner.persist(&mut core)?;

        debug!(node = inner.id, index = entry.index, term = entry.term, "proposal accepted");
        inner.replicate_now.notify_one();
        // a single-node cluster commits on append
        inner.apply_ready.notify_one();

        Ok(Proposal {
            index: entry.index,
            term: entry.term,
        })
    }

    /// (current term, whether this node believes it is leader)
    pub fn get_state(&self) -> (u64, bool) {
        self.inner.core.lock().node.get_state()
    }

    pub fn status(&self) -> RaftStatus {
        let core = self.inner.core.lock();
        let node = &core.node;
        RaftStatus {
            id: node.id,
            term: node.current_term,
            state: node.state,
            leader_id: node.leader_id,
            commit_index: node.commit_index,
            last_applied: node.last_applied,
            last_log_index: node.last_log_index(),
            last_log_term: node.last_log_term(),
        }
    }

    /// Stop the node. Idempotent. Timers stop, no further rpcs are sent,
    /// inbound rpcs are refused and nothing more is delivered for apply.
    pub fn shutdown(&self) {
        self.inner.halt();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.core.lock().killed
    }

    /// true when both handles drive the same node instance
    pub fn ptr_eq(&self, other: &Raft) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Serve an inbound rpc. Whatever the handler changed in durable state
    /// is saved before the response is returned.
    pub fn handle_request(&self, request: RaftRequest) -> Result<RaftResponse, RaftError> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        if core.killed {
            return Err(RaftError::Shutdown);
        }

        let commit_before = core.node.commit_index;
        let (response, reset_timer) = match request {
            RaftRequest::RequestVote(args) => {
                let (reply, reset) = core.node.handle_vote_request(&args);
                (RaftResponse::RequestVote(reply), reset)
            }
            RaftRequest::AppendEntries(args) => {
                let (reply, reset) = core.node.handle_append_entries(args);
                (RaftResponse::AppendEntries(reply), reset)
            }
        };

        inner.persist(&mut core)?;
        if reset_timer {
            inner.reset_election_timer(&mut core);
        }
        if core.node.commit_index > commit_before {
            inner.apply_ready.notify_one();
        }
        Ok(response)
    }
}

/// a vote for a server outside the cluster can only come from damaged state
fn check_against_peers(state: &PersistentState, peers: &[u64]) -> Result<(), RaftError> {
    match state.voted_for {
        Some(candidate) if !peers.contains(&candidate) => Err(RaftError::CorruptState(format!(
            "voted for {candidate}, which is not in the peer set"
        ))),
        _ => Ok(()),
    }
}

impl Inner {
    fn halt(&self) {
        let term = {
            let mut core = self.core.lock();
            if core.killed {
                return;
            }
            core.killed = true;
            core.node.current_term
        };
        self.shutdown_tx.send_replace(true);
        info!(node = self.id, term, "raft node shut down");
    }

    /// current term, for log events emitted outside the lock
    fn term(&self) -> u64 {
        self.core.lock().node.current_term
    }

    /// Save durable state if the last transition changed it. A node that
    /// cannot persist must not keep voting or acknowledging, so a failed
    /// write stops it.
    fn persist(&self, core: &mut Core) -> Result<(), RaftError> {
        let Some(state) = core.node.take_persist() else {
            return Ok(());
        };
        match core.storage.save_state(&state) {
            Ok(()) => {
                trace!(node = self.id, term = state.current_term, log_len = state.log.len(), "raft state saved");
                Ok(())
            }
            Err(e) => {
                error!(
                    node = self.id,
                    term = state.current_term,
                    error = %e,
                    "failed to persist raft state, shutting down"
                );
                core.killed = true;
                self.shutdown_tx.send_replace(true);
                Err(e.into())
            }
        }
    }

    fn reset_election_timer(&self, core: &mut Core) {
        core.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    /// bounded outbound call; any failure is just a missing reply
    async fn call<T, F>(&self, peer: u64, term: u64, kind: &'static str, rpc: F) -> Option<T>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        match time::timeout(self.config.rpc_deadline(), rpc).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(e)) => {
                trace!(node = self.id, term, peer, rpc = kind, error = %e, "rpc failed");
                None
            }
            Err(_) => {
                trace!(node = self.id, term, peer, rpc = kind, "rpc timed out");
                None
            }
        }
    }

    // -- election --

    async fn run_election_timer(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let deadline = {
                let core = self.core.lock();
                if core.killed {
                    break;
                }
                core.election_deadline
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = time::sleep_until(deadline) => {}
            }

            self.on_election_timeout();
        }
        debug!(node = self.id, term = self.term(), "election timer stopped");
    }

    fn on_election_timeout(self: &Arc<Self>) {
        let (args, peers) = {
            let mut core = self.core.lock();
            // the deadline may have been pushed back while we slept
            if core.killed || Instant::now() < core.election_deadline {
                return;
            }
            self.reset_election_timer(&mut core);
            if core.node.is_leader() {
                return;
            }

            let args = core.node.start_election();
            if self.persist(&mut core).is_err() {
                return;
            }
            if core.node.is_leader() {
                self.spawn_leader(core.node.current_term);
                return;
            }
            (args, core.node.peers().collect::<Vec<_>>())
        };

        tokio::spawn(self.clone().request_votes(args, peers));
    }

    /// fan out RequestVote and tally replies as they arrive
    async fn request_votes(self: Arc<Self>, args: RequestVoteArgs, peers: Vec<u64>) {
        let term = args.term;
        let mut pending: FuturesUnordered<_> = peers
            .into_iter()
            .map(|peer| {
                let args = args.clone();
                let this = &self;
                async move {
                    let reply = this
                        .call(peer, term, "request_vote", this.transport.request_vote(peer, args))
                        .await;
                    (peer, reply)
                }
            })
            .collect();

        while let Some((peer, reply)) = pending.next().await {
            let Some(reply) = reply else { continue };
            let mut core = self.core.lock();
            if core.killed {
                return;
            }
            let elected = core.node.handle_vote_response(peer, term, &reply);
            if self.persist(&mut core).is_err() {
                return;
            }
            if elected {
                self.spawn_leader(term);
                return;
            }
            // stepped down or moved on to a later election
            if core.node.current_term != term || core.node.state != NodeState::Candidate {
                return;
            }
        }
    }

    // -- replication --

    fn spawn_leader(self: &Arc<Self>, term: u64) {
        tokio::spawn(self.clone().run_leader(term));
    }

    /// heartbeat/replication loop for one leadership term; it exits as soon
    /// as the node is no longer leader of `term`
    async fn run_leader(self: Arc<Self>, term: u64) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = time::interval(self.config.heartbeat());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // the first tick completes immediately, announcing the new leader
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                _ = self.replicate_now.notified() => {}
            }
            if !self.broadcast_append_entries(term) {
                break;
            }
        }
        debug!(node = self.id, term, "leader loop stopped");
    }

    fn broadcast_append_entries(self: &Arc<Self>, term: u64) -> bool {
        let requests: Vec<(u64, AppendEntriesArgs)> = {
            let core = self.core.lock();
            let node = &core.node;
            if core.killed || !node.is_leader() || node.current_term != term {
                return false;
            }
            node.peers()
                .filter_map(|peer| node.create_append_entries(peer).map(|args| (peer, args)))
                .collect()
        };

        for (peer, args) in requests {
            tokio::spawn(self.clone().replicate_to(peer, args));
        }
        true
    }

    async fn replicate_to(self: Arc<Self>, peer: u64, args: AppendEntriesArgs) {
        let sent = AppendSummary::of(&args);
        let Some(reply) = self
            .call(peer, sent.term, "append_entries", self.transport.append_entries(peer, args))
            .await
        else {
            return;
        };

        let mut core = self.core.lock();
        if core.killed {
            return;
        }
        let committed = core.node.handle_append_entries_response(peer, sent, &reply);
        if self.persist(&mut core).is_err() {
            return;
        }
        if committed {
            self.apply_ready.notify_one();
        }
    }

    // -- application --

    /// deliver committed entries in index order; last_applied only moves
    /// once the application has taken the entry
    async fn run_applier(self: Arc<Self>, apply_tx: mpsc::Sender<ApplyMsg>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let pending = {
                let core = self.core.lock();
                if core.killed {
                    break;
                }
                core.node.entries_to_apply()
            };

            if pending.is_empty() {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = self.apply_ready.notified() => continue,
                }
            }

            for entry in pending {
                let index = entry.index;
                let msg = ApplyMsg {
                    index,
                    command: entry.command,
                };
                tokio::select! {
                    _ = shutdown.changed() => return,
                    sent = apply_tx.send(msg) => {
                        if sent.is_err() {
                            warn!(node = self.id, term = self.term(), "apply channel closed, stopping delivery");
                            return;
                        }
                    }
                }

                let mut core = self.core.lock();
                if core.killed {
                    return;
                }
                core.node.mark_applied(index);
                trace!(node = self.id, term = core.node.current_term, index, "applied");
            }
        }
        debug!(node = self.id, term = self.term(), "apply loop stopped");
    }
}
