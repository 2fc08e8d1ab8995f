//! # network
//!
//! why: exercise raft under partitions, crashes, loss, delay and reordering without sockets
//! relations: implements Transport for the cluster tests; delivers into Raft::handle_request
//! what: Network (switchboard), NetworkEnd (one server's outbound endpoint)
//!
//! a server's endpoint works only while both ends are connected and the
//! endpoint is the newest one issued for that server; restarting a server
//! takes a fresh endpoint, which silences anything the old incarnation
//! still has in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, RaftRequest, RaftResponse, RequestVoteArgs, RequestVoteReply,
};
use tokio::time;
use tracing::trace;

use crate::raft::Raft;
use crate::transport::{Transport, TransportError};

/// Shared, cloneable switchboard connecting a set of raft servers
#[derive(Clone, Default)]
pub struct Network {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    unreliable: bool,
    long_delays: bool,
    long_reordering: bool,
    servers: HashMap<u64, Raft>,
    connected: HashMap<u64, bool>,
    generations: HashMap<u64, u64>,
    counts: HashMap<u64, usize>,
    total: usize,
}

impl NetworkState {
    fn link_up(&self, from: u64, generation: u64, to: u64) -> bool {
        self.generations.get(&from) == Some(&generation)
            && self.connected.get(&from).copied().unwrap_or(false)
            && self.connected.get(&to).copied().unwrap_or(false)
    }
}

impl Network {
    /// a reliable network with nothing attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the outbound endpoint for server `from`, retiring any endpoint
    /// issued to it before.
    pub fn end(&self, from: u64) -> NetworkEnd {
        let mut state = self.state.lock();
        let generation = state.generations.entry(from).or_insert(0);
        *generation += 1;
        NetworkEnd {
            net: self.clone(),
            from,
            generation: *generation,
        }
    }

    /// route inbound rpcs for `id` to `raft`
    pub fn add_server(&self, id: u64, raft: Raft) {
        self.state.lock().servers.insert(id, raft);
    }

    pub fn delete_server(&self, id: u64) {
        self.state.lock().servers.remove(&id);
    }

    pub fn connect(&self, id: u64) {
        trace!(node = id, "connected");
        self.state.lock().connected.insert(id, true);
    }

    pub fn disconnect(&self, id: u64) {
        trace!(node = id, "disconnected");
        self.state.lock().connected.insert(id, false);
    }

    /// an unreliable network delays every request a little and loses
    /// roughly one in ten requests and one in ten replies
    pub fn set_reliable(&self, reliable: bool) {
        self.state.lock().unreliable = !reliable;
    }

    /// hold back most replies for a long, random time
    pub fn set_long_reordering(&self, enabled: bool) {
        self.state.lock().long_reordering = enabled;
    }

    /// make calls over dead links take long to fail
    pub fn set_long_delays(&self, enabled: bool) {
        self.state.lock().long_delays = enabled;
    }

    /// rpcs delivered to server `id`
    pub fn rpc_count(&self, id: u64) -> usize {
        self.state.lock().counts.get(&id).copied().unwrap_or(0)
    }

    /// rpcs delivered to any server
    pub fn total_count(&self) -> usize {
        self.state.lock().total
    }

    async fn deliver(&self, from: u64, generation: u64, to: u64, request: RaftRequest) -> Result<RaftResponse, TransportError> {
        let (target, unreliable, long_delays, long_reordering) = {
            let state = self.state.lock();
            let target = if state.link_up(from, generation, to) {
                state.servers.get(&to).cloned()
            } else {
                None
            };
            (target, state.unreliable, state.long_delays, state.long_reordering)
        };

        let Some(target) = target else {
            // no reply ever comes back; the caller gives up eventually
            let max = if long_delays { 700 } else { 100 };
            let ms = rand::thread_rng().gen_range(0..max);
            time::sleep(Duration::from_millis(ms)).await;
            return Err(TransportError::Unreachable(to));
        };

        if unreliable {
            let ms = rand::thread_rng().gen_range(0..27);
            time::sleep(Duration::from_millis(ms)).await;
            if rand::thread_rng().gen_range(0..1000) < 100 {
                trace!(node = from, term = request.term(), to, kind = request.kind(), "request dropped");
                return Err(TransportError::Dropped);
            }
        }

        {
            let mut state = self.state.lock();
            *state.counts.entry(to).or_insert(0) += 1;
            state.total += 1;
        }

        let response = target
            .handle_request(request)
            .map_err(|_| TransportError::Unreachable(to))?;

        // the target may have been partitioned away or replaced while it
        // was handling the request
        let still_there = {
            let state = self.state.lock();
            state.link_up(from, generation, to) && state.servers.get(&to).is_some_and(|s| s.ptr_eq(&target))
        };
        if !still_there {
            return Err(TransportError::Unreachable(to));
        }

        if unreliable && rand::thread_rng().gen_range(0..1000) < 100 {
            trace!(node = from, term = response.term(), to, "reply dropped");
            return Err(TransportError::Dropped);
        }

        if long_reordering && rand::thread_rng().gen_range(0..900) < 600 {
            let ms = 200 + rand::thread_rng().gen_range(0..=2000);
            time::sleep(Duration::from_millis(ms)).await;
        }

        Ok(response)
    }
}

/// One server's endpoint into the [`Network`]
#[derive(Clone)]
pub struct NetworkEnd {
    net: Network,
    from: u64,
    generation: u64,
}

#[async_trait]
impl Transport for NetworkEnd {
    async fn request_vote(&self, target: u64, args: RequestVoteArgs) -> Result<RequestVoteReply, TransportError> {
        match self
            .net
            .deliver(self.from, self.generation, target, RaftRequest::RequestVote(args))
            .await?
        {
            RaftResponse::RequestVote(reply) => Ok(reply),
            RaftResponse::AppendEntries(_) => Err(TransportError::Dropped),
        }
    }

    async fn append_entries(&self, target: u64, args: AppendEntriesArgs) -> Result<AppendEntriesReply, TransportError> {
        match self
            .net
            .deliver(self.from, self.generation, target, RaftRequest::AppendEntries(args))
            .await?
        {
            RaftResponse::AppendEntries(reply) => Ok(reply),
            RaftResponse::RequestVote(_) => Err(TransportError::Dropped),
        }
    }
}
