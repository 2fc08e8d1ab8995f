//! # cluster harness
//!
//! why: drive a whole cluster through crashes, restarts and partitions
//! relations: built on raft_runtime::Network and raft_storage::InMemoryStorage
//! what: Cluster, command encoding, tracing setup shared by the cluster tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use raft_core::RaftConfig;
use raft_runtime::{ApplyMsg, Network, Raft};
use raft_storage::InMemoryStorage;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

/// upper bound on how long a healthy cluster needs to elect a leader
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(1000);

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

pub fn encode(cmd: u64) -> Vec<u8> {
    cmd.to_be_bytes().to_vec()
}

pub fn decode(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

pub fn random_cmd() -> u64 {
    rand::thread_rng().gen_range(0..u32::MAX as u64)
}

struct Servers {
    rafts: Vec<Option<Raft>>,
    saved: Vec<InMemoryStorage>,
    connected: Vec<bool>,
}

#[derive(Default)]
struct Applied {
    /// per server: index -> command it applied there
    logs: Vec<HashMap<u64, u64>>,
    errors: Vec<String>,
}

/// A cluster of `n` raft servers wired through one simulated network
pub struct Cluster {
    pub n: usize,
    pub net: Network,
    config: RaftConfig,
    servers: Mutex<Servers>,
    applied: Arc<Mutex<Applied>>,
}

impl Cluster {
    /// start and connect `n` servers
    pub fn new(n: usize, unreliable: bool) -> Arc<Cluster> {
        Self::with_config(n, unreliable, RaftConfig::default())
    }

    pub fn with_config(n: usize, unreliable: bool, config: RaftConfig) -> Arc<Cluster> {
        init_tracing();

        let net = Network::new();
        net.set_reliable(!unreliable);
        // calls over dead links take a while to fail, as they would on a real network
        net.set_long_delays(true);

        let cluster = Cluster {
            n,
            net,
            config,
            servers: Mutex::new(Servers {
                rafts: vec![None; n],
                saved: (0..n).map(|_| InMemoryStorage::new()).collect(),
                connected: vec![false; n],
            }),
            applied: Arc::new(Mutex::new(Applied {
                logs: vec![HashMap::new(); n],
                errors: Vec::new(),
            })),
        };

        for i in 0..n {
            cluster.start(i);
        }
        for i in 0..n {
            cluster.connect(i);
        }
        Arc::new(cluster)
    }

    fn peers(&self) -> Vec<u64> {
        (0..self.n as u64).collect()
    }

    /// shut server `i` down, keeping what it persisted
    pub fn crash(&self, i: usize) {
        self.disconnect(i);
        self.net.delete_server(i as u64);

        let mut servers = self.servers.lock();
        if let Some(raft) = servers.rafts[i].take() {
            raft.shutdown();
        }
        // the dead incarnation keeps writing into its old handle, if anything
        servers.saved[i] = servers.saved[i].duplicate();
    }

    /// (re)start server `i` from its last persisted state; it stays
    /// disconnected until `connect(i)`
    pub fn start(&self, i: usize) {
        self.crash(i);

        let mut servers = self.servers.lock();
        let storage = servers.saved[i].duplicate();
        servers.saved[i] = storage.clone();

        let (apply_tx, apply_rx) = mpsc::channel(64);
        tokio::spawn(check_applied(i, apply_rx, self.applied.clone()));

        let raft = Raft::new(
            self.peers(),
            i as u64,
            storage,
            apply_tx,
            Arc::new(self.net.end(i as u64)),
            self.config.clone(),
        )
        .expect("raft node starts from saved state");

        servers.rafts[i] = Some(raft.clone());
        drop(servers);
        self.net.add_server(i as u64, raft);
    }

    pub fn connect(&self, i: usize) {
        self.servers.lock().connected[i] = true;
        self.net.connect(i as u64);
    }

    pub fn disconnect(&self, i: usize) {
        self.servers.lock().connected[i] = false;
        self.net.disconnect(i as u64);
    }

    pub fn raft(&self, i: usize) -> Option<Raft> {
        self.servers.lock().rafts[i].clone()
    }

    pub fn is_connected(&self, i: usize) -> bool {
        self.servers.lock().connected[i]
    }

    pub fn is_up(&self, i: usize) -> bool {
        self.servers.lock().rafts[i].is_some()
    }

    /// the persisted bytes of server `i`, as its current incarnation sees them
    pub fn storage(&self, i: usize) -> InMemoryStorage {
        self.servers.lock().saved[i].clone()
    }

    pub fn rpc_total(&self) -> usize {
        (0..self.n as u64).map(|i| self.net.rpc_count(i)).sum()
    }

    fn live_connected(&self) -> Vec<(usize, Raft)> {
        let servers = self.servers.lock();
        (0..self.n)
            .filter(|&i| servers.connected[i])
            .filter_map(|i| servers.rafts[i].clone().map(|r| (i, r)))
            .collect()
    }

    /// wait for exactly one leader among connected servers; more than one
    /// leader in the same term fails the test
    pub async fn check_one_leader(&self) -> usize {
        for _ in 0..10 {
            let ms = rand::thread_rng().gen_range(450..550);
            time::sleep(Duration::from_millis(ms)).await;

            let mut leaders: HashMap<u64, Vec<usize>> = HashMap::new();
            for (i, raft) in self.live_connected() {
                let (term, is_leader) = raft.get_state();
                if is_leader {
                    leaders.entry(term).or_default().push(i);
                }
            }

            for (term, ids) in &leaders {
                assert!(ids.len() <= 1, "term {term} has {} (>1) leaders: {ids:?}", ids.len());
            }
            if let Some(latest) = leaders.keys().max() {
                return leaders[latest][0];
            }
        }
        panic!("expected one leader, got none");
    }

    /// every connected server agrees on the term
    pub fn check_terms(&self) -> u64 {
        let mut term = None;
        for (_, raft) in self.live_connected() {
            let (t, _) = raft.get_state();
            match term {
                None => term = Some(t),
                Some(seen) => assert_eq!(seen, t, "servers disagree on term"),
            }
        }
        term.unwrap_or(0)
    }

    /// no connected server thinks it is leader
    pub fn check_no_leader(&self) {
        for (i, raft) in self.live_connected() {
            let (_, is_leader) = raft.get_state();
            assert!(!is_leader, "expected no leader, but {i} claims to be leader");
        }
    }

    /// how many servers applied `index`, and the command they agree on
    pub fn n_committed(&self, index: u64) -> (usize, Option<u64>) {
        let applied = self.applied.lock();
        if let Some(err) = applied.errors.first() {
            panic!("apply error: {err}");
        }

        let mut count = 0;
        let mut cmd = None;
        for log in &applied.logs {
            if let Some(&value) = log.get(&index) {
                if let Some(seen) = cmd {
                    assert_eq!(seen, value, "committed values do not match at index {index}");
                }
                count += 1;
                cmd = Some(value);
            }
        }
        (count, cmd)
    }

    /// wait for at least `n` servers to apply `index`. `None` when some
    /// server moved past `start_term`, meaning the entry may never commit.
    pub async fn wait(&self, index: u64, n: usize, start_term: Option<u64>) -> Option<u64> {
        let mut pause = Duration::from_millis(10);
        for _ in 0..30 {
            let (count, _) = self.n_committed(index);
            if count >= n {
                break;
            }
            time::sleep(pause).await;
            if pause < Duration::from_secs(1) {
                pause *= 2;
            }
            if let Some(start_term) = start_term {
                let servers = self.servers.lock();
                for raft in servers.rafts.iter().flatten() {
                    if raft.get_state().0 > start_term {
                        return None;
                    }
                }
            }
        }
        let (count, cmd) = self.n_committed(index);
        assert!(count >= n, "only {count} decided for index {index}; wanted {n}");
        cmd
    }

    /// Submit `cmd` through whichever server accepts it and wait until
    /// `expected` servers applied it. Retries across leader changes for up
    /// to ten seconds; returns the index it committed at.
    pub async fn one(&self, cmd: u64, expected: usize) -> u64 {
        let started = Instant::now();
        let mut next = 0;
        while started.elapsed() < Duration::from_secs(10) {
            let mut index = None;
            for _ in 0..self.n {
                next = (next + 1) % self.n;
                let raft = {
                    let servers = self.servers.lock();
                    if servers.connected[next] {
                        servers.rafts[next].clone()
                    } else {
                        None
                    }
                };
                if let Some(Ok(proposal)) = raft.map(|r| r.start(encode(cmd))) {
                    index = Some(proposal.index);
                    break;
                }
            }

            match index {
                Some(index) => {
                    let submitted = Instant::now();
                    while submitted.elapsed() < Duration::from_secs(2) {
                        let (count, value) = self.n_committed(index);
                        if count > 0 && count >= expected && value == Some(cmd) {
                            return index;
                        }
                        time::sleep(Duration::from_millis(20)).await;
                    }
                }
                None => time::sleep(Duration::from_millis(50)).await,
            }
        }
        panic!("one({cmd}) failed to reach agreement");
    }

    pub fn cleanup(&self) {
        let mut servers = self.servers.lock();
        for raft in servers.rafts.iter_mut().filter_map(Option::take) {
            raft.shutdown();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// consume one incarnation's apply channel, recording what it applied
/// and flagging divergence or gaps
async fn check_applied(i: usize, mut apply_rx: mpsc::Receiver<ApplyMsg>, applied: Arc<Mutex<Applied>>) {
    while let Some(msg) = apply_rx.recv().await {
        let mut applied = applied.lock();
        let Some(value) = decode(&msg.command) else {
            applied.errors.push(format!("server {i} applied a malformed command at {}", msg.index));
            continue;
        };

        let conflict = applied.logs.iter().enumerate().find_map(|(j, log)| match log.get(&msg.index) {
            Some(&old) if old != value => Some(format!("commit index={} server={i} {value} != server={j} {old}", msg.index)),
            _ => None,
        });
        if let Some(err) = conflict {
            applied.errors.push(err);
        }

        let prev_ok = msg.index == 1 || applied.logs[i].contains_key(&(msg.index - 1));
        applied.logs[i].insert(msg.index, value);
        if !prev_ok {
            applied.errors.push(format!("server {i} apply out of order {}", msg.index));
        }
    }
}
