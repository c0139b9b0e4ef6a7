//! End-to-end tests: a full cluster of replicas and key/value servers wired
//! through a simulated network that can partition nodes, drop packets, and
//! delay delivery, with clients driven through the same lossy transport.

use replikv::kv::{self, Clerk, Endpoint, GetArgs, GetReply, PutAppendArgs, PutAppendReply};
use replikv::lin::{check_operations, KvInput, KvModel, KvOp, KvOutput, Operation};
use replikv::raft::{self, Envelope, NodeId, Options, Persister, Status};

use crossbeam::channel::{Receiver, Sender};
use rand::Rng as _;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// The simulated cluster network. Each node has an inbox; a router thread
/// per node forwards its outbound messages, subject to partitions, random
/// drops, and occasional delayed (reordered) delivery.
struct Network {
    inboxes: Mutex<Vec<Sender<Envelope>>>,
    connected: Vec<AtomicBool>,
    /// Packet drop probability in percent.
    drop_rate: AtomicU32,
}

impl Network {
    fn new(size: u8) -> (Arc<Self>, Vec<Receiver<Envelope>>) {
        let mut inboxes = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..size {
            let (tx, rx) = crossbeam::channel::unbounded();
            inboxes.push(tx);
            receivers.push(rx);
        }
        let net = Arc::new(Self {
            inboxes: Mutex::new(inboxes),
            connected: (0..size).map(|_| AtomicBool::new(true)).collect(),
            drop_rate: AtomicU32::new(0),
        });
        (net, receivers)
    }

    fn is_connected(&self, id: NodeId) -> bool {
        self.connected[id as usize - 1].load(Ordering::Relaxed)
    }

    fn set_connected(&self, id: NodeId, connected: bool) {
        self.connected[id as usize - 1].store(connected, Ordering::Relaxed);
    }

    fn drop_packet(&self) -> bool {
        let rate = self.drop_rate.load(Ordering::Relaxed);
        rate > 0 && rand::thread_rng().gen_range(0..100) < rate
    }

    fn deliver(&self, msg: Envelope) {
        let inbox = self.inboxes.lock().unwrap()[msg.to as usize - 1].clone();
        let _ = inbox.send(msg);
    }

    /// Forwards one node's outbound messages until its replica shuts down.
    fn route(self: Arc<Self>, outbound: Receiver<Envelope>) {
        while let Ok(msg) = outbound.recv() {
            if !self.is_connected(msg.from) || !self.is_connected(msg.to) || self.drop_packet() {
                continue;
            }
            // Under a lossy network, also delay (and thereby reorder) some
            // messages.
            if self.drop_rate.load(Ordering::Relaxed) > 0 && rand::thread_rng().gen_bool(0.2) {
                let net = self.clone();
                let delay = Duration::from_millis(rand::thread_rng().gen_range(1..=15));
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    net.deliver(msg);
                });
            } else {
                self.deliver(msg);
            }
        }
    }
}

/// A key/value endpoint as seen through the lossy network: requests and
/// replies to a disconnected or unlucky server go missing, and the caller
/// sees None. A dropped reply still applies the operation, which is what
/// makes client-side retries interesting.
struct RemoteKv {
    net: Arc<Network>,
    server: NodeId,
    kv: Arc<kv::Server>,
    /// When set, the next put_append reply is dropped after applying.
    drop_next_reply: AtomicBool,
}

impl RemoteKv {
    fn reachable(&self) -> bool {
        if !self.net.is_connected(self.server) || self.net.drop_packet() {
            // Lost request: simulate the transport timing out.
            std::thread::sleep(Duration::from_millis(10));
            return false;
        }
        // A little wire latency keeps retry loops honest.
        std::thread::sleep(Duration::from_millis(1));
        true
    }
}

impl Endpoint for RemoteKv {
    fn get(&self, args: &GetArgs) -> Option<GetReply> {
        if !self.reachable() {
            return None;
        }
        let reply = self.kv.get(args);
        if self.net.drop_packet() {
            return None;
        }
        Some(reply)
    }

    fn put_append(&self, args: &PutAppendArgs) -> Option<PutAppendReply> {
        if !self.reachable() {
            return None;
        }
        let reply = self.kv.put_append(args);
        if self.drop_next_reply.swap(false, Ordering::SeqCst) || self.net.drop_packet() {
            return None;
        }
        Some(reply)
    }
}

struct TestNode {
    raft: raft::Client,
    kv: Arc<kv::Server>,
    persister: Arc<Persister>,
    server_thread: JoinHandle<()>,
}

/// An in-process cluster of replicas.
struct Cluster {
    net: Arc<Network>,
    nodes: Vec<Option<TestNode>>,
    size: u8,
    max_raft_state: Option<usize>,
    start: Instant,
}

impl Cluster {
    fn new(size: u8, max_raft_state: Option<usize>) -> Self {
        let (net, receivers) = Network::new(size);
        let mut cluster = Self {
            net,
            nodes: (0..size).map(|_| None).collect(),
            size,
            max_raft_state,
            start: Instant::now(),
        };
        for (id, peer_rx) in receivers.into_iter().enumerate() {
            let persister = Arc::new(Persister::new());
            cluster.nodes[id] = Some(cluster.start_node(id as NodeId + 1, persister, peer_rx));
        }
        cluster
    }

    fn start_node(&self, id: NodeId, persister: Arc<Persister>, peer_rx: Receiver<Envelope>) -> TestNode {
        let (peer_tx, outbound) = crossbeam::channel::unbounded();
        let router_net = self.net.clone();
        std::thread::spawn(move || router_net.route(outbound));

        let peers: HashSet<NodeId> = (1..=self.size).filter(|p| *p != id).collect();
        let (apply_tx, apply_rx) = crossbeam::channel::bounded(100);
        let (server, client) = raft::Server::new(
            id,
            peers,
            persister.clone(),
            peer_tx,
            peer_rx,
            apply_tx,
            Options::default(),
        )
        .expect("replica startup failed");
        let server_thread = std::thread::spawn(move || server.serve().expect("replica crashed"));
        let kv = kv::Server::new(client.clone(), apply_rx, persister.clone(), self.max_raft_state);
        TestNode { raft: client, kv, persister, server_thread }
    }

    fn node(&self, id: NodeId) -> &TestNode {
        self.nodes[id as usize - 1].as_ref().expect("node is stopped")
    }

    /// Stops a node's replica, keeping its persister.
    fn stop(&mut self, id: NodeId) -> Arc<Persister> {
        self.net.set_connected(id, false);
        let node = self.nodes[id as usize - 1].take().expect("node already stopped");
        node.raft.shutdown().expect("shutdown failed");
        node.server_thread.join().expect("server thread panicked");
        node.persister
    }

    /// Restarts a node from the persisted state of a previous incarnation,
    /// as after a crash.
    fn restart(&mut self, id: NodeId, persister: Arc<Persister>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.net.inboxes.lock().unwrap()[id as usize - 1] = tx;
        self.nodes[id as usize - 1] = Some(self.start_node(id, Arc::new(persister.copy()), rx));
        self.net.set_connected(id, true);
    }

    fn disconnect(&self, id: NodeId) {
        self.net.set_connected(id, false);
    }

    fn reconnect(&self, id: NodeId) {
        self.net.set_connected(id, true);
    }

    fn set_drop_rate(&self, percent: u32) {
        self.net.drop_rate.store(percent, Ordering::Relaxed);
    }

    fn status(&self, id: NodeId) -> Status {
        self.node(id).raft.status().expect("status failed")
    }

    /// Returns the connected leader, if any.
    fn leader(&self) -> Option<NodeId> {
        (1..=self.size)
            .filter(|id| self.nodes[*id as usize - 1].is_some() && self.net.is_connected(*id))
            .find(|id| self.status(*id).leader)
    }

    fn wait_for_leader(&self) -> NodeId {
        wait_until(Duration::from_secs(10), "no leader elected", || self.leader())
    }

    /// Builds a clerk talking to all servers through the lossy network.
    fn clerk(&self) -> Clerk {
        Clerk::new(self.endpoints().into_iter().map(|e| e as Arc<dyn Endpoint>).collect())
    }

    fn endpoints(&self) -> Vec<Arc<RemoteKv>> {
        (1..=self.size)
            .map(|id| {
                Arc::new(RemoteKv {
                    net: self.net.clone(),
                    server: id,
                    kv: self.node(id).kv.clone(),
                    drop_next_reply: AtomicBool::new(false),
                })
            })
            .collect()
    }

    fn now(&self) -> i64 {
        self.start.elapsed().as_nanos() as i64
    }

    fn shutdown(mut self) {
        for id in 1..=self.size {
            if self.nodes[id as usize - 1].is_some() {
                self.stop(id);
            }
        }
    }
}

/// Polls a condition until it yields a value or the timeout expires.
fn wait_until<T>(timeout: Duration, what: &str, mut condition: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = condition() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting: {what}");
        std::thread::sleep(Duration::from_millis(25));
    }
}

/// Waits until every given node's status satisfies the predicate.
fn wait_for_statuses(cluster: &Cluster, ids: &[NodeId], what: &str, predicate: impl Fn(&Status) -> bool) {
    wait_until(Duration::from_secs(10), what, || {
        ids.iter().all(|id| predicate(&cluster.status(*id))).then_some(())
    });
}

#[test]
fn basic_agreement() {
    let cluster = Cluster::new(3, None);
    let mut clerk = cluster.clerk();

    clerk.put("x", "1");
    assert_eq!(clerk.get("x"), Some("1".to_string()));

    // Both operations went through the log: every replica ends up with the
    // same two committed, applied entries in the same term.
    wait_for_statuses(&cluster, &[1, 2, 3], "replicas to converge", |status| {
        status.last_index == 2 && status.commit_index == 2 && status.applied_index == 2
    });
    let terms: HashSet<u64> = (1..=3).map(|id| cluster.status(id).term).collect();
    assert_eq!(terms.len(), 1, "replicas disagree on term");

    cluster.shutdown();
}

#[test]
fn get_missing_key_is_none() {
    let cluster = Cluster::new(3, None);
    let mut clerk = cluster.clerk();
    assert_eq!(clerk.get("nope"), None);
    clerk.put("nope", "");
    assert_eq!(clerk.get("nope"), Some("".to_string()));
    cluster.shutdown();
}

#[test]
fn leader_failover_preserves_data() {
    let cluster = Cluster::new(3, None);
    let mut clerk = cluster.clerk();

    clerk.put("k", "a");
    let old_leader = cluster.wait_for_leader();

    // The surviving majority elects a new leader and keeps serving.
    cluster.disconnect(old_leader);
    assert_eq!(clerk.get("k"), Some("a".to_string()));
    clerk.append("k", "b");
    assert_eq!(clerk.get("k"), Some("ab".to_string()));

    // The old leader rejoins, steps down, and converges.
    cluster.reconnect(old_leader);
    wait_until(Duration::from_secs(10), "old leader to catch up", || {
        let leader = cluster.leader()?;
        let status = cluster.status(old_leader);
        (leader != old_leader
            && !status.leader
            && status.applied_index >= cluster.status(leader).applied_index)
            .then_some(())
    });
    assert_eq!(clerk.get("k"), Some("ab".to_string()));

    cluster.shutdown();
}

#[test]
fn isolated_leader_cannot_commit() {
    let cluster = Cluster::new(3, None);
    let mut clerk = cluster.clerk();
    clerk.put("k", "before");

    let isolated = cluster.wait_for_leader();
    cluster.disconnect(isolated);

    // Fire a write directly at the isolated leader. It accepts the
    // proposal but can't reach a quorum, so the handler times out and
    // bounces the client.
    let started = Instant::now();
    let reply = cluster.node(isolated).kv.put_append(&PutAppendArgs {
        key: "iso".into(),
        value: "lost".into(),
        op: kv::Mutation::Put,
        client_id: 999,
        request_id: 0,
    });
    assert!(reply.wrong_leader, "isolated leader confirmed a write");
    assert!(started.elapsed() >= kv::RESULT_TIMEOUT, "timed out too early");

    // The majority side keeps going in a newer term.
    clerk.put("k", "after");
    assert_eq!(clerk.get("k"), Some("after".to_string()));

    // On rejoin the isolated leader steps down with no data loss, and its
    // unacknowledged write never took effect: its stale-term log tail lost
    // to the majority's newer entries.
    cluster.reconnect(isolated);
    wait_for_statuses(&cluster, &[isolated], "isolated leader to step down", |status| !status.leader);
    assert_eq!(clerk.get("k"), Some("after".to_string()));
    assert_eq!(clerk.get("iso"), None);

    cluster.shutdown();
}

#[test]
fn duplicate_requests_apply_once() {
    let cluster = Cluster::new(3, None);

    // A clerk whose first accepted append loses its reply. The clerk
    // retries the same request id; meanwhile the leader changes, so the
    // retry commits a second copy of the operation under a new leader.
    let endpoints = cluster.endpoints();
    let leader = {
        let mut clerk = cluster.clerk();
        clerk.put("k", "");
        cluster.wait_for_leader()
    };
    let flag = &endpoints[leader as usize - 1].drop_next_reply;
    flag.store(true, Ordering::SeqCst);

    let mut clerk = Clerk::new(endpoints.iter().map(|e| e.clone() as Arc<dyn Endpoint>).collect());
    let appender = std::thread::scope(|scope| {
        let handle = scope.spawn(|| {
            clerk.append("k", "X");
            clerk
        });
        // Once the doomed reply has been consumed, force a leader change so
        // the retry lands on a different leader.
        wait_until(Duration::from_secs(10), "reply was never dropped", || {
            (!flag.load(Ordering::SeqCst)).then_some(())
        });
        cluster.disconnect(leader);
        let clerk = handle.join().expect("appender panicked");
        cluster.reconnect(leader);
        clerk
    });

    // Exactly one X, despite the operation having been committed twice.
    let mut clerk = appender;
    assert_eq!(clerk.get("k"), Some("X".to_string()));

    cluster.shutdown();
}

#[test]
fn lagging_follower_catches_up_via_snapshot() {
    let cluster = Cluster::new(3, Some(1000));
    let mut clerk = cluster.clerk();
    clerk.put("warm", "up");

    let behind = (1..=3).find(|id| !cluster.status(*id).leader).unwrap();
    cluster.disconnect(behind);

    for i in 0..60 {
        clerk.put(&format!("key{i}"), &format!("value{i}"));
    }

    // The growing consensus state forced the others to compact their logs
    // past everything the lagging follower is missing.
    let leader = cluster.wait_for_leader();
    wait_for_statuses(&cluster, &[leader], "leader to compact", |status| status.base_index > 0);

    // The follower can only catch up by installing a snapshot: its first
    // missing entries no longer exist anywhere.
    cluster.reconnect(behind);
    let leader_applied = cluster.status(leader).applied_index;
    wait_for_statuses(&cluster, &[behind], "follower to catch up", |status| {
        status.applied_index >= leader_applied && status.base_index > 0
    });

    // And it serves the latest values.
    cluster.disconnect(leader);
    for i in [0, 30, 59] {
        assert_eq!(clerk.get(&format!("key{i}")), Some(format!("value{i}")));
    }

    cluster.shutdown();
}

#[test]
fn restart_recovers_persisted_state() {
    let mut cluster = Cluster::new(3, Some(500));
    let mut clerk = cluster.clerk();
    for i in 0..20 {
        clerk.put(&format!("key{i}"), &format!("value{i}"));
    }
    drop(clerk);

    // Cold-restart the whole cluster from stable storage, snapshots and
    // all.
    let persisters: Vec<Arc<Persister>> = (1..=3).map(|id| cluster.stop(id)).collect();
    for (id, persister) in (1..=3).zip(persisters) {
        cluster.restart(id, persister);
    }
    cluster.wait_for_leader();

    let mut clerk = cluster.clerk();
    for i in [0, 7, 19] {
        assert_eq!(clerk.get(&format!("key{i}")), Some(format!("value{i}")));
    }

    cluster.shutdown();
}

#[test]
fn unreliable_concurrent_history_linearizes() {
    let cluster = Cluster::new(5, Some(2000));
    cluster.set_drop_rate(10);

    let history = Mutex::new(Vec::<Operation<KvInput, KvOutput>>::new());
    let record = |input: KvInput, call: i64, value: String, ret: i64| {
        history.lock().unwrap().push(Operation { input, call, output: KvOutput { value }, ret });
    };

    std::thread::scope(|scope| {
        for client in 0..5 {
            let mut clerk = cluster.clerk();
            let cluster = &cluster;
            let record = &record;
            scope.spawn(move || {
                let mut rng = rand::thread_rng();
                for i in 0..100 {
                    let key = format!("key{}", rng.gen_range(0..5));
                    let call = cluster.now();
                    match rng.gen_range(0..3) {
                        0 => {
                            let value = format!("{client}.{i};");
                            clerk.put(&key, &value);
                            let input = KvInput { op: KvOp::Put, key, value };
                            record(input, call, String::new(), cluster.now());
                        }
                        1 => {
                            let value = format!("{client}.{i};");
                            clerk.append(&key, &value);
                            let input = KvInput { op: KvOp::Append, key, value };
                            record(input, call, String::new(), cluster.now());
                        }
                        _ => {
                            let value = clerk.get(&key).unwrap_or_default();
                            let input = KvInput { op: KvOp::Get, key, value: String::new() };
                            record(input, call, value, cluster.now());
                        }
                    }
                }
            });
        }
    });

    cluster.set_drop_rate(0);
    let history = history.into_inner().unwrap();
    assert_eq!(history.len(), 500);
    assert!(
        check_operations(&KvModel, history, Some(Duration::from_secs(10))),
        "history is not linearizable"
    );

    cluster.shutdown();
}
