use super::{
    ClientId, Command, Endpoint, ErrCode, GetArgs, GetReply, Mutation, Op, PutAppendArgs,
    PutAppendReply, RequestId,
};
use crate::encoding::{bincode, Value as _};
use crate::raft;
use crate::raft::{Apply, Index, Persister};

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The outcome of an applied operation, routed to the handler waiting on
/// the operation's log index.
#[derive(Clone, Debug)]
struct Applied {
    client_id: ClientId,
    request_id: RequestId,
    err: ErrCode,
    value: String,
}

/// The replicated key/value state, plus the rendezvous channels between the
/// apply dispatcher and waiting request handlers. Guarded by a mutex that is
/// never held across a blocking channel operation: the result channels have
/// capacity 1 and are drained before each send.
struct Shared {
    /// The key/value map.
    data: HashMap<String, String>,
    /// The highest applied request id per client, for deduplication.
    /// Monotone: replayed lower ids never regress it.
    ack: HashMap<ClientId, RequestId>,
    /// Result channels keyed by log index, created by whichever side gets
    /// there first.
    results: HashMap<Index, (Sender<Applied>, Receiver<Applied>)>,
}

impl Shared {
    /// Applies an operation to the state, deduplicating mutations by
    /// (client_id, request_id).
    fn apply(&mut self, op: Op) -> Applied {
        let mut result = Applied {
            client_id: op.client_id,
            request_id: op.request_id,
            err: ErrCode::Ok,
            value: String::new(),
        };
        let duplicate = self.ack.get(&op.client_id).is_some_and(|&id| id >= op.request_id);

        match op.command {
            Command::Put { key, value } => {
                if !duplicate {
                    self.data.insert(key, value);
                }
            }
            Command::Append { key, value } => {
                if !duplicate {
                    self.data.entry(key).or_default().push_str(&value);
                }
            }
            Command::Get { key } => match self.data.get(&key) {
                Some(value) => result.value = value.clone(),
                None => result.err = ErrCode::NoKey,
            },
        }

        let ack = self.ack.entry(op.client_id).or_default();
        *ack = std::cmp::max(*ack, op.request_id);
        result
    }
}

/// A replicated key/value server. Handlers propose operations through the
/// local consensus replica and wait for them to come back around through the
/// ordered apply channel, which a dedicated dispatcher thread drains into
/// the state.
pub struct Server {
    raft: raft::Client,
    shared: Arc<Mutex<Shared>>,
}

impl Server {
    /// Creates a key/value server over a consensus replica, spawning the
    /// apply dispatcher thread. The dispatcher exits when the replica shuts
    /// down and closes the apply channel.
    ///
    /// If max_raft_state is given, the server takes a snapshot whenever the
    /// persisted consensus state grows beyond that many bytes, allowing the
    /// replica to compact its log.
    pub fn new(
        raft: raft::Client,
        apply_rx: Receiver<Apply>,
        persister: Arc<Persister>,
        max_raft_state: Option<usize>,
    ) -> Arc<Self> {
        let shared = Arc::new(Mutex::new(Shared {
            data: HashMap::new(),
            ack: HashMap::new(),
            results: HashMap::new(),
        }));
        let server = Arc::new(Self { raft: raft.clone(), shared: shared.clone() });
        std::thread::spawn(move || {
            Self::dispatch(shared, raft, persister, max_raft_state, apply_rx)
        });
        server
    }

    /// Handles a Get request.
    pub fn get(&self, args: &GetArgs) -> GetReply {
        let op = Op {
            command: Command::Get { key: args.key.clone() },
            client_id: args.client_id,
            request_id: args.request_id,
        };
        match self.submit(op) {
            Some(applied) => {
                GetReply { wrong_leader: false, err: applied.err, value: applied.value }
            }
            None => GetReply { wrong_leader: true, err: ErrCode::Ok, value: String::new() },
        }
    }

    /// Handles a Put or Append request.
    pub fn put_append(&self, args: &PutAppendArgs) -> PutAppendReply {
        let (key, value) = (args.key.clone(), args.value.clone());
        let command = match args.op {
            Mutation::Put => Command::Put { key, value },
            Mutation::Append => Command::Append { key, value },
        };
        let op = Op { command, client_id: args.client_id, request_id: args.request_id };
        match self.submit(op) {
            Some(applied) => PutAppendReply { wrong_leader: false, err: applied.err },
            None => PutAppendReply { wrong_leader: true, err: ErrCode::Ok },
        }
    }

    /// Proposes an operation and waits for it to be applied at the log
    /// index the replica assigned it. Returns None if the replica isn't
    /// leader, if the deadline expires before the index applies, or if the
    /// slot was taken by a different operation under a newer leader; in all
    /// cases the client must retry, and deduplication makes retried
    /// mutations harmless.
    fn submit(&self, op: Op) -> Option<Applied> {
        let (index, _term) = self.raft.propose(op.encode().ok()?).ok()?;
        debug!("Submitted {op:?} at index {index}");

        let result_rx = {
            let mut shared = self.shared.lock().expect("lock poisoned");
            let (_, rx) = shared
                .results
                .entry(index)
                .or_insert_with(|| crossbeam::channel::bounded(1));
            rx.clone()
        };

        let result = result_rx.recv_timeout(super::RESULT_TIMEOUT).ok();
        self.shared.lock().expect("lock poisoned").results.remove(&index);

        result.filter(|r| r.client_id == op.client_id && r.request_id == op.request_id)
    }

    /// The apply dispatcher: the single reader of the apply channel. Applies
    /// entries to the state in log order, unblocks waiting handlers, swaps
    /// in snapshots, and triggers log compaction when the persisted
    /// consensus state grows too large.
    fn dispatch(
        shared: Arc<Mutex<Shared>>,
        raft: raft::Client,
        persister: Arc<Persister>,
        max_raft_state: Option<usize>,
        apply_rx: Receiver<Apply>,
    ) {
        while let Ok(apply) = apply_rx.recv() {
            match apply {
                Apply::Entry(entry) => {
                    // Commands were encoded by our own handlers; failing to
                    // decode one means divergent state, so halt.
                    let op = Op::decode(&entry.command).expect("invalid command in log");

                    {
                        let mut shared = shared.lock().expect("lock poisoned");
                        let result = shared.apply(op);
                        let (tx, rx) = shared
                            .results
                            .entry(entry.index)
                            .or_insert_with(|| crossbeam::channel::bounded(1));
                        while rx.try_recv().is_ok() {} // drain a stale result
                        let _ = tx.send(result);
                    }

                    if let Some(max) = max_raft_state {
                        if persister.raft_state_size() > max {
                            Self::take_snapshot(&shared, &raft, entry.index);
                        }
                    }
                }
                Apply::Snapshot(snapshot) => {
                    let (data, ack) =
                        bincode::deserialize(&snapshot.data).expect("invalid snapshot");
                    debug!("Restoring snapshot through index {}", snapshot.last_index);
                    let mut shared = shared.lock().expect("lock poisoned");
                    shared.data = data;
                    shared.ack = ack;
                }
            }
        }
    }

    /// Encodes the state and hands it to the replica for log compaction.
    fn take_snapshot(shared: &Arc<Mutex<Shared>>, raft: &raft::Client, index: Index) {
        let encoded = {
            let shared = shared.lock().expect("lock poisoned");
            bincode::serialize(&(&shared.data, &shared.ack))
        };
        match encoded {
            Ok(data) => {
                if let Err(err) = raft.create_snapshot(index, data) {
                    error!("Snapshot request failed: {err}");
                }
            }
            Err(err) => error!("Snapshot encoding failed: {err}"),
        }
    }
}

impl Endpoint for Server {
    fn get(&self, args: &GetArgs) -> Option<GetReply> {
        Some(Server::get(self, args))
    }

    fn put_append(&self, args: &PutAppendArgs) -> Option<PutAppendReply> {
        Some(Server::put_append(self, args))
    }
}
