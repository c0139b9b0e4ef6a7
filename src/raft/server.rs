use super::{Apply, Client, Envelope, Index, Log, Node, NodeId, Options, Persister, Snapshot, Status, Term};
use crate::encoding::Value as _;
use crate::error::{Error, Result};

use crossbeam::channel::{Receiver, Sender};
use log::debug;
use std::collections::HashSet;
use std::sync::Arc;

/// A request from the local key/value service to its consensus driver.
pub enum Request {
    /// Proposes a command for replication. Replies with the log index and
    /// term it will commit at, or Error::Abort if this node isn't leader.
    Propose { command: Vec<u8>, reply_tx: Sender<Result<(Index, Term)>> },
    /// Fetches the replica's status.
    Status { reply_tx: Sender<Status> },
    /// Compacts the log through an applied index, storing the given state
    /// machine snapshot. Fire-and-forget: the sender must not wait on the
    /// driver, which may itself be blocked feeding the apply channel.
    CreateSnapshot { index: Index, data: Vec<u8> },
    /// Stops the driver loop.
    Shutdown,
}

/// The consensus driver for one replica. Owns the node and runs its event
/// loop on a dedicated thread: ticks drive timeouts and heartbeats, inbound
/// peer messages are stepped, outbound messages are handed to the transport,
/// and local requests are served between messages. All node access happens
/// on this single thread, so the node itself needs no locks.
pub struct Server {
    node: Node,
    /// Outbound messages from the node.
    node_rx: Receiver<Envelope>,
    /// Inbound messages from the transport.
    peer_rx: Receiver<Envelope>,
    /// Outbound messages to the transport.
    peer_tx: Sender<Envelope>,
    /// Local requests from the key/value service.
    request_rx: Receiver<Request>,
}

impl Server {
    /// Creates a replica server, recovering any persisted state. If a
    /// snapshot was recovered it is re-emitted on the apply channel, before
    /// any entry, so the state machine starts from it.
    pub fn new(
        id: NodeId,
        peers: HashSet<NodeId>,
        persister: Arc<Persister>,
        peer_tx: Sender<Envelope>,
        peer_rx: Receiver<Envelope>,
        apply_tx: Sender<Apply>,
        opts: Options,
    ) -> Result<(Self, Client)> {
        if peers.contains(&id) {
            return Err(Error::InvalidInput(format!("node {id} can't be its own peer")));
        }
        let log = Log::new(persister)?;
        let snapshot = log.snapshot_bytes();
        if !snapshot.is_empty() {
            apply_tx.send(Apply::Snapshot(Snapshot::decode(&snapshot)?))?;
        }

        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let (request_tx, request_rx) = crossbeam::channel::unbounded();
        let node = Node::new(id, peers, log, node_tx, apply_tx, opts)?;
        let server = Self { node, node_rx, peer_rx, peer_tx, request_rx };
        Ok((server, Client::new(request_tx)))
    }

    /// Runs the driver event loop until shut down, or until the transport
    /// or all request handles disappear.
    pub fn serve(self) -> Result<()> {
        let Self { mut node, node_rx, peer_rx, peer_tx, request_rx } = self;
        let ticker = crossbeam::channel::tick(super::TICK_INTERVAL);

        loop {
            crossbeam::select! {
                recv(ticker) -> _ => node = node.tick()?,

                recv(peer_rx) -> msg => match msg {
                    Ok(msg) => node = node.step(msg)?,
                    Err(_) => return Ok(()),
                },

                recv(node_rx) -> msg => {
                    if peer_tx.send(msg?).is_err() {
                        return Ok(());
                    }
                },

                recv(request_rx) -> request => match request {
                    Ok(Request::Propose { command, reply_tx }) => {
                        // The handler may have timed out and gone away, so
                        // delivery failures are fine.
                        let _ = reply_tx.send(node.propose(command));
                    }
                    Ok(Request::Status { reply_tx }) => {
                        let _ = reply_tx.send(node.status());
                    }
                    Ok(Request::CreateSnapshot { index, data }) => {
                        node.create_snapshot(index, data)?;
                    }
                    Ok(Request::Shutdown) | Err(_) => {
                        debug!("Replica {} shutting down", node.id());
                        return Ok(());
                    }
                },
            }
        }
    }
}
