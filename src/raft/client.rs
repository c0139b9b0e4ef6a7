use super::{Index, Request, Status, Term};
use crate::error::Result;

use crossbeam::channel::Sender;

/// A cheap, cloneable handle to a local replica's driver thread. Requests
/// travel over the driver's request channel, replies come back on a
/// per-request rendezvous channel.
#[derive(Clone)]
pub struct Client {
    request_tx: Sender<Request>,
}

impl Client {
    pub(super) fn new(request_tx: Sender<Request>) -> Self {
        Self { request_tx }
    }

    /// Proposes a command for replication. Returns the log index and term
    /// the command will commit at if this replica remains leader, or
    /// Error::Abort if it isn't the leader. A returned index is no promise
    /// of a commit: the caller must watch the apply stream.
    pub fn propose(&self, command: Vec<u8>) -> Result<(Index, Term)> {
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        self.request_tx.send(Request::Propose { command, reply_tx })?;
        reply_rx.recv()?
    }

    /// Returns the replica's status.
    pub fn status(&self) -> Result<Status> {
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        self.request_tx.send(Request::Status { reply_tx })?;
        Ok(reply_rx.recv()?)
    }

    /// Asks the replica to compact its log through the given applied index,
    /// storing the given state machine snapshot. Returns without waiting:
    /// the driver may currently be blocked on the apply channel this caller
    /// drains.
    pub fn create_snapshot(&self, index: Index, data: Vec<u8>) -> Result<()> {
        Ok(self.request_tx.send(Request::CreateSnapshot { index, data })?)
    }

    /// Shuts down the replica's driver loop.
    pub fn shutdown(&self) -> Result<()> {
        Ok(self.request_tx.send(Request::Shutdown)?)
    }
}
