//! The replicated key/value layer: a deterministic state machine applied
//! from the consensus log, its request handlers, and the client.

mod client;
mod command;
mod server;

pub use client::Clerk;
pub use command::{
    ClientId, Command, Endpoint, ErrCode, GetArgs, GetReply, Mutation, Op, PutAppendArgs,
    PutAppendReply, RequestId,
};
pub use server::Server;

/// How long a request handler waits for its operation to come back through
/// the apply channel before telling the client to retry. Tuned above a
/// heartbeat round-trip but below the election timeout.
pub const RESULT_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(240);
