use crate::encoding;

use serde_derive::{Deserialize, Serialize};

/// A client identifier: a random 62-bit integer chosen at Clerk
/// construction, globally unique with overwhelming probability.
pub type ClientId = u64;

/// A per-client request sequence number, strictly increasing from 0.
pub type RequestId = u64;

/// A key/value operation, replicated through the consensus log as an opaque
/// command. The (client_id, request_id) pair identifies a logical client
/// request across retries, turning at-least-once delivery into
/// effectively-once application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub command: Command,
    pub client_id: ClientId,
    pub request_id: RequestId,
}

impl encoding::Value for Op {}

/// A key/value command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Get { key: String },
    Put { key: String, value: String },
    Append { key: String, value: String },
}

/// A mutation kind for PutAppend requests.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Put,
    Append,
}

/// An error code carried in replies.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ErrCode {
    Ok,
    /// The key does not exist. Only returned by Get; the reply value is
    /// empty and callers must consult this code to tell absence from an
    /// empty value.
    NoKey,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub client_id: ClientId,
    pub request_id: RequestId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetReply {
    /// True if this server isn't the leader (or couldn't confirm the
    /// operation in time); the client should try another server.
    pub wrong_leader: bool,
    pub err: ErrCode,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub op: Mutation,
    pub client_id: ClientId,
    pub request_id: RequestId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub wrong_leader: bool,
    pub err: ErrCode,
}

/// The RPC surface of a key/value replica, as seen by a client through an
/// unreliable transport. None means no reply was heard -- the request or
/// reply may have been dropped, or the server may be unreachable -- and the
/// caller must treat the call as retryable. Server implementations answer
/// directly; test transports inject drops, delays, and partitions.
pub trait Endpoint: Send + Sync {
    fn get(&self, args: &GetArgs) -> Option<GetReply>;
    fn put_append(&self, args: &PutAppendArgs) -> Option<PutAppendReply>;
}
