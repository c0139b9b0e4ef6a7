use super::{ClientId, Endpoint, ErrCode, GetArgs, Mutation, PutAppendArgs, RequestId};

use log::debug;
use rand::Rng as _;
use std::sync::Arc;

/// A client for the replicated key/value service. Remembers which server
/// answered last (the presumed leader) and cycles through the others on
/// failure, retrying forever: any reply other than a definitive answer from
/// the leader just moves the hint along.
///
/// A clerk issues one request at a time with strictly increasing request
/// ids; the mutable receivers enforce that discipline, which the servers'
/// deduplication depends on. Wrap a clerk per thread rather than sharing
/// one.
pub struct Clerk {
    servers: Vec<Arc<dyn Endpoint>>,
    client_id: ClientId,
    next_request_id: RequestId,
    leader: usize,
}

impl Clerk {
    /// Creates a clerk, picking a random 62-bit client id.
    pub fn new(servers: Vec<Arc<dyn Endpoint>>) -> Self {
        assert!(!servers.is_empty(), "clerk needs at least one server");
        let client_id = rand::thread_rng().gen_range(0..1_u64 << 62);
        Self { servers, client_id, next_request_id: 0, leader: 0 }
    }

    /// Fetches the value of a key, or None if the key doesn't exist.
    pub fn get(&mut self, key: &str) -> Option<String> {
        let args = GetArgs {
            key: key.to_owned(),
            client_id: self.client_id,
            request_id: self.next_request_id,
        };
        self.next_request_id += 1;

        loop {
            if let Some(reply) = self.servers[self.leader].get(&args) {
                if !reply.wrong_leader {
                    debug!("Get({key}) = {:?} via server {}", reply.value, self.leader);
                    return match reply.err {
                        ErrCode::Ok => Some(reply.value),
                        ErrCode::NoKey => None,
                    };
                }
            }
            self.leader = (self.leader + 1) % self.servers.len();
        }
    }

    /// Sets the value of a key.
    pub fn put(&mut self, key: &str, value: &str) {
        self.put_append(key, value, Mutation::Put)
    }

    /// Appends to the value of a key, treating a missing key as empty.
    pub fn append(&mut self, key: &str, value: &str) {
        self.put_append(key, value, Mutation::Append)
    }

    fn put_append(&mut self, key: &str, value: &str, op: Mutation) {
        let args = PutAppendArgs {
            key: key.to_owned(),
            value: value.to_owned(),
            op,
            client_id: self.client_id,
            request_id: self.next_request_id,
        };
        self.next_request_id += 1;

        loop {
            if let Some(reply) = self.servers[self.leader].put_append(&args) {
                if !reply.wrong_leader {
                    debug!("{op:?}({key}, {value}) via server {}", self.leader);
                    return;
                }
            }
            self.leader = (self.leader + 1) % self.servers.len();
        }
    }
}
