//! The consensus replica: a leader-based replicated log. Each replica runs
//! a driver thread hosting a deterministic node state machine; committed
//! commands are handed to the local state machine over an ordered apply
//! channel.

mod client;
mod log;
mod message;
mod node;
mod persister;
mod server;

pub use self::log::{Entry, Index, Log, Snapshot};
pub use client::Client;
pub use message::{Envelope, Message};
pub use node::{Apply, Node, NodeId, Options, Status, Term, Ticks};
pub use persister::Persister;
pub use server::{Request, Server};

/// The wall-clock duration of one logical tick.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(20);

/// The interval between leader heartbeats, in ticks (60 ms).
pub const HEARTBEAT_INTERVAL: Ticks = 3;

/// The randomized election timeout range, in ticks (200-500 ms). Must be
/// comfortably above the heartbeat interval so followers don't call
/// spurious elections.
pub const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 10..25;
