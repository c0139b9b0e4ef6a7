use super::{Entry, Index, NodeId, Term};

use serde_derive::{Deserialize, Serialize};

/// A message envelope routed between replicas by the transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: NodeId,
    /// The recipient.
    pub to: NodeId,
    /// The sender's term when the message was sent.
    pub term: Term,
    /// The message payload.
    pub message: Message,
}

/// A message between replicas: the three consensus RPC surfaces and their
/// replies. The sender's term always travels in the envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// A candidate solicits a vote. The envelope sender is the candidate.
    RequestVote {
        /// The index of the candidate's last log entry.
        last_index: Index,
        /// The term of the candidate's last log entry.
        last_term: Term,
    },

    /// A response to RequestVote. A granted vote is binding for the
    /// envelope's term.
    RequestVoteResponse {
        /// Whether the vote was granted.
        granted: bool,
    },

    /// The leader replicates log entries and asserts leadership. Sent with
    /// an empty entry list as the periodic heartbeat.
    AppendEntries {
        /// The index of the entry immediately preceding the ones sent.
        prev_index: Index,
        /// The term of that entry.
        prev_term: Term,
        /// Entries to append, contiguous from prev_index + 1. May be empty.
        entries: Vec<Entry>,
        /// The leader's commit index.
        leader_commit: Index,
    },

    /// A response to AppendEntries.
    AppendEntriesResponse {
        /// Whether the entries were appended (the consistency check at
        /// prev_index passed).
        success: bool,
        /// On success, the index of the last entry now known replicated on
        /// the follower. On failure, the index the leader should retry
        /// from: the first index of the conflicting term, so divergent logs
        /// converge in one probe per term rather than one per entry.
        next_try_index: Index,
    },

    /// The leader sends its current snapshot to a follower whose next
    /// needed entry has been compacted away.
    InstallSnapshot {
        /// The index of the last entry covered by the snapshot.
        last_index: Index,
        /// The term of that entry.
        last_term: Term,
        /// The encoded snapshot blob.
        data: Vec<u8>,
    },

    /// A response to InstallSnapshot, confirming the snapshot point has
    /// been installed. Rejections are carried purely by the envelope term.
    InstallSnapshotResponse {
        /// The snapshot point that was installed.
        last_index: Index,
    },
}
