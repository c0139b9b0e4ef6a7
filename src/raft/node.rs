use super::{Entry, Envelope, Index, Log, Message, Snapshot};
use crate::encoding::Value as _;
use crate::error::{Error, Result};

use itertools::Itertools as _;
use log::{debug, info};
use rand::Rng as _;
use std::collections::{HashMap, HashSet};

/// A node ID.
pub type NodeId = u8;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u8;

/// Replica timing options. Ticks are counted by the driver loop; see
/// raft::TICK_INTERVAL for the wall-clock length of one tick.
#[derive(Clone)]
pub struct Options {
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The range of randomized election timeouts.
    pub election_timeout_range: std::ops::Range<Ticks>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: super::HEARTBEAT_INTERVAL,
            election_timeout_range: super::ELECTION_TIMEOUT_RANGE,
        }
    }
}

/// A message to the state machine on the apply channel. Entries are emitted
/// in strictly increasing index order, never reordered or dropped; a
/// snapshot replaces all state and jumps the index to its snapshot point.
#[derive(Clone, Debug, PartialEq)]
pub enum Apply {
    /// A committed log entry.
    Entry(Entry),
    /// A snapshot installed from the leader or recovered at startup.
    Snapshot(Snapshot),
}

/// A point-in-time view of a replica's consensus state, for introspection.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub id: NodeId,
    pub term: Term,
    pub leader: bool,
    pub base_index: Index,
    pub last_index: Index,
    pub commit_index: Index,
    pub applied_index: Index,
    pub state_size: usize,
}

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node, and return a new one with a
/// possibly different role. Outbound messages are sent via the node_tx
/// channel, and committed commands are handed to the state machine in log
/// order via the apply_tx channel.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new node, starting as a leaderless follower, or leader if
    /// there are no peers.
    pub fn new(
        id: NodeId,
        peers: HashSet<NodeId>,
        log: Log,
        node_tx: crossbeam::channel::Sender<Envelope>,
        apply_tx: crossbeam::channel::Sender<Apply>,
        opts: Options,
    ) -> Result<Self> {
        let node = RawNode::new(id, peers, log, node_tx, apply_tx, opts)?;
        if node.peers.is_empty() {
            // If there are no peers, become leader immediately.
            return Ok(node.into_candidate()?.into_leader()?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeId {
        match self {
            Node::Candidate(n) => n.id,
            Node::Follower(n) => n.id,
            Node::Leader(n) => n.id,
        }
    }

    /// Returns the node's current term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term(),
            Node::Follower(n) => n.term(),
            Node::Leader(n) => n.term(),
        }
    }

    /// Processes a message from a peer.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }

    /// Proposes a command for replication, returning the log index and term
    /// it will commit at if this node remains leader. Fails with
    /// Error::Abort on non-leaders; the caller should retry elsewhere.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<(Index, Term)> {
        match self {
            Node::Leader(n) => n.propose(command),
            _ => Err(Error::Abort),
        }
    }

    /// Compacts the log through the given applied index, storing the given
    /// state machine snapshot. Works in any role.
    pub fn create_snapshot(&mut self, index: Index, data: Vec<u8>) -> Result<()> {
        match self {
            Node::Candidate(n) => n.create_snapshot(index, data),
            Node::Follower(n) => n.create_snapshot(index, data),
            Node::Leader(n) => n.create_snapshot(index, data),
        }
    }

    /// Returns the node's status.
    pub fn status(&self) -> Status {
        match self {
            Node::Candidate(n) => n.status(false),
            Node::Follower(n) => n.status(false),
            Node::Leader(n) => n.status(true),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role {}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>.
pub struct RawNode<R: Role = Follower> {
    id: NodeId,
    peers: HashSet<NodeId>,
    log: Log,
    node_tx: crossbeam::channel::Sender<Envelope>,
    apply_tx: crossbeam::channel::Sender<Apply>,
    /// The index of the last entry emitted on the apply channel.
    applied_index: Index,
    opts: Options,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            log: self.log,
            node_tx: self.node_tx,
            apply_tx: self.apply_tx,
            applied_index: self.applied_index,
            opts: self.opts,
            role,
        }
    }

    /// Returns the node's current term.
    fn term(&self) -> Term {
        self.log.get_term().0
    }

    /// Returns the cluster size as number of nodes.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns the cluster quorum size (strict majority).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector, in descending
    /// order. The vector must have the same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "vector size must match cluster size");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends a message to a peer.
    fn send(&self, to: NodeId, message: Message) -> Result<()> {
        let msg = Envelope { from: self.id, to, term: self.term(), message };
        debug!("Sending {msg:?}");
        Ok(self.node_tx.send(msg)?)
    }

    /// Broadcasts a message to all peers. Sorted for test determinism.
    fn broadcast(&self, message: Message) -> Result<()> {
        for id in self.peers.iter().copied().sorted() {
            self.send(id, message.clone())?;
        }
        Ok(())
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.election_timeout_range.clone())
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        assert_eq!(msg.to, self.id, "message to other node");
        assert!(
            msg.from == self.id || self.peers.contains(&msg.from),
            "unknown sender {}",
            msg.from
        );
    }

    /// Replies to a request from a past term, so the stale sender observes
    /// our newer term (in the response envelope) and steps down. Stale
    /// responses are simply dropped.
    fn reply_stale(&self, msg: Envelope) -> Result<()> {
        match msg.message {
            Message::RequestVote { .. } => {
                self.send(msg.from, Message::RequestVoteResponse { granted: false })
            }
            Message::AppendEntries { .. } => {
                let next_try_index = self.log.get_last_index().0 + 1;
                self.send(msg.from, Message::AppendEntriesResponse { success: false, next_try_index })
            }
            Message::InstallSnapshot { last_index, .. } => {
                self.send(msg.from, Message::InstallSnapshotResponse { last_index })
            }
            _ => {
                debug!("Dropping stale response {msg:?}");
                Ok(())
            }
        }
    }

    /// Emits any committed but unapplied entries on the apply channel, in
    /// index order.
    fn maybe_apply(&mut self) -> Result<()> {
        let (commit_index, _) = self.log.get_commit_index();
        while self.applied_index < commit_index {
            let index = self.applied_index + 1;
            let entry = self.log.get(index).expect("missing committed entry").clone();
            debug!("Applying {entry:?}");
            self.apply_tx.send(Apply::Entry(entry))?;
            self.applied_index = index;
        }
        Ok(())
    }

    /// Compacts the log through the given index, which must already be
    /// applied, and persists the state machine snapshot with it.
    fn create_snapshot(&mut self, index: Index, data: Vec<u8>) -> Result<()> {
        assert!(index <= self.applied_index, "can't snapshot unapplied index {index}");
        self.log.create_snapshot(index, data)
    }

    /// Builds a status summary.
    fn status(&self, leader: bool) -> Status {
        Status {
            id: self.id,
            term: self.term(),
            leader,
            base_index: self.log.get_base().0,
            last_index: self.log.get_last_index().0,
            commit_index: self.log.get_commit_index().0,
            applied_index: self.applied_index,
            state_size: self.log.state_size(),
        }
    }
}

/// A candidate is campaigning to become a leader.
pub struct Candidate {
    /// Votes received, including our own.
    votes: HashSet<NodeId>,
    /// Ticks elapsed since election start.
    election_duration: Ticks,
    /// Election timeout, in ticks.
    election_timeout: Ticks,
}

impl Candidate {
    fn new(election_timeout: Ticks) -> Self {
        Self { votes: HashSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Asserts internal invariants.
    fn assert(&mut self) {
        assert_ne!(self.term(), 0, "candidates can't have term 0");
        assert!(self.role.votes.contains(&self.id), "candidate did not vote for self");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");
    }

    /// Transitions the candidate to a follower. Either we lost the election
    /// and follow the winner, or we discovered a new term and step into it
    /// as a leaderless follower.
    fn into_follower(mut self, term: Term, leader: Option<NodeId>) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        let election_timeout = self.gen_election_timeout();
        if let Some(leader) = leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
            Ok(self.into_role(Follower::new(Some(leader), election_timeout)))
        } else {
            // We found a new term, but don't know the leader yet. We'll
            // learn it from its first message.
            assert_ne!(term, self.term(), "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            Ok(self.into_role(Follower::new(None, election_timeout)))
        }
    }

    /// Transitions the candidate to a leader. We won the election.
    fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term());
        let peers = self.peers.clone();
        let (last_index, _) = self.log.get_last_index();
        let mut node = self.into_role(Leader::new(peers, last_index));
        // Assert leadership immediately, before the first heartbeat tick.
        node.heartbeat()?;
        Ok(node)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        if msg.term < self.term() {
            self.reply_stale(msg)?;
            return Ok(self.into());
        }
        if msg.term > self.term() {
            let node = self.into_follower(msg.term, None)?;
            return match msg.message {
                // Step requests in the new term; responses (e.g. a rejection
                // from a higher-term node) carry nothing further.
                Message::RequestVote { .. }
                | Message::AppendEntries { .. }
                | Message::InstallSnapshot { .. } => node.step(msg),
                _ => Ok(node.into()),
            };
        }

        match msg.message {
            // Don't grant votes to other candidates in our term, we voted
            // for ourself.
            Message::RequestVote { .. } => {
                self.send(msg.from, Message::RequestVoteResponse { granted: false })?;
            }

            // Record granted votes, and assume leadership on quorum.
            Message::RequestVoteResponse { granted: true } => {
                self.role.votes.insert(msg.from);
                if self.role.votes.len() >= self.quorum_size() {
                    return Ok(self.into_leader()?.into());
                }
            }

            // We didn't get the vote.
            Message::RequestVoteResponse { granted: false } => {}

            // Someone else won the election in this term. Follow it and
            // step the message so the log consistency check runs.
            Message::AppendEntries { .. } | Message::InstallSnapshot { .. } => {
                return self.into_follower(msg.term, Some(msg.from))?.step(msg);
            }

            // Replication responses can only follow replication sends, which
            // only leaders in this term can have made.
            Message::AppendEntriesResponse { .. } | Message::InstallSnapshotResponse { .. } => {
                panic!("received unexpected message {msg:?}")
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert();
        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            self.campaign()?;
        }
        Ok(self.into())
    }

    /// Campaigns for leadership in a new term: bump the term, vote for
    /// ourself, persist, and solicit votes from all peers.
    fn campaign(&mut self) -> Result<()> {
        let term = self.term() + 1;
        info!("Starting new election for term {term}");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.votes.insert(self.id); // vote for ourself
        self.log.set_term(term, Some(self.id))?;

        let (last_index, last_term) = self.log.get_last_index();
        self.broadcast(Message::RequestVote { last_index, last_term })?;
        Ok(())
    }
}

/// A follower replicates entries from a leader.
pub struct Follower {
    /// The leader, or None if just initialized or in a new term.
    leader: Option<NodeId>,
    /// The number of ticks since the last message from the leader, or since
    /// we last granted a vote.
    leader_seen: Ticks,
    /// The leader_seen timeout before triggering an election.
    election_timeout: Ticks,
}

impl Follower {
    fn new(leader: Option<NodeId>, election_timeout: Ticks) -> Self {
        Self { leader, leader_seen: 0, election_timeout }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower.
    fn new(
        id: NodeId,
        peers: HashSet<NodeId>,
        log: Log,
        node_tx: crossbeam::channel::Sender<Envelope>,
        apply_tx: crossbeam::channel::Sender<Apply>,
        opts: Options,
    ) -> Result<Self> {
        let applied_index = log.get_base().0;
        let role = Follower::new(None, 0);
        let mut node = Self { id, peers, log, node_tx, apply_tx, applied_index, opts, role };
        node.role.election_timeout = node.gen_election_timeout();
        Ok(node)
    }

    /// Asserts internal invariants.
    fn assert(&mut self) {
        if let Some(leader) = self.role.leader {
            assert_ne!(leader, self.id, "can't follow self");
            assert!(self.peers.contains(&leader), "leader not in peers");
            assert_ne!(self.term(), 0, "followers with leaders can't have term 0");
        }
    }

    /// Transitions the follower into a candidate, campaigning for
    /// leadership in a new term.
    fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        // Apply any pending entries, so we're caught up if we win.
        self.maybe_apply()?;

        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout));
        node.campaign()?;
        Ok(node)
    }

    /// Transitions the follower into a follower, either a leaderless
    /// follower in a new term or following a discovered leader in the
    /// current term.
    fn into_follower(mut self, leader: Option<NodeId>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        if let Some(leader) = leader {
            // We found a leader in the current term.
            assert_eq!(self.role.leader, None, "already have leader in term");
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Following leader {leader} in term {term}");
            self.role = Follower::new(Some(leader), self.role.election_timeout);
        } else {
            // We found a new term, but don't know its leader yet.
            assert_ne!(term, self.term(), "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            self.role = Follower::new(None, self.gen_election_timeout());
        }
        Ok(self)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        if msg.term < self.term() {
            self.reply_stale(msg)?;
            return Ok(self.into());
        }
        if msg.term > self.term() {
            let node = self.into_follower(None, msg.term)?;
            return match msg.message {
                Message::RequestVote { .. }
                | Message::AppendEntries { .. }
                | Message::InstallSnapshot { .. } => node.step(msg),
                _ => Ok(node.into()),
            };
        }

        match msg.message {
            // The leader replicates entries, or asserts leadership with an
            // empty batch. Run the log consistency check at prev_index,
            // splice on success, and advance the commit index.
            Message::AppendEntries { prev_index, prev_term, entries, leader_commit } => {
                match self.role.leader {
                    Some(leader) => assert_eq!(msg.from, leader, "multiple leaders in term"),
                    None => self = self.into_follower(Some(msg.from), msg.term)?,
                }
                self.role.leader_seen = 0;

                let (base_index, _) = self.log.get_base();
                let (last_index, _) = self.log.get_last_index();
                let (success, next_try_index) = if prev_index > last_index {
                    // We're missing entries before prev_index; back up to
                    // the end of our log.
                    (false, last_index + 1)
                } else if prev_index + 1 < base_index {
                    // Everything through the base is already committed via
                    // a snapshot; resume from the first entry after it.
                    (false, base_index + 1)
                } else if prev_index >= base_index && self.log.term_at(prev_index) != Some(prev_term)
                {
                    // The entry at prev_index conflicts; skip the whole
                    // conflicting term.
                    (false, self.log.next_try_index(prev_index))
                } else {
                    // The consistency check passed: prev_index is in the
                    // log, or sits just below the snapshot sentinel, which
                    // stands in for it (everything there is committed).
                    // Entries the snapshot already covers carry nothing new.
                    let match_index = entries.last().map(|e| e.index).unwrap_or(prev_index);
                    let entries = entries.into_iter().filter(|e| e.index > base_index).collect();
                    self.log.splice(entries)?;
                    (true, match_index)
                };

                if success && leader_commit > self.log.get_commit_index().0 {
                    let (last_index, _) = self.log.get_last_index();
                    self.log.commit(std::cmp::min(leader_commit, last_index));
                    self.maybe_apply()?;
                }

                self.send(msg.from, Message::AppendEntriesResponse { success, next_try_index })?;
            }

            // A candidate is requesting our vote. Grant it if we haven't
            // voted for someone else and its log is at least as up-to-date
            // as ours.
            Message::RequestVote { last_index, last_term } => {
                if let (_, Some(vote)) = self.log.get_term() {
                    if msg.from != vote {
                        self.send(msg.from, Message::RequestVoteResponse { granted: false })?;
                        return Ok(self.into());
                    }
                }

                let (our_index, our_term) = self.log.get_last_index();
                if last_term < our_term || (last_term == our_term && last_index < our_index) {
                    self.send(msg.from, Message::RequestVoteResponse { granted: false })?;
                    return Ok(self.into());
                }

                info!("Voting for {} in term {} election", msg.from, msg.term);
                self.log.set_term(msg.term, Some(msg.from))?;
                self.role.leader_seen = 0;
                self.send(msg.from, Message::RequestVoteResponse { granted: true })?;
            }

            // The leader is sending its snapshot, because the entries we
            // need have been compacted away. Install it if it's ahead of
            // our commit index, and hand it to the state machine.
            Message::InstallSnapshot { last_index, last_term, data } => {
                match self.role.leader {
                    Some(leader) => assert_eq!(msg.from, leader, "multiple leaders in term"),
                    None => self = self.into_follower(Some(msg.from), msg.term)?,
                }
                self.role.leader_seen = 0;

                if last_index > self.log.get_commit_index().0 {
                    let snapshot = Snapshot::decode(&data)?;
                    assert_eq!((snapshot.last_index, snapshot.last_term), (last_index, last_term));
                    self.log.install_snapshot(last_index, last_term, data)?;
                    self.applied_index = last_index;
                    info!("Installed snapshot through index {last_index}");
                    self.apply_tx.send(Apply::Snapshot(snapshot))?;
                }

                self.send(msg.from, Message::InstallSnapshotResponse { last_index })?;
            }

            // We may receive late vote responses after losing an election
            // and following a leader in the same term. Ignore them.
            Message::RequestVoteResponse { .. } => {}

            // Replication responses in this term can only stem from a
            // previous incarnation of this node that led the term before a
            // restart. They carry nothing for us.
            Message::AppendEntriesResponse { .. } | Message::InstallSnapshotResponse { .. } => {
                debug!("Ignoring response to a previous incarnation ({msg:?})");
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert();
        self.role.leader_seen += 1;
        if self.role.leader_seen >= self.role.election_timeout {
            return Ok(self.into_candidate()?.into());
        }
        Ok(self.into())
    }
}

/// Follower replication progress, tracked by the leader.
struct Progress {
    /// The next log index to replicate to the follower.
    next_index: Index,
    /// The last log index known to be replicated on the follower.
    match_index: Index,
}

impl Progress {
    /// Attempts to advance the follower's match index, returning true if it
    /// did. next_index is pulled along, but never regressed.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }

    /// Regresses the next index to the given index, if it's currently
    /// greater. Can't regress below match_index + 1. Returns true if
    /// next_index changed.
    fn regress_next(&mut self, next_index: Index) -> bool {
        if next_index >= self.next_index || self.next_index <= self.match_index + 1 {
            return false;
        }
        self.next_index = std::cmp::max(next_index, self.match_index + 1);
        true
    }
}

/// A leader serves requests and replicates the log to followers.
pub struct Leader {
    /// Follower replication progress.
    progress: HashMap<NodeId, Progress>,
    /// Number of ticks since the last periodic heartbeat.
    since_heartbeat: Ticks,
}

impl Leader {
    fn new(peers: HashSet<NodeId>, last_index: Index) -> Self {
        let next_index = last_index + 1;
        let progress = peers
            .into_iter()
            .map(|p| (p, Progress { next_index, match_index: 0 }))
            .collect();
        Self { progress, since_heartbeat: 0 }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Asserts internal invariants.
    fn assert(&mut self) {
        assert_ne!(self.term(), 0, "leaders can't have term 0");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");
    }

    /// Transitions the leader into a follower. This can only happen if we
    /// discover a new term, so we become a leaderless follower.
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term(), "can only become follower in later term");
        info!("Discovered new term {term}, stepping down");
        self.log.set_term(term, None)?;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, election_timeout)))
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        if msg.term < self.term() {
            self.reply_stale(msg)?;
            return Ok(self.into());
        }
        if msg.term > self.term() {
            let node = self.into_follower(msg.term)?;
            return match msg.message {
                Message::RequestVote { .. }
                | Message::AppendEntries { .. }
                | Message::InstallSnapshot { .. } => node.step(msg),
                _ => Ok(node.into()),
            };
        }

        match msg.message {
            // There can't be two leaders in the same term.
            Message::AppendEntries { .. } | Message::InstallSnapshot { .. } => {
                panic!("saw other leader {} in term {}", msg.from, msg.term);
            }

            // A follower appended our entries (or confirmed a heartbeat).
            // Record its progress, try to commit, and keep catching it up.
            Message::AppendEntriesResponse { success: true, next_try_index } => {
                let (last_index, _) = self.log.get_last_index();
                assert!(next_try_index <= last_index, "follower matched unknown index");

                if self.progress(msg.from).advance(next_try_index) {
                    self.maybe_commit_and_apply()?;
                }
                if self.progress(msg.from).match_index < last_index {
                    self.send_append(msg.from)?;
                }
            }

            // The consistency check failed on the follower. Back up its
            // next index to the follower's hint and retry immediately.
            Message::AppendEntriesResponse { success: false, next_try_index } => {
                let (last_index, _) = self.log.get_last_index();
                let next = std::cmp::min(next_try_index, last_index);
                if self.progress(msg.from).regress_next(next) {
                    self.send_append(msg.from)?;
                }
            }

            // The follower installed our snapshot; resume replication from
            // the entry after it.
            Message::InstallSnapshotResponse { last_index } => {
                if self.progress(msg.from).advance(last_index) {
                    self.maybe_commit_and_apply()?;
                }
                if self.progress(msg.from).match_index < self.log.get_last_index().0 {
                    self.send_append(msg.from)?;
                }
            }

            // Don't grant votes to candidates in our term.
            Message::RequestVote { .. } => {
                self.send(msg.from, Message::RequestVoteResponse { granted: false })?;
            }

            // Votes may come in after we won the election. Ignore them.
            Message::RequestVoteResponse { .. } => {}
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert();
        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.heartbeat()?;
            self.role.since_heartbeat = 0;
        }
        Ok(self.into())
    }

    /// Sends a replication message to every peer: pending entries (or an
    /// empty batch as a pure heartbeat), or the current snapshot if the
    /// peer's next entry has been compacted away.
    fn heartbeat(&mut self) -> Result<()> {
        for peer in self.peers.iter().copied().sorted() {
            self.send_append(peer)?;
        }
        Ok(())
    }

    /// Returns a mutable borrow of a peer's progress.
    fn progress(&mut self, id: NodeId) -> &mut Progress {
        self.role.progress.get_mut(&id).expect("unknown node")
    }

    /// Proposes a command by appending it to the log and eagerly
    /// replicating it to all peers. It commits once a quorum confirms it.
    fn propose(&mut self, command: Vec<u8>) -> Result<(Index, Term)> {
        let index = self.log.append(command)?;
        for peer in self.peers.iter().copied().sorted() {
            self.send_append(peer)?;
        }
        if self.peers.is_empty() {
            self.maybe_commit_and_apply()?;
        }
        Ok((index, self.term()))
    }

    /// Sends pending entries to a peer from its next index, or the current
    /// snapshot if that index has been compacted away.
    fn send_append(&mut self, peer: NodeId) -> Result<()> {
        let (base_index, _) = self.log.get_base();
        let progress = self.role.progress.get_mut(&peer).expect("unknown node");
        assert_ne!(progress.next_index, 0, "invalid next_index 0");
        assert!(progress.next_index > progress.match_index, "next_index below match_index");

        if progress.next_index <= base_index {
            let (last_index, last_term) = self.log.get_base();
            let data = self.log.snapshot_bytes();
            debug!("Replicating snapshot through {last_index} to {peer}");
            return self.send(peer, Message::InstallSnapshot { last_index, last_term, data });
        }

        let prev_index = progress.next_index - 1;
        let prev_term = self.log.term_at(prev_index).expect("missing prev entry");
        let entries = self.log.entries_from(progress.next_index);
        let (leader_commit, _) = self.log.get_commit_index();
        debug!("Replicating {} entries with prev {prev_index} to {peer}", entries.len());
        self.send(peer, Message::AppendEntries { prev_index, prev_term, entries, leader_commit })
    }

    /// Commits any entries replicated to a quorum, and applies them. Only
    /// entries from our own term count towards a commit; earlier entries
    /// commit implicitly with the first commit of our term.
    fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        let (last_index, _) = self.log.get_last_index();
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index)
                .chain(std::iter::once(last_index))
                .collect(),
        );

        // The quorum value may regress transiently (e.g. new leaders start
        // peers at match index 0), so don't assert on it.
        let (commit_index, _) = self.log.get_commit_index();
        if quorum_index <= commit_index {
            return Ok(commit_index);
        }
        if self.log.term_at(quorum_index) != Some(self.term()) {
            return Ok(commit_index);
        }

        self.log.commit(quorum_index);
        self.maybe_apply()?;
        Ok(quorum_index)
    }
}
