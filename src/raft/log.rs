use super::{NodeId, Persister, Term};
use crate::encoding::{self, bincode};
use crate::error::Result;

use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;

/// A log index. Starts at 1; 0 is the initial snapshot sentinel.
pub type Index = u64;

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was proposed.
    pub term: Term,
    /// The state machine command. Opaque to the consensus layer, which
    /// replicates and orders it but never interprets it.
    pub command: Vec<u8>,
}

/// A snapshot of the state machine, replacing the log prefix up to and
/// including last_index. The data is opaque application state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The index of the last log entry the snapshot covers.
    pub last_index: Index,
    /// The term of that entry.
    pub last_term: Term,
    /// The application-supplied state machine snapshot.
    pub data: Vec<u8>,
}

impl encoding::Value for Snapshot {}

/// The replicated command log of a single replica.
///
/// Entries are held in memory as a contiguous vector. The entry at position 0
/// is a sentinel carrying the latest snapshot's last included index and term
/// with an empty command; everything at or below the sentinel index (the base
/// index) has been folded into the snapshot. The log also owns the current
/// term and vote, since they must be persisted together with the entries.
///
/// Invariants:
///
/// * Entry indexes are contiguous from the base index (no gaps).
/// * Entry terms never decrease, and never exceed the current term.
/// * Committed entries are never truncated or replaced.
/// * Entries with the same index and term contain the same command, and
///   identical preceding logs (the Raft log matching property).
///
/// Durability: the (term, vote, entries) triple is written to the persister
/// as a single blob whenever any of them change, before the change becomes
/// visible to any peer via an outbound message. The commit index is volatile;
/// after a restart it is recovered from the snapshot point and the leader.
pub struct Log {
    persister: Arc<Persister>,
    /// All entries above the snapshot point, preceded by the sentinel.
    entries: Vec<Entry>,
    /// The current term.
    term: Term,
    /// Our vote in the current term, if any.
    vote: Option<NodeId>,
    /// The index of the last committed entry.
    commit_index: Index,
}

impl Log {
    /// Initializes a log from the persister, recovering any previously
    /// persisted state and snapshot. Decode failures are fatal.
    pub fn new(persister: Arc<Persister>) -> Result<Self> {
        let (mut term, mut vote, mut entries) = (0, None, Vec::new());
        let state = persister.read_raft_state();
        if !state.is_empty() {
            (term, vote, entries) = bincode::deserialize(&state)?;
        }
        if entries.is_empty() {
            entries.push(Entry { index: 0, term: 0, command: Vec::new() });
        }

        let mut log = Self { persister, entries, term, vote, commit_index: 0 };

        // If there is a snapshot, the log must begin at its last included
        // entry, and everything up to it is committed.
        let snapshot = log.persister.read_snapshot();
        if !snapshot.is_empty() {
            let snapshot = <Snapshot as encoding::Value>::decode(&snapshot)?;
            log.trim(snapshot.last_index, snapshot.last_term);
            log.commit_index = snapshot.last_index;
        } else {
            log.commit_index = log.get_base().0;
        }
        Ok(log)
    }

    /// Returns the base (snapshot sentinel) index and term.
    pub fn get_base(&self) -> (Index, Term) {
        let base = &self.entries[0];
        (base.index, base.term)
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        let last = self.entries.last().expect("log without sentinel");
        (last.index, last.term)
    }

    /// Returns the commit index and term.
    pub fn get_commit_index(&self) -> (Index, Term) {
        let term = self.term_at(self.commit_index).expect("commit index not in log");
        (self.commit_index, term)
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<NodeId>) {
        (self.term, self.vote)
    }

    /// Sets the current term and cast vote (if any), persisting them. The
    /// term can't regress, and the vote can only change with the term.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeId>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote");
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.term = term;
        self.vote = vote;
        self.persist()
    }

    /// Fetches the entry at an index, if the log still contains it. The base
    /// sentinel is not returned, its command is gone.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        let (base, _) = self.get_base();
        if index <= base || index > self.get_last_index().0 {
            return None;
        }
        Some(&self.entries[(index - base) as usize])
    }

    /// Returns the term of the entry at an index, including the base
    /// sentinel, or None if the index is outside the log.
    pub fn term_at(&self, index: Index) -> Option<Term> {
        let (base, _) = self.get_base();
        if index < base || index > self.get_last_index().0 {
            return None;
        }
        Some(self.entries[(index - base) as usize].term)
    }

    /// Clones all entries from the given index (inclusive) upward, for
    /// replication to a peer.
    pub fn entries_from(&self, from: Index) -> Vec<Entry> {
        let (base, _) = self.get_base();
        assert!(from > base, "can't fetch entries at or below the snapshot point");
        if from > self.get_last_index().0 {
            return Vec::new();
        }
        self.entries[(from - base) as usize..].to_vec()
    }

    /// Appends a command to the log at the current term and persists it,
    /// returning the entry's index.
    pub fn append(&mut self, command: Vec<u8>) -> Result<Index> {
        assert!(self.term > 0, "can't append entry in term 0");
        let index = self.get_last_index().0 + 1;
        self.entries.push(Entry { index, term: self.term, command });
        self.persist()?;
        Ok(index)
    }

    /// Splices entries replicated from the leader into the log and persists
    /// the result. The first entry must directly follow an existing one.
    /// Entries already present with a matching term are left alone, so stale
    /// or reordered messages never truncate entries they don't carry; at the
    /// first term conflict the local tail is dropped and replaced.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.get_last_index().0);
        };
        let (base, _) = self.get_base();
        assert!(first.index > base, "spliced entries below snapshot point");
        assert!(first.index <= self.get_last_index().0 + 1, "splice disconnected from log");
        assert!(entries.windows(2).all(|w| w[0].index + 1 == w[1].index), "splice has index gaps");
        assert!(entries.windows(2).all(|w| w[0].term <= w[1].term), "splice has term regression");
        assert!(last.term <= self.term, "splice term {} beyond current {}", last.term, self.term);

        // Skip entries we already have.
        let mut entries = entries.as_slice();
        while let Some(next) = entries.first() {
            match self.term_at(next.index) {
                Some(term) if term == next.term => entries = &entries[1..],
                _ => break,
            }
        }
        let Some(first) = entries.first() else {
            return Ok(self.get_last_index().0);
        };

        // Truncate any conflicting tail and append the rest. Committed
        // entries can never conflict.
        assert!(first.index > self.commit_index, "splice below commit index");
        self.entries.truncate((first.index - base) as usize);
        self.entries.extend(entries.iter().cloned());
        self.persist()?;
        Ok(self.get_last_index().0)
    }

    /// Advances the commit index. The index must be in the log, and can't
    /// regress.
    pub fn commit(&mut self, index: Index) -> Index {
        assert!(index >= self.commit_index, "commit regression {} → {index}", self.commit_index);
        assert!(index <= self.get_last_index().0, "commit index {index} not in log");
        self.commit_index = index;
        index
    }

    /// Computes the next index the leader should retry after a consistency
    /// check failed at prev_index: the first index of the conflicting term,
    /// bounded below by the first index after the snapshot point. This
    /// bounds retries to one per divergent term rather than one per entry.
    pub fn next_try_index(&self, prev_index: Index) -> Index {
        let (base, _) = self.get_base();
        let Some(conflict_term) = self.term_at(prev_index) else {
            return self.get_last_index().0 + 1;
        };
        let mut next_try = base + 1;
        for index in (base + 1..prev_index).rev() {
            if self.term_at(index) != Some(conflict_term) {
                next_try = index + 1;
                break;
            }
        }
        next_try
    }

    /// Compacts the log through the given index in response to the local
    /// state machine taking a snapshot, and atomically persists the state
    /// and snapshot blobs. Ignored if the index has already been compacted
    /// away or is not yet in the log.
    pub fn create_snapshot(&mut self, index: Index, data: Vec<u8>) -> Result<()> {
        let (base, _) = self.get_base();
        if index <= base || index > self.get_last_index().0 {
            return Ok(());
        }
        let term = self.term_at(index).expect("entry vanished");
        self.trim(index, term);
        let snapshot = encoding::Value::encode(&Snapshot { last_index: index, last_term: term, data })?;
        self.persister.save_state_and_snapshot(self.encode_state()?, snapshot);
        Ok(())
    }

    /// Replaces the log prefix with a snapshot received from the leader,
    /// atomically persisting state and snapshot. Everything through
    /// last_index becomes committed. Entries beyond the snapshot point that
    /// match it are retained.
    pub fn install_snapshot(&mut self, last_index: Index, last_term: Term, data: Vec<u8>) -> Result<()> {
        self.trim(last_index, last_term);
        self.commit_index = last_index;
        self.persister.save_state_and_snapshot(self.encode_state()?, data);
        Ok(())
    }

    /// Returns the raw bytes of the current snapshot blob, empty if none.
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        self.persister.read_snapshot()
    }

    /// Returns the size of the persisted state blob in bytes.
    pub fn state_size(&self) -> usize {
        self.persister.raft_state_size()
    }

    /// Drops all entries through the given snapshot point, leaving a new
    /// sentinel. A suffix whose entries follow an exact (index, term) match
    /// of the snapshot point survives, everything else is discarded.
    fn trim(&mut self, last_index: Index, last_term: Term) {
        let mut trimmed = vec![Entry { index: last_index, term: last_term, command: Vec::new() }];
        if let Some(at) =
            self.entries.iter().rposition(|e| e.index == last_index && e.term == last_term)
        {
            trimmed.extend(self.entries.drain(at + 1..));
        }
        self.entries = trimmed;
    }

    /// Persists the current term, vote, and entries as a single blob.
    fn persist(&mut self) -> Result<()> {
        self.persister.save_raft_state(self.encode_state()?);
        Ok(())
    }

    /// Encodes the persistent (term, vote, entries) triple.
    fn encode_state(&self) -> Result<Vec<u8>> {
        bincode::serialize(&(self.term, self.vote, &self.entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(index: Index, term: Term, command: &str) -> Entry {
        Entry { index, term, command: command.as_bytes().to_vec() }
    }

    fn setup(term: Term) -> Log {
        let mut log = Log::new(Arc::new(Persister::new())).unwrap();
        log.set_term(term, None).unwrap();
        log
    }

    #[test]
    fn new_empty() {
        let log = Log::new(Arc::new(Persister::new())).unwrap();
        assert_eq!(log.get_base(), (0, 0));
        assert_eq!(log.get_last_index(), (0, 0));
        assert_eq!(log.get_commit_index(), (0, 0));
        assert_eq!(log.get_term(), (0, None));
        assert_eq!(log.get(0), None);
        assert_eq!(log.term_at(0), Some(0));
    }

    #[test]
    fn append_and_reload() {
        let persister = Arc::new(Persister::new());
        let mut log = Log::new(persister.clone()).unwrap();
        log.set_term(1, Some(1)).unwrap();
        assert_eq!(log.append(b"a".to_vec()).unwrap(), 1);
        assert_eq!(log.append(b"b".to_vec()).unwrap(), 2);
        log.commit(2);

        // A log recovered from the same persister sees the entries and the
        // term/vote pair, but not the volatile commit index.
        let reloaded = Log::new(persister).unwrap();
        assert_eq!(reloaded.get_term(), (1, Some(1)));
        assert_eq!(reloaded.get_last_index(), (2, 1));
        assert_eq!(reloaded.get(1), Some(&entry(1, 1, "a")));
        assert_eq!(reloaded.get(2), Some(&entry(2, 1, "b")));
        assert_eq!(reloaded.get_commit_index().0, 0);
    }

    #[test]
    fn set_term_noop_and_vote() {
        let mut log = setup(1);
        log.set_term(1, Some(2)).unwrap();
        assert_eq!(log.get_term(), (1, Some(2)));
        log.set_term(3, None).unwrap();
        assert_eq!(log.get_term(), (3, None));
    }

    #[test]
    #[should_panic(expected = "term regression")]
    fn set_term_regression_panics() {
        let mut log = setup(3);
        log.set_term(2, None).unwrap();
    }

    #[test]
    fn splice_appends_and_truncates_conflicts() {
        let mut log = setup(2);
        log.splice(vec![entry(1, 1, "a"), entry(2, 1, "b"), entry(3, 1, "c")]).unwrap();
        assert_eq!(log.get_last_index(), (3, 1));

        // Overlapping entries with matching terms are skipped; a conflicting
        // tail is replaced.
        log.splice(vec![entry(2, 1, "b"), entry(3, 2, "x")]).unwrap();
        assert_eq!(log.get_last_index(), (3, 2));
        assert_eq!(log.get(2), Some(&entry(2, 1, "b")));
        assert_eq!(log.get(3), Some(&entry(3, 2, "x")));

        // A stale shorter message must not truncate the matching tail.
        log.splice(vec![entry(1, 1, "a")]).unwrap();
        assert_eq!(log.get_last_index(), (3, 2));
    }

    #[test]
    fn next_try_index_skips_conflicting_term() {
        let mut log = setup(3);
        log.splice(vec![
            entry(1, 1, "a"),
            entry(2, 2, "b"),
            entry(3, 2, "c"),
            entry(4, 2, "d"),
            entry(5, 3, "e"),
        ])
        .unwrap();

        // Conflict at index 4 (term 2): retry from the first index of term 2.
        assert_eq!(log.next_try_index(4), 2);
        // Conflict at index 1 (term 1): bottoms out just above the base.
        assert_eq!(log.next_try_index(1), 1);
        // Probe beyond the log: retry from just past the end.
        assert_eq!(log.next_try_index(9), 6);
    }

    #[test]
    fn snapshot_roundtrip() {
        let persister = Arc::new(Persister::new());
        let mut log = Log::new(persister.clone()).unwrap();
        log.set_term(1, None).unwrap();
        for cmd in ["a", "b", "c", "d"] {
            log.append(cmd.as_bytes().to_vec()).unwrap();
        }
        log.commit(3);
        log.create_snapshot(3, b"machine state".to_vec()).unwrap();

        // The log keeps the suffix beyond the snapshot point.
        assert_eq!(log.get_base(), (3, 1));
        assert_eq!(log.get_last_index(), (4, 1));
        assert_eq!(log.get(3), None);
        assert_eq!(log.get(4), Some(&entry(4, 1, "d")));

        // Reloading recovers the trimmed log and treats the snapshot point
        // as committed.
        let reloaded = Log::new(persister.clone()).unwrap();
        assert_eq!(reloaded.get_base(), (3, 1));
        assert_eq!(reloaded.get_last_index(), (4, 1));
        assert_eq!(reloaded.get_commit_index().0, 3);

        let snapshot = <Snapshot as encoding::Value>::decode(&persister.read_snapshot()).unwrap();
        assert_eq!(snapshot, Snapshot { last_index: 3, last_term: 1, data: b"machine state".to_vec() });
    }

    #[test]
    fn install_snapshot_discards_divergent_log() {
        let mut log = setup(2);
        log.splice(vec![entry(1, 1, "a"), entry(2, 1, "b")]).unwrap();

        let blob = encoding::Value::encode(&Snapshot {
            last_index: 5,
            last_term: 2,
            data: b"state".to_vec(),
        })
        .unwrap();
        log.install_snapshot(5, 2, blob).unwrap();

        assert_eq!(log.get_base(), (5, 2));
        assert_eq!(log.get_last_index(), (5, 2));
        assert_eq!(log.get_commit_index(), (5, 2));
    }

    #[test]
    fn create_snapshot_out_of_range_is_noop() {
        let mut log = setup(1);
        log.splice(vec![entry(1, 1, "a"), entry(2, 1, "b")]).unwrap();
        log.commit(2);
        log.create_snapshot(2, b"s".to_vec()).unwrap();

        // Both below the base and beyond the last index are ignored.
        log.create_snapshot(1, b"stale".to_vec()).unwrap();
        log.create_snapshot(7, b"future".to_vec()).unwrap();
        assert_eq!(log.get_base(), (2, 1));
    }
}
