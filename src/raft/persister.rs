use std::sync::Mutex;

/// Stable storage for a single replica: two byte blobs, one holding the
/// replica's persistent consensus state (term, vote, and log) and one holding
/// the latest state machine snapshot. The blobs must agree on the snapshot
/// point, so updates that change both go through save_state_and_snapshot().
///
/// The persister is shared between the consensus driver (which writes state
/// and snapshots) and the key/value layer (which polls the state size to
/// decide when to compact), so all access is behind a mutex.
pub struct Persister {
    inner: Mutex<Blobs>,
}

#[derive(Clone, Default)]
struct Blobs {
    raft_state: Vec<u8>,
    snapshot: Vec<u8>,
}

impl Persister {
    /// Creates an empty persister.
    pub fn new() -> Self {
        Self { inner: Mutex::new(Blobs::default()) }
    }

    /// Returns a deep copy of the persister, e.g. to restart a replica from
    /// its last persisted state.
    pub fn copy(&self) -> Self {
        let inner = self.inner.lock().expect("lock poisoned").clone();
        Self { inner: Mutex::new(inner) }
    }

    /// Saves the consensus state blob.
    pub fn save_raft_state(&self, state: Vec<u8>) {
        self.inner.lock().expect("lock poisoned").raft_state = state;
    }

    /// Returns the consensus state blob, or an empty vector if none.
    pub fn read_raft_state(&self) -> Vec<u8> {
        self.inner.lock().expect("lock poisoned").raft_state.clone()
    }

    /// Returns the size of the consensus state blob in bytes.
    pub fn raft_state_size(&self) -> usize {
        self.inner.lock().expect("lock poisoned").raft_state.len()
    }

    /// Atomically saves the consensus state and snapshot blobs. This is the
    /// only way to update the snapshot: both blobs encode the snapshot's
    /// last included index, and saving them separately could tear.
    pub fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.raft_state = state;
        inner.snapshot = snapshot;
    }

    /// Returns the snapshot blob, or an empty vector if none.
    pub fn read_snapshot(&self) -> Vec<u8> {
        self.inner.lock().expect("lock poisoned").snapshot.clone()
    }

    /// Returns the size of the snapshot blob in bytes.
    pub fn snapshot_size(&self) -> usize {
        self.inner.lock().expect("lock poisoned").snapshot.len()
    }
}

impl Default for Persister {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_read() {
        let persister = Persister::new();
        assert_eq!(persister.read_raft_state(), Vec::<u8>::new());
        assert_eq!(persister.raft_state_size(), 0);

        persister.save_raft_state(vec![1, 2, 3]);
        assert_eq!(persister.read_raft_state(), vec![1, 2, 3]);
        assert_eq!(persister.raft_state_size(), 3);
        assert_eq!(persister.snapshot_size(), 0);

        persister.save_state_and_snapshot(vec![4, 5], vec![6, 7, 8, 9]);
        assert_eq!(persister.read_raft_state(), vec![4, 5]);
        assert_eq!(persister.read_snapshot(), vec![6, 7, 8, 9]);
        assert_eq!(persister.snapshot_size(), 4);
    }

    #[test]
    fn copy_is_deep() {
        let persister = Persister::new();
        persister.save_state_and_snapshot(vec![1], vec![2]);

        let copy = persister.copy();
        persister.save_state_and_snapshot(vec![3], vec![4]);

        assert_eq!(copy.read_raft_state(), vec![1]);
        assert_eq!(copy.read_snapshot(), vec![2]);
    }
}
