/// A completed operation in an observed history: its input and output, and
/// the times the client issued the call and saw it return. Times are on any
/// single monotonic scale (e.g. nanoseconds since the start of a test run);
/// only their order matters.
#[derive(Clone, Debug)]
pub struct Operation<I, O> {
    pub input: I,
    pub call: i64,
    pub output: O,
    pub ret: i64,
}

/// A call or return event in an interleaved history. The id ties a return
/// to its call; ids need not be dense, they are renumbered internally.
#[derive(Clone, Debug)]
pub enum Event<I, O> {
    Call { id: usize, input: I },
    Return { id: usize, output: O },
}

impl<I, O> Event<I, O> {
    pub fn id(&self) -> usize {
        match self {
            Event::Call { id, .. } => *id,
            Event::Return { id, .. } => *id,
        }
    }
}

/// A sequential specification of the system being checked. The checker
/// searches for a total order of operations that is consistent with both
/// this model and the real-time order observed in the history.
pub trait Model: Sync {
    type Input: Clone + Send + Sync;
    type Output: Clone + Send + Sync;
    type State: Clone + PartialEq + Send;

    /// Divides a history into parts that can be linearized independently,
    /// e.g. per key for a key/value store. Each part is checked on its own
    /// worker. Defaults to a single partition.
    fn partition(
        &self,
        history: Vec<Operation<Self::Input, Self::Output>>,
    ) -> Vec<Vec<Operation<Self::Input, Self::Output>>> {
        vec![history]
    }

    /// Like partition, for interleaved event histories.
    fn partition_events(
        &self,
        events: Vec<Event<Self::Input, Self::Output>>,
    ) -> Vec<Vec<Event<Self::Input, Self::Output>>> {
        vec![events]
    }

    /// Returns the initial state.
    fn init(&self) -> Self::State;

    /// Checks an operation against a state: if an operation with this input
    /// could return this output from this state, returns the successor
    /// state, otherwise None. Must not depend on anything but its
    /// arguments.
    fn step(
        &self,
        state: &Self::State,
        input: &Self::Input,
        output: &Self::Output,
    ) -> Option<Self::State>;

    /// State equality, used to prune revisited search states. Defaults to
    /// ==, override if states have irrelevant components.
    fn equal(&self, a: &Self::State, b: &Self::State) -> bool {
        a == b
    }
}
