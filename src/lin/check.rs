use super::{Bitset, Event, Model, Operation};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// The nil arena index.
const NIL: usize = usize::MAX;

/// Checks whether a history of completed operations is linearizable under
/// the model: whether some total order of the operations respects both the
/// observed real-time order and the model's sequential behavior. The
/// history is partitioned by the model and each partition is searched on
/// its own worker thread, stopping early on the first violation.
///
/// With a timeout, an undecided check is reported as success once time runs
/// out: an exhaustive search can be factorial, and a false violation is
/// worse than an inconclusive pass. Callers pick timeouts accordingly.
pub fn check_operations<M: Model>(
    model: &M,
    history: Vec<Operation<M::Input, M::Output>>,
    timeout: Option<Duration>,
) -> bool {
    let partitions = model.partition(history).into_iter().map(Partition::from_operations).collect();
    check_partitions(model, partitions, timeout)
}

/// Like check_operations, for an interleaved call/return event stream.
/// Every call must have a matching return; ids are renumbered internally.
pub fn check_events<M: Model>(
    model: &M,
    events: Vec<Event<M::Input, M::Output>>,
    timeout: Option<Duration>,
) -> bool {
    let partitions = model.partition_events(events).into_iter().map(Partition::from_events).collect();
    check_partitions(model, partitions, timeout)
}

/// A partition prepared for checking: per-operation inputs and outputs
/// indexed by dense operation id, and the time-ordered call/return
/// sequence.
struct Partition<I, O> {
    inputs: Vec<I>,
    outputs: Vec<O>,
    /// (is_return, id) in history order.
    sequence: Vec<(bool, usize)>,
}

impl<I, O> Partition<I, O> {
    /// Prepares a partition from completed operations, splitting each into
    /// a call and a return entry ordered by time. On ties, calls sort
    /// before returns: that widens the apparent concurrency window, which
    /// can only make the check more permissive.
    fn from_operations(ops: Vec<Operation<I, O>>) -> Self {
        let mut inputs = Vec::with_capacity(ops.len());
        let mut outputs = Vec::with_capacity(ops.len());
        let mut events = Vec::with_capacity(ops.len() * 2);
        for (id, op) in ops.into_iter().enumerate() {
            events.push((op.call, false, id));
            events.push((op.ret, true, id));
            inputs.push(op.input);
            outputs.push(op.output);
        }
        events.sort_by_key(|&(time, is_return, _)| (time, is_return));
        let sequence = events.into_iter().map(|(_, is_return, id)| (is_return, id)).collect();
        Self { inputs, outputs, sequence }
    }

    /// Prepares a partition from an event stream, renumbering ids to a
    /// dense 0..n space in order of first appearance.
    fn from_events(events: Vec<Event<I, O>>) -> Self {
        let mut ids = HashMap::new();
        let mut inputs = Vec::new();
        let mut outputs: Vec<Option<O>> = Vec::new();
        let mut sequence = Vec::with_capacity(events.len());
        for event in events {
            let next = ids.len();
            let id = *ids.entry(event.id()).or_insert(next);
            match event {
                Event::Call { input, .. } => {
                    assert_eq!(id, inputs.len(), "duplicate call id");
                    inputs.push(input);
                    outputs.push(None);
                    sequence.push((false, id));
                }
                Event::Return { output, .. } => {
                    outputs[id] = Some(output);
                    sequence.push((true, id));
                }
            }
        }
        let outputs = outputs.into_iter().map(|o| o.expect("call without return")).collect();
        Self { inputs, outputs, sequence }
    }
}

/// Checks all partitions in parallel. A kill flag short-circuits the other
/// workers as soon as any partition fails, and stops them after a timeout.
fn check_partitions<M: Model>(
    model: &M,
    partitions: Vec<Partition<M::Input, M::Output>>,
    timeout: Option<Duration>,
) -> bool {
    let kill = AtomicBool::new(false);
    let (result_tx, result_rx) = crossbeam::channel::unbounded();

    std::thread::scope(|scope| {
        for partition in &partitions {
            let result_tx = result_tx.clone();
            let kill = &kill;
            scope.spawn(move || {
                let _ = result_tx.send(check_partition(model, partition, kill));
            });
        }
        drop(result_tx);

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut ok = true;
        for _ in 0..partitions.len() {
            let result = match deadline {
                Some(deadline) => result_rx.recv_deadline(deadline).ok(),
                None => result_rx.recv().ok(),
            };
            match result {
                Some(true) => continue,
                Some(false) => {
                    ok = false;
                    break;
                }
                // Out of time: report inconclusive success.
                None => break,
            }
        }
        // Unblock any still-running workers so the scope can join them.
        kill.store(true, Ordering::Relaxed);
        ok
    })
}

/// An entry in the arena-allocated doubly linked list the search runs over.
/// Links are arena indices rather than pointers; the nodes of one check are
/// short-lived and the indices sidestep ownership cycles.
struct ListEntry {
    /// The operation id.
    id: usize,
    /// For a call, the arena index of its return entry; NIL for returns.
    matches: usize,
    prev: usize,
    next: usize,
}

/// Checks a single partition using Wing & Gong's backtracking search with
/// memoization. Walks the remaining history head-first looking for a call
/// whose operation the model accepts next; tentatively linearizes it by
/// lifting its call and return out of the list; and backtracks when it
/// runs into the return of an operation it hasn't linearized. Each
/// (linearized set, state) pair is visited at most once thanks to the
/// cache.
fn check_partition<M: Model>(
    model: &M,
    partition: &Partition<M::Input, M::Output>,
    kill: &AtomicBool,
) -> bool {
    let Partition { inputs, outputs, sequence } = partition;
    let n = inputs.len();

    // Build the linked list: arena slot 0 is the head sentinel, the
    // entries follow in history order.
    let mut nodes = Vec::with_capacity(sequence.len() + 1);
    nodes.push(ListEntry { id: NIL, matches: NIL, prev: NIL, next: 1 });
    let mut returns = HashMap::with_capacity(n);
    for (at, &(is_return, id)) in sequence.iter().enumerate() {
        let at = at + 1;
        nodes.push(ListEntry { id, matches: NIL, prev: at - 1, next: at + 1 });
        if is_return {
            returns.insert(id, at);
        }
    }
    nodes.last_mut().expect("empty arena").next = NIL;
    for at in 1..nodes.len() {
        if let Some(&ret) = returns.get(&nodes[at].id) {
            if ret != at {
                nodes[at].matches = ret;
            }
        }
    }

    let head = 0;
    let mut linearized = Bitset::new(n);
    let mut cache: HashMap<u64, Vec<(Bitset, M::State)>> = HashMap::new();
    let mut calls: Vec<(usize, M::State)> = Vec::new();
    let mut state = model.init();
    let mut entry = nodes[head].next;

    while nodes[head].next != NIL {
        if kill.load(Ordering::Relaxed) {
            return false;
        }

        if nodes[entry].matches != NIL {
            // A call whose operation we can try to linearize next.
            let id = nodes[entry].id;
            match model.step(&state, &inputs[id], &outputs[id]) {
                Some(new_state) => {
                    let mut new_linearized = linearized.clone();
                    new_linearized.set(id);
                    let seen = cache.get(&new_linearized.hash()).is_some_and(|entries| {
                        entries
                            .iter()
                            .any(|(b, s)| *b == new_linearized && model.equal(s, &new_state))
                    });
                    if !seen {
                        // Commit to this operation: remember it for
                        // backtracking, lift it out of the history, and
                        // restart at the head.
                        cache
                            .entry(new_linearized.hash())
                            .or_default()
                            .push((new_linearized, new_state.clone()));
                        calls.push((entry, state));
                        state = new_state;
                        linearized.set(id);
                        lift(&mut nodes, entry);
                        entry = nodes[head].next;
                    } else {
                        // Already explored this frontier; try the next
                        // candidate.
                        entry = nodes[entry].next;
                    }
                }
                None => entry = nodes[entry].next,
            }
        } else {
            // The return of an operation we haven't linearized: nothing
            // further down may be linearized before it, so backtrack. If
            // there's nothing to undo, the history is not linearizable.
            let Some((top, previous_state)) = calls.pop() else {
                return false;
            };
            state = previous_state;
            linearized.clear(nodes[top].id);
            unlift(&mut nodes, top);
            entry = nodes[top].next;
        }
    }
    true
}

/// Removes a call entry and its return from the list.
fn lift(nodes: &mut [ListEntry], call: usize) {
    let (prev, next) = (nodes[call].prev, nodes[call].next);
    nodes[prev].next = next;
    if next != NIL {
        nodes[next].prev = prev;
    }
    let ret = nodes[call].matches;
    let (prev, next) = (nodes[ret].prev, nodes[ret].next);
    nodes[prev].next = next;
    if next != NIL {
        nodes[next].prev = prev;
    }
}

/// Reinserts a call entry and its return, undoing lift(). Only valid in
/// reverse lift order, so the stashed neighbor links are current.
fn unlift(nodes: &mut [ListEntry], call: usize) {
    let ret = nodes[call].matches;
    let (prev, next) = (nodes[ret].prev, nodes[ret].next);
    nodes[prev].next = ret;
    if next != NIL {
        nodes[next].prev = ret;
    }
    let (prev, next) = (nodes[call].prev, nodes[call].next);
    nodes[prev].next = call;
    if next != NIL {
        nodes[next].prev = call;
    }
}
