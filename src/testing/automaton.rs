//! Search for a linearization of a recorded history.
//!
//! This is the just-in-time tree search of Wing & Gong as refined by Lowe: walk the history in
//! time order, tentatively linearize any operation whose invocation has been reached, and back
//! track when a return is reached before its operation was linearized. Configurations (the set
//! of linearized operations together with the sequential state) already explored are cached,
//! which keeps the search polynomial for well behaved histories.

use std::cmp;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};

use super::linearizability_tester::{Action, Event, LinearizabilityResult, SequentialOp};

const HEAD: usize = 0;

#[derive(Clone, PartialEq, Eq, Hash)]
struct Linearized {
    bits: Vec<u64>,
}

impl Linearized {
    fn new(size: usize) -> Self {
        Linearized {
            bits: vec![0; (size + 63) / 64],
        }
    }

    fn set(&mut self, op: usize) {
        self.bits[op / 64] |= 1u64 << (op % 64);
    }

    fn clear(&mut self, op: usize) {
        self.bits[op / 64] &= !(1u64 << (op % 64));
    }
}

/// A point in the search: which operations are linearized, and where that left the
/// sequential object.
#[derive(Eq)]
pub struct Configuration<Seq: Hash + Eq> {
    sequential: Seq,
    linearized: Linearized,
}

impl<Seq: Hash + Eq> Configuration<Seq> {
    fn new(sequential: Seq, linearized: Linearized) -> Self {
        Self {
            sequential,
            linearized,
        }
    }
}

impl<Seq: Hash + Eq> Hash for Configuration<Seq> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sequential.hash(state);
        self.linearized.hash(state);
    }
}

impl<Seq: Hash + Eq> PartialEq for Configuration<Seq> {
    fn eq(&self, other: &Self) -> bool {
        self.linearized == other.linearized && self.sequential == other.sequential
    }
}

struct Operation<Seq, Ret> {
    thread: usize,
    message: String,
    op: SequentialOp<Seq, Ret>,
    arg: Option<Ret>,
    result: Option<Ret>,
    call: usize,
    ret: usize,
}

#[derive(Clone, Copy)]
enum Entry {
    Call(usize),
    Return,
}

/// The history as a doubly linked list of call and return entries, so that linearized
/// operations can be lifted out and put back in constant time.
struct History<Seq, Ret> {
    operations: Vec<Operation<Seq, Ret>>,
    // entries[0] is the head sentinel, the last slot the tail sentinel
    entries: Vec<Option<Entry>>,
    prev: Vec<usize>,
    next: Vec<usize>,
}

impl<Seq, Ret> History<Seq, Ret> {
    fn from_events(events: Vec<Event<Seq, Ret>>, num_threads: usize) -> Result<Self, String> {
        let mut operations: Vec<Operation<Seq, Ret>> = Vec::new();
        let mut entries = vec![None];
        let mut pending: Vec<Option<usize>> = vec![None; num_threads];

        for event in events {
            let thread = event.thread;
            match event.action {
                Action::Invoke { message, op, arg } => {
                    let slot = pending
                        .get_mut(thread)
                        .ok_or_else(|| format!("unknown thread {}", thread))?;
                    if slot.is_some() {
                        return Err(format!("thread {} invoked twice without returning", thread));
                    }
                    *slot = Some(operations.len());
                    entries.push(Some(Entry::Call(operations.len())));
                    operations.push(Operation {
                        thread,
                        message,
                        op,
                        arg,
                        result: None,
                        call: entries.len() - 1,
                        ret: 0,
                    });
                }
                Action::Return { result } => {
                    let op = pending
                        .get_mut(thread)
                        .and_then(Option::take)
                        .ok_or_else(|| format!("thread {} returned without an invocation", thread))?;
                    entries.push(Some(Entry::Return));
                    operations[op].result = result;
                    operations[op].ret = entries.len() - 1;
                }
            }
        }

        if let Some(thread) = pending.iter().position(Option::is_some) {
            return Err(format!("thread {} never returned", thread));
        }

        entries.push(None);
        let len = entries.len();
        let prev = (0..len).map(|i| i.saturating_sub(1)).collect();
        let next = (0..len).map(|i| cmp::min(i + 1, len - 1)).collect();
        Ok(History {
            operations,
            entries,
            prev,
            next,
        })
    }

    fn tail(&self) -> usize {
        self.entries.len() - 1
    }

    fn is_empty(&self) -> bool {
        self.next[HEAD] == self.tail()
    }

    fn unlink(&mut self, entry: usize) {
        let (prev, next) = (self.prev[entry], self.next[entry]);
        self.next[prev] = next;
        self.prev[next] = prev;
    }

    fn relink(&mut self, entry: usize) {
        let (prev, next) = (self.prev[entry], self.next[entry]);
        self.next[prev] = entry;
        self.prev[next] = entry;
    }

    fn lift(&mut self, op: usize) {
        let (call, ret) = (self.operations[op].call, self.operations[op].ret);
        self.unlink(call);
        self.unlink(ret);
    }

    // Must undo lifts in reverse order.
    fn unlift(&mut self, op: usize) {
        let (call, ret) = (self.operations[op].call, self.operations[op].ret);
        self.relink(ret);
        self.relink(call);
    }
}

/// Decide whether the time ordered `events` can be explained by some sequential run of the
/// operations on `initial`, giving up after `max_steps` search steps.
pub(super) fn check<Seq, Ret>(
    events: Vec<Event<Seq, Ret>>,
    initial: Seq,
    num_threads: usize,
    max_steps: usize,
) -> LinearizabilityResult
where
    Seq: Clone + Hash + Eq,
    Ret: Clone + Eq + Debug,
{
    let mut history = match History::from_events(events, num_threads) {
        Ok(history) => history,
        Err(reason) => return LinearizabilityResult::Failure(reason),
    };

    let mut linearized = Linearized::new(history.operations.len());
    let mut cache: HashSet<Configuration<Seq>> = HashSet::new();
    let mut calls: Vec<(usize, Seq)> = Vec::new();
    let mut state = initial;
    let mut entry = history.next[HEAD];
    let mut steps = 0;
    let mut deepest = (0, Vec::new());

    while !history.is_empty() {
        steps += 1;
        if steps > max_steps {
            return LinearizabilityResult::Timeout;
        }

        match history.entries[entry] {
            Some(Entry::Call(op)) => {
                let operation = &history.operations[op];
                let (new_state, result) = (operation.op)(&state, operation.arg.clone());
                if result == operation.result {
                    let mut new_linearized = linearized.clone();
                    new_linearized.set(op);
                    if cache.insert(Configuration::new(new_state.clone(), new_linearized.clone())) {
                        calls.push((op, state));
                        state = new_state;
                        linearized = new_linearized;
                        history.lift(op);
                        entry = history.next[HEAD];
                        continue;
                    }
                }
                entry = history.next[entry];
            }
            // Reached a return of an operation not yet linearized, or the end: back track
            _ => {
                if calls.len() >= deepest.0 {
                    deepest = (calls.len(), pending_calls(&history, 3));
                }
                match calls.pop() {
                    None => return LinearizabilityResult::Failure(report(&history, deepest)),
                    Some((op, previous)) => {
                        state = previous;
                        linearized.clear(op);
                        history.unlift(op);
                        entry = history.next[history.operations[op].call];
                    }
                }
            }
        }
    }

    LinearizabilityResult::Success
}

fn pending_calls<Seq, Ret>(history: &History<Seq, Ret>, limit: usize) -> Vec<usize> {
    let mut found = Vec::new();
    let mut entry = history.next[HEAD];
    while entry != history.tail() && found.len() < limit {
        if let Some(Entry::Call(op)) = history.entries[entry] {
            found.push(op);
        }
        entry = history.next[entry];
    }
    found
}

fn report<Seq, Ret: Debug>(history: &History<Seq, Ret>, deepest: (usize, Vec<usize>)) -> String {
    let (depth, stuck) = deepest;
    let stuck: Vec<String> = stuck
        .into_iter()
        .map(|op| {
            let operation = &history.operations[op];
            format!(
                "thread {}: {} -> {:?}",
                operation.thread, operation.message, operation.result
            )
        })
        .collect();
    format!(
        "no linearization found: at most {} of {} operations linearized, stuck before [{}]",
        depth,
        history.operations.len(),
        stuck.join(", ")
    )
}
