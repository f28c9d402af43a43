use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::time::Instant;

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use super::automaton;

/// The sequential counterpart of a concurrent operation: takes the model state and the
/// operation's argument, returns the next state and the result the operation should produce.
pub type SequentialOp<Seq, Ret> = fn(&Seq, Option<Ret>) -> (Seq, Option<Ret>);

/// One step of a recorded history, seen by logical thread `thread` at `stamp`.
pub(super) struct Event<Seq, Ret> {
    pub stamp: Instant,
    pub thread: usize,
    pub action: Action<Seq, Ret>,
}

pub(super) enum Action<Seq, Ret> {
    Invoke {
        message: String,
        op: SequentialOp<Seq, Ret>,
        arg: Option<Ret>,
    },
    Return {
        result: Option<Ret>,
    },
}

/// Outcome of a linearizability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinearizabilityResult {
    /// Some sequential order of the operations explains every result.
    Success,
    /// No sequential order does, or the history could not be recorded. Holds a description.
    Failure(String),
    /// The search ran out of steps before reaching an answer.
    Timeout,
}

/// Runs a workload against a concurrent object `C` on several threads and checks the recorded
/// history against a sequential model `S`. `Ret` is the type of arguments and results of the
/// logged operations.
pub struct LinearizabilityTester<C, S, Ret> {
    num_threads: usize,
    max_steps: usize,
    concurrent: C,
    sequential: S,
    _marker: PhantomData<fn() -> Ret>,
}

/// Per-thread record of invocations and returns. Workers perform every operation through it.
pub struct ThreadLog<'a, C, S, Ret> {
    id: usize,
    concurrent: &'a C,
    events: Vec<Event<S, Ret>>,
}

impl<C, S, Ret> LinearizabilityTester<C, S, Ret>
where
    C: Sync,
    S: Clone + Hash + Eq,
    Ret: Clone + Eq + Debug + Send,
{
    /// `max_steps` bounds the search; past it [`run`](Self::run) reports a timeout.
    pub fn new(num_threads: usize, max_steps: usize, concurrent: C, sequential: S) -> Self {
        LinearizabilityTester {
            num_threads,
            max_steps,
            concurrent,
            sequential,
            _marker: PhantomData,
        }
    }

    /// Run `worker(id, log)` once on each of `num_threads` threads, then look for a
    /// linearization of everything they logged.
    pub fn run<W>(self, worker: W) -> LinearizabilityResult
    where
        W: Fn(usize, &mut ThreadLog<'_, C, S, Ret>) + Sync,
    {
        let pool = match ThreadPoolBuilder::new().num_threads(self.num_threads).build() {
            Ok(pool) => pool,
            Err(e) => return LinearizabilityResult::Failure(format!("could not start workers: {}", e)),
        };

        let num_threads = self.num_threads;
        let concurrent = &self.concurrent;
        let worker = &worker;
        let logs: Vec<Vec<Event<S, Ret>>> = pool.install(|| {
            (0..num_threads)
                .into_par_iter()
                .map(|id| {
                    let mut log = ThreadLog::new(id, concurrent);
                    worker(id, &mut log);
                    log.events
                })
                .collect()
        });

        let mut events: Vec<Event<S, Ret>> = logs.into_iter().flatten().collect();
        // Stable, so a thread's own invoke and return keep their order on equal stamps
        events.sort_by_key(|event| event.stamp);
        debug!(
            "checking {} events from {} threads for linearizability",
            events.len(),
            num_threads
        );

        automaton::check(events, self.sequential, num_threads, self.max_steps)
    }
}

impl<'a, C, S, Ret> ThreadLog<'a, C, S, Ret> {
    fn new(id: usize, concurrent: &'a C) -> Self {
        ThreadLog {
            id,
            concurrent,
            events: Vec::new(),
        }
    }

    /// Perform `method`, an operation that takes no argument and may return a value.
    /// `seq_method` is its sequential counterpart and is called with `None`.
    pub fn log<F>(&mut self, method: F, message: String, seq_method: SequentialOp<S, Ret>)
    where
        F: FnOnce(&C) -> Option<Ret>,
    {
        self.record(Action::Invoke {
            message,
            op: seq_method,
            arg: None,
        });
        let result = method(self.concurrent);
        self.record(Action::Return { result });
    }

    /// Perform `method`, an operation that takes `val` and returns nothing.
    /// `seq_method` is its sequential counterpart and is called with `Some(val)`.
    pub fn log_val<F>(&mut self, method: F, val: Ret, message: String, seq_method: SequentialOp<S, Ret>)
    where
        F: FnOnce(&C, Ret),
        Ret: Clone,
    {
        self.record(Action::Invoke {
            message,
            op: seq_method,
            arg: Some(val.clone()),
        });
        method(self.concurrent, val);
        self.record(Action::Return { result: None });
    }

    fn record(&mut self, action: Action<S, Ret>) {
        self.events.push(Event {
            stamp: Instant::now(),
            thread: self.id,
            action,
        });
    }
}
