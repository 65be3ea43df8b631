//! Dependency-ordered dispatch onto a bounded thread pool
//!
//! The calling thread acts as coordinator: it decides what to run, owns all
//! bookkeeping and receives completions over a channel. Workers only run the
//! job closure.

use crate::context::CancelToken;
use crate::graph::invert;
use std::any::Any;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;

/// What to do with a node whose dependencies are satisfied
pub(crate) enum Prepared<J> {
    /// Run the job on a worker
    Dispatch(J),
    /// Already handled on the coordinator; `true` if it succeeded
    Done(bool),
}

/// Coordinator-side hooks of a run
pub(crate) trait Coordinator {
    type Job: Send;
    type Output: Send;

    fn prepare(&mut self, node: usize) -> Prepared<Self::Job>;

    /// Record a finished job, `Err` carrying a worker panic message.
    /// Returns whether the node succeeded.
    fn finish(&mut self, node: usize, output: Result<Self::Output, String>) -> bool;
}

#[derive(Debug, Default)]
pub(crate) struct Outcome {
    /// Nodes never started, in index order
    pub skipped: Vec<usize>,
    pub cancelled: bool,
    /// Dispatch stopped early (failure or cancellation)
    pub halted: bool,
}

/// Run every node once its producers succeeded, at most `jobs` at a time
///
/// The first unsuccessful node stops further dispatch; jobs already running
/// are awaited and handed to [`Coordinator::finish`].
pub(crate) fn run<C, F>(
    dependencies: &[Vec<usize>],
    jobs: usize,
    cancel: &CancelToken,
    coordinator: &mut C,
    work: F,
) -> Result<Outcome, rayon::ThreadPoolBuildError>
where
    C: Coordinator,
    F: Fn(C::Job) -> C::Output + Sync,
{
    let n = dependencies.len();
    let jobs = jobs.max(1);
    let dependents = invert(dependencies);
    let mut remaining: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| remaining[i] == 0)
        .map(Reverse)
        .collect();
    let mut started = vec![false; n];
    let mut outcome = Outcome::default();

    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
    let (tx, rx) = mpsc::channel::<(usize, Result<C::Output, String>)>();
    let work = &work;

    pool.in_place_scope(|scope| {
        let mut in_flight = 0usize;
        loop {
            while !outcome.halted && in_flight < jobs {
                let Some(Reverse(node)) = ready.pop() else {
                    break;
                };
                if cancel.is_cancelled() {
                    log::info!("Run cancelled, no further operations will be started");
                    outcome.cancelled = true;
                    outcome.halted = true;
                    break;
                }
                started[node] = true;
                match coordinator.prepare(node) {
                    Prepared::Done(true) => release(node, &dependents, &mut remaining, &mut ready),
                    Prepared::Done(false) => outcome.halted = true,
                    Prepared::Dispatch(job) => {
                        in_flight += 1;
                        let tx = tx.clone();
                        scope.spawn(move |_| {
                            let result = panic::catch_unwind(AssertUnwindSafe(|| work(job)))
                                .map_err(panic_message);
                            let _ = tx.send((node, result));
                        });
                    }
                }
            }

            if in_flight == 0 {
                break;
            }
            let Ok((node, result)) = rx.recv() else {
                break;
            };
            in_flight -= 1;
            if coordinator.finish(node, result) {
                release(node, &dependents, &mut remaining, &mut ready);
            } else {
                outcome.halted = true;
            }
        }
    });

    outcome.skipped = (0..n).filter(|&i| !started[i]).collect();
    Ok(outcome)
}

fn release(
    node: usize,
    dependents: &[Vec<usize>],
    remaining: &mut [usize],
    ready: &mut BinaryHeap<Reverse<usize>>,
) {
    for &consumer in &dependents[node] {
        remaining[consumer] -= 1;
        if remaining[consumer] == 0 {
            ready.push(Reverse(consumer));
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}
