//! Replica worker pool with gradient all-reduce
//!
//! Every worker thread owns a full model replica. Frozen weights are shared
//! through `Arc` buffers; adapter gradients are averaged once per optimizer
//! step by an [`AllReduce`] group. Any worker may vote to stop, and a worker
//! that fails aborts the group so that its peers return at their next
//! reduction instead of waiting forever.

use crate::{Error, Result};
use ndarray::Array1;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

/// Outcome of one reduction
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reduced {
    /// Mean gradient per parameter
    pub grads: Vec<Array1<f32>>,
    /// Mean loss
    pub loss: f32,
    /// Whether any replica voted to stop or the group was aborted
    pub stop: bool,
}

impl Reduced {
    fn stopped() -> Self {
        Self {
            stop: true,
            ..Self::default()
        }
    }
}

/// Collective operations seen by one replica
pub trait Collective {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Average `grads` and `loss` across replicas and OR the stop votes
    ///
    /// Blocks until every replica has contributed.
    fn all_reduce(&self, grads: Vec<Array1<f32>>, loss: f32, stop: bool) -> Reduced;

    /// Release every pending and future reduction with `stop = true`
    fn abort(&self);

    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }
}

/// A world of one
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce(&self, grads: Vec<Array1<f32>>, loss: f32, stop: bool) -> Reduced {
        Reduced { grads, loss, stop }
    }

    fn abort(&self) {}
}

#[derive(Default)]
struct Round {
    generation: u64,
    arrived: usize,
    grad_sum: Vec<Array1<f32>>,
    loss_sum: f32,
    stop: bool,
    result: Reduced,
    aborted: bool,
}

/// Mean all-reduce over a fixed number of threads
pub struct AllReduce {
    world_size: usize,
    round: Mutex<Round>,
    done: Condvar,
}

impl AllReduce {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            round: Mutex::new(Round::default()),
            done: Condvar::new(),
        }
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    fn lock(&self) -> MutexGuard<'_, Round> {
        self.round.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Contribute to the current round and wait for its result
    pub fn reduce(&self, grads: Vec<Array1<f32>>, loss: f32, stop: bool) -> Reduced {
        let mut round = self.lock();
        if round.aborted {
            return Reduced::stopped();
        }

        if round.grad_sum.is_empty() {
            round.grad_sum = grads;
        } else {
            for (sum, grad) in round.grad_sum.iter_mut().zip(&grads) {
                *sum += grad;
            }
        }
        round.loss_sum += loss;
        round.stop |= stop;
        round.arrived += 1;

        if round.arrived == self.world_size {
            let n = self.world_size as f32;
            let grads = std::mem::take(&mut round.grad_sum)
                .into_iter()
                .map(|g| g / n)
                .collect();
            round.result = Reduced {
                grads,
                loss: round.loss_sum / n,
                stop: round.stop,
            };
            round.loss_sum = 0.0;
            round.stop = false;
            round.arrived = 0;
            round.generation += 1;
            self.done.notify_all();
            return round.result.clone();
        }

        let generation = round.generation;
        let round = self
            .done
            .wait_while(round, |r| r.generation == generation && !r.aborted)
            .unwrap_or_else(PoisonError::into_inner);
        if round.generation == generation {
            Reduced::stopped()
        } else {
            round.result.clone()
        }
    }

    pub fn abort(&self) {
        let mut round = self.lock();
        round.aborted = true;
        self.done.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }
}

/// One member of an [`AllReduce`] group
pub struct Replica<'a> {
    rank: usize,
    group: &'a AllReduce,
}

impl<'a> Replica<'a> {
    pub fn new(rank: usize, group: &'a AllReduce) -> Self {
        Self { rank, group }
    }
}

impl Collective for Replica<'_> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size()
    }

    fn all_reduce(&self, grads: Vec<Array1<f32>>, loss: f32, stop: bool) -> Reduced {
        self.group.reduce(grads, loss, stop)
    }

    fn abort(&self) {
        self.group.abort();
    }
}

/// Aborts the group if the worker unwinds
struct AbortOnPanic<'a>(&'a AllReduce);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

/// Run `worker` on `world_size` threads sharing one all-reduce group
///
/// Results are returned in rank order. If any worker fails, the group is
/// aborted and the error of the lowest failing rank is returned.
pub fn run_workers<T, F>(world_size: usize, worker: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(&Replica<'_>) -> Result<T> + Sync,
{
    if world_size == 0 {
        return Err(Error::InvalidParameter("num_cores must be at least 1".to_string()));
    }

    let group = AllReduce::new(world_size);
    tracing::debug!(world_size, "starting replica workers");

    let results: Vec<Result<T>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let group = &group;
                let worker = &worker;
                thread::Builder::new()
                    .name(format!("afinar-rank-{rank}"))
                    .spawn_scoped(scope, move || {
                        let _guard = AbortOnPanic(group);
                        let result = worker(&Replica::new(rank, group));
                        if let Err(e) = &result {
                            tracing::error!(rank, error = %e, "worker failed");
                            group.abort();
                        }
                        result
                    })
                    .map_err(|e| {
                        group.abort();
                        Error::Worker {
                            rank,
                            message: format!("cannot spawn thread: {e}"),
                        }
                    })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle?.join().unwrap_or_else(|_| {
                    Err(Error::Worker {
                        rank,
                        message: "worker panicked".to_string(),
                    })
                })
            })
            .collect()
    });

    results.into_iter().collect()
}
