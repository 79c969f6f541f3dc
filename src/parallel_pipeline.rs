// THEORY:
// The `parallel_pipeline` module owns the one concurrency primitive the engine
// needs: a bounded pool of workers that drains a batch of independent units and
// then stops. Every phase (calibration, post-processing, reconciliation) submits its
// units here and awaits the drain before the next phase may begin.
//
// Key architectural principles:
// 1.  **Fixed Worker Count**: `workers` tokio tasks pull from one shared queue. Each
//     unit's body is CPU-bound, so it runs on the blocking thread pool via
//     `spawn_blocking`; at most `workers` bodies are ever in flight.
// 2.  **Channel Back-Pressure Free**: Results travel back over an unbounded mpsc
//     channel tagged with the unit's submission index, so completion order does not
//     matter and the caller always receives results in submission order.
// 3.  **Cooperative Stop**: A worker looks at the shared `CancelFlag` before taking a
//     new unit. Units already running always finish; units never taken come back as
//     `None`.
// 4.  **Failure Containment**: A panicking unit is reported, never propagated. The
//     rest of the batch keeps running.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::core_modules::cancellation::CancelFlag;

/// The outcome of draining one batch of units.
#[derive(Debug)]
pub struct PoolOutcome<R> {
    /// One slot per submitted unit, in submission order. `None` when the unit was
    /// never started (cancellation) or panicked.
    pub results: Vec<Option<R>>,
    /// Submission indices of units that panicked.
    pub panicked: Vec<usize>,
    /// True if the cancel flag was raised by the time the pool drained.
    pub cancelled: bool,
}

impl<R> PoolOutcome<R> {
    /// Number of units that were never started.
    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.is_none()).count() - self.panicked.len()
    }
}

/// A bounded pool of workers sharing one cancellation flag.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    cancel: CancelFlag,
}

impl WorkerPool {
    pub fn new(workers: usize, cancel: CancelFlag) -> Self {
        Self {
            workers: workers.max(1),
            cancel,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Runs `job` over every unit with at most `workers` units in flight and waits
    /// for the pool to drain.
    pub async fn run<T, R, F>(&self, units: Vec<T>, job: F) -> PoolOutcome<R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let total = units.len();
        let queue: Arc<Mutex<VecDeque<(usize, T)>>> =
            Arc::new(Mutex::new(units.into_iter().enumerate().collect()));
        let job = Arc::new(job);
        let (result_sender, mut result_receiver) = mpsc::unbounded_channel::<(usize, Option<R>)>();

        // --- Spawn workers ---
        let worker_count = self.workers.min(total);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let queue = Arc::clone(&queue);
            let job = Arc::clone(&job);
            let sender = result_sender.clone();
            let cancel = self.cancel.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        debug!(worker_id, "worker stopping on cancel");
                        break;
                    }
                    let next = queue.lock().pop_front();
                    let Some((index, unit)) = next else {
                        break;
                    };

                    let job = Arc::clone(&job);
                    match tokio::task::spawn_blocking(move || job(unit)).await {
                        Ok(result) => {
                            let _ = sender.send((index, Some(result)));
                        }
                        Err(err) => {
                            error!(worker_id, index, "unit of work failed: {err}");
                            let _ = sender.send((index, None));
                        }
                    }
                }
            }));
        }
        drop(result_sender);

        // --- Drain (phase barrier) ---
        for joined in futures::future::join_all(workers).await {
            if let Err(err) = joined {
                error!("worker task failed: {err}");
            }
        }

        let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
        let mut panicked = Vec::new();
        while let Some((index, result)) = result_receiver.recv().await {
            match result {
                Some(value) => results[index] = Some(value),
                None => panicked.push(index),
            }
        }
        panicked.sort_unstable();

        PoolOutcome {
            results,
            panicked,
            cancelled: self.cancel.is_cancelled(),
        }
    }
}
