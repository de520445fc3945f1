use std::sync::Arc;
use std::time::Instant;

use prometheus::Histogram;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Failure of a unit of work outside its own error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker failed: {0}")]
    Panicked(String),

    #[error("worker pool closed")]
    Closed,
}

/// Fixed-size pool running self-contained units of work on the blocking
/// threads of the runtime.
///
/// Each unit receives an owned input and returns an owned result; nothing is
/// shared between units. [`WorkerPool::run_all`] returns only once every unit
/// has finished.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    workers: usize,
    unit_duration: Option<Histogram>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(workers)),
            workers,
            unit_duration: None,
        }
    }

    /// Records the wall time of every unit in `histogram`.
    pub fn with_unit_duration(mut self, histogram: Histogram) -> Self {
        self.unit_duration = Some(histogram);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `work` over every input, at most `workers` at a time, and waits
    /// for all of them. Results come back in input order; a panicking unit
    /// yields an error in its slot and does not affect its siblings.
    pub async fn run_all<I, T, F>(&self, inputs: Vec<I>, work: F) -> Vec<Result<T, PoolError>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> T + Send + Sync + 'static,
    {
        let total = inputs.len();
        let work = Arc::new(work);
        let mut in_flight = JoinSet::new();

        for (idx, input) in inputs.into_iter().enumerate() {
            let semaphore = Arc::clone(&self.semaphore);
            let work = Arc::clone(&work);
            let unit_duration = self.unit_duration.clone();

            in_flight.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (idx, Err(PoolError::Closed)),
                };

                let started = Instant::now();
                let result = tokio::task::spawn_blocking(move || work(input))
                    .await
                    .map_err(|e| PoolError::Panicked(e.to_string()));

                if let Some(h) = unit_duration {
                    h.observe(started.elapsed().as_secs_f64());
                }

                (idx, result)
            });
        }

        let mut slots: Vec<Option<Result<T, PoolError>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((idx, result)) => {
                    if let Some(slot) = slots.get_mut(idx) {
                        *slot = Some(result);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "worker pool task join failed");
                }
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(PoolError::Panicked("result lost".to_string()))))
            .collect()
    }
}
