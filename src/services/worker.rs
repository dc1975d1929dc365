//! Periodic background tasks with an explicit start/stop lifecycle.
//!
//! A worker runs at most once per instance: `start` spawns the ticking task
//! (repeat calls are no-ops), `stop` closes the control channel and waits for
//! the task to return. Once stopped, a worker cannot be restarted.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

enum WorkerState {
    Idle,
    Running {
        stop_tx: oneshot::Sender<()>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

pub struct BackgroundWorker {
    name: &'static str,
    period: Duration,
    state: Mutex<WorkerState>,
}

impl BackgroundWorker {
    #[must_use]
    pub const fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            state: Mutex::new(WorkerState::Idle),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            WorkerState::Running { .. }
        )
    }

    /// Spawn the worker. `tick` runs once per period, first after one full
    /// period has elapsed. Returns `false` if the worker was already started.
    pub fn start<F, Fut>(&self, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*state, WorkerState::Idle) {
            debug!(worker = self.name, "Worker already started");
            return false;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let name = self.name;
        let period = self.period;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => tick().await,
                }
            }

            debug!(worker = name, "Worker loop exited");
        });

        info!(
            event = "worker_started",
            worker = self.name,
            period_secs = self.period.as_secs_f64(),
            "Background worker started"
        );

        *state = WorkerState::Running { stop_tx, handle };
        true
    }

    /// Signal the worker and wait for it to return. Idempotent.
    pub async fn stop(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, WorkerState::Stopped)
        };

        if let WorkerState::Running { stop_tx, handle } = previous {
            drop(stop_tx);
            if let Err(e) = handle.await {
                warn!(worker = self.name, error = %e, "Worker task ended abnormally");
            }
            info!(event = "worker_stopped", worker = self.name, "Background worker stopped");
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let WorkerState::Running { handle, .. } = state {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticks_until_stopped() {
        let worker = BackgroundWorker::new("test", Duration::from_secs(10));
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        assert!(worker.start(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        assert!(worker.is_running());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        worker.stop().await;
        assert!(!worker.is_running());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_is_final() {
        let worker = BackgroundWorker::new("test", Duration::from_secs(60));
        assert!(worker.start(|| async {}));
        assert!(!worker.start(|| async {}));

        worker.stop().await;
        worker.stop().await;

        assert!(!worker.start(|| async {}));
        assert!(!worker.is_running());
    }
}
