//! Cancelable recurring background tasks.
//!
//! Every task launched through a [`TaskRunner`] shares one cancellation token.
//! [`TaskRunner::stop_all`] cancels the token and waits for every task to exit.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::AnalysisError;

/// Launches recurring units of work and cancels them together.
#[derive(Debug, Default)]
pub struct TaskRunner {
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period` until the runner is stopped.
    ///
    /// The first tick fires one full period after launch. Ticks that fall
    /// behind are skipped rather than replayed in a burst. On cancellation the
    /// task exits without a final tick.
    pub fn run_recurring<F>(
        &self,
        name: impl Into<String>,
        period: Duration,
        mut tick: F,
    ) -> Result<(), AnalysisError>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        if period.is_zero() {
            return Err(AnalysisError::ZeroPeriod { task: name });
        }

        let cancel = self.cancel.child_token();
        let span = tracing::debug_span!("recurring_task", task = %name, period = ?period);

        self.spawn(name.clone(), async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::info!(task = %name, "Recurring task stopped");
                        break;
                    }
                    _ = ticker.tick() => tick(),
                }
            }
        }
        .instrument(span))
    }

    fn spawn<Fut>(&self, name: String, task: Fut) -> Result<(), AnalysisError>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(AnalysisError::RunnerStopped { task: name });
        }
        let handle = Handle::try_current().map_err(|_| AnalysisError::NoRuntime { task: name })?;

        self.tasks.lock().spawn_on(task, &handle);
        Ok(())
    }

    /// Number of launched tasks that have not been drained by [`stop_all`](Self::stop_all).
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every task and wait until all of them have exited.
    ///
    /// Later calls to [`run_recurring`](Self::run_recurring) fail with
    /// [`AnalysisError::RunnerStopped`].
    pub async fn stop_all(&self) {
        self.cancel.cancel();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let total = tasks.len();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Recurring task ended abnormally");
            }
        }

        tracing::info!(tasks = total, "All recurring tasks stopped");
    }
}
