//! Looping job runner.
//!
//! A [`Runner`] drives one [`Job`] on a fixed interval until cancelled. A
//! transient failure is logged and retried on the next tick; a defect stops
//! the loop and is returned to the caller. Progress is published through a
//! shared [`RunnerState`] that the health endpoints read.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use feedsync_catalog::Feed2Catalog;
use feedsync_search::Catalog2Search;

use crate::error::Result;
use crate::metrics::{self, RunTimer};
use crate::monitoring::MonitoringProcessor;

/// Runner configuration.
#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    /// Pause between runs.
    pub interval: Duration,
    /// Time without a successful run after which the worker is unhealthy.
    pub unhealthy_threshold: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            unhealthy_threshold: Duration::from_secs(300),
        }
    }
}

/// One unit of repeatable work.
#[async_trait]
pub trait Job: Send {
    /// Job name for logs and metric labels.
    fn name(&self) -> &'static str;

    /// Runs until caught up or cancelled. Returns the number of items
    /// processed.
    async fn run_once(&mut self, cancel: &CancellationToken) -> Result<usize>;
}

#[async_trait]
impl Job for Feed2Catalog {
    fn name(&self) -> &'static str {
        "feed2catalog"
    }

    async fn run_once(&mut self, cancel: &CancellationToken) -> Result<usize> {
        let counts = self.run(cancel).await?;
        Ok(counts.total())
    }
}

#[async_trait]
impl Job for Catalog2Search {
    fn name(&self) -> &'static str {
        "catalog2search"
    }

    async fn run_once(&mut self, cancel: &CancellationToken) -> Result<usize> {
        let summary = self.run(cancel).await?;
        Ok(summary.items)
    }
}

#[async_trait]
impl Job for MonitoringProcessor {
    fn name(&self) -> &'static str {
        "monitoring"
    }

    async fn run_once(&mut self, cancel: &CancellationToken) -> Result<usize> {
        let summary = self.process_all(cancel).await?;
        Ok(summary.handled())
    }
}

/// Shared run state, read by the health endpoints.
#[derive(Debug)]
pub struct RunnerState {
    ready: AtomicBool,
    last_success_ts: AtomicU64,
    successful_runs: AtomicU64,
    failed_runs: AtomicU64,
    run_in_progress: AtomicBool,
    unhealthy_threshold: Duration,
}

impl RunnerState {
    /// Creates a state that is not ready yet.
    #[must_use]
    pub fn new(unhealthy_threshold: Duration) -> Self {
        Self {
            ready: AtomicBool::new(false),
            last_success_ts: AtomicU64::new(0),
            successful_runs: AtomicU64::new(0),
            failed_runs: AtomicU64::new(0),
            run_in_progress: AtomicBool::new(false),
            unhealthy_threshold,
        }
    }

    /// Marks startup as complete.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Returns true once startup is complete.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn start_run(&self) {
        self.run_in_progress.store(true, Ordering::Release);
    }

    /// Records a successful run.
    pub fn record_success(&self) {
        let now: u64 = Utc::now().timestamp().try_into().unwrap_or_default();
        self.last_success_ts.store(now, Ordering::Release);
        self.successful_runs.fetch_add(1, Ordering::Relaxed);
        self.run_in_progress.store(false, Ordering::Release);
    }

    /// Records a failed run.
    pub fn record_failure(&self) {
        self.failed_runs.fetch_add(1, Ordering::Relaxed);
        self.run_in_progress.store(false, Ordering::Release);
    }

    /// Successful runs so far.
    #[must_use]
    pub fn successful_runs(&self) -> u64 {
        self.successful_runs.load(Ordering::Relaxed)
    }

    /// Failed runs so far.
    #[must_use]
    pub fn failed_runs(&self) -> u64 {
        self.failed_runs.load(Ordering::Relaxed)
    }

    /// Returns true while a run is executing.
    #[must_use]
    pub fn run_in_progress(&self) -> bool {
        self.run_in_progress.load(Ordering::Acquire)
    }

    /// Configured unhealthy threshold.
    #[must_use]
    pub fn unhealthy_threshold(&self) -> Duration {
        self.unhealthy_threshold
    }

    /// Time of the last successful run.
    #[must_use]
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        let ts = self.last_success_ts.load(Ordering::Acquire);
        if ts == 0 {
            return None;
        }
        DateTime::from_timestamp(i64::try_from(ts).ok()?, 0)
    }

    /// Ready, with at least one successful run within the unhealthy threshold.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        if !self.is_ready() || self.successful_runs() == 0 {
            return false;
        }
        let Some(last) = self.last_success() else {
            return false;
        };
        let elapsed = (Utc::now() - last).num_seconds().max(0).unsigned_abs();
        elapsed < self.unhealthy_threshold.as_secs()
    }
}

/// Drives a job on an interval.
pub struct Runner<J> {
    job: J,
    config: RunnerConfig,
    state: Arc<RunnerState>,
}

impl<J: Job> Runner<J> {
    /// Creates a runner publishing to `state`.
    #[must_use]
    pub fn new(job: J, config: RunnerConfig, state: Arc<RunnerState>) -> Self {
        Self { job, config, state }
    }

    /// Returns the shared state.
    #[must_use]
    pub fn state(&self) -> &Arc<RunnerState> {
        &self.state
    }

    /// Runs the job once and records the outcome.
    ///
    /// # Errors
    ///
    /// Returns the job error, transient or not.
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> Result<usize> {
        let name = self.job.name();
        self.state.start_run();
        let timer = RunTimer::start(name);

        match self.job.run_once(cancel).await {
            Ok(items) => {
                timer.finish(items);
                self.state.record_success();
                tracing::info!(job = name, items, "run complete");
                Ok(items)
            }
            Err(e) => {
                metrics::record_run_failure(name);
                self.state.record_failure();
                tracing::error!(job = name, error = %e, defect = e.is_defect(), "run failed");
                Err(e)
            }
        }
    }

    /// Runs the job every interval until `cancel` fires.
    ///
    /// The first run starts immediately. Transient failures are retried on
    /// the next tick.
    ///
    /// # Errors
    ///
    /// Returns the first defect.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        self.state.mark_ready();
        tracing::info!(
            job = self.job.name(),
            interval_secs = self.config.interval.as_secs(),
            "runner ready"
        );

        loop {
            if let Err(e) = self.run_once(cancel).await {
                if e.is_defect() {
                    return Err(e);
                }
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!(job = self.job.name(), "runner cancelled");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }
        }
    }
}

/// Periodically publishes the time since the last successful run.
pub async fn report_lag(state: Arc<RunnerState>, job: &'static str, every: Duration) {
    let start = Utc::now();
    loop {
        let now = Utc::now();
        let lag = state
            .last_success()
            .map_or_else(|| (now - start).num_seconds(), |ts| (now - ts).num_seconds());
        #[allow(clippy::cast_precision_loss)]
        let lag = lag.max(0) as f64;
        metrics::set_run_lag(job, lag);
        tokio::time::sleep(every).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use feedsync_search::SearchError;

    use crate::error::SyncError;

    /// Job that replays scripted outcomes, then succeeds with zero items.
    struct ScriptedJob {
        outcomes: VecDeque<Result<usize>>,
        runs: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Job for ScriptedJob {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run_once(&mut self, _: &CancellationToken) -> Result<usize> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.outcomes.pop_front().unwrap_or(Ok(0))
        }
    }

    fn runner(outcomes: Vec<Result<usize>>) -> (Runner<ScriptedJob>, Arc<AtomicU64>) {
        let runs = Arc::new(AtomicU64::new(0));
        let job = ScriptedJob {
            outcomes: outcomes.into(),
            runs: runs.clone(),
        };
        let config = RunnerConfig {
            interval: Duration::from_millis(5),
            unhealthy_threshold: Duration::from_secs(60),
        };
        let state = Arc::new(RunnerState::new(config.unhealthy_threshold));
        (Runner::new(job, config, state), runs)
    }

    #[tokio::test]
    async fn state_becomes_healthy_after_first_success() {
        let (mut runner, _) = runner(vec![Ok(3)]);
        let cancel = CancellationToken::new();
        assert!(!runner.state().is_healthy());

        runner.state().mark_ready();
        assert!(!runner.state().is_healthy(), "no successful run yet");

        assert_eq!(runner.run_once(&cancel).await.expect("run"), 3);
        assert!(runner.state().is_healthy());
        assert_eq!(runner.state().successful_runs(), 1);
        assert!(!runner.state().run_in_progress());
    }

    #[tokio::test]
    async fn transient_failures_keep_the_loop_running() {
        let (mut runner, runs) = runner(vec![
            Err(SyncError::monitoring("queue unavailable")),
            Err(SyncError::monitoring("queue unavailable")),
        ]);
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        let observed = runs.clone();
        tokio::spawn(async move {
            while observed.load(Ordering::SeqCst) < 4 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            stopper.cancel();
        });

        runner.run(&cancel).await.expect("cancelled cleanly");
        assert!(runs.load(Ordering::SeqCst) >= 4);
        assert_eq!(runner.state().failed_runs(), 2);
        assert!(runner.state().is_healthy());
    }

    #[tokio::test]
    async fn defects_stop_the_loop() {
        let (mut runner, runs) = runner(vec![
            Ok(1),
            Err(SearchError::invariant("refcount mismatch").into()),
        ]);

        let err = runner
            .run(&CancellationToken::new())
            .await
            .expect_err("defect");
        assert!(err.is_defect());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(runner.state().failed_runs(), 1);
    }
}
