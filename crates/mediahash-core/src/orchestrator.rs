//! Self-sustaining fetch loop.
//!
//! Each cycle claims a batch of `queued` items and runs it through the
//! fetch stage, which fans hash work out to the task queue. A cycle that
//! did work is followed immediately by the next one. An idle cycle sleeps
//! with exponential backoff; a failed cycle sleeps per the retry policy.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::claim::ClaimProtocol;
use crate::error::AppError;
use crate::fetch::{FetchOutcome, FetchStage};
use crate::task::RetryPolicy;
use crate::task_queue::TaskQueue;
use crate::traits::{MetadataProvider, WorkStore};
use crate::work::WorkStatus;

/// Upper bound on rows released per stale sweep.
pub const SWEEP_LIMIT: usize = 1_000;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// First sleep after a cycle finds nothing to claim.
    pub idle_backoff: Duration,
    pub max_idle_backoff: Duration,
    pub retry_policy: RetryPolicy,
    /// Release claims older than this back to their source status.
    /// `None` disables the sweep.
    pub stale_claim_timeout: Option<TimeDelta>,
    pub sweep_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            idle_backoff: Duration::from_secs(1),
            max_idle_backoff: Duration::from_secs(60),
            retry_policy: RetryPolicy::default(),
            stale_claim_timeout: None,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_idle_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.idle_backoff = initial;
        self.max_idle_backoff = max.max(initial);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_stale_claim_timeout(mut self, timeout: TimeDelta) -> Self {
        self.stale_claim_timeout = Some(timeout);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Processed(FetchOutcome),
    Idle,
}

#[derive(Debug, Clone)]
pub enum CycleEvent<'a> {
    Started,
    CycleFinished {
        cycle: u64,
        outcome: &'a FetchOutcome,
    },
    Idle {
        sleep: Duration,
    },
    CycleFailed {
        error: &'a str,
        attempt: u32,
        retry_in: Duration,
    },
    RetriesExhausted {
        attempts: u32,
    },
    StaleReleased {
        released: u64,
    },
    Stopped {
        cycles: u64,
    },
}

pub trait CycleReporter: Send + Sync {
    fn report(&self, event: CycleEvent<'_>) {
        let _ = event;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCycleReporter;

impl CycleReporter for TracingCycleReporter {
    fn report(&self, event: CycleEvent<'_>) {
        match event {
            CycleEvent::Started => tracing::info!("Orchestrator started"),
            CycleEvent::CycleFinished { cycle, outcome } => {
                tracing::info!(
                    %cycle,
                    claimed = outcome.claimed,
                    done = outcome.done,
                    hash_enqueued = outcome.hash_enqueued,
                    missing = outcome.missing,
                    "Cycle finished"
                );
            }
            CycleEvent::Idle { sleep } => {
                tracing::debug!(sleep_ms = %sleep.as_millis(), "Nothing to claim");
            }
            CycleEvent::CycleFailed {
                error,
                attempt,
                retry_in,
            } => {
                tracing::warn!(%error, %attempt, retry_in_s = %retry_in.as_secs(), "Cycle failed");
            }
            CycleEvent::RetriesExhausted { attempts } => {
                tracing::error!(%attempts, "Cycle retries exhausted, items stay queued");
            }
            CycleEvent::StaleReleased { released } => {
                tracing::warn!(%released, "Released stale claims");
            }
            CycleEvent::Stopped { cycles } => {
                tracing::info!(%cycles, "Orchestrator stopped");
            }
        }
    }
}

/// Release claims older than `older_than` in both lanes.
pub async fn sweep_stale_claims<S: WorkStore>(
    claims: &ClaimProtocol<S>,
    older_than: chrono::DateTime<Utc>,
    limit: usize,
) -> Result<u64, AppError> {
    let fetch = claims
        .release_stale(WorkStatus::Processing, WorkStatus::Queued, older_than, limit)
        .await?;
    let export = claims
        .release_stale(
            WorkStatus::ProcessingExport,
            WorkStatus::QueuedExport,
            older_than,
            limit,
        )
        .await?;
    Ok(fetch + export)
}

pub struct Orchestrator<S, P, Q>
where
    S: WorkStore,
    P: MetadataProvider,
    Q: TaskQueue,
{
    fetch: FetchStage<S, P, Q>,
    config: OrchestratorConfig,
}

impl<S, P, Q> Orchestrator<S, P, Q>
where
    S: WorkStore,
    P: MetadataProvider,
    Q: TaskQueue,
{
    pub fn new(fetch: FetchStage<S, P, Q>, config: OrchestratorConfig) -> Self {
        Self { fetch, config }
    }

    /// One claim-and-fetch cycle.
    pub async fn cycle(&self) -> Result<CycleOutcome, AppError> {
        Ok(match self.fetch.run_next().await? {
            Some(outcome) => CycleOutcome::Processed(outcome),
            None => CycleOutcome::Idle,
        })
    }

    /// Cycle until cancelled. Returns the number of cycles that did work.
    pub async fn run<CR: CycleReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &CR,
    ) -> Result<u64, AppError> {
        reporter.report(CycleEvent::Started);

        let mut cycles = 0u64;
        let mut idle_sleep = self.config.idle_backoff;
        let mut failures = 0u32;
        let mut last_sweep: Option<Instant> = None;

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            self.maybe_sweep(&mut last_sweep, reporter).await;

            let sleep = match self.cycle().await {
                Ok(CycleOutcome::Processed(outcome)) => {
                    cycles += 1;
                    failures = 0;
                    idle_sleep = self.config.idle_backoff;
                    reporter.report(CycleEvent::CycleFinished {
                        cycle: cycles,
                        outcome: &outcome,
                    });
                    continue;
                }
                Ok(CycleOutcome::Idle) => {
                    failures = 0;
                    let sleep = idle_sleep;
                    idle_sleep = (idle_sleep * 2).min(self.config.max_idle_backoff);
                    reporter.report(CycleEvent::Idle { sleep });
                    sleep
                }
                Err(e) => {
                    failures += 1;
                    let policy = &self.config.retry_policy;
                    let retry_in = policy
                        .delay_for_attempt(failures)
                        .to_std()
                        .unwrap_or(self.config.max_idle_backoff);
                    let error = e.to_string();
                    reporter.report(CycleEvent::CycleFailed {
                        error: &error,
                        attempt: failures,
                        retry_in,
                    });
                    if failures >= policy.max_attempts {
                        reporter.report(CycleEvent::RetriesExhausted { attempts: failures });
                        failures = 0;
                    }
                    retry_in
                }
            };

            tokio::select! {
                () = tokio::time::sleep(sleep) => {}
                () = cancel_token.cancelled() => break,
            }
        }

        reporter.report(CycleEvent::Stopped { cycles });
        Ok(cycles)
    }

    async fn maybe_sweep<CR: CycleReporter>(
        &self,
        last_sweep: &mut Option<Instant>,
        reporter: &CR,
    ) {
        let Some(timeout) = self.config.stale_claim_timeout else {
            return;
        };
        if last_sweep.is_some_and(|at| at.elapsed() < self.config.sweep_interval) {
            return;
        }
        *last_sweep = Some(Instant::now());

        match sweep_stale_claims(self.fetch.claims(), Utc::now() - timeout, SWEEP_LIMIT).await {
            Ok(0) => {}
            Ok(released) => reporter.report(CycleEvent::StaleReleased { released }),
            Err(e) => tracing::error!(error = %e, "Stale claim sweep failed"),
        }
    }
}
