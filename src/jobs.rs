//! Background Job Scheduler
//!
//! Three recurring jobs, each on its own interval loop:
//!
//! - `train-model`: retrain the factor model (weekly by default)
//! - `materialize-recommendations`: refresh stored rows for every user (daily)
//! - `prune-expired-tokens`: delete expired or revoked refresh tokens (hourly)
//!
//! A job runs inline in its loop, so two runs of the same job never
//! overlap. Failed runs are retried with exponential backoff up to the
//! job's attempt budget. Shutdown is observed between runs only.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::JobsConfig;
use crate::error::{Error, Result};
use crate::recommendation::{Materializer, ModelTrainer, SkipReason, TrainOutcome};
use crate::store::TokenStore;

/// Longest pause between two attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

pub const TRAIN_MODEL: &str = "train-model";
pub const MATERIALIZE_RECOMMENDATIONS: &str = "materialize-recommendations";
pub const PRUNE_EXPIRED_TOKENS: &str = "prune-expired-tokens";

/// Schedule and retry budget of one job
#[derive(Debug, Clone)]
pub struct JobPolicy {
    pub name: &'static str,
    pub interval: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

/// Run `job` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Backoff doubles after each failed attempt.
pub async fn run_with_retry<T, F, Fut>(policy: &JobPolicy, mut job: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.retry_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match job().await {
            Ok(value) => {
                metrics::counter!("job_runs_total", "job" => policy.name, "status" => "ok")
                    .increment(1);
                return Ok(value);
            }
            Err(e) if attempt < max_attempts && e.is_retryable() => {
                warn!(
                    "Job {} failed (attempt {}/{}): {}. Retrying in {:?}",
                    policy.name, attempt, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, MAX_RETRY_DELAY);
            }
            Err(e) => {
                metrics::counter!("job_runs_total", "job" => policy.name, "status" => "failed")
                    .increment(1);
                return Err(e);
            }
        }
    }
}

/// Spawn a loop running `job` every `policy.interval` until shutdown.
/// The first tick is skipped so nothing runs at startup.
pub fn spawn_recurring<F, Fut>(
    policy: JobPolicy,
    mut shutdown_rx: broadcast::Receiver<()>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(policy.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    info!("⏰ Running job {}", policy.name);
                    match run_with_retry(&policy, &job).await {
                        Ok(()) => info!("✅ Job {} completed", policy.name),
                        Err(e) => error!("Job {} failed: {}", policy.name, e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Job {} shutting down", policy.name);
                    break;
                }
            }
        }
    })
}

/// One training run as a job. Persistence and training failures are
/// retryable; insufficient data or an overlapping run is not a failure.
pub async fn train_model(trainer: &ModelTrainer) -> Result<()> {
    match trainer.train().await {
        TrainOutcome::Trained(_) => Ok(()),
        TrainOutcome::Skipped(SkipReason::InsufficientData { .. })
        | TrainOutcome::Skipped(SkipReason::AlreadyRunning) => Ok(()),
        TrainOutcome::Skipped(SkipReason::PersistenceFailed(message)) => Err(Error::ModelStorage {
            message: message.into(),
            source: None,
        }),
        TrainOutcome::Skipped(SkipReason::TrainingFailed(message)) => Err(Error::training(message)),
    }
}

pub async fn materialize_recommendations(materializer: &Materializer) -> Result<()> {
    let users = materializer.materialize_all().await?;
    info!("Materialized recommendations for {} users", users);
    Ok(())
}

pub async fn prune_expired_tokens(tokens: &dyn TokenStore) -> Result<()> {
    let removed = tokens.prune_expired_tokens().await?;
    if removed > 0 {
        info!("🧹 Pruned {} expired refresh tokens", removed);
    }
    Ok(())
}

/// Owns the collaborators of the recurring jobs
pub struct JobScheduler {
    trainer: ModelTrainer,
    materializer: Materializer,
    tokens: Arc<dyn TokenStore>,
    config: JobsConfig,
}

impl JobScheduler {
    pub fn new(
        trainer: ModelTrainer,
        materializer: Materializer,
        tokens: Arc<dyn TokenStore>,
        config: JobsConfig,
    ) -> Self {
        Self {
            trainer,
            materializer,
            tokens,
            config,
        }
    }

    pub fn policies(&self) -> [JobPolicy; 3] {
        let c = &self.config;
        [
            JobPolicy {
                name: TRAIN_MODEL,
                interval: c.train_interval,
                max_attempts: c.train_attempts,
                retry_delay: c.retry_delay,
            },
            JobPolicy {
                name: MATERIALIZE_RECOMMENDATIONS,
                interval: c.materialize_interval,
                max_attempts: c.materialize_attempts,
                retry_delay: c.retry_delay,
            },
            JobPolicy {
                name: PRUNE_EXPIRED_TOKENS,
                interval: c.prune_interval,
                max_attempts: c.prune_attempts,
                retry_delay: c.retry_delay,
            },
        ]
    }

    /// Start every job loop
    pub fn spawn_all(self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let [train, materialize, prune] = self.policies();
        let mut handles = Vec::with_capacity(3);

        let trainer = self.trainer;
        handles.push(spawn_recurring(train, shutdown.subscribe(), move || {
            let trainer = trainer.clone();
            async move { train_model(&trainer).await }
        }));

        let materializer = self.materializer;
        handles.push(spawn_recurring(materialize, shutdown.subscribe(), move || {
            let materializer = materializer.clone();
            async move { materialize_recommendations(&materializer).await }
        }));

        let tokens = self.tokens;
        handles.push(spawn_recurring(prune, shutdown.subscribe(), move || {
            let tokens = tokens.clone();
            async move { prune_expired_tokens(tokens.as_ref()).await }
        }));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> JobPolicy {
        JobPolicy {
            name: "test-job",
            interval: Duration::from_secs(60),
            max_attempts,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retries_until_budget_spent() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = run_with_retry(&policy(2), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::database("connection reset")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_single_attempt_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = run_with_retry(&policy(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::database("connection reset")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_on_second_attempt() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&policy(2), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::PoolExhausted)
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = run_with_retry(&policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::bad_request("bad input")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_policies() {
        let config = JobsConfig::default();
        assert_eq!(config.train_attempts, 2);
        assert_eq!(config.materialize_attempts, 2);
        assert_eq!(config.prune_attempts, 1);
    }

    #[tokio::test]
    async fn test_recurring_job_stops_on_shutdown() {
        let (tx, _) = broadcast::channel(1);
        let handle = spawn_recurring(policy(1), tx.subscribe(), || async { Ok(()) });

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
