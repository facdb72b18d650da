//! Model Trainer
//!
//! Reads every favorite, factorizes it, persists the artifact and only then
//! swaps the new model into the shared handle. Any failure leaves the
//! previous model in place, in memory and on disk.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use super::metrics::PerformanceTimer;
use super::model::{FactorModel, FactorizationParams, ModelHandle};
use crate::config::RecommendationConfig;
use crate::error::{Error, Result};
use crate::store::{InteractionStore, ModelStorage};

/// Summary of a successful training run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainReport {
    pub interactions: usize,
    pub users: usize,
    pub shows: usize,
}

/// Why a run did not produce a new model
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    InsufficientData { found: usize, required: usize },
    AlreadyRunning,
    TrainingFailed(String),
    PersistenceFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    Trained(TrainReport),
    Skipped(SkipReason),
}

impl TrainOutcome {
    pub fn is_trained(&self) -> bool {
        matches!(self, TrainOutcome::Trained(_))
    }

    fn label(&self) -> &'static str {
        match self {
            TrainOutcome::Trained(_) => "trained",
            TrainOutcome::Skipped(SkipReason::InsufficientData { .. }) => "insufficient_data",
            TrainOutcome::Skipped(SkipReason::AlreadyRunning) => "already_running",
            TrainOutcome::Skipped(SkipReason::TrainingFailed(_)) => "training_failed",
            TrainOutcome::Skipped(SkipReason::PersistenceFailed(_)) => "persistence_failed",
        }
    }
}

#[derive(Clone)]
pub struct ModelTrainer {
    interactions: Arc<dyn InteractionStore>,
    storage: Arc<dyn ModelStorage>,
    handle: ModelHandle,
    params: FactorizationParams,
    min_interactions: usize,
    guard: Arc<Mutex<()>>,
}

impl ModelTrainer {
    pub fn new(
        interactions: Arc<dyn InteractionStore>,
        storage: Arc<dyn ModelStorage>,
        handle: ModelHandle,
        config: &RecommendationConfig,
    ) -> Self {
        Self {
            interactions,
            storage,
            handle,
            params: FactorizationParams {
                rank: config.rank,
                iterations: config.iterations,
                learning_rate: config.learning_rate,
                regularization: config.regularization,
                seed: config.seed,
            },
            min_interactions: config.min_interactions,
            guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_params(mut self, params: FactorizationParams) -> Self {
        self.params = params;
        self
    }

    /// True while a training run holds the guard
    pub fn is_training(&self) -> bool {
        self.guard.try_lock().is_err()
    }

    /// Retrain from the full interaction store. Never returns an error;
    /// failures are logged and reported as a skipped outcome.
    #[instrument(skip(self))]
    pub async fn train(&self) -> TrainOutcome {
        let Ok(_running) = self.guard.try_lock() else {
            warn!("Training already in progress, skipping");
            return TrainOutcome::Skipped(SkipReason::AlreadyRunning);
        };
        self.train_locked().await
    }

    /// Claim the training guard now and train in a background task.
    /// Fails with `Conflict` if a run is already in progress.
    pub fn spawn_training(&self) -> Result<JoinHandle<TrainOutcome>> {
        let running = self
            .guard
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::Conflict {
                message: "Model training is already in progress".into(),
            })?;

        let trainer = self.clone();
        Ok(tokio::spawn(async move {
            let _running = running;
            trainer.train_locked().await
        }))
    }

    async fn train_locked(&self) -> TrainOutcome {
        let timer = PerformanceTimer::new("train_model");
        let outcome = match self.run().await {
            Ok(report) => {
                info!(
                    "✅ Model trained on {} interactions ({} users, {} shows)",
                    report.interactions, report.users, report.shows
                );
                TrainOutcome::Trained(report)
            }
            Err(Error::InsufficientData { found, required }) => {
                warn!(
                    "Not enough interactions to train: {} (need {})",
                    found, required
                );
                TrainOutcome::Skipped(SkipReason::InsufficientData { found, required })
            }
            Err(e @ (Error::ModelStorage { .. } | Error::Io(_))) => {
                error!("Failed to persist model, keeping previous one: {}", e);
                TrainOutcome::Skipped(SkipReason::PersistenceFailed(e.to_string()))
            }
            Err(e) => {
                error!("Model training failed, keeping previous model: {}", e);
                TrainOutcome::Skipped(SkipReason::TrainingFailed(e.to_string()))
            }
        };
        timer.log_if_slow(60_000);

        metrics::counter!("model_training_runs_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn run(&self) -> Result<TrainReport> {
        let interactions = self.interactions.list_favorite_interactions().await?;

        if interactions.len() < self.min_interactions {
            return Err(Error::InsufficientData {
                found: interactions.len(),
                required: self.min_interactions,
            });
        }

        info!("🔄 Training model on {} interactions...", interactions.len());

        let params = self.params.clone();
        let model =
            tokio::task::spawn_blocking(move || FactorModel::fit(&interactions, &params)).await??;

        let report = TrainReport {
            interactions: model.trained_on,
            users: model.num_users(),
            shows: model.num_shows(),
        };

        let bytes = model.to_bytes()?;
        self.storage.save_artifact(&bytes).await?;
        self.handle.replace(model);

        Ok(report)
    }
}
