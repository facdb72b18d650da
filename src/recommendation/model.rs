//! Latent-Factor Model
//!
//! Matrix factorization over the implicit (user, show) favorite matrix.
//! Users and shows are mapped to dense indices with a first-seen
//! categorical encoding, then factorized with stochastic gradient descent
//! against a constant positive label.
//!
//! The trained `FactorModel` is immutable. The process-wide `ModelHandle`
//! hands out `Arc` snapshots to readers and swaps in a new model in one
//! step once a retrain succeeds.

use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::ModelStorage;

/// Bumped whenever the serialized layout changes
const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Favorites carry no magnitude; every observed pair is this label
pub const POSITIVE_LABEL: f32 = 1.0;

/// Initial factors are drawn uniformly from `[-INIT_RANGE, INIT_RANGE)`
const INIT_RANGE: f32 = 0.1;

/// Factorization hyper-parameters, fixed for the duration of one training call
#[derive(Debug, Clone, PartialEq)]
pub struct FactorizationParams {
    pub rank: usize,
    pub iterations: usize,
    pub learning_rate: f32,
    pub regularization: f32,
    pub seed: u64,
}

impl Default for FactorizationParams {
    fn default() -> Self {
        Self {
            rank: 100,
            iterations: 20,
            learning_rate: 0.1,
            regularization: 0.1,
            seed: 0,
        }
    }
}

/// Stable id → dense index mapping, assigned in first-seen order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoricalEncoding {
    index: HashMap<Uuid, usize>,
    len: usize,
}

impl CategoricalEncoding {
    /// Index for `id`, allocating the next one if unseen
    pub fn encode(&mut self, id: Uuid) -> usize {
        let next = self.len;
        let idx = *self.index.entry(id).or_insert(next);
        if idx == next {
            self.len += 1;
        }
        idx
    }

    pub fn get(&self, id: &Uuid) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Result of asking the model about one (user, show) pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prediction {
    /// Raw affinity, not yet sanitized. NaN when either id was never seen.
    Ok(f32),
    /// The stored factors cannot be used for this pair
    Failed,
}

/// Trained latent-factor model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorModel {
    format_version: u32,
    users: CategoricalEncoding,
    shows: CategoricalEncoding,
    /// [num_users x rank]
    user_factors: Array2<f32>,
    /// [num_shows x rank]
    show_factors: Array2<f32>,
    pub params_rank: usize,
    pub trained_on: usize,
    pub trained_at: DateTime<Utc>,
}

impl FactorModel {
    /// Factorize the favorite pairs. Duplicate pairs are counted once.
    pub fn fit(interactions: &[(Uuid, Uuid)], params: &FactorizationParams) -> Result<Self> {
        if params.rank == 0 {
            return Err(Error::training("rank must be at least 1"));
        }

        let mut users = CategoricalEncoding::default();
        let mut shows = CategoricalEncoding::default();
        let mut seen = std::collections::HashSet::with_capacity(interactions.len());
        let mut entries: Vec<(usize, usize)> = Vec::with_capacity(interactions.len());

        for &(user_id, show_id) in interactions {
            if !seen.insert((user_id, show_id)) {
                continue;
            }
            entries.push((users.encode(user_id), shows.encode(show_id)));
        }

        if entries.is_empty() {
            return Err(Error::training("no interactions to factorize"));
        }

        let k = params.rank;
        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut user_factors = Array2::<f32>::zeros((users.len(), k));
        let mut show_factors = Array2::<f32>::zeros((shows.len(), k));
        user_factors.mapv_inplace(|_| rng.gen_range(-INIT_RANGE..INIT_RANGE));
        show_factors.mapv_inplace(|_| rng.gen_range(-INIT_RANGE..INIT_RANGE));

        let lr = params.learning_rate;
        let reg = params.regularization;
        let mut order: Vec<usize> = (0..entries.len()).collect();

        for iteration in 0..params.iterations {
            order.shuffle(&mut rng);

            for &e in &order {
                let (u, i) = entries[e];
                let err = POSITIVE_LABEL - user_factors.row(u).dot(&show_factors.row(i));

                for f in 0..k {
                    let pu = user_factors[[u, f]];
                    let qi = show_factors[[i, f]];
                    user_factors[[u, f]] += lr * (err * qi - reg * pu);
                    show_factors[[i, f]] += lr * (err * pu - reg * qi);
                }
            }

            let loss = mean_squared_error(&entries, &user_factors, &show_factors);
            if !loss.is_finite() {
                return Err(Error::training(format!(
                    "factorization diverged at iteration {}",
                    iteration
                )));
            }
            if iteration % 5 == 0 {
                debug!("SGD iteration {}: loss = {:.5}", iteration, loss);
            }
        }

        info!(
            "Factorized {} interactions ({} users x {} shows, rank {})",
            entries.len(),
            users.len(),
            shows.len(),
            k
        );

        Ok(Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            users,
            shows,
            user_factors,
            show_factors,
            params_rank: k,
            trained_on: entries.len(),
            trained_at: Utc::now(),
        })
    }

    /// Raw affinity for a pair of raw ids
    pub fn predict(&self, user_id: Uuid, show_id: Uuid) -> Prediction {
        let (Some(u), Some(i)) = (self.users.get(&user_id), self.shows.get(&show_id)) else {
            return Prediction::Ok(f32::NAN);
        };

        match (self.user_row(u), self.show_row(i)) {
            (Some(p), Some(q)) if p.len() == q.len() => Prediction::Ok(p.dot(&q)),
            _ => Prediction::Failed,
        }
    }

    fn user_row(&self, idx: usize) -> Option<ArrayView1<'_, f32>> {
        (idx < self.user_factors.nrows()).then(|| self.user_factors.row(idx))
    }

    fn show_row(&self, idx: usize) -> Option<ArrayView1<'_, f32>> {
        (idx < self.show_factors.nrows()).then(|| self.show_factors.row(idx))
    }

    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    pub fn num_shows(&self) -> usize {
        self.shows.len()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let model: Self = bincode::deserialize(bytes)?;
        if model.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(Error::ModelStorage {
                message: format!(
                    "unsupported artifact format version {} (expected {})",
                    model.format_version, ARTIFACT_FORMAT_VERSION
                )
                .into(),
                source: None,
            });
        }
        Ok(model)
    }
}

fn mean_squared_error(
    entries: &[(usize, usize)],
    user_factors: &Array2<f32>,
    show_factors: &Array2<f32>,
) -> f32 {
    let total: f32 = entries
        .iter()
        .map(|&(u, i)| (POSITIVE_LABEL - user_factors.row(u).dot(&show_factors.row(i))).powi(2))
        .sum();
    total / entries.len().max(1) as f32
}

/// Shared, swappable reference to the current model
#[derive(Clone, Default)]
pub struct ModelHandle {
    current: Arc<RwLock<Option<Arc<FactorModel>>>>,
}

impl ModelHandle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_model(model: FactorModel) -> Self {
        let handle = Self::default();
        handle.replace(model);
        handle
    }

    /// Load the persisted artifact once at startup. A missing or unreadable
    /// artifact leaves the handle empty so the content-based path is used.
    pub async fn load(storage: &dyn ModelStorage) -> Self {
        let handle = Self::default();
        match storage.load_artifact().await {
            Ok(Some(bytes)) => match FactorModel::from_bytes(&bytes) {
                Ok(model) => {
                    info!(
                        "✓ Recommendation model loaded ({} users, {} shows, trained {})",
                        model.num_users(),
                        model.num_shows(),
                        model.trained_at
                    );
                    handle.replace(model);
                }
                Err(e) => tracing::warn!("Ignoring unreadable model artifact: {}", e),
            },
            Ok(None) => info!("No model artifact found; using content-based recommendations"),
            Err(e) => tracing::warn!("Failed to read model artifact: {}", e),
        }
        handle
    }

    /// Snapshot for one scoring call
    pub fn snapshot(&self) -> Option<Arc<FactorModel>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, model: FactorModel) {
        let model = Arc::new(model);
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(model);
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> FactorizationParams {
        FactorizationParams {
            rank: 8,
            iterations: 30,
            learning_rate: 0.05,
            regularization: 0.01,
            seed: 7,
        }
    }

    fn sample_interactions() -> (Vec<Uuid>, Vec<Uuid>, Vec<(Uuid, Uuid)>) {
        let users: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let shows: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let pairs = vec![
            (users[0], shows[0]),
            (users[0], shows[1]),
            (users[1], shows[0]),
            (users[1], shows[2]),
            (users[2], shows[3]),
            (users[3], shows[3]),
            (users[3], shows[4]),
        ];
        (users, shows, pairs)
    }

    #[test]
    fn test_encoding_is_first_seen_and_stable() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut enc = CategoricalEncoding::default();
        assert_eq!(enc.encode(a), 0);
        assert_eq!(enc.encode(b), 1);
        assert_eq!(enc.encode(a), 0);
        assert_eq!(enc.len(), 2);
        assert_eq!(enc.get(&b), Some(1));
        assert_eq!(enc.get(&Uuid::new_v4()), None);
    }

    #[test]
    fn test_fit_learns_observed_pairs() {
        let (users, shows, pairs) = sample_interactions();
        let model = FactorModel::fit(&pairs, &small_params()).unwrap();

        assert_eq!(model.num_users(), 4);
        assert_eq!(model.num_shows(), 5);
        assert_eq!(model.trained_on, 7);

        match model.predict(users[0], shows[0]) {
            Prediction::Ok(s) => assert!(s > 0.3, "observed pair should score high, got {}", s),
            other => panic!("expected score, got {:?}", other),
        }
    }

    #[test]
    fn test_fit_deduplicates_pairs() {
        let (_, _, mut pairs) = sample_interactions();
        pairs.push(pairs[0]);
        let model = FactorModel::fit(&pairs, &small_params()).unwrap();
        assert_eq!(model.trained_on, 7);
    }

    #[test]
    fn test_predict_unseen_ids() {
        let (users, shows, pairs) = sample_interactions();
        let model = FactorModel::fit(&pairs, &small_params()).unwrap();

        for prediction in [
            model.predict(Uuid::new_v4(), shows[0]),
            model.predict(users[0], Uuid::new_v4()),
        ] {
            assert!(matches!(prediction, Prediction::Ok(raw) if raw.is_nan()));
        }
    }

    #[test]
    fn test_same_seed_same_predictions() {
        let (users, shows, pairs) = sample_interactions();
        let a = FactorModel::fit(&pairs, &small_params()).unwrap();
        let b = FactorModel::fit(&pairs, &small_params()).unwrap();
        assert_eq!(a.predict(users[2], shows[4]), b.predict(users[2], shows[4]));
    }

    #[test]
    fn test_fit_rejects_empty_input() {
        assert!(FactorModel::fit(&[], &small_params()).is_err());
    }

    #[test]
    fn test_artifact_bytes_roundtrip() {
        let (users, shows, pairs) = sample_interactions();
        let model = FactorModel::fit(&pairs, &small_params()).unwrap();
        let restored = FactorModel::from_bytes(&model.to_bytes().unwrap()).unwrap();
        assert_eq!(
            model.predict(users[1], shows[2]),
            restored.predict(users[1], shows[2])
        );
    }

    #[test]
    fn test_garbage_artifact_is_rejected() {
        assert!(FactorModel::from_bytes(b"definitely not a model").is_err());
    }

    #[test]
    fn test_handle_swap_keeps_old_snapshot_alive() {
        let (users, shows, pairs) = sample_interactions();
        let handle = ModelHandle::empty();
        assert!(!handle.is_loaded());

        handle.replace(FactorModel::fit(&pairs, &small_params()).unwrap());
        let old = handle.snapshot().unwrap();

        let mut other = small_params();
        other.seed = 99;
        handle.replace(FactorModel::fit(&pairs, &other).unwrap());
        let new = handle.snapshot().unwrap();

        assert!(!Arc::ptr_eq(&old, &new));
        // The reader that took the old snapshot can still use it
        assert!(matches!(old.predict(users[0], shows[0]), Prediction::Ok(_)));
    }
}
