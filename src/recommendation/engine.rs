//! Recommendation Engine
//!
//! Scores every unfavorited catalog show for a user and returns the best
//! `count`. With a trained model the score blends the model's affinity
//! with the show's rating and popularity; without one the engine hands
//! over to the content-based fallback.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::catalog::{Show, ShowType};
use super::fallback::ContentBasedRecommender;
use super::metrics::PerformanceTimer;
use super::model::{FactorModel, ModelHandle, Prediction};
use super::reason::generate_reason;
use crate::error::Result;
use crate::store::{CatalogStore, InteractionStore, UserDirectory};

/// Upper bound of the sanitized model score and of show ratings
const SCORE_CEILING: f64 = 10.0;

/// A ranked recommendation ready for display or persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationCandidate {
    pub show_id: Uuid,
    pub title: String,
    pub show_type: ShowType,
    pub rating: f64,
    pub genres: Vec<String>,
    /// Display score in [0.0, 100.0], one decimal
    pub score: f64,
    pub reason: String,
    pub source: CandidateSource,
}

/// Which path produced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Model,
    Genre,
    Popular,
}

/// How a single recommend call is served, decided once up front
pub enum Strategy {
    ModelBased(Arc<FactorModel>),
    ContentBased,
}

impl Strategy {
    fn label(&self) -> &'static str {
        match self {
            Strategy::ModelBased(_) => "model",
            Strategy::ContentBased => "content",
        }
    }
}

/// Blend weights for the hybrid score
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub model: f64,
    pub rating: f64,
    pub popularity: f64,
    /// Used when the model cannot score a pair
    pub degraded_rating: f64,
    pub degraded_popularity: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            model: 0.6,
            rating: 0.2,
            popularity: 0.2,
            degraded_rating: 0.5,
            degraded_popularity: 0.5,
        }
    }
}

impl ScoringWeights {
    /// Hybrid score for one show. Never NaN.
    pub fn combined_score(&self, prediction: Prediction, rating: f64, popularity: f64) -> f64 {
        let score = match prediction {
            Prediction::Ok(raw) => {
                self.model * sanitize_model_score(raw)
                    + self.rating * rating
                    + self.popularity * (popularity / 10.0)
            }
            Prediction::Failed => {
                self.degraded_rating * rating + self.degraded_popularity * (popularity / 10.0)
            }
        };

        if score.is_finite() {
            score
        } else {
            0.0
        }
    }
}

/// Non-finite model output counts as no signal; the rest is clamped to [0, 10]
pub fn sanitize_model_score(raw: f32) -> f64 {
    let raw = f64::from(raw);
    if raw.is_finite() {
        raw.clamp(0.0, SCORE_CEILING)
    } else {
        0.0
    }
}

/// Map a combined score onto the 0-100 display scale with one decimal
pub fn display_score(combined: f64) -> f64 {
    if combined.is_nan() {
        return 0.0;
    }
    round_one_decimal(combined.clamp(0.0, SCORE_CEILING) * 10.0)
}

pub(crate) fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// A show with its combined score and catalog position
struct ScoredShow {
    position: usize,
    combined: f64,
    show: Show,
}

/// Order best first; equal scores keep catalog order
fn rank(mut scored: Vec<ScoredShow>, count: usize) -> Vec<ScoredShow> {
    scored.sort_by(|a, b| {
        b.combined
            .total_cmp(&a.combined)
            .then(a.position.cmp(&b.position))
    });
    scored.truncate(count);
    scored
}

/// Main recommendation engine
#[derive(Clone)]
pub struct Recommender {
    users: Arc<dyn UserDirectory>,
    interactions: Arc<dyn InteractionStore>,
    catalog: Arc<dyn CatalogStore>,
    model: ModelHandle,
    fallback: ContentBasedRecommender,
    weights: ScoringWeights,
}

impl Recommender {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        interactions: Arc<dyn InteractionStore>,
        catalog: Arc<dyn CatalogStore>,
        model: ModelHandle,
    ) -> Self {
        let fallback = ContentBasedRecommender::new(interactions.clone(), catalog.clone());
        Self {
            users,
            interactions,
            catalog,
            model,
            fallback,
            weights: ScoringWeights::default(),
        }
    }

    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    /// Up to `count` recommendations for the user, best first.
    ///
    /// Unknown users get an empty list. Only store failures are errors.
    #[instrument(skip(self))]
    pub async fn recommend(&self, user_id: Uuid, count: usize) -> Result<Vec<RecommendationCandidate>> {
        let _timer = PerformanceTimer::new("recommend");

        if count == 0 {
            return Ok(Vec::new());
        }

        if !self.users.user_exists(user_id).await? {
            debug!("User {} not found, no recommendations", user_id);
            return Ok(Vec::new());
        }

        let favorites = self.interactions.list_favorite_show_ids(user_id).await?;

        let strategy = match self.model.snapshot() {
            Some(model) => Strategy::ModelBased(model),
            None => Strategy::ContentBased,
        };
        let label = strategy.label();

        let results = match strategy {
            Strategy::ContentBased => {
                debug!("No model loaded, using content-based recommendations");
                self.fallback.recommend(user_id, count, &favorites).await?
            }
            Strategy::ModelBased(model) => {
                self.score_with_model(user_id, count, &favorites, model)
                    .await?
            }
        };

        metrics::counter!("recommendations_served_total", "strategy" => label).increment(1);
        debug!(
            "Returning {} {} recommendations for {}",
            results.len(),
            label,
            user_id
        );
        Ok(results)
    }

    async fn score_with_model(
        &self,
        user_id: Uuid,
        count: usize,
        favorites: &[Uuid],
        model: Arc<FactorModel>,
    ) -> Result<Vec<RecommendationCandidate>> {
        let candidates = self.catalog.list_shows_excluding(favorites).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let favorite_genres: HashSet<Uuid> = self
            .interactions
            .list_favorite_genre_ids(user_id)
            .await?
            .into_iter()
            .collect();

        let weights = self.weights.clone();

        // CPU-bound scoring goes to rayon, off the async runtime
        let ranked = tokio::task::spawn_blocking(move || {
            use rayon::prelude::*;
            let _scoring_timer = PerformanceTimer::new("parallel_scoring");

            let scored: Vec<ScoredShow> = candidates
                .into_par_iter()
                .enumerate()
                .map(|(position, show)| {
                    let prediction = model.predict(user_id, show.id);
                    let combined = weights.combined_score(prediction, show.rating, show.popularity);
                    ScoredShow {
                        position,
                        combined,
                        show,
                    }
                })
                .collect();

            rank(scored, count)
        })
        .await?;

        Ok(ranked
            .into_iter()
            .map(|scored| {
                let reason = generate_reason(&scored.show, &favorite_genres);
                RecommendationCandidate {
                    show_id: scored.show.id,
                    genres: scored.show.genre_names(),
                    title: scored.show.title,
                    show_type: scored.show.show_type,
                    rating: scored.show.rating,
                    score: display_score(scored.combined),
                    reason,
                    source: CandidateSource::Model,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn show(rating: f64) -> Show {
        Show {
            id: Uuid::new_v4(),
            title: "Show".into(),
            show_type: ShowType::Scripted,
            rating,
            popularity: 10.0,
            genres: vec![],
        }
    }

    #[test]
    fn test_combined_score_formula() {
        let w = ScoringWeights::default();
        let score = w.combined_score(Prediction::Ok(5.0), 8.0, 50.0);
        assert!((score - (0.6 * 5.0 + 0.2 * 8.0 + 0.2 * 5.0)).abs() < 1e-9);
    }

    #[test]
    fn test_combined_score_clamps_model_output() {
        let w = ScoringWeights::default();
        let high = w.combined_score(Prediction::Ok(250.0), 0.0, 0.0);
        let low = w.combined_score(Prediction::Ok(-3.0), 0.0, 0.0);
        assert!((high - 6.0).abs() < 1e-9);
        assert_eq!(low, 0.0);
    }

    #[test]
    fn test_nan_prediction_contributes_nothing() {
        let w = ScoringWeights::default();
        let score = w.combined_score(Prediction::Ok(f32::NAN), 8.0, 50.0);
        assert!((score - (0.2 * 8.0 + 0.2 * 5.0)).abs() < 1e-9);
    }

    #[test]
    fn test_failed_prediction_uses_degraded_formula() {
        let w = ScoringWeights::default();
        let score = w.combined_score(Prediction::Failed, 8.0, 50.0);
        assert!((score - (0.5 * 8.0 + 0.5 * 5.0)).abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_inputs_never_yield_nan() {
        let w = ScoringWeights::default();
        assert_eq!(w.combined_score(Prediction::Failed, f64::NAN, 1.0), 0.0);
        assert_eq!(w.combined_score(Prediction::Ok(1.0), 1.0, f64::INFINITY), 0.0);
    }

    #[test]
    fn test_display_score_bounds_and_rounding() {
        assert_eq!(display_score(f64::NAN), 0.0);
        assert_eq!(display_score(-4.0), 0.0);
        assert_eq!(display_score(42.0), 100.0);
        assert_eq!(display_score(f64::INFINITY), 100.0);
        assert_eq!(display_score(7.234), 72.3);
        assert_eq!(display_score(7.236), 72.4);
    }

    #[test]
    fn test_rank_breaks_ties_by_catalog_order() {
        let scored = vec![
            ScoredShow { position: 0, combined: 3.0, show: show(1.0) },
            ScoredShow { position: 1, combined: 5.0, show: show(2.0) },
            ScoredShow { position: 2, combined: 3.0, show: show(3.0) },
            ScoredShow { position: 3, combined: 5.0, show: show(4.0) },
        ];

        let ranked = rank(scored, 3);
        let positions: Vec<usize> = ranked.iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![1, 3, 0]);
    }
}
