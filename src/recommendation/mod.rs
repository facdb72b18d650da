//! Recommendation Module
//!
//! Hybrid show recommendations for ShowTrack users.
//!
//! ## Architecture
//!
//! 1. **Model** - Latent-factor model over the implicit favorites matrix
//! 2. **Trainer** - Periodic full retrain, persisted before it goes live
//! 3. **Engine** - Scores every unfavorited show and ranks the catalog
//! 4. **Fallback** - Genre and popularity recommendations when no model exists
//! 5. **Materializer** - Stores each user's top recommendations for the digest
//!
//! ## Scoring
//!
//! With a model, each candidate scores
//! `0.6 * model + 0.2 * rating + 0.2 * popularity / 10`, where the model
//! term is clamped to [0, 10]. Ids the model never saw predict NaN and
//! contribute a model term of 0. When the stored factors cannot score a
//! pair the candidate falls back to `0.5 * rating + 0.5 * popularity / 10`.
//! Display scores are the combined score on a 0-100 scale.

pub mod catalog;
pub mod engine;
pub mod fallback;
pub mod materializer;
pub mod metrics;
pub mod model;
pub mod reason;
pub mod trainer;

pub use catalog::{Genre, Interaction, Show, ShowType};
pub use engine::{CandidateSource, RecommendationCandidate, Recommender, ScoringWeights};
pub use materializer::{Materializer, RecommendationRow};
pub use model::{FactorModel, FactorizationParams, ModelHandle, Prediction};
pub use trainer::{ModelTrainer, SkipReason, TrainOutcome, TrainReport};
