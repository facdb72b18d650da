//! Content-based recommendations, used until a model has been trained.
//!
//! Users with favorite genres get the best rated shows sharing one of
//! those genres, topped up with popular shows when there are not enough.
//! Everyone else gets the most popular shows.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::catalog::Show;
use super::engine::{round_one_decimal, CandidateSource, RecommendationCandidate};
use super::reason::{genre_match_reason, POPULAR_REASON};
use crate::error::Result;
use crate::store::{CatalogStore, InteractionStore};

const MAX_DISPLAY_SCORE: f64 = 100.0;

#[derive(Clone)]
pub struct ContentBasedRecommender {
    interactions: Arc<dyn InteractionStore>,
    catalog: Arc<dyn CatalogStore>,
}

impl ContentBasedRecommender {
    pub fn new(interactions: Arc<dyn InteractionStore>, catalog: Arc<dyn CatalogStore>) -> Self {
        Self {
            interactions,
            catalog,
        }
    }

    pub async fn recommend(
        &self,
        user_id: Uuid,
        count: usize,
        exclude: &[Uuid],
    ) -> Result<Vec<RecommendationCandidate>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let genre_ids = self.interactions.list_favorite_genre_ids(user_id).await?;

        if genre_ids.is_empty() {
            debug!("No favorite genres for {}, recommending popular shows", user_id);
            return self.popular(exclude, count).await;
        }

        let favorite_genres: HashSet<Uuid> = genre_ids.iter().copied().collect();
        let shows = self.catalog.list_shows_by_genres(&genre_ids, exclude).await?;

        let mut results: Vec<RecommendationCandidate> = shows
            .into_iter()
            .filter(|show| show.has_any_genre(&favorite_genres))
            .take(count)
            .map(|show| {
                let reason = genre_match_reason(&show, &favorite_genres);
                let score = show.rating * 10.0;
                candidate(show, score, reason, CandidateSource::Genre)
            })
            .collect();

        if results.len() < count {
            let mut taken: Vec<Uuid> = exclude.to_vec();
            taken.extend(results.iter().map(|c| c.show_id));
            let filler = self.popular(&taken, count - results.len()).await?;
            results.extend(filler);
        }

        Ok(results)
    }

    async fn popular(&self, exclude: &[Uuid], count: usize) -> Result<Vec<RecommendationCandidate>> {
        let shows = self.catalog.list_top_popular(exclude, count).await?;
        Ok(shows
            .into_iter()
            .take(count)
            .map(|show| {
                let score = show.popularity;
                candidate(show, score, POPULAR_REASON.to_string(), CandidateSource::Popular)
            })
            .collect())
    }
}

fn candidate(show: Show, raw_score: f64, reason: String, source: CandidateSource) -> RecommendationCandidate {
    let score = if raw_score.is_nan() {
        0.0
    } else {
        round_one_decimal(raw_score.clamp(0.0, MAX_DISPLAY_SCORE))
    };

    RecommendationCandidate {
        show_id: show.id,
        genres: show.genre_names(),
        title: show.title,
        show_type: show.show_type,
        rating: show.rating,
        score,
        reason,
        source,
    }
}
