//! Recommendation Materializer
//!
//! Precomputes recommendations for every active user and stores them as
//! rows, replacing whatever the user had before. The rows feed the saved
//! recommendations endpoint and the email digest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::engine::{RecommendationCandidate, Recommender};
use crate::error::{Error, Result};
use crate::store::{RecommendationWriter, UserDirectory};

/// A persisted recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RecommendationRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub show_id: Uuid,
    pub score: f64,
    pub reason: String,
    pub email_sent: bool,
    pub email_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RecommendationRow {
    pub fn from_candidate(user_id: Uuid, candidate: &RecommendationCandidate, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            show_id: candidate.show_id,
            score: candidate.score,
            reason: candidate.reason.clone(),
            email_sent: false,
            email_sent_at: None,
            created_at: now,
        }
    }
}

#[derive(Clone)]
pub struct Materializer {
    users: Arc<dyn UserDirectory>,
    writer: Arc<dyn RecommendationWriter>,
    recommender: Recommender,
    count: usize,
    concurrency: usize,
}

impl Materializer {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        writer: Arc<dyn RecommendationWriter>,
        recommender: Recommender,
        count: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            users,
            writer,
            recommender,
            count,
            concurrency: concurrency.max(1),
        }
    }

    /// Refresh stored recommendations for every active user.
    ///
    /// Returns how many users had their rows committed. A single user
    /// failing is logged and skipped. Failing to list users, or every user
    /// failing, is a retryable error.
    #[instrument(skip(self))]
    pub async fn materialize_all(&self) -> Result<usize> {
        let user_ids = self.users.list_active_user_ids().await?;

        if user_ids.is_empty() {
            info!("No users to materialize recommendations for");
            return Ok(0);
        }

        info!(
            "🔄 Materializing recommendations for {} users...",
            user_ids.len()
        );

        let total = user_ids.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();

        for user_id in user_ids {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(Error::internal)?;
            let this = self.clone();

            set.spawn(async move {
                let _permit = permit;
                (user_id, this.materialize_user(user_id).await)
            });
        }

        let mut committed = 0;
        let mut last_error = None;
        while let Some(res) = set.join_next().await {
            match res {
                Ok((_, Ok(_))) => committed += 1,
                Ok((user_id, Err(e))) => {
                    warn!("Failed to materialize recommendations for {}: {}", user_id, e);
                    last_error = Some(e.to_string());
                }
                Err(e) => {
                    error!("Task join error: {}", e);
                    last_error = Some(e.to_string());
                }
            }
        }

        if committed == 0 {
            let cause = last_error.unwrap_or_else(|| "no user committed".to_string());
            error!("❌ Materialization failed for all {} users", total);
            return Err(Error::database(format!(
                "recommendations could not be stored for any of {} users: {}",
                total, cause
            )));
        }

        metrics::counter!("recommendations_materialized_users_total").increment(committed as u64);
        info!(
            "✅ Recommendations materialized for {}/{} users",
            committed, total
        );
        Ok(committed)
    }

    /// Recompute and replace one user's rows, returning how many were written
    pub async fn materialize_user(&self, user_id: Uuid) -> Result<usize> {
        let candidates = self.recommender.recommend(user_id, self.count).await?;
        let now = Utc::now();
        let rows: Vec<RecommendationRow> = candidates
            .iter()
            .map(|c| RecommendationRow::from_candidate(user_id, c, now))
            .collect();

        self.writer.replace_user_recommendations(user_id, &rows).await?;
        Ok(rows.len())
    }
}
