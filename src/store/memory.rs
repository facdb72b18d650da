//! In-process store used by tests and local runs without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use super::{
    CatalogStore, InteractionStore, ModelStorage, RecommendationReader, RecommendationWriter,
    TokenStore, UserDirectory,
};
use crate::error::{Error, Result};
use crate::recommendation::catalog::{Interaction, Show};
use crate::recommendation::materializer::RecommendationRow;

#[derive(Debug, Clone)]
struct RefreshToken {
    expires_at: DateTime<Utc>,
    revoked: bool,
}

#[derive(Default)]
struct Inner {
    /// user id -> soft-deleted flag
    users: BTreeMap<Uuid, bool>,
    /// Keyed by id, so iteration is catalog order
    shows: BTreeMap<Uuid, Show>,
    favorites: Vec<Interaction>,
    recommendations: Vec<RecommendationRow>,
    tokens: Vec<RefreshToken>,
    artifact: Option<Vec<u8>>,
    failing_users: HashSet<Uuid>,
    fail_artifact_saves: bool,
}

/// Implements every store trait over plain collections
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_user(&self, user_id: Uuid) {
        self.write().users.insert(user_id, false);
    }

    pub fn delete_user(&self, user_id: Uuid) {
        if let Some(deleted) = self.write().users.get_mut(&user_id) {
            *deleted = true;
        }
    }

    pub fn add_show(&self, show: Show) {
        self.write().shows.insert(show.id, show);
    }

    /// Record a favorite; repeats are ignored
    pub fn add_favorite(&self, user_id: Uuid, show_id: Uuid) {
        let mut inner = self.write();
        if inner
            .favorites
            .iter()
            .any(|f| f.user_id == user_id && f.show_id == show_id)
        {
            return;
        }
        inner.favorites.push(Interaction {
            user_id,
            show_id,
            added_at: Utc::now(),
        });
    }

    pub fn add_refresh_token(&self, expires_at: DateTime<Utc>, revoked: bool) {
        self.write().tokens.push(RefreshToken {
            expires_at,
            revoked,
        });
    }

    pub fn token_count(&self) -> usize {
        self.read().tokens.len()
    }

    /// Make writes for this user fail, as a broken row would in the database
    pub fn fail_writes_for(&self, user_id: Uuid) {
        self.write().failing_users.insert(user_id);
    }

    pub fn fail_artifact_saves(&self, fail: bool) {
        self.write().fail_artifact_saves = fail;
    }

    pub fn stored_recommendations(&self, user_id: Uuid) -> Vec<RecommendationRow> {
        self.read()
            .recommendations
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn has_artifact(&self) -> bool {
        self.read().artifact.is_some()
    }

    fn is_active(inner: &Inner, user_id: &Uuid) -> bool {
        matches!(inner.users.get(user_id), Some(false))
    }
}

#[async_trait]
impl InteractionStore for MemoryStore {
    async fn list_favorite_interactions(&self) -> Result<Vec<(Uuid, Uuid)>> {
        let inner = self.read();
        Ok(inner
            .favorites
            .iter()
            .filter(|f| Self::is_active(&inner, &f.user_id) && inner.shows.contains_key(&f.show_id))
            .map(|f| (f.user_id, f.show_id))
            .collect())
    }

    async fn list_favorite_show_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .read()
            .favorites
            .iter()
            .filter(|f| f.user_id == user_id)
            .map(|f| f.show_id)
            .collect())
    }

    async fn list_favorite_genre_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let inner = self.read();
        let mut seen = HashSet::new();
        let mut genres = Vec::new();
        for fav in inner.favorites.iter().filter(|f| f.user_id == user_id) {
            if let Some(show) = inner.shows.get(&fav.show_id) {
                for genre in &show.genres {
                    if seen.insert(genre.id) {
                        genres.push(genre.id);
                    }
                }
            }
        }
        Ok(genres)
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn get_show(&self, show_id: Uuid) -> Result<Option<Show>> {
        Ok(self.read().shows.get(&show_id).cloned())
    }

    async fn list_shows_excluding(&self, exclude: &[Uuid]) -> Result<Vec<Show>> {
        Ok(self
            .read()
            .shows
            .values()
            .filter(|s| !exclude.contains(&s.id))
            .cloned()
            .collect())
    }

    async fn list_shows_by_genres(&self, genre_ids: &[Uuid], exclude: &[Uuid]) -> Result<Vec<Show>> {
        let wanted: HashSet<Uuid> = genre_ids.iter().copied().collect();
        let mut shows: Vec<Show> = self
            .read()
            .shows
            .values()
            .filter(|s| !exclude.contains(&s.id) && s.has_any_genre(&wanted))
            .cloned()
            .collect();
        // Stable sort keeps id order among equal ratings
        shows.sort_by(|a, b| b.rating.total_cmp(&a.rating));
        Ok(shows)
    }

    async fn list_top_popular(&self, exclude: &[Uuid], n: usize) -> Result<Vec<Show>> {
        let mut shows: Vec<Show> = self
            .read()
            .shows
            .values()
            .filter(|s| !exclude.contains(&s.id))
            .cloned()
            .collect();
        shows.sort_by(|a, b| b.popularity.total_cmp(&a.popularity));
        shows.truncate(n);
        Ok(shows)
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn user_exists(&self, user_id: Uuid) -> Result<bool> {
        Ok(Self::is_active(&self.read(), &user_id))
    }

    async fn list_active_user_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self
            .read()
            .users
            .iter()
            .filter(|(_, deleted)| !**deleted)
            .map(|(id, _)| *id)
            .collect())
    }
}

#[async_trait]
impl ModelStorage for MemoryStore {
    async fn save_artifact(&self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.write();
        if inner.fail_artifact_saves {
            return Err(Error::ModelStorage {
                message: "artifact store unavailable".into(),
                source: None,
            });
        }
        inner.artifact = Some(bytes.to_vec());
        Ok(())
    }

    async fn load_artifact(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.read().artifact.clone())
    }
}

#[async_trait]
impl RecommendationWriter for MemoryStore {
    async fn replace_user_recommendations(
        &self,
        user_id: Uuid,
        rows: &[RecommendationRow],
    ) -> Result<()> {
        let mut inner = self.write();
        if inner.failing_users.contains(&user_id) {
            return Err(Error::database(format!(
                "failed to write recommendations for {}",
                user_id
            )));
        }
        inner.recommendations.retain(|r| r.user_id != user_id);
        inner.recommendations.extend(rows.iter().cloned());
        Ok(())
    }
}

#[async_trait]
impl RecommendationReader for MemoryStore {
    async fn list_user_recommendations(&self, user_id: Uuid) -> Result<Vec<RecommendationRow>> {
        let mut rows = self.stored_recommendations(user_id);
        rows.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(rows)
    }

    async fn list_unsent_by_user(&self) -> Result<Vec<(Uuid, Vec<RecommendationRow>)>> {
        let inner = self.read();
        let mut grouped: BTreeMap<Uuid, Vec<RecommendationRow>> = BTreeMap::new();
        for row in inner
            .recommendations
            .iter()
            .filter(|r| !r.email_sent && Self::is_active(&inner, &r.user_id))
        {
            grouped.entry(row.user_id).or_default().push(row.clone());
        }
        for rows in grouped.values_mut() {
            rows.sort_by(|a, b| b.score.total_cmp(&a.score));
        }
        Ok(grouped.into_iter().collect())
    }

    async fn mark_email_sent(&self, row_ids: &[Uuid]) -> Result<u64> {
        let now = Utc::now();
        let mut marked = 0;
        for row in self
            .write()
            .recommendations
            .iter_mut()
            .filter(|r| row_ids.contains(&r.id))
        {
            row.email_sent = true;
            row.email_sent_at = Some(now);
            marked += 1;
        }
        Ok(marked)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn prune_expired_tokens(&self) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.write();
        let before = inner.tokens.len();
        inner.tokens.retain(|t| t.expires_at >= now && !t.revoked);
        Ok((before - inner.tokens.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recommendation::catalog::{Genre, ShowType};
    use chrono::Duration;

    fn show(rating: f64, popularity: f64, genres: Vec<Genre>) -> Show {
        Show {
            id: Uuid::new_v4(),
            title: "Show".into(),
            show_type: ShowType::Scripted,
            rating,
            popularity,
            genres,
        }
    }

    #[tokio::test]
    async fn test_favorites_are_deduplicated() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let s = show(7.0, 10.0, vec![]);
        store.add_user(user);
        store.add_favorite(user, s.id);
        store.add_favorite(user, s.id);
        store.add_show(s);

        assert_eq!(store.list_favorite_interactions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_show() {
        let store = MemoryStore::new();
        let s = show(8.2, 55.0, vec![]);
        let id = s.id;
        store.add_show(s);

        let found = store.get_show(id).await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.rating, 8.2);
        assert!(store.get_show(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deleted_users_are_hidden() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.add_user(user);
        store.delete_user(user);

        assert!(!store.user_exists(user).await.unwrap());
        assert!(store.list_active_user_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_removes_expired_and_revoked() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.add_refresh_token(now - Duration::hours(1), false);
        store.add_refresh_token(now + Duration::hours(1), true);
        store.add_refresh_token(now + Duration::hours(1), false);

        assert_eq!(store.prune_expired_tokens().await.unwrap(), 2);
        assert_eq!(store.token_count(), 1);
    }

    #[tokio::test]
    async fn test_mark_email_sent() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.add_user(user);
        let row = RecommendationRow {
            id: Uuid::new_v4(),
            user_id: user,
            show_id: Uuid::new_v4(),
            score: 81.0,
            reason: "Popular show you might enjoy".into(),
            email_sent: false,
            email_sent_at: None,
            created_at: Utc::now(),
        };
        store
            .replace_user_recommendations(user, std::slice::from_ref(&row))
            .await
            .unwrap();

        assert_eq!(store.list_unsent_by_user().await.unwrap().len(), 1);
        assert_eq!(store.mark_email_sent(&[row.id]).await.unwrap(), 1);
        assert!(store.list_unsent_by_user().await.unwrap().is_empty());
    }
}
