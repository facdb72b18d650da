//! Storage collaborators consumed by the recommendation core.
//!
//! Each trait is a narrow read or write port. `PgStore` implements all of
//! them against the application database, `MemoryStore` keeps everything
//! in process for tests and local runs, and `FileModelStorage` keeps the
//! trained model artifact on disk.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::recommendation::catalog::Show;
use crate::recommendation::materializer::RecommendationRow;

pub mod artifact;
pub mod memory;
pub mod postgres;

pub use artifact::FileModelStorage;
pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Favorites, read as implicit positive interactions
#[async_trait]
pub trait InteractionStore: Send + Sync {
    /// Every (user, show) favorite pair
    async fn list_favorite_interactions(&self) -> Result<Vec<(Uuid, Uuid)>>;

    async fn list_favorite_show_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>>;

    /// Distinct genre ids across the user's favorites
    async fn list_favorite_genre_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>>;
}

/// Read-only catalog access
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// A single live show, `None` when missing or deleted
    async fn get_show(&self, show_id: Uuid) -> Result<Option<Show>>;

    /// All shows not in `exclude`, ordered by show id
    async fn list_shows_excluding(&self, exclude: &[Uuid]) -> Result<Vec<Show>>;

    /// Shows sharing a genre with `genre_ids`, best rated first
    async fn list_shows_by_genres(&self, genre_ids: &[Uuid], exclude: &[Uuid])
        -> Result<Vec<Show>>;

    /// The `n` most popular shows not in `exclude`
    async fn list_top_popular(&self, exclude: &[Uuid], n: usize) -> Result<Vec<Show>>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_exists(&self, user_id: Uuid) -> Result<bool>;

    /// Ids of users that are not soft-deleted
    async fn list_active_user_ids(&self) -> Result<Vec<Uuid>>;
}

/// Durable home of the serialized model
#[async_trait]
pub trait ModelStorage: Send + Sync {
    /// Persist the artifact, replacing any previous one only once fully written
    async fn save_artifact(&self, bytes: &[u8]) -> Result<()>;

    async fn load_artifact(&self) -> Result<Option<Vec<u8>>>;
}

/// Write side of the materialized recommendation rows
#[async_trait]
pub trait RecommendationWriter: Send + Sync {
    /// Delete every row for the user and insert `rows`, atomically
    async fn replace_user_recommendations(
        &self,
        user_id: Uuid,
        rows: &[RecommendationRow],
    ) -> Result<()>;
}

/// Read side for the API and the email digest
#[async_trait]
pub trait RecommendationReader: Send + Sync {
    /// Rows for one user, highest score first
    async fn list_user_recommendations(&self, user_id: Uuid) -> Result<Vec<RecommendationRow>>;

    /// Unsent rows of active users, grouped by user
    async fn list_unsent_by_user(&self) -> Result<Vec<(Uuid, Vec<RecommendationRow>)>>;

    async fn mark_email_sent(&self, row_ids: &[Uuid]) -> Result<u64>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Delete expired or revoked refresh tokens, returning how many went
    async fn prune_expired_tokens(&self) -> Result<u64>;
}
