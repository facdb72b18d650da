//! PostgreSQL implementation of the store traits.
//!
//! Queries run against the application's existing schema. Numeric columns
//! are cast to `float8` on the way out and to `numeric` on the way in.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    CatalogStore, InteractionStore, RecommendationReader, RecommendationWriter, TokenStore,
    UserDirectory,
};
use crate::error::Result;
use crate::recommendation::catalog::{Genre, Show, ShowType};
use crate::recommendation::materializer::RecommendationRow;

/// Columns and joins shared by every show query. Callers append a WHERE
/// clause, then `GROUP BY s.id` and their ordering.
const SHOW_SELECT: &str = r#"
    SELECT
        s.id,
        s.title,
        s.type AS show_type,
        COALESCE(s.rating, 0)::float8 AS rating,
        COALESCE(s.popularity, 0)::float8 AS popularity,
        COALESCE(array_agg(g.id ORDER BY g.name, g.id) FILTER (WHERE g.id IS NOT NULL), '{}'::uuid[]) AS genre_ids,
        COALESCE(array_agg(g.name ORDER BY g.name, g.id) FILTER (WHERE g.id IS NOT NULL), '{}'::text[]) AS genre_names
    FROM tv_shows s
    LEFT JOIN tv_show_genres tg ON tg.tv_show_id = s.id
    LEFT JOIN genres g ON g.id = tg.genre_id
"#;

const RECOMMENDATION_SELECT: &str = r#"
    SELECT
        r.id,
        r.user_id,
        r.tv_show_id AS show_id,
        r.score::float8 AS score,
        COALESCE(r.reason, 'Recommended for you') AS reason,
        r.email_sent,
        r.email_sent_at,
        r.created_at
    FROM user_recommendations r
"#;

#[derive(Debug, FromRow)]
struct ShowRow {
    id: Uuid,
    title: String,
    show_type: i32,
    rating: f64,
    popularity: f64,
    genre_ids: Vec<Uuid>,
    genre_names: Vec<String>,
}

impl From<ShowRow> for Show {
    fn from(row: ShowRow) -> Self {
        let genres = row
            .genre_ids
            .into_iter()
            .zip(row.genre_names)
            .map(|(id, name)| Genre::new(id, name))
            .collect();

        Show {
            id: row.id,
            title: row.title,
            show_type: ShowType::from_code(row.show_type),
            rating: row.rating,
            popularity: row.popularity,
            genres,
        }
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_shows(&self, sql: &str, binds: ShowBinds<'_>) -> Result<Vec<Show>> {
        let query = sqlx::query_as::<_, ShowRow>(sql);
        let query = match binds {
            ShowBinds::Exclude(exclude) => query.bind(exclude),
            ShowBinds::GenresExclude(genres, exclude) => query.bind(genres).bind(exclude),
            ShowBinds::ExcludeLimit(exclude, limit) => query.bind(exclude).bind(limit),
        };
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Show::from).collect())
    }
}

enum ShowBinds<'a> {
    Exclude(&'a [Uuid]),
    GenresExclude(&'a [Uuid], &'a [Uuid]),
    ExcludeLimit(&'a [Uuid], i64),
}

#[async_trait]
impl InteractionStore for PgStore {
    #[instrument(skip(self))]
    async fn list_favorite_interactions(&self) -> Result<Vec<(Uuid, Uuid)>> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid)>(
            r#"
            SELECT f.user_id, f.tv_show_id
            FROM favorite_tv_shows f
            JOIN users u ON u.id = f.user_id AND u.is_deleted = false
            JOIN tv_shows s ON s.id = f.tv_show_id AND s.is_deleted = false
            ORDER BY f.added_at, f.user_id, f.tv_show_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        debug!("Loaded {} favorite interactions", rows.len());
        Ok(rows)
    }

    async fn list_favorite_show_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT tv_show_id FROM favorite_tv_shows WHERE user_id = $1 ORDER BY added_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn list_favorite_genre_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT tg.genre_id
            FROM favorite_tv_shows f
            JOIN tv_show_genres tg ON tg.tv_show_id = f.tv_show_id
            WHERE f.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn get_show(&self, show_id: Uuid) -> Result<Option<Show>> {
        let sql = format!(
            "{} WHERE s.id = $1 AND s.is_deleted = false GROUP BY s.id",
            SHOW_SELECT
        );
        let row = sqlx::query_as::<_, ShowRow>(&sql)
            .bind(show_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Show::from))
    }

    #[instrument(skip(self, exclude), fields(excluded = exclude.len()))]
    async fn list_shows_excluding(&self, exclude: &[Uuid]) -> Result<Vec<Show>> {
        let sql = format!(
            "{} WHERE s.is_deleted = false AND NOT (s.id = ANY($1)) GROUP BY s.id ORDER BY s.id",
            SHOW_SELECT
        );
        self.fetch_shows(&sql, ShowBinds::Exclude(exclude)).await
    }

    async fn list_shows_by_genres(&self, genre_ids: &[Uuid], exclude: &[Uuid]) -> Result<Vec<Show>> {
        let sql = format!(
            r#"{}
            WHERE s.is_deleted = false
              AND NOT (s.id = ANY($2))
              AND EXISTS (
                  SELECT 1 FROM tv_show_genres x
                  WHERE x.tv_show_id = s.id AND x.genre_id = ANY($1)
              )
            GROUP BY s.id
            ORDER BY s.rating DESC NULLS LAST, s.id"#,
            SHOW_SELECT
        );
        self.fetch_shows(&sql, ShowBinds::GenresExclude(genre_ids, exclude))
            .await
    }

    async fn list_top_popular(&self, exclude: &[Uuid], n: usize) -> Result<Vec<Show>> {
        let sql = format!(
            r#"{}
            WHERE s.is_deleted = false AND NOT (s.id = ANY($1))
            GROUP BY s.id
            ORDER BY s.popularity DESC NULLS LAST, s.id
            LIMIT $2"#,
            SHOW_SELECT
        );
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        self.fetch_shows(&sql, ShowBinds::ExcludeLimit(exclude, limit))
            .await
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn user_exists(&self, user_id: Uuid) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = $1 AND is_deleted = false)",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn list_active_user_ids(&self) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>("SELECT id FROM users WHERE is_deleted = false ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[async_trait]
impl RecommendationWriter for PgStore {
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn replace_user_recommendations(
        &self,
        user_id: Uuid,
        rows: &[RecommendationRow],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM user_recommendations WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO user_recommendations
                    (id, user_id, tv_show_id, score, reason, email_sent, email_sent_at, created_at, is_deleted)
                VALUES ($1, $2, $3, CAST($4 AS numeric(5,1)), $5, $6, $7, $8, false)
                "#,
            )
            .bind(row.id)
            .bind(row.user_id)
            .bind(row.show_id)
            .bind(row.score)
            .bind(&row.reason)
            .bind(row.email_sent)
            .bind(row.email_sent_at)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl RecommendationReader for PgStore {
    async fn list_user_recommendations(&self, user_id: Uuid) -> Result<Vec<RecommendationRow>> {
        let sql = format!(
            "{} WHERE r.user_id = $1 AND r.is_deleted = false ORDER BY r.score DESC, r.created_at",
            RECOMMENDATION_SELECT
        );
        let rows = sqlx::query_as::<_, RecommendationRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn list_unsent_by_user(&self) -> Result<Vec<(Uuid, Vec<RecommendationRow>)>> {
        let sql = format!(
            r#"{}
            JOIN users u ON u.id = r.user_id AND u.is_deleted = false
            WHERE r.email_sent = false AND r.is_deleted = false
            ORDER BY r.user_id, r.score DESC"#,
            RECOMMENDATION_SELECT
        );
        let rows = sqlx::query_as::<_, RecommendationRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        let mut grouped: Vec<(Uuid, Vec<RecommendationRow>)> = Vec::new();
        for row in rows {
            match grouped.last_mut() {
                Some((user_id, batch)) if *user_id == row.user_id => batch.push(row),
                _ => grouped.push((row.user_id, vec![row])),
            }
        }
        Ok(grouped)
    }

    async fn mark_email_sent(&self, row_ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE user_recommendations SET email_sent = true, email_sent_at = NOW() WHERE id = ANY($1)",
        )
        .bind(row_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TokenStore for PgStore {
    #[instrument(skip(self))]
    async fn prune_expired_tokens(&self) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < NOW() OR is_revoked = true")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
