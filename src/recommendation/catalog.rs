//! Catalog and interaction types shared by the trainer, scorer and stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of show, as stored in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShowType {
    Scripted,
    Documentary,
    Reality,
    TalkShow,
    GameShow,
    NewsShow,
    Miniseries,
    Other,
}

impl ShowType {
    /// Decode the integer code used by the `tv_shows.type` column
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ShowType::Scripted,
            1 => ShowType::Documentary,
            2 => ShowType::Reality,
            3 => ShowType::TalkShow,
            4 => ShowType::GameShow,
            5 => ShowType::NewsShow,
            6 => ShowType::Miniseries,
            _ => ShowType::Other,
        }
    }
}

impl std::fmt::Display for ShowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShowType::Scripted => write!(f, "Scripted"),
            ShowType::Documentary => write!(f, "Documentary"),
            ShowType::Reality => write!(f, "Reality"),
            ShowType::TalkShow => write!(f, "TalkShow"),
            ShowType::GameShow => write!(f, "GameShow"),
            ShowType::NewsShow => write!(f, "NewsShow"),
            ShowType::Miniseries => write!(f, "Miniseries"),
            ShowType::Other => write!(f, "Other"),
        }
    }
}

/// Genre tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Genre {
    pub id: Uuid,
    pub name: String,
}

impl Genre {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// A catalog show. Immutable for the duration of a scoring pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Show {
    pub id: Uuid,
    pub title: String,
    pub show_type: ShowType,
    /// Average rating on a 0-10 scale
    pub rating: f64,
    /// Unbounded positive popularity score
    pub popularity: f64,
    /// Genres in stored order
    pub genres: Vec<Genre>,
}

impl Show {
    pub fn genre_names(&self) -> Vec<String> {
        self.genres.iter().map(|g| g.name.clone()).collect()
    }

    pub fn has_any_genre(&self, genre_ids: &std::collections::HashSet<Uuid>) -> bool {
        self.genres.iter().any(|g| genre_ids.contains(&g.id))
    }
}

/// Implicit positive signal: the user favorited the show
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interaction {
    pub user_id: Uuid,
    pub show_id: Uuid,
    pub added_at: DateTime<Utc>,
}
