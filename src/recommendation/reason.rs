//! Human-readable explanations attached to every recommendation.

use std::collections::HashSet;
use uuid::Uuid;

use super::catalog::Show;

/// Reason used by the popularity fallback
pub const POPULAR_REASON: &str = "Popular show you might enjoy";

/// At most this many genre names appear in a reason
const MAX_REASON_GENRES: usize = 2;

/// Explain a model-based recommendation: name up to two of the show's
/// genres the user already favors, or fall back to the show type.
pub fn generate_reason(show: &Show, favorite_genres: &HashSet<Uuid>) -> String {
    let matching = matching_genre_names(show, favorite_genres);

    if matching.is_empty() {
        format!("Highly rated {} show", show.show_type)
    } else {
        format!("Based on your love for {}", matching.join(" and "))
    }
}

/// Explain a genre-matched content-based recommendation
pub fn genre_match_reason(show: &Show, favorite_genres: &HashSet<Uuid>) -> String {
    let mut names = matching_genre_names(show, favorite_genres);
    if names.is_empty() {
        names = show
            .genres
            .iter()
            .take(MAX_REASON_GENRES)
            .map(|g| g.name.as_str())
            .collect();
    }
    format!("Similar to your favorite {} shows", names.join(", "))
}

fn matching_genre_names<'a>(show: &'a Show, favorite_genres: &HashSet<Uuid>) -> Vec<&'a str> {
    show.genres
        .iter()
        .filter(|g| favorite_genres.contains(&g.id))
        .take(MAX_REASON_GENRES)
        .map(|g| g.name.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recommendation::catalog::{Genre, ShowType};

    fn show(genres: Vec<Genre>, show_type: ShowType) -> Show {
        Show {
            id: Uuid::new_v4(),
            title: "Test".into(),
            show_type,
            rating: 8.0,
            popularity: 50.0,
            genres,
        }
    }

    #[test]
    fn test_reason_names_two_matching_genres() {
        let drama = Genre::new(Uuid::new_v4(), "Drama");
        let crime = Genre::new(Uuid::new_v4(), "Crime");
        let thriller = Genre::new(Uuid::new_v4(), "Thriller");
        let favorites: HashSet<Uuid> = [drama.id, crime.id, thriller.id].into_iter().collect();

        let s = show(vec![drama, crime, thriller], ShowType::Scripted);
        assert_eq!(
            generate_reason(&s, &favorites),
            "Based on your love for Drama and Crime"
        );
    }

    #[test]
    fn test_reason_single_match() {
        let drama = Genre::new(Uuid::new_v4(), "Drama");
        let comedy = Genre::new(Uuid::new_v4(), "Comedy");
        let favorites: HashSet<Uuid> = [comedy.id].into_iter().collect();

        let s = show(vec![drama, comedy], ShowType::Scripted);
        assert_eq!(generate_reason(&s, &favorites), "Based on your love for Comedy");
    }

    #[test]
    fn test_reason_falls_back_to_show_type() {
        let s = show(vec![Genre::new(Uuid::new_v4(), "News")], ShowType::Documentary);
        assert_eq!(
            generate_reason(&s, &HashSet::new()),
            "Highly rated Documentary show"
        );
    }

    #[test]
    fn test_genre_match_reason() {
        let drama = Genre::new(Uuid::new_v4(), "Drama");
        let crime = Genre::new(Uuid::new_v4(), "Crime");
        let favorites: HashSet<Uuid> = [crime.id].into_iter().collect();

        let s = show(vec![drama, crime], ShowType::Scripted);
        assert_eq!(
            genre_match_reason(&s, &favorites),
            "Similar to your favorite Crime shows"
        );
    }
}
