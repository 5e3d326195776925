use std::collections::HashMap;

/// Configuration-driven mapper folding the movie and TV genre vocabularies of
/// the metadata source into one list the dashboard can filter on.
#[derive(Debug, Default, Clone)]
pub struct GenreMapper {
    aliases: HashMap<String, String>,
}

impl GenreMapper {
    /// Mapper seeded with the unified labels the dashboard uses. Closely
    /// aligned movie/TV genres share a label; genres that only exist on one
    /// side are tagged with that side.
    pub fn with_defaults() -> Self {
        [
            ("Action", "Action & Adventure"),
            ("Adventure", "Action & Adventure"),
            ("War", "War & Politics"),
            ("Fantasy", "Sci-Fi & Fantasy"),
            ("Science Fiction", "Sci-Fi & Fantasy"),
            ("Music", "Musical"),
            ("Kids", "Kids (tv)"),
            ("News", "News (tv)"),
            ("Reality", "Reality (tv)"),
            ("Soap", "Soap (tv)"),
            ("Talk", "Talk (tv)"),
            ("History", "History (movie)"),
            ("Romance", "Romance (movie)"),
            ("Thriller", "Thriller (movie)"),
        ]
        .into_iter()
        .fold(Self::default(), |mapper, (raw, unified)| {
            mapper.register(raw, unified)
        })
    }

    /// Register or override the unified label for a raw genre name.
    pub fn register(mut self, raw: impl AsRef<str>, unified: impl Into<String>) -> Self {
        self.aliases
            .insert(raw.as_ref().trim().to_lowercase(), unified.into());
        self
    }

    /// Unified label for a raw genre. Unknown genres pass through trimmed;
    /// blank input maps to nothing.
    pub fn unify(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(
            self.aliases
                .get(&trimmed.to_lowercase())
                .cloned()
                .unwrap_or_else(|| trimmed.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_movie_and_tv_genres() {
        let mapper = GenreMapper::with_defaults();
        assert_eq!(
            mapper.unify("Adventure").as_deref(),
            Some("Action & Adventure")
        );
        assert_eq!(
            mapper.unify("Action & Adventure").as_deref(),
            Some("Action & Adventure")
        );
        assert_eq!(
            mapper.unify("science fiction").as_deref(),
            Some("Sci-Fi & Fantasy")
        );
        assert_eq!(
            mapper.unify("Reality").as_deref(),
            Some("Reality (tv)")
        );
    }

    #[test]
    fn unknown_genres_pass_through() {
        let mapper = GenreMapper::with_defaults();
        assert_eq!(
            mapper.unify(" Documentary ").as_deref(),
            Some("Documentary")
        );
        assert_eq!(mapper.unify("  "), None);
    }

    #[test]
    fn allows_overrides() {
        let mapper = GenreMapper::with_defaults().register("Thriller", "Thriller");
        assert_eq!(
            mapper.unify("Thriller").as_deref(),
            Some("Thriller")
        );
    }
}
