use std::fmt;

/// Canonicalized title name used for fallback matching across sources.
///
/// Normalization steps:
/// - lowercase (Unicode aware)
/// - every non-alphanumeric character becomes a separator
/// - runs of separators collapse into one space, ends are trimmed
///
/// "The Lord of the Rings: The Fellowship" and "the lord of the rings the
/// fellowship " produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameKey {
    normalized: String,
    year: i32,
}

impl NameKey {
    /// `None` when the name normalizes to nothing or the year is unknown; a
    /// bare name is too weak to identify a work.
    pub fn new(raw: &str, year: Option<i32>) -> Option<Self> {
        let year = year?;
        let normalized = normalize_name(raw);
        if normalized.is_empty() {
            return None;
        }
        Some(Self { normalized, year })
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl fmt::Display for NameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.normalized, self.year)
    }
}

pub fn normalize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

/// IMDb ids arrive as `tt0133093`, `TT0133093 ` or empty strings.
pub fn normalize_imdb_id(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

/// Platform labels are compared after trimming; region codes are uppercased.
pub fn normalize_platform(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn normalize_region(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_and_whitespace_variants_share_a_key() {
        let a = NameKey::new("Bar", Some(1999)).unwrap();
        let b = NameKey::new("bar ", Some(1999)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "bar:1999");
    }

    #[test]
    fn punctuation_is_stripped() {
        let a = NameKey::new("Spider-Man: No Way Home", Some(2021)).unwrap();
        let b = NameKey::new("spider man   no way home!", Some(2021)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.normalized(), "spider man no way home");
    }

    #[test]
    fn year_is_part_of_identity() {
        let a = NameKey::new("Dune", Some(1984)).unwrap();
        let b = NameKey::new("Dune", Some(2021)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn missing_year_or_empty_name_yields_no_key() {
        assert!(NameKey::new("Dune", None).is_none());
        assert!(NameKey::new(" -- ", Some(2000)).is_none());
    }

    #[test]
    fn non_ascii_letters_survive() {
        let a = NameKey::new("Amélie", Some(2001)).unwrap();
        let b = NameKey::new("AMÉLIE", Some(2001)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn imdb_and_platform_cleanup() {
        assert_eq!(normalize_imdb_id(Some(" TT0133093 ")), Some("tt0133093".into()));
        assert_eq!(normalize_imdb_id(Some("")), None);
        assert_eq!(normalize_platform("  Amazon   Prime Video "), "Amazon Prime Video");
        assert_eq!(normalize_region(" us"), "US");
    }
}
