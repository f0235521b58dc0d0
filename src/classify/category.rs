//! The closed classification taxonomy.

use serde::{Deserialize, Serialize};

/// Category a message is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Meeting,
    Task,
    Junk,
    Newsletter,
    Other,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Meeting,
        Category::Task,
        Category::Junk,
        Category::Newsletter,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meeting => "meeting",
            Self::Task => "task",
            Self::Junk => "junk",
            Self::Newsletter => "newsletter",
            Self::Other => "other",
        }
    }

    /// Map free-form classifier output onto the taxonomy.
    ///
    /// Matching ignores case and surrounding whitespace; anything unrecognized
    /// becomes [`Category::Other`].
    pub fn coerce(raw: &str) -> Category {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .unwrap_or(Category::Other)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_known_categories() {
        assert_eq!(Category::coerce("meeting"), Category::Meeting);
        assert_eq!(Category::coerce(" Task "), Category::Task);
        assert_eq!(Category::coerce("NEWSLETTER"), Category::Newsletter);
        assert_eq!(Category::coerce("junk"), Category::Junk);
    }

    #[test]
    fn coerce_unknown_falls_back_to_other() {
        assert_eq!(Category::coerce("spam_probably"), Category::Other);
        assert_eq!(Category::coerce(""), Category::Other);
        assert_eq!(Category::coerce("meetings"), Category::Other);
    }

    #[test]
    fn display_matches_serde() {
        for c in Category::ALL {
            let json = serde_json::to_string(&c).unwrap();
            assert_eq!(json, format!("\"{c}\""));
        }
    }
}
