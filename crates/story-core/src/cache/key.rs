//! Structured cache keys.
//!
//! Keys render as `{projectId}:{category}:{path-or-empty}` for logging and
//! for the string pattern form accepted by
//! [`CacheStore::invalidate_pattern`](super::CacheStore::invalidate_pattern),
//! but they are stored and ordered as tuples so that every prefix selects a
//! contiguous range of the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kind of repository data held under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    FileContent,
    FileHistory,
    ProjectBranches,
    ProjectTree,
    RepositoryStatus,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 5] = [
        CacheCategory::FileContent,
        CacheCategory::FileHistory,
        CacheCategory::ProjectBranches,
        CacheCategory::ProjectTree,
        CacheCategory::RepositoryStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::FileContent => "file_content",
            CacheCategory::FileHistory => "file_history",
            CacheCategory::ProjectBranches => "project_branches",
            CacheCategory::ProjectTree => "project_tree",
            CacheCategory::RepositoryStatus => "repository_status",
        }
    }

    /// Smallest category in key order, used as a range lower bound.
    fn first() -> Self {
        CacheCategory::ALL[0]
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheCategory {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| KeyParseError::UnknownCategory(s.to_string()))
    }
}

/// Composite `(projectId, category, path?)` key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub project_id: String,
    pub category: CacheCategory,
    pub path: Option<String>,
}

impl CacheKey {
    /// Key for a per-file entry.
    pub fn file(project_id: &str, category: CacheCategory, path: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            category,
            path: Some(path.to_string()),
        }
    }

    /// Key for a project-wide entry (tree, status, branches).
    pub fn project(project_id: &str, category: CacheCategory) -> Self {
        Self {
            project_id: project_id.to_string(),
            category,
            path: None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.project_id,
            self.category,
            self.path.as_deref().unwrap_or("")
        )
    }
}

/// A selection of keys sharing a leading component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPrefix {
    /// Every entry of a project (`"{projectId}:"`).
    Project(String),
    /// Every entry of one category in a project (`"{projectId}:{category}"`).
    Category(String, CacheCategory),
    /// Entries of one category whose path starts with `path_prefix`.
    Path {
        project_id: String,
        category: CacheCategory,
        path_prefix: String,
    },
}

impl KeyPrefix {
    pub fn project(project_id: &str) -> Self {
        KeyPrefix::Project(project_id.to_string())
    }

    pub fn category(project_id: &str, category: CacheCategory) -> Self {
        KeyPrefix::Category(project_id.to_string(), category)
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            KeyPrefix::Project(p) => key.project_id == *p,
            KeyPrefix::Category(p, c) => key.project_id == *p && key.category == *c,
            KeyPrefix::Path {
                project_id,
                category,
                path_prefix,
            } => {
                key.project_id == *project_id
                    && key.category == *category
                    && key.path.as_deref().unwrap_or("").starts_with(path_prefix.as_str())
            }
        }
    }

    /// First key in store order that could match this prefix.
    pub(crate) fn lower_bound(&self) -> CacheKey {
        match self {
            KeyPrefix::Project(p) => CacheKey {
                project_id: p.clone(),
                category: CacheCategory::first(),
                path: None,
            },
            KeyPrefix::Category(p, c) => CacheKey::project(p, *c),
            KeyPrefix::Path {
                project_id,
                category,
                path_prefix,
            } => CacheKey {
                project_id: project_id.clone(),
                category: *category,
                path: (!path_prefix.is_empty()).then(|| path_prefix.clone()),
            },
        }
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPrefix::Project(p) => write!(f, "{}:", p),
            KeyPrefix::Category(p, c) => write!(f, "{}:{}", p, c),
            KeyPrefix::Path {
                project_id,
                category,
                path_prefix,
            } => write!(f, "{}:{}:{}", project_id, category, path_prefix),
        }
    }
}

impl FromStr for KeyPrefix {
    type Err = KeyParseError;

    /// Parse the string pattern form.
    ///
    /// Accepts `"{projectId}:"`, `"{projectId}:{category}"`,
    /// `"{projectId}:{category}:"` and `"{projectId}:{category}:{pathPrefix}"`.
    /// A partial category name is rejected rather than guessed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (project_id, rest) = s
            .split_once(':')
            .ok_or_else(|| KeyParseError::MissingSeparator(s.to_string()))?;
        if project_id.is_empty() {
            return Err(KeyParseError::EmptyProject);
        }
        if rest.is_empty() {
            return Ok(KeyPrefix::project(project_id));
        }

        let (category, path_prefix) = match rest.split_once(':') {
            Some((category, path)) => (category.parse::<CacheCategory>()?, path),
            None => (rest.parse::<CacheCategory>()?, ""),
        };

        if path_prefix.is_empty() {
            Ok(KeyPrefix::category(project_id, category))
        } else {
            Ok(KeyPrefix::Path {
                project_id: project_id.to_string(),
                category,
                path_prefix: path_prefix.to_string(),
            })
        }
    }
}

/// Errors parsing the string key scheme.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    #[error("pattern {0:?} has no project separator")]
    MissingSeparator(String),
    #[error("pattern has an empty project id")]
    EmptyProject,
    #[error("unknown cache category {0:?}")]
    UnknownCategory(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_uses_colon_scheme() {
        let key = CacheKey::file("p1", CacheCategory::FileContent, "scenes/1.md");
        assert_eq!(key.to_string(), "p1:file_content:scenes/1.md");

        let key = CacheKey::project("p1", CacheCategory::ProjectTree);
        assert_eq!(key.to_string(), "p1:project_tree:");
    }

    #[test]
    fn test_parse_project_prefix() {
        assert_eq!("p1:".parse::<KeyPrefix>(), Ok(KeyPrefix::project("p1")));
    }

    #[test]
    fn test_parse_category_prefix() {
        let expected = KeyPrefix::category("p1", CacheCategory::FileHistory);
        assert_eq!("p1:file_history".parse::<KeyPrefix>(), Ok(expected.clone()));
        assert_eq!("p1:file_history:".parse::<KeyPrefix>(), Ok(expected));
    }

    #[test]
    fn test_parse_path_prefix() {
        let parsed: KeyPrefix = "p1:file_content:scenes/".parse().unwrap();
        assert!(parsed.matches(&CacheKey::file("p1", CacheCategory::FileContent, "scenes/2.md")));
        assert!(!parsed.matches(&CacheKey::file("p1", CacheCategory::FileContent, "chapters/2.md")));
    }

    #[test]
    fn test_parse_rejects_partial_category() {
        assert_eq!(
            "p1:file_con".parse::<KeyPrefix>(),
            Err(KeyParseError::UnknownCategory("file_con".into()))
        );
        assert_eq!(":file_content".parse::<KeyPrefix>(), Err(KeyParseError::EmptyProject));
        assert!(matches!(
            "p1".parse::<KeyPrefix>(),
            Err(KeyParseError::MissingSeparator(_))
        ));
    }

    #[test]
    fn test_project_prefix_does_not_match_longer_project_id() {
        // "p1:" must not select "p10"'s entries.
        let prefix = KeyPrefix::project("p1");
        assert!(!prefix.matches(&CacheKey::project("p10", CacheCategory::ProjectTree)));
    }

    #[test]
    fn test_lower_bound_sorts_before_matches() {
        let prefix = KeyPrefix::category("p1", CacheCategory::FileContent);
        let bound = prefix.lower_bound();
        let key = CacheKey::file("p1", CacheCategory::FileContent, "a.md");
        assert!(bound <= key);
    }
}
