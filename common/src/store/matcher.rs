// Group matchers for key queries and group-level pause/resume

use serde::{Deserialize, Serialize};

/// Selects job or trigger groups by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operator", content = "value", rename_all = "snake_case")]
pub enum GroupMatcher {
    Equals(String),
    StartsWith(String),
    EndsWith(String),
    Contains(String),
    Anything,
}

impl GroupMatcher {
    pub fn equals(group: impl Into<String>) -> Self {
        GroupMatcher::Equals(group.into())
    }

    pub fn starts_with(prefix: impl Into<String>) -> Self {
        GroupMatcher::StartsWith(prefix.into())
    }

    pub fn ends_with(suffix: impl Into<String>) -> Self {
        GroupMatcher::EndsWith(suffix.into())
    }

    pub fn contains(fragment: impl Into<String>) -> Self {
        GroupMatcher::Contains(fragment.into())
    }

    pub fn is_match(&self, group: &str) -> bool {
        match self {
            GroupMatcher::Equals(g) => group == g,
            GroupMatcher::StartsWith(p) => group.starts_with(p.as_str()),
            GroupMatcher::EndsWith(s) => group.ends_with(s.as_str()),
            GroupMatcher::Contains(f) => group.contains(f.as_str()),
            GroupMatcher::Anything => true,
        }
    }

    /// The single group an exact matcher names, allowing a direct index lookup
    pub fn exact(&self) -> Option<&str> {
        match self {
            GroupMatcher::Equals(g) => Some(g),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matchers() {
        assert!(GroupMatcher::starts_with("alerts-").is_match("alerts-eu"));
        assert!(!GroupMatcher::starts_with("alerts-").is_match("eu-alerts"));
        assert!(GroupMatcher::ends_with("-eu").is_match("alerts-eu"));
        assert!(GroupMatcher::contains("ert").is_match("alerts-eu"));
        assert!(GroupMatcher::Anything.is_match(""));
    }

    #[test]
    fn test_exact_only_for_equals() {
        assert_eq!(GroupMatcher::equals("DEFAULT").exact(), Some("DEFAULT"));
        assert_eq!(GroupMatcher::contains("DEF").exact(), None);
    }
}
