//! Topic namespace and pattern handling
//!
//! Topic names are `/`-delimited. Patterns may use `+` (exactly one level)
//! and `#` (one or more trailing levels). The tree only ever stores
//! concrete topics; patterns are evaluated against it on every operation.

mod tree;
pub mod validation;


pub use tree::{Resolution, Resolved, TopicNode, TopicTree};
pub use validation::{
    has_wildcard, parse_levels, topic_matches_filter, validate_topic_filter, TopicLevel,
};

/// A validated topic pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    wildcard: bool,
}

impl TopicPattern {
    /// Validate and wrap a pattern string
    pub fn parse(pattern: &str) -> Result<Self, &'static str> {
        validate_topic_filter(pattern)?;
        Ok(Self {
            raw: pattern.to_string(),
            wildcard: has_wildcard(pattern),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    pub fn levels(&self) -> Vec<TopicLevel<'_>> {
        parse_levels(&self.raw).collect()
    }

    /// Whether this pattern denotes the concrete topic `name`
    pub fn matches(&self, name: &str) -> bool {
        if self.wildcard {
            topic_matches_filter(name, &self.raw)
        } else {
            self.raw == name
        }
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}
