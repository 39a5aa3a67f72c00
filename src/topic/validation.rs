//! Topic pattern validation and matching
//!
//! Key rules:
//! - `/` is the level separator; empty levels are ordinary literal levels
//! - Single-level wildcard (+) must occupy an entire level
//! - Multi-level wildcard (#) must occupy an entire level and be the last one
//! - `#` matches one or more remaining levels, never the prefix itself

/// Represents a level in a topic pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicLevel<'a> {
    /// Literal topic level
    Normal(&'a str),
    /// Single-level wildcard (+)
    SingleWildcard,
    /// Multi-level wildcard (#)
    MultiWildcard,
}

/// Parse a topic pattern into levels
pub fn parse_levels(topic: &str) -> impl Iterator<Item = TopicLevel<'_>> {
    topic.split('/').map(|level| match level {
        "+" => TopicLevel::SingleWildcard,
        "#" => TopicLevel::MultiWildcard,
        s => TopicLevel::Normal(s),
    })
}

/// Whether a pattern contains any wildcard character
pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains('+') || pattern.contains('#')
}

/// Validate a topic pattern (used by SUB, UNSUB, PUB and PUBRET)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic cannot be empty");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check if a topic pattern matches a concrete topic name
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let topic_levels: Vec<&str> = topic.split('/').collect();
    let filter_levels: Vec<&str> = filter.split('/').collect();

    let mut ti = 0;
    for filter_level in filter_levels {
        if filter_level == "#" {
            // at least one level must remain
            return ti < topic_levels.len();
        }

        if ti >= topic_levels.len() {
            return false;
        }

        if filter_level != "+" && filter_level != topic_levels[ti] {
            return false;
        }
        ti += 1;
    }

    ti == topic_levels.len()
}
