//! # Topic Patterns
//!
//! Events are addressed by four-segment topics:
//!
//! ```text
//! {server}/{type}/{id}/{stream}      e.g. hub/led/1234/state
//! ```
//!
//! A subscription pattern uses the same shape; `type` and `id` may be `*`,
//! which matches exactly one segment. The pattern may carry a query suffix
//! after `?` that is compiled into a predicate over the event payload.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Segment separator.
pub const SEGMENT_SEPARATOR: char = '/';
/// Separator between the pattern and its query suffix.
pub const QUERY_SEPARATOR: char = '?';
/// Single-segment wildcard.
pub const WILDCARD: &str = "*";

static LITERAL_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.:@-]+$").expect("valid segment regex"));

/// Topic grammar violations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopicError {
    /// Nothing before the query separator.
    #[error("topic is empty")]
    Empty,

    /// Not exactly four segments.
    #[error("topic '{0}' must have 4 segments (server/type/id/stream)")]
    SegmentCount(String),

    /// A segment holds characters outside the grammar, or a wildcard where
    /// none is allowed.
    #[error("invalid segment '{segment}' at position {position}")]
    Segment {
        /// Offending text.
        segment: String,
        /// Zero-based segment index.
        position: usize,
    },

    /// `?` present but nothing follows it.
    #[error("empty query after '?'")]
    EmptyQuery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
}

/// # Topic Pattern
///
/// A parsed subscription topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<Segment>,
    bare: String,
    query: Option<String>,
}

impl TopicPattern {
    /// Parses `server/type/id/stream[?query]`.
    pub fn parse(text: &str) -> Result<Self, TopicError> {
        let (bare, query) = match text.split_once(QUERY_SEPARATOR) {
            Some((bare, query)) => {
                let query = query.trim();
                if query.is_empty() {
                    return Err(TopicError::EmptyQuery);
                }
                (bare.trim(), Some(query.to_string()))
            }
            None => (text.trim(), None),
        };

        if bare.is_empty() {
            return Err(TopicError::Empty);
        }

        let parts: Vec<&str> = bare.split(SEGMENT_SEPARATOR).collect();
        if parts.len() != 4 {
            return Err(TopicError::SegmentCount(bare.to_string()));
        }

        let segments = parts
            .iter()
            .enumerate()
            .map(|(position, part)| parse_segment(part, position))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            segments,
            bare: bare.to_string(),
            query,
        })
    }

    /// The pattern without its query suffix; this is what backends receive.
    pub fn bare(&self) -> &str {
        &self.bare
    }

    /// The query suffix, if any.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// The server (peer) segment.
    pub fn server(&self) -> &str {
        match &self.segments[0] {
            Segment::Literal(s) => s,
            Segment::Any => WILDCARD,
        }
    }

    /// Whether a concrete event topic falls under this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split(SEGMENT_SEPARATOR);
        for segment in &self.segments {
            match (segment, parts.next()) {
                (_, None) => return false,
                (Segment::Any, Some(part)) => {
                    if part.is_empty() {
                        return false;
                    }
                }
                (Segment::Literal(lit), Some(part)) => {
                    if lit != part {
                        return false;
                    }
                }
            }
        }
        parts.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.query {
            Some(q) => write!(f, "{}{}{}", self.bare, QUERY_SEPARATOR, q),
            None => f.write_str(&self.bare),
        }
    }
}

fn parse_segment(part: &str, position: usize) -> Result<Segment, TopicError> {
    // Only type (1) and id (2) accept the wildcard.
    if part == WILDCARD && (position == 1 || position == 2) {
        return Ok(Segment::Any);
    }
    if LITERAL_SEGMENT.is_match(part) {
        Ok(Segment::Literal(part.to_string()))
    } else {
        Err(TopicError::Segment {
            segment: part.to_string(),
            position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_id_matches_one_segment() {
        let pattern = TopicPattern::parse("hub/led/*/state").unwrap();

        assert!(pattern.matches("hub/led/1234/state"));
        assert!(!pattern.matches("hub/photocell/1234/state"));
        assert!(!pattern.matches("hub/led/1234/extra/state"));
        assert!(!pattern.matches("hub/led//state"));
        assert!(!pattern.matches("hub/led/1234"));
    }

    #[test]
    fn test_server_segment_isolates_peers() {
        let pattern = TopicPattern::parse("hub-a/*/*/state").unwrap();

        assert!(pattern.matches("hub-a/led/1/state"));
        assert!(!pattern.matches("hub-b/led/1/state"));
        assert_eq!(pattern.server(), "hub-a");
    }

    #[test]
    fn test_query_suffix_is_split_off() {
        let pattern = TopicPattern::parse("hub/led/*/state?value > 3").unwrap();

        assert_eq!(pattern.bare(), "hub/led/*/state");
        assert_eq!(pattern.query(), Some("value > 3"));
        assert_eq!(pattern.to_string(), "hub/led/*/state?value > 3");
    }

    #[test]
    fn test_grammar_errors() {
        assert_eq!(TopicPattern::parse(""), Err(TopicError::Empty));
        assert!(matches!(
            TopicPattern::parse("hub/led/state"),
            Err(TopicError::SegmentCount(_))
        ));
        assert!(matches!(
            TopicPattern::parse("*/led/1/state"),
            Err(TopicError::Segment { position: 0, .. })
        ));
        assert!(matches!(
            TopicPattern::parse("hub/led/1/*"),
            Err(TopicError::Segment { position: 3, .. })
        ));
        assert!(matches!(
            TopicPattern::parse("hub/le d/1/state"),
            Err(TopicError::Segment { position: 1, .. })
        ));
        assert_eq!(TopicPattern::parse("hub/led/1/state?"), Err(TopicError::EmptyQuery));
    }
}
