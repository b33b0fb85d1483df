//! Topic routing patterns.
//!
//! A pattern is a dot-separated list of segments. `*` matches exactly one
//! segment of a routing key, `#` matches zero or more. Any other segment must
//! match literally.

use std::fmt;

use crate::utils::error::BusError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Word(String),
    Star,
    Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutingPattern {
    pub fn parse(raw: &str) -> Result<Self, BusError> {
        let invalid = |reason: &str| BusError::InvalidPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let mut segments = Vec::new();
        for segment in raw.split('.') {
            let parsed = match segment {
                "" => return Err(invalid("empty segment")),
                "*" => Segment::Star,
                "#" => Segment::Hash,
                word if word
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
                {
                    Segment::Word(word.to_string())
                }
                _ => return Err(invalid("wildcards must be whole segments")),
            };
            segments.push(parsed);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern names a single event, without wildcards.
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| matches!(segment, Segment::Word(_)))
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        let words: Vec<&str> = routing_key.split('.').collect();
        match_segments(&self.segments, &words)
    }
}

fn match_segments(pattern: &[Segment], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((Segment::Hash, rest)) => (0..=words.len()).any(|skip| match_segments(rest, &words[skip..])),
        Some((Segment::Star, rest)) => !words.is_empty() && match_segments(rest, &words[1..]),
        Some((Segment::Word(word), rest)) => {
            words.first() == Some(&word.as_str()) && match_segments(rest, &words[1..])
        }
    }
}

impl fmt::Display for RoutingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
