use std::collections::HashSet;

use crate::message::tags_string_to_tags_code;

const SUBSCRIBE_ALL: &str = "*";
const TAG_EXPRESSION_SEPARATOR: &str = "||";

/// Decides from a consume queue entry's tag hash whether a consumer wants the message.
pub trait MessageFilter: Send + Sync {
    fn is_matched(&self, tags_code: i64) -> bool;
}

/// Matches everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl MessageFilter for AcceptAll {
    fn is_matched(&self, _tags_code: i64) -> bool {
        true
    }
}

/// Subscription to a set of tags, or to all of them with `*`.
///
/// Matching is on tag hashes, so distinct tags that collide are let through; consumers
/// re-check the decoded tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    codes: Option<HashSet<i64>>,
}

impl TagFilter {
    pub fn all() -> Self {
        Self { codes: None }
    }

    pub fn of<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut codes = HashSet::new();
        for tag in tags {
            let tag = tag.as_ref().trim();
            if tag == SUBSCRIBE_ALL {
                return Self::all();
            }
            if !tag.is_empty() {
                codes.insert(tags_string_to_tags_code(Some(tag)));
            }
        }
        if codes.is_empty() {
            return Self::all();
        }
        Self { codes: Some(codes) }
    }

    /// Parse a `"TagA || TagB"` expression; empty or `*` subscribes to all.
    pub fn parse(expression: &str) -> Self {
        Self::of(expression.split(TAG_EXPRESSION_SEPARATOR))
    }

    pub fn is_subscribe_all(&self) -> bool {
        self.codes.is_none()
    }
}

impl MessageFilter for TagFilter {
    fn is_matched(&self, tags_code: i64) -> bool {
        match &self.codes {
            None => true,
            Some(codes) => codes.contains(&tags_code),
        }
    }
}
