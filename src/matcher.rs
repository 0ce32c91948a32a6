/// Wildcard matching for blocked-site patterns
use regex::{Regex, RegexBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,
    #[error("pattern did not compile: {0}")]
    Compile(#[from] regex::Error),
}

/// A blocked-site wildcard pattern compiled to a regex.
///
/// Translation:
/// 1. `*` → `.*` (any sequence, including empty)
/// 2. `?` → `.` (any single character)
/// 3. every other character is escaped and matches literally
/// 4. compiled case-insensitive
///
/// The regex is anchored (`^...$`): a pattern matches the whole URL, not a
/// substring of it. Patterns are expected to carry their own wildcards, e.g.
/// `*://*.facebook.com/*`. A bare `facebook.com` therefore matches only the
/// literal string `facebook.com` and cannot be tricked into matching
/// `evilfacebook.com.attacker.net`.
///
/// Examples:
/// - `*://*.facebook.com/*` matches `https://sub.facebook.com/path`
/// - `*://example.com/?` matches `https://example.com/a` but not `/ab`
/// - `a.b` matches `a.b` only, never `axb`
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    source: String,
    regex: Regex,
}

impl WildcardPattern {
    pub fn new(pattern: &str) -> Result<WildcardPattern, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let regex = RegexBuilder::new(&translate(pattern))
            .case_insensitive(true)
            .build()?;

        Ok(WildcardPattern {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    /// The original wildcard text this pattern was compiled from
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Translate a wildcard pattern into an anchored regex pattern
fn translate(pattern: &str) -> String {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push('^');

    for c in pattern.chars() {
        match c {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            c => translated.push_str(&regex::escape(&c.to_string())),
        }
    }

    translated.push('$');
    translated
}

/// One-shot convenience: compile `pattern` and test `url` against it.
///
/// An empty pattern matches nothing.
pub fn matches_wildcard(url: &str, pattern: &str) -> bool {
    WildcardPattern::new(pattern)
        .map(|p| p.is_match(url))
        .unwrap_or(false)
}
