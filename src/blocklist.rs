/// Blocked-site list model and local/server reconciliation
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::matcher::matches_wildcard;

/// Free accounts are capped at this many blocked patterns; a paying account
/// lifts the cap.
pub const FREE_PATTERN_LIMIT: usize = 5;

/// A single blocked-site rule. Uniqueness is by exact pattern string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedSite {
    pub pattern: String,
    pub created_at: DateTime<Utc>,
}

impl BlockedSite {
    pub fn new(pattern: impl Into<String>) -> BlockedSite {
        BlockedSite {
            pattern: pattern.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum BlocklistError {
    #[error("free accounts are limited to {FREE_PATTERN_LIMIT} blocked patterns")]
    PatternLimitReached,
    #[error("pattern is empty")]
    EmptyPattern,
    #[error("url has no blockable host: {0}")]
    UnblockableUrl(String),
}

/// Merge a local pattern list with the server's copy.
///
/// Policy: start from the local list in its insertion order; server entries
/// whose pattern is unknown locally are appended at the end; when both sides
/// carry the same pattern, the entry with the later `created_at` wins. The
/// result is not re-sorted by time.
pub fn merge_patterns(local: &[BlockedSite], server: &[BlockedSite]) -> Vec<BlockedSite> {
    let mut merged: Vec<BlockedSite> = local.to_vec();

    for remote in server {
        match merged.iter_mut().find(|site| site.pattern == remote.pattern) {
            Some(existing) => {
                if remote.created_at > existing.created_at {
                    *existing = remote.clone();
                }
            }
            None => merged.push(remote.clone()),
        }
    }

    merged
}

/// Find the first blocked site whose pattern matches `url`
pub fn find_blocked<'a>(url: &str, sites: &'a [BlockedSite]) -> Option<&'a BlockedSite> {
    sites.iter().find(|site| matches_wildcard(url, &site.pattern))
}

/// Build the "quick block current domain" pattern for a tab URL,
/// e.g. `https://news.example.com/a` → `*://news.example.com/*`
pub fn quick_block_pattern(url: &str) -> Result<String, BlocklistError> {
    let parsed = Url::parse(url).map_err(|_| BlocklistError::UnblockableUrl(url.to_string()))?;

    match parsed.host_str() {
        Some(host) => Ok(format!("*://{host}/*")),
        None => Err(BlocklistError::UnblockableUrl(url.to_string())),
    }
}

/// Free-tier gate for adding one more pattern to a list of `current` entries
pub fn ensure_can_add(current: usize, is_paid: bool) -> Result<(), BlocklistError> {
    if !is_paid && current >= FREE_PATTERN_LIMIT {
        return Err(BlocklistError::PatternLimitReached);
    }
    Ok(())
}
