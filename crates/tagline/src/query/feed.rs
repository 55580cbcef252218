//! Change feed pagination.
//!
//! Each shard's [`TimelineIndex`](crate::timeline::index::TimelineIndex)
//! yields its changes in [`FeedKey`] order; a page is the `limit` smallest
//! entries across all shards. The continuation token is the feed key of the
//! last entry returned, so repeating a call with the same token returns the
//! same page and following tokens neither skips nor repeats entries.

use crate::error::{Result, TagError};
use crate::tag::{EntityId, Sequence, Timestamp};
use crate::timeline::index::{Change, FeedKey};
use std::fmt;
use std::ops::Bound;
use std::str::FromStr;

/// Continuation token of the change feed.
///
/// Serialized as `timestamp:entity-uuid:sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeedToken {
    /// Timestamp of the last returned change.
    pub timestamp: Timestamp,
    /// Entity of the last returned change.
    pub entity_id: EntityId,
    /// Sequence of the last returned change.
    pub sequence: Sequence,
}

impl FeedToken {
    /// Token positioned at `change`.
    pub fn from_change(change: &Change) -> Self {
        Self {
            timestamp: change.timestamp,
            entity_id: change.entity_id,
            sequence: change.sequence,
        }
    }

    /// Feed position the token refers to.
    pub fn feed_key(&self) -> FeedKey {
        FeedKey {
            timestamp: self.timestamp,
            entity_id: self.entity_id,
            sequence: self.sequence,
        }
    }
}

impl fmt::Display for FeedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.timestamp, self.entity_id, self.sequence)
    }
}

impl FromStr for FeedToken {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TagError::InvalidTag(format!("invalid feed token '{}'", s));

        let mut parts = s.splitn(3, ':');
        let timestamp = parts
            .next()
            .and_then(|p| p.parse::<Timestamp>().ok())
            .ok_or_else(invalid)?;
        let entity_id = parts
            .next()
            .ok_or_else(invalid)?
            .parse::<EntityId>()
            .map_err(|_| invalid())?;
        let sequence = parts
            .next()
            .and_then(|p| p.parse::<Sequence>().ok())
            .ok_or_else(invalid)?;

        Ok(Self {
            timestamp,
            entity_id,
            sequence,
        })
    }
}

/// One page of the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangePage {
    /// Changes in non-decreasing timestamp order.
    pub changes: Vec<Change>,
    /// Token to pass to the next call. Points at the last returned change,
    /// or repeats the input token when the page is empty.
    pub next_token: Option<FeedToken>,
}

/// First feed position a call may return: at or after `since`, and strictly
/// after `token`.
pub fn lower_bound(since: Timestamp, token: Option<FeedToken>) -> Bound<FeedKey> {
    let since_key = FeedKey::lowest_at(since);
    match token {
        Some(token) if token.feed_key() >= since_key => Bound::Excluded(token.feed_key()),
        _ => Bound::Included(since_key),
    }
}

/// Merges per-shard pages into the `limit` smallest changes.
pub fn merge_pages(
    pages: impl IntoIterator<Item = Vec<Change>>,
    limit: usize,
    token: Option<FeedToken>,
) -> ChangePage {
    let mut changes: Vec<Change> = pages.into_iter().flatten().collect();
    changes.sort_by_key(Change::feed_key);
    changes.truncate(limit);

    let next_token = changes.last().map(FeedToken::from_change).or(token);
    ChangePage {
        changes,
        next_token,
    }
}
