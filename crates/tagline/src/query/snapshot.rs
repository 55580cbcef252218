//! Point-in-time reconstruction and diffs.

use crate::error::{Result, TagError};
use crate::query::Cancellation;
use crate::tag::Timestamp;
use crate::timeline::index::TimelineIndex;
use crate::timeline::{CurrentView, Entity};

/// A key whose value differs between two points in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDiff {
    /// Tag key.
    pub key: String,
    /// Value as of the first timestamp, `None` if absent.
    pub before: Option<String>,
    /// Value as of the second timestamp, `None` if absent.
    pub after: Option<String>,
}

/// Reconstructs the entity's view using only versions at or before `ts`.
///
/// Keys whose selected version is a delete are left out.
///
/// # Errors
///
/// [`TagError::NotFound`] if `ts` precedes the entity's creation, or the
/// cancellation error if `cancel` fires.
pub fn as_of(entity: &Entity, ts: Timestamp, cancel: &Cancellation) -> Result<CurrentView> {
    if ts < entity.created_at {
        return Err(TagError::NotFound(entity.id));
    }

    let mut view = CurrentView::new();
    for key in entity.timeline.keys() {
        cancel.check()?;
        if let Some(value) = entity
            .timeline
            .version_as_of(key, ts)
            .and_then(|version| version.set_value())
        {
            view.insert(key.to_string(), value.to_string());
        }
    }
    Ok(view)
}

/// Value of a single key as of `ts`.
pub fn value_as_of(entity: &Entity, key: &str, ts: Timestamp) -> Result<Option<String>> {
    if ts < entity.created_at {
        return Err(TagError::NotFound(entity.id));
    }
    Ok(entity
        .timeline
        .version_as_of(key, ts)
        .and_then(|version| version.set_value())
        .map(str::to_string))
}

/// Keys whose value as of `t1` differs from their value as of `t2`.
///
/// Only keys with a version in `(min(t1, t2), max(t1, t2)]` can differ, and
/// those are found through the index. A side before the entity's creation
/// is an empty snapshot. The result is ordered by key.
pub fn diff(
    entity: &Entity,
    index: &TimelineIndex,
    t1: Timestamp,
    t2: Timestamp,
    cancel: &Cancellation,
) -> Result<Vec<KeyDiff>> {
    let (lo, hi) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };

    let mut diffs = Vec::new();
    for key in index.keys_changed_between(entity.id, lo, hi) {
        cancel.check()?;
        let before = entity
            .timeline
            .version_as_of(&key, t1)
            .and_then(|v| v.set_value())
            .map(str::to_string);
        let after = entity
            .timeline
            .version_as_of(&key, t2)
            .and_then(|v| v.set_value())
            .map(str::to_string);
        if before != after {
            diffs.push(KeyDiff { key, before, after });
        }
    }
    Ok(diffs)
}
