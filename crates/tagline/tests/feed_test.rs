//! Change feed ordering and pagination across shards.

use alopex_tagline::{
    Cancellation, Change, FeedToken, PolicySet, RetentionLimits, RetentionPolicy, StoreConfig,
    SyncMode, TagMutation, TagStore, WalConfig,
};
use std::collections::HashSet;
use std::time::Duration;
use tempfile::TempDir;

const SECOND: i64 = 1_000_000_000;
const T0: i64 = 1_705_318_245_000_000_000;

fn test_config() -> StoreConfig {
    StoreConfig::default()
        .with_shard_count(8)
        .with_bucket_width(Duration::from_secs(10))
        .with_wal_config(WalConfig::default().with_sync_mode(SyncMode::None))
}

/// Twelve entities, each with versions spread over two minutes.
fn populate(store: &TagStore) {
    for e in 0..12 {
        let id = store
            .create_entity("ds", "device", &[TagMutation::set("kind", "gauge").at(T0)], Vec::new())
            .unwrap();
        for step in 1..=6 {
            let ts = T0 + (step * 20 + e % 3) * SECOND;
            store
                .append_tags(
                    id,
                    &[TagMutation::set("reading", step.to_string()), TagMutation::set("phase", "x")],
                    Some(ts),
                )
                .unwrap();
        }
    }
}

fn read_all(store: &TagStore, since: i64, page_size: usize) -> Vec<Change> {
    let mut all = Vec::new();
    let mut token = None;
    loop {
        let page = store
            .get_changes_since(since, page_size, token, &Cancellation::none())
            .unwrap();
        if page.changes.is_empty() {
            assert_eq!(page.next_token, token);
            return all;
        }
        assert!(page.changes.len() <= page_size);
        all.extend(page.changes);
        token = page.next_token;
    }
}

#[test]
fn test_feed_is_time_ordered() {
    let temp_dir = TempDir::new().unwrap();
    let store = TagStore::open(temp_dir.path(), test_config()).unwrap();
    populate(&store);

    let page = store
        .get_changes_since(0, 1_000, None, &Cancellation::none())
        .unwrap();
    assert_eq!(page.changes.len(), 12 * (1 + 6 * 2));
    assert!(page
        .changes
        .windows(2)
        .all(|pair| pair[0].feed_key() < pair[1].feed_key()));
    assert!(page
        .changes
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp));
}

#[test]
fn test_pages_have_no_gaps_or_duplicates() {
    let temp_dir = TempDir::new().unwrap();
    let store = TagStore::open(temp_dir.path(), test_config()).unwrap();
    populate(&store);

    let everything = store
        .get_changes_since(0, usize::MAX, None, &Cancellation::none())
        .unwrap()
        .changes;

    for page_size in [1, 7, 13, 50] {
        let paged = read_all(&store, 0, page_size);
        assert_eq!(paged, everything, "page size {}", page_size);

        let unique: HashSet<_> = paged.iter().map(Change::feed_key).collect();
        assert_eq!(unique.len(), paged.len());
    }
}

#[test]
fn test_since_filters_older_changes() {
    let temp_dir = TempDir::new().unwrap();
    let store = TagStore::open(temp_dir.path(), test_config()).unwrap();
    populate(&store);

    let since = T0 + 60 * SECOND;
    let changes = read_all(&store, since, 9);
    assert!(!changes.is_empty());
    assert!(changes.iter().all(|c| c.timestamp >= since));

    let expected = store
        .get_changes_since(0, usize::MAX, None, &Cancellation::none())
        .unwrap()
        .changes
        .into_iter()
        .filter(|c| c.timestamp >= since)
        .count();
    assert_eq!(changes.len(), expected);
}

#[test]
fn test_same_token_returns_same_page() {
    let temp_dir = TempDir::new().unwrap();
    let store = TagStore::open(temp_dir.path(), test_config()).unwrap();
    populate(&store);

    let first = store
        .get_changes_since(0, 10, None, &Cancellation::none())
        .unwrap();
    let token = first.next_token;
    assert!(token.is_some());

    let second = store
        .get_changes_since(0, 10, token, &Cancellation::none())
        .unwrap();
    let again = store
        .get_changes_since(0, 10, token, &Cancellation::none())
        .unwrap();
    assert_eq!(second, again);
    assert_ne!(second.changes, first.changes);

    // Tokens survive a trip through their text form.
    let parsed: FeedToken = token.unwrap().to_string().parse().unwrap();
    let from_text = store
        .get_changes_since(0, 10, Some(parsed), &Cancellation::none())
        .unwrap();
    assert_eq!(from_text, second);
}

#[test]
fn test_zero_limit_returns_empty_page() {
    let temp_dir = TempDir::new().unwrap();
    let store = TagStore::open(temp_dir.path(), test_config()).unwrap();
    populate(&store);

    let page = store
        .get_changes_since(0, 0, None, &Cancellation::none())
        .unwrap();
    assert!(page.changes.is_empty());
    assert_eq!(page.next_token, None);
}

#[test]
fn test_deletes_appear_without_value() {
    let temp_dir = TempDir::new().unwrap();
    let store = TagStore::open(temp_dir.path(), test_config()).unwrap();
    let id = store
        .create_entity("ds", "device", &[TagMutation::set("a", "1").at(T0)], Vec::new())
        .unwrap();
    store.append_tags(id, &[TagMutation::delete("a")], Some(T0 + SECOND)).unwrap();

    let changes = read_all(&store, 0, 10);
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].value.as_deref(), Some("1"));
    assert_eq!(changes[1].value, None);
    assert_eq!(changes[1].key, "a");
}

#[test]
fn test_pruned_versions_leave_the_feed() {
    let policies = PolicySet::new().with_policy(RetentionPolicy::for_type(
        "device",
        RetentionLimits::unlimited().with_max_versions(2),
    ));
    let temp_dir = TempDir::new().unwrap();
    let store = TagStore::open(temp_dir.path(), test_config().with_policies(policies)).unwrap();
    let id = store
        .create_entity("ds", "device", &[TagMutation::set("v", "init").at(T0 - SECOND)], Vec::new())
        .unwrap();
    for i in 0..5 {
        store
            .append_tags(id, &[TagMutation::set("v", i.to_string())], Some(T0 + i * SECOND))
            .unwrap();
    }

    let values: Vec<_> = read_all(&store, 0, 3)
        .into_iter()
        .filter_map(|c| c.value)
        .collect();
    assert_eq!(values, vec!["3", "4"]);
}
