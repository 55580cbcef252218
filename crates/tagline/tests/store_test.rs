//! Integration tests for the tag store's write and query paths.

use alopex_tagline::{
    Cancellation, HistoryQuery, KeyDiff, PolicySet, RetentionLimits, RetentionPolicy,
    StoreConfig, SyncMode, TagError, TagMutation, TagStore, WalConfig,
};
use std::collections::BTreeMap;
use tempfile::TempDir;

const SECOND: i64 = 1_000_000_000;
const T0: i64 = 1_705_318_245_000_000_000;

fn test_config() -> StoreConfig {
    StoreConfig::default()
        .with_shard_count(4)
        .with_wal_config(WalConfig::default().with_sync_mode(SyncMode::None))
}

fn open_store(config: StoreConfig) -> (TempDir, TagStore) {
    let temp_dir = TempDir::new().unwrap();
    let store = TagStore::open(temp_dir.path(), config).unwrap();
    (temp_dir, store)
}

#[test]
fn test_sensor_history_with_two_version_limit() {
    let policies = PolicySet::new().with_policy(RetentionPolicy::for_type(
        "sensor",
        RetentionLimits::unlimited().with_max_versions(2),
    ));
    let (_dir, store) = open_store(test_config().with_policies(policies));

    let id = store
        .create_entity("telemetry", "sensor", &[TagMutation::parse("type:sensor").unwrap().at(T0)], Vec::new())
        .unwrap();
    store.append_tags(id, &[TagMutation::set("value", "10")], Some(T0)).unwrap();
    store.append_tags(id, &[TagMutation::set("value", "20")], Some(T0 + SECOND)).unwrap();
    store.append_tags(id, &[TagMutation::set("value", "30")], Some(T0 + 2 * SECOND)).unwrap();

    let history: Vec<(String, i64)> = store
        .get_history(id, HistoryQuery::for_key("value"), Cancellation::none())
        .unwrap()
        .map(|v| {
            let v = v.unwrap();
            (v.value, v.timestamp)
        })
        .collect();
    assert_eq!(
        history,
        vec![("20".to_string(), T0 + SECOND), ("30".to_string(), T0 + 2 * SECOND)]
    );

    let snapshot = store
        .get_as_of(id, T0 + SECOND + SECOND / 2, &Cancellation::none())
        .unwrap();
    assert_eq!(snapshot.get("value").map(String::as_str), Some("20"));
    assert_eq!(snapshot.get("type").map(String::as_str), Some("sensor"));
}

#[test]
fn test_metric_policy_keeps_newest_thousand() {
    let (_dir, store) = open_store(test_config().with_policies(PolicySet::builtin()));
    let id = store.create_entity("", "metric", &[], Vec::new()).unwrap();

    for i in 0..1200 {
        store
            .append_tags(id, &[TagMutation::set("cpu", i.to_string())], None)
            .unwrap();
    }

    let versions: Vec<String> = store
        .get_history(id, HistoryQuery::for_key("cpu"), Cancellation::none())
        .unwrap()
        .map(|v| v.unwrap().value)
        .collect();
    assert_eq!(versions.len(), 1000);
    assert_eq!(versions.first().map(String::as_str), Some("200"));
    assert_eq!(versions.last().map(String::as_str), Some("1199"));
    assert_eq!(store.get_tag(id, "cpu").unwrap().as_deref(), Some("1199"));
    assert_eq!(store.stats().version_count, 1000);
}

#[test]
fn test_as_of_after_last_write_equals_latest() {
    let (_dir, store) = open_store(test_config());
    let id = store
        .create_entity("ds", "device", &[TagMutation::set("state", "idle").at(T0)], Vec::new())
        .unwrap();
    store
        .append_tags(id, &[TagMutation::set("state", "busy"), TagMutation::set("load", "0.7")], Some(T0 + SECOND))
        .unwrap();
    store.append_tags(id, &[TagMutation::delete("load")], Some(T0 + 2 * SECOND)).unwrap();

    let latest = store.get_latest(id).unwrap();
    let last_write = store.get_entity(id).unwrap().last_write;
    for ts in [last_write, last_write + 1, i64::MAX] {
        assert_eq!(store.get_as_of(id, ts, &Cancellation::none()).unwrap(), latest);
    }
    assert_eq!(latest, BTreeMap::from([("state".to_string(), "busy".to_string())]));
}

#[test]
fn test_diff_between_equal_timestamps_is_empty() {
    let (_dir, store) = open_store(test_config());
    let id = store
        .create_entity("ds", "device", &[TagMutation::set("a", "1").at(T0)], Vec::new())
        .unwrap();
    store.append_tags(id, &[TagMutation::set("a", "2")], Some(T0 + SECOND)).unwrap();

    for t in [0, T0, T0 + SECOND / 2, T0 + SECOND, i64::MAX] {
        assert!(store.get_diff(id, t, t, &Cancellation::none()).unwrap().is_empty());
    }

    let diff = store.get_diff(id, T0, T0 + SECOND, &Cancellation::none()).unwrap();
    assert_eq!(
        diff,
        vec![KeyDiff {
            key: "a".to_string(),
            before: Some("1".to_string()),
            after: Some("2".to_string()),
        }]
    );
}

#[test]
fn test_unknown_entity_is_not_found() {
    let (_dir, store) = open_store(test_config());
    let id = alopex_tagline::EntityId::generate();
    let none = Cancellation::none();

    assert!(matches!(store.append_tags(id, &[TagMutation::set("a", "1")], None), Err(TagError::NotFound(e)) if e == id));
    assert!(matches!(store.get_latest(id), Err(TagError::NotFound(_))));
    assert!(matches!(store.get_as_of(id, T0, &none), Err(TagError::NotFound(_))));
    assert!(matches!(store.get_history(id, HistoryQuery::all(), none.clone()), Err(TagError::NotFound(_))));
    assert!(matches!(store.get_diff(id, 0, T0, &none), Err(TagError::NotFound(_))));
    assert!(matches!(store.get_tag(id, "a"), Err(TagError::NotFound(_))));
    assert!(matches!(store.delete_entity(id), Err(TagError::NotFound(_))));
}

#[test]
fn test_as_of_before_creation_is_not_found() {
    let (_dir, store) = open_store(test_config());
    let id = store
        .create_entity("ds", "device", &[TagMutation::set("a", "1").at(T0)], Vec::new())
        .unwrap();

    assert_eq!(store.get_entity(id).unwrap().created_at, T0);
    assert!(matches!(
        store.get_as_of(id, T0 - 1, &Cancellation::none()),
        Err(TagError::NotFound(_))
    ));
    assert!(matches!(store.get_tag_as_of(id, "a", T0 - 1), Err(TagError::NotFound(_))));
    assert_eq!(store.get_tag_as_of(id, "a", T0).unwrap().as_deref(), Some("1"));
    assert_eq!(store.get_tag_as_of(id, "never", T0).unwrap(), None);
}

#[test]
fn test_out_of_order_timestamp_rejected() {
    let (_dir, store) = open_store(test_config());
    let id = store.create_entity("ds", "device", &[], Vec::new()).unwrap();
    let created_at = store.get_entity(id).unwrap().created_at;

    store
        .append_tags(id, &[TagMutation::set("a", "1").at(created_at + 10 * SECOND)], None)
        .unwrap();

    let result = store.append_tags(
        id,
        &[TagMutation::set("b", "x"), TagMutation::set("a", "stale").at(created_at + SECOND)],
        None,
    );
    assert!(matches!(result, Err(TagError::InvalidTimestamp { ref key, .. }) if key == "a"));
    // All-or-nothing: "b" was not written either.
    assert_eq!(store.get_tag(id, "b").unwrap(), None);

    // Equal timestamps are ordered by sequence.
    let handles = store
        .append_tags(id, &[TagMutation::set("a", "2").at(created_at + 10 * SECOND)], None)
        .unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(store.get_tag(id, "a").unwrap().as_deref(), Some("2"));
}

#[test]
fn test_untimed_writes_follow_explicit_future_write() {
    let (_dir, store) = open_store(test_config());
    let id = store.create_entity("ds", "device", &[], Vec::new()).unwrap();
    let future = i64::MAX / 2;

    store.append_tags(id, &[TagMutation::set("a", "1").at(future)], None).unwrap();
    let handles = store.append_tags(id, &[TagMutation::set("a", "2")], None).unwrap();
    assert_eq!(handles[0].timestamp, future);
    assert_eq!(store.get_tag(id, "a").unwrap().as_deref(), Some("2"));
}

#[test]
fn test_retention_fails_open_without_policy_selector() {
    let policies = PolicySet::new().with_policy(RetentionPolicy::for_dataset(
        "",
        RetentionLimits::unlimited().with_max_versions(1),
    ));
    let (_dir, store) = open_store(test_config().with_policies(policies));
    let id = store.create_entity("", "", &[], Vec::new()).unwrap();

    for i in 0..5 {
        store.append_tags(id, &[TagMutation::set("a", i.to_string())], None).unwrap();
    }

    let info = store.get_entity(id).unwrap();
    assert_eq!(info.version_count, 5);
}

#[test]
fn test_update_policy_applies_to_later_writes() {
    let (_dir, store) = open_store(test_config());
    let id = store.create_entity("ds", "gauge", &[], Vec::new()).unwrap();
    for i in 0..10 {
        store.append_tags(id, &[TagMutation::set("v", i.to_string())], None).unwrap();
    }
    assert_eq!(store.get_entity(id).unwrap().version_count, 10);

    let previous = store.update_policy(RetentionPolicy::for_type(
        "gauge",
        RetentionLimits::unlimited().with_max_versions(3),
    ));
    assert!(previous.is_none());
    assert_eq!(store.policies().len(), 1);

    store.append_tags(id, &[TagMutation::set("v", "10")], None).unwrap();
    let values: Vec<String> = store
        .get_history(id, HistoryQuery::for_key("v"), Cancellation::none())
        .unwrap()
        .map(|v| v.unwrap().value)
        .collect();
    assert_eq!(values, vec!["8", "9", "10"]);
}

#[test]
fn test_history_across_keys_in_time_order() {
    let (_dir, store) = open_store(test_config().with_history_page_size(2));
    let id = store
        .create_entity("ds", "device", &[TagMutation::set("b", "0").at(T0)], Vec::new())
        .unwrap();
    for i in 1..=5 {
        let key = if i % 2 == 0 { "a" } else { "b" };
        store
            .append_tags(id, &[TagMutation::set(key, i.to_string())], Some(T0 + i * SECOND))
            .unwrap();
    }

    let all: Vec<(String, String)> = store
        .get_history(id, HistoryQuery::all(), Cancellation::none())
        .unwrap()
        .map(|v| {
            let v = v.unwrap();
            (v.key, v.value)
        })
        .collect();
    assert_eq!(all.len(), 6);
    assert_eq!(all[0], ("b".to_string(), "0".to_string()));
    assert_eq!(all[5], ("b".to_string(), "5".to_string()));

    let window: Vec<i64> = store
        .get_history(
            id,
            HistoryQuery::all().since(T0 + 2 * SECOND).until(T0 + 4 * SECOND),
            Cancellation::none(),
        )
        .unwrap()
        .map(|v| v.unwrap().timestamp)
        .collect();
    assert_eq!(window, vec![T0 + 2 * SECOND, T0 + 3 * SECOND, T0 + 4 * SECOND]);

    let mut history = store
        .get_history(id, HistoryQuery::for_key("a"), Cancellation::none())
        .unwrap();
    assert_eq!(history.by_ref().count(), 2);
    history.restart();
    assert_eq!(history.count(), 2);
}

#[test]
fn test_delete_entity_removes_everything() {
    let (_dir, store) = open_store(test_config());
    let keep = store
        .create_entity("ds", "device", &[TagMutation::set("a", "1").at(T0)], Vec::new())
        .unwrap();
    let doomed = store
        .create_entity("ds", "device", &[TagMutation::set("a", "1").at(T0)], b"payload".to_vec())
        .unwrap();
    assert_eq!(store.get_entity(doomed).unwrap().content, b"payload");

    store.delete_entity(doomed).unwrap();

    assert!(matches!(store.get_latest(doomed), Err(TagError::NotFound(_))));
    assert!(matches!(store.get_entity(doomed), Err(TagError::NotFound(_))));
    let feed = store.get_changes_since(0, 100, None, &Cancellation::none()).unwrap();
    assert!(feed.changes.iter().all(|c| c.entity_id == keep));
    assert_eq!(store.stats().entity_count, 1);
}

#[test]
fn test_get_tag_uses_filter_and_timeline() {
    let (_dir, store) = open_store(test_config());
    let id = store
        .create_entity("ds", "device", &[TagMutation::set("a", "1")], Vec::new())
        .unwrap();
    store.append_tags(id, &[TagMutation::delete("a")], None).unwrap();

    assert_eq!(store.get_tag(id, "never-written").unwrap(), None);
    // The filter still reports "a"; the timeline answers.
    assert_eq!(store.get_tag(id, "a").unwrap(), None);

    let pairs = store.rebuild_filters();
    assert_eq!(pairs, 1);
    assert_eq!(store.get_tag(id, "a").unwrap(), None);
}

#[test]
fn test_wire_tags() {
    let (_dir, store) = open_store(test_config());
    let id = store.create_entity("ds", "device", &[], Vec::new()).unwrap();
    let created_at = store.get_entity(id).unwrap().created_at;

    let explicit = format!("{}|status:active", created_at + SECOND);
    let handles = store
        .append_wire_tags(id, &["url:https://example.com", explicit.as_str()])
        .unwrap();
    assert_eq!(handles.len(), 2);
    assert_eq!(handles[1].timestamp, created_at + SECOND);

    let latest = store.get_latest(id).unwrap();
    assert_eq!(latest.get("url").map(String::as_str), Some("https://example.com"));
    assert_eq!(latest.get("status").map(String::as_str), Some("active"));

    assert!(matches!(
        store.append_wire_tags(id, &["soon|status:x"]),
        Err(TagError::InvalidTimestamp { .. })
    ));
}

#[test]
fn test_cancelled_reads() {
    let (_dir, store) = open_store(test_config());
    let id = store
        .create_entity("ds", "device", &[TagMutation::set("a", "1")], Vec::new())
        .unwrap();

    let cancel = Cancellation::cancellable();
    cancel.cancel();
    assert!(matches!(store.get_as_of(id, i64::MAX, &cancel), Err(TagError::Cancelled)));
    assert!(matches!(
        store.get_changes_since(0, 10, None, &cancel),
        Err(TagError::Cancelled)
    ));

    let mut history = store.get_history(id, HistoryQuery::all(), cancel).unwrap();
    assert!(matches!(history.next(), Some(Err(TagError::Cancelled))));
    assert!(history.next().is_none());

    let expired = Cancellation::with_timeout(std::time::Duration::ZERO);
    assert!(matches!(
        store.get_diff(id, 0, i64::MAX, &expired),
        Err(TagError::DeadlineExceeded)
    ));
}
