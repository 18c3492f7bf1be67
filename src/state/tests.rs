#![cfg(test)]

use std::collections::HashMap;

use super::*;

#[test]
fn new_thread_is_modified() {
    let mut state = BoardState::default();
    assert!(state.note_last_modified(1004, 1_620_800_000));
    assert_eq!(state.thread_cache.get(&1004), Some(&1_620_800_000));
}

#[test]
fn changed_thread_is_modified() {
    let mut state = BoardState::default();
    state.note_last_modified(1002, 1_620_600_000);
    assert!(state.note_last_modified(1002, 1_620_650_000));
    assert_eq!(state.thread_cache.get(&1002), Some(&1_620_650_000));
}

#[test]
fn unchanged_thread_is_not_modified() {
    let mut state = BoardState::default();
    state.note_last_modified(1002, 1_620_600_000);
    assert!(!state.note_last_modified(1002, 1_620_600_000));
}

#[test]
fn thread_cache_prunes_oldest() {
    let mut state = BoardState::default();
    // 1001 and 1002 are the two oldest entries of 205.
    for i in 0..205u64 {
        state.note_last_modified(1001 + i, 1_620_500_000 + i);
    }
    state.prune_thread_cache();

    assert!(state.thread_cache.len() <= PER_BOARD_CACHE_CAP);
    assert!(!state.thread_cache.contains_key(&1001));
    assert!(!state.thread_cache.contains_key(&1002));
    // Newest entries survive.
    assert!(state.thread_cache.contains_key(&1205));
}

#[test]
fn eviction_leaves_slack() {
    let mut map: BoundedMap<u64, u64> = BoundedMap::new(200);
    for i in 0..205u64 {
        map.insert(i, i);
    }
    map.evict_stale(|&v| v);
    // 205 entries, 5 over the bound, plus 10 slack: 15 evicted.
    assert_eq!(map.len(), 190);
    assert!(!map.contains_key(&0));
    assert!(!map.contains_key(&14));
    assert!(map.contains_key(&15));
}

#[test]
fn under_bound_maps_are_left_alone() {
    let mut map: BoundedMap<u64, u64> = BoundedMap::new(200);
    for i in 0..200u64 {
        map.insert(i, i);
    }
    map.evict_stale(|&v| v);
    assert_eq!(map.len(), 200);
}

#[test]
fn most_recent_reply_no_never_regresses() {
    let mut state = BoardState::default();
    state.record_stats(100, 5, 1, Some(900));
    // A full fetch after the newest reply was deleted would otherwise move the marker backwards.
    state.record_stats(100, 6, 1, Some(880));
    assert_eq!(state.stats(100).unwrap().most_recent_reply_no, Some(900));

    state.record_stats(100, 7, 2, Some(915));
    let stats = state.stats(100).unwrap();
    assert_eq!(stats.most_recent_reply_no, Some(915));
    assert_eq!(stats.replies, 7);
    assert_eq!(stats.images, 2);
}

#[test]
fn meta_tracks_and_prunes_by_bump_time() {
    let mut state = BoardState::default();
    for i in 0..205u64 {
        state.track_meta(i, 1 + i % 10, 1_620_500_000 + i);
    }
    state.prune_thread_meta();
    assert!(state.thread_meta.len() <= PER_BOARD_CACHE_CAP);
    assert!(state.meta(0).is_none());
    assert_eq!(state.meta(204).map(|m| m.page()), Some(1 + 204 % 10));

    state.remove_meta(204);
    assert!(state.meta(204).is_none());
}

#[test]
fn http_cache_drops_insertion_oldest() {
    let mut cache = HttpCache::new(3);
    cache.set("a".into(), "Mon".into());
    cache.set("b".into(), "Tue".into());
    cache.set("c".into(), "Wed".into());
    // Re-setting an existing URL keeps its insertion position.
    cache.set("a".into(), "Thu".into());
    assert_eq!(cache.len(), 3);

    cache.set("d".into(), "Fri".into());
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.get("a"), None);
    assert_eq!(cache.get("b"), Some("Tue"));
    assert_eq!(cache.get("d"), Some("Fri"));
}

#[test]
fn thread_meta_serializes_as_pair() {
    let meta = ThreadMeta(3, 1_717_755_968);
    let json = serde_json::to_string(&meta).unwrap();
    assert_eq!(json, "[3,1717755968]");
    let back: ThreadMeta = serde_json::from_str(&json).unwrap();
    assert_eq!(back, meta);
}

#[test]
fn cache_files_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache").join("thread_cache.json");

    let mut per_board = HashMap::new();
    per_board.insert(123u64, 1_717_755_968u64);
    let mut file: ThreadCacheFile = HashMap::new();
    file.insert("po".to_string(), per_board);

    write_json_atomic(&path, &file).unwrap();
    let back: ThreadCacheFile = read_json(&path).unwrap();
    assert_eq!(back["po"][&123], 1_717_755_968);

    // No temp file left behind.
    let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("thread_cache.json")]);
}

#[test]
fn missing_cache_file_reads_as_none() {
    let dir = tempfile::tempdir().unwrap();
    let missing: Option<ThreadCacheFile> = read_json(&dir.path().join("nope.json"));
    assert!(missing.is_none());
}
