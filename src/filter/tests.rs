#![cfg(test)]

use super::*;
use crate::config::BoardConfig;
use crate::four_chan::Board;

fn rules(config: BoardConfig) -> FilterRules {
    FilterRules::compile(&config).unwrap()
}

fn catalog_of(threads: &[(u64, u64)]) -> Catalog {
    let threads: Vec<String> = threads
        .iter()
        .map(|(no, lm)| {
            format!(
                r#"{{"no": {}, "resto": 0, "time": 1571420000, "last_modified": {}, "com": "some comment text"}}"#,
                no, lm
            )
        })
        .collect();
    let json = format!(r#"[{{"page": 1, "threads": [{}]}}]"#, threads.join(","));
    Catalog::build(Board::new("po").unwrap(), serde_json::from_str(&json).unwrap()).unwrap()
}

#[test]
fn no_lists_archives_everything() {
    let rules = rules(BoardConfig::default());
    assert!(rules.should_archive("anything", "at all"));
    assert!(rules.should_archive("", ""));
}

#[test]
fn min_chars_gate() {
    let rules = rules(BoardConfig {
        op_comment_min_chars: Some(10),
        ..BoardConfig::default()
    });
    assert!(!rules.should_archive("subject", "too short"));
    assert!(rules.should_archive("subject", "this one is long enough"));
}

#[test]
fn min_unique_chars_gate() {
    let rules = rules(BoardConfig {
        op_comment_min_chars_unique: Some(5),
        ..BoardConfig::default()
    });
    // 24 characters but only 2 distinct codepoints.
    assert!(!rules.should_archive("", "aaaaaaaaaaaabbbbbbbbbbbb"));
    assert!(rules.should_archive("", "abcde"));
}

#[test]
fn blacklist_rejects() {
    let rules = rules(BoardConfig {
        blacklist: Some("buy.*now".to_string()),
        ..BoardConfig::default()
    });
    assert!(!rules.should_archive("BUY gold NOW", "legit thread"));
    assert!(!rules.should_archive("legit subject", "buy it now"));
    assert!(rules.should_archive("legit subject", "legit thread"));
}

#[test]
fn whitelist_requires_match() {
    let rules = rules(BoardConfig {
        whitelist: Some("desktop thread".to_string()),
        ..BoardConfig::default()
    });
    assert!(rules.should_archive("DESKTOP THREAD", ""));
    assert!(rules.should_archive("", "post your desktop thread"));
    assert!(!rules.should_archive("wallpapers", "post them"));
}

#[test]
fn blacklist_beats_whitelist() {
    let rules = rules(BoardConfig {
        whitelist: Some("desktop".to_string()),
        blacklist: Some("rice".to_string()),
        ..BoardConfig::default()
    });
    assert!(!rules.should_archive("desktop rice", ""));
    assert!(rules.should_archive("desktop", ""));
}

#[test]
fn bad_pattern_fails_compilation() {
    let result = FilterRules::compile(&BoardConfig {
        whitelist: Some("(unclosed".to_string()),
        ..BoardConfig::default()
    });
    assert!(result.is_err());
}

#[test]
fn last_modified_gate() {
    let rules = rules(BoardConfig::default());
    let mut state = crate::state::BoardState::default();

    let first = filter_catalog(&catalog_of(&[(100, 10), (101, 20)]), &rules, &mut state, false);
    assert_eq!(first.modified, vec![100, 101]);
    assert_eq!(first.unmodified, 0);

    // Nothing changed: everything is gated out, but the cache is refreshed.
    let second = filter_catalog(&catalog_of(&[(100, 10), (101, 20)]), &rules, &mut state, false);
    assert!(second.modified.is_empty());
    assert_eq!(second.unmodified, 2);

    // One thread bumped, one new.
    let third = filter_catalog(
        &catalog_of(&[(100, 10), (101, 25), (102, 30)]),
        &rules,
        &mut state,
        false,
    );
    assert_eq!(third.modified, vec![101, 102]);
    assert_eq!(third.unmodified, 1);
}

#[test]
fn first_loop_seeds_everything() {
    let rules = rules(BoardConfig::default());
    let mut state = crate::state::BoardState::default();
    state.note_last_modified(100, 10);

    let outcome = filter_catalog(&catalog_of(&[(100, 10), (101, 20)]), &rules, &mut state, true);
    assert_eq!(outcome.modified, vec![100, 101]);
    assert_eq!(outcome.unmodified, 0);
    assert_eq!(state.thread_cache.get(&101), Some(&20));
}

#[test]
fn rejected_threads_do_not_touch_the_cache() {
    let rules = rules(BoardConfig {
        blacklist: Some("some comment".to_string()),
        ..BoardConfig::default()
    });
    let mut state = crate::state::BoardState::default();

    let outcome = filter_catalog(&catalog_of(&[(100, 10)]), &rules, &mut state, false);
    assert!(outcome.modified.is_empty());
    assert_eq!(outcome.unmodified, 0);
    assert!(!state.thread_cache.contains_key(&100));
}
