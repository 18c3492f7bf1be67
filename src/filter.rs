//! Catalog filtering: min-chars gates, blacklist/whitelist regexes, and the last-modified gate.
//!
//! Filters match against plain text extracted from the API's HTML fields, never against raw HTML.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};

use crate::catalog::Catalog;
use crate::config::BoardConfig;
use crate::state::BoardState;

mod tests;

/// A board's filter rules, with regexes compiled once up front.
pub struct FilterRules {
    blacklist: Option<Regex>,
    whitelist: Option<Regex>,
    op_comment_min_chars: Option<usize>,
    op_comment_min_chars_unique: Option<usize>,
}

impl FilterRules {
    pub fn compile(config: &BoardConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            blacklist: compile_search(&config.blacklist)?,
            whitelist: compile_search(&config.whitelist)?,
            op_comment_min_chars: config.op_comment_min_chars,
            op_comment_min_chars_unique: config.op_comment_min_chars_unique,
        })
    }

    /// Whether a thread's OP text passes this board's gates.
    ///
    /// A blacklist match rejects even when the whitelist would accept; with a whitelist
    /// configured, only matching threads are archived; with no lists, everything is.
    pub fn should_archive(&self, subject: &str, comment: &str) -> bool {
        if let Some(min) = self.op_comment_min_chars {
            if comment.chars().count() < min {
                return false;
            }
        }
        if let Some(min) = self.op_comment_min_chars_unique {
            let distinct: HashSet<char> = comment.chars().collect();
            if distinct.len() < min {
                return false;
            }
        }

        if let Some(blacklist) = &self.blacklist {
            if (!subject.is_empty() && blacklist.is_match(subject))
                || (!comment.is_empty() && blacklist.is_match(comment))
            {
                return false;
            }
        }

        if let Some(whitelist) = &self.whitelist {
            return (!subject.is_empty() && whitelist.is_match(subject))
                || (!comment.is_empty() && whitelist.is_match(comment));
        }

        true
    }
}

fn compile_search(pattern: &Option<String>) -> Result<Option<Regex>, regex::Error> {
    match pattern {
        Some(pattern) => Ok(Some(
            RegexBuilder::new(pattern).case_insensitive(true).build()?,
        )),
        None => Ok(None),
    }
}

/// Outcome of one catalog scan.
pub struct FilterOutcome {
    /// Threads to process this loop.
    pub modified: Vec<u64>,
    /// Threads that passed the text gates but whose `last_modified` matched the cache.
    pub unmodified: usize,
}

/// Select the catalog threads worth processing this loop.
///
/// With `seed_all` (first loop after restart, when configured), every thread that passes the text
/// gates is accepted and the last-modified cache is seeded. Otherwise a thread is accepted only
/// when its `last_modified` is unseen or differs from the cache; the cache is updated regardless.
/// The board's thread_cache is pruned after the scan.
pub fn filter_catalog(
    catalog: &Catalog,
    rules: &FilterRules,
    state: &mut BoardState,
    seed_all: bool,
) -> FilterOutcome {
    let mut modified = Vec::new();
    let mut unmodified = 0;

    for thread in catalog.threads() {
        let (subject, comment) = thread.post.plain_text();
        if !rules.should_archive(&subject, &comment) {
            continue;
        }

        let changed = state.note_last_modified(thread.no(), thread.last_modified);
        if seed_all || changed {
            modified.push(thread.no());
        } else {
            unmodified += 1;
        }
    }

    state.prune_thread_cache();
    modified.sort_unstable();

    FilterOutcome {
        modified,
        unmodified,
    }
}
