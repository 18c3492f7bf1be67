//! Per-thread update decisions: when a catalog preview can stand in for a full thread fetch, and
//! what a thread's disappearance from the catalog means.

use crate::config::DeletionConfig;
use crate::four_chan::{CatalogThread, Post};
use crate::state::{ThreadMeta, ThreadStats};


/// Why a thread is no longer in the catalog.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disappearance {
    /// Not enough tracked metadata to say anything. No database change.
    Inconclusive,
    /// Fell off the last page through normal eviction. No database change.
    Pruned,
    /// Vanished while it was still recently bumped, on an early page, and below the popularity
    /// threshold. Normal eviction can't explain that: the thread was either moderator-removed or
    /// moved to the archive, and the archive index decides which.
    ProbablyRemoved,
}

/// Classify a thread that the previous loop was tracking but the current catalog lacks.
///
/// The classifier only looks at state recorded *before* this loop's updates, and takes `now`
/// explicitly so its verdicts are reproducible.
pub fn classify_missing_thread(
    meta: Option<&ThreadMeta>,
    stats: Option<&ThreadStats>,
    config: &DeletionConfig,
    now: u64,
) -> Disappearance {
    let meta = match meta {
        Some(meta) => meta,
        None => return Disappearance::Inconclusive,
    };
    if meta.page() == 0 || meta.bump_time() == 0 {
        return Disappearance::Inconclusive;
    }

    let replies = match stats {
        Some(stats) => stats.replies,
        None => return Disappearance::Inconclusive,
    };

    let minutes_since_bump = now.saturating_sub(meta.bump_time()) / 60;
    let recently_attended = minutes_since_bump < config.not_deleted_if_bump_age_exceeds_n_min;
    let on_early_page = meta.page() < config.not_deleted_if_page_n_reached;
    let is_popular = replies >= config.not_deleted_if_n_replies;

    if recently_attended && on_early_page && !is_popular {
        Disappearance::ProbablyRemoved
    } else {
        Disappearance::Pruned
    }
}

/// Whether the catalog's `last_replies` preview provably contains exactly the replies we are
/// missing, so the thread endpoint doesn't need to be fetched at all.
///
/// Usable only when the preview is non-empty, the cached stats know the most recent reply we
/// stored, the reply count actually grew, the growth fits inside the preview, the stored reply is
/// still visible in the preview (continuity), and the preview holds exactly `growth` replies newer
/// than it.
pub fn can_use_catalog_update(
    thread: &CatalogThread,
    stats: Option<&ThreadStats>,
    last_replies: Option<&[Post]>,
) -> bool {
    let last_replies = match last_replies {
        Some(last_replies) if !last_replies.is_empty() => last_replies,
        _ => return false,
    };
    let stats = match stats {
        Some(stats) => stats,
        None => return false,
    };
    let last_seen = match stats.most_recent_reply_no {
        Some(no) => no,
        None => return false,
    };

    if thread.replies <= stats.replies {
        return false;
    }
    let growth = thread.replies - stats.replies;
    if growth > last_replies.len() as u64 {
        return false;
    }

    if !last_replies.iter().any(|reply| reply.no == last_seen) {
        return false;
    }

    let newer = last_replies.iter().filter(|reply| reply.no > last_seen).count() as u64;
    newer == growth
}

/// The new replies adopted by a catalog update: exactly the preview entries newer than the last
/// reply we stored.
pub fn catalog_update_posts(last_replies: &[Post], last_seen: u64) -> Vec<Post> {
    last_replies
        .iter()
        .filter(|reply| reply.no > last_seen)
        .cloned()
        .collect()
}
