//! Mapping API posts onto the Asagi relational layout.
//!
//! Schema notes (the following only applies to scraped posts):
//!   * `media_id` is set by triggers, `poster_ip` and `subnum` are always 0
//!   * `email` and `delpass` are always `NULL`
//!   * Timestamps are "adjusted" to America/New_York if the `adjust_timestamps` setting is on
//!   * `comment` keeps its markup; rewriting it to bbcode is the archive frontend's job

use chrono::prelude::*;
use chrono_tz::America;

use crate::four_chan::{CatalogThread, Post};
use crate::html;
use crate::media;
use crate::state::ThreadStats;

/// One `{board}` table row, keyed on `(num, subnum)`.
#[derive(Clone, Debug)]
pub struct PostRow {
    pub num: u64,
    pub subnum: u64,
    pub thread_num: u64,
    pub op: bool,
    pub timestamp: u64,
    pub timestamp_expired: u64,
    pub preview_orig: Option<String>,
    pub preview_w: u32,
    pub preview_h: u32,
    pub media_filename: Option<String>,
    pub media_w: u32,
    pub media_h: u32,
    pub media_size: u32,
    pub media_hash: Option<String>,
    pub media_orig: Option<String>,
    pub spoiler: bool,
    pub deleted: bool,
    pub capcode: String,
    pub name: Option<String>,
    pub trip: Option<String>,
    pub title: Option<String>,
    pub comment: Option<String>,
    pub sticky: bool,
    pub locked: bool,
    pub poster_hash: Option<String>,
    pub poster_country: Option<String>,
    pub exif: Option<String>,
}

impl PostRow {
    pub fn from_post(post: &Post, adjust_timestamps: bool) -> Self {
        let image = post.image.as_ref();
        Self {
            num: post.no,
            subnum: 0,
            thread_num: post.thread_no(),
            op: post.is_op(),
            timestamp: post.time.adjust(adjust_timestamps),
            timestamp_expired: post
                .op_data
                .archived_on
                .map_or(0, |time| time.adjust(adjust_timestamps)),
            preview_orig: image.map(media::thumb_filename),
            preview_w: image.map_or(0, |image| u32::from(image.thumbnail_width)),
            preview_h: image.map_or(0, |image| u32::from(image.thumbnail_height)),
            media_filename: image
                .map(|image| html::unescape(&format!("{}{}", image.filename, image.ext))),
            media_w: image.map_or(0, |image| u32::from(image.image_width)),
            media_h: image.map_or(0, |image| u32::from(image.image_height)),
            media_size: image.map_or(0, |image| image.filesize),
            media_hash: image.map(|image| image.md5.clone()),
            media_orig: image.map(media::full_filename),
            spoiler: image.map_or(false, |image| image.spoiler),
            deleted: post.file_deleted,
            capcode: asagi_capcode(post.capcode.as_deref()),
            name: post.name.as_ref().map(|name| html::unescape(name)),
            trip: post.trip.clone(),
            title: post.subject.as_ref().map(|subject| html::unescape(subject)),
            comment: post.comment.clone(),
            sticky: post.op_data.sticky,
            // All archived threads arrive closed; only count a lock that predates archival.
            locked: post.op_data.closed && !post.op_data.archived,
            poster_hash: post.id.clone(),
            poster_country: post.country_name.clone(),
            exif: post
                .unique_ips
                .filter(|&n| n > 0)
                .map(|n| serde_json::json!({ "uniqueIps": n }).to_string()),
        }
    }
}

/// One `{board}_threads` row, keyed on `thread_num`.
#[derive(Clone, Debug)]
pub struct ThreadStatsRow {
    pub thread_num: u64,
    pub time_op: u64,
    pub time_last: u64,
    pub time_bump: u64,
    pub time_ghost: Option<u64>,
    pub time_ghost_bump: Option<u64>,
    pub time_last_modified: u64,
    pub nreplies: u64,
    pub nimages: u64,
    pub sticky: bool,
    pub locked: bool,
}

impl ThreadStatsRow {
    /// Build the stats row from the catalog's view of the thread and whatever posts this loop
    /// observed for it.
    pub fn build(
        thread: &CatalogThread,
        posts: &[Post],
        stats: &ThreadStats,
        adjust_timestamps: bool,
    ) -> Self {
        let time_op = thread.post.time;
        let time_last = posts
            .iter()
            .map(|post| post.time)
            .max()
            .unwrap_or(time_op);

        Self {
            thread_num: thread.no(),
            time_op: time_op.adjust(adjust_timestamps),
            time_last: time_last.adjust(adjust_timestamps),
            time_bump: time_last.adjust(adjust_timestamps),
            time_ghost: None,
            time_ghost_bump: None,
            time_last_modified: thread.last_modified,
            nreplies: stats.replies,
            nimages: stats.images,
            sticky: thread.post.op_data.sticky,
            locked: thread.post.op_data.closed,
        }
    }
}

/// Convert an API capcode to its Asagi single-letter form.
pub fn asagi_capcode(capcode: Option<&str>) -> String {
    match capcode {
        None => "N",
        Some("mod") => "M",
        Some("admin") | Some("admin_highlight") => "A",
        Some("developer") => "D",
        Some("verified") => "V",
        Some("founder") => "F",
        Some("manager") => "G",
        Some(_) => "M",
    }
    .to_string()
}

pub trait TimestampExt {
    fn adjust(&self, adjust: bool) -> u64;
}

impl TimestampExt for u64 {
    fn adjust(&self, adjust: bool) -> u64 {
        if adjust {
            America::New_York
                .timestamp(*self as i64, 0)
                .naive_local()
                .timestamp() as u64
        } else {
            *self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op() -> Post {
        serde_json::from_str(
            r#"{
                "no": 100, "resto": 0, "time": 1571420000,
                "name": "Anonymous &amp; friends", "sub": "it&#039;s a thread",
                "com": "first <br> post", "unique_ips": 31,
                "filename": "photo &amp; co", "ext": ".jpg", "tim": 1717755968123,
                "fsize": 123456, "md5": "rl2m2jcoQVkkBVZUqpJTVA==",
                "w": 800, "h": 600, "tn_w": 250, "tn_h": 187
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn capcodes() {
        assert_eq!(asagi_capcode(None), "N");
        assert_eq!(asagi_capcode(Some("mod")), "M");
        assert_eq!(asagi_capcode(Some("admin")), "A");
        assert_eq!(asagi_capcode(Some("admin_highlight")), "A");
        assert_eq!(asagi_capcode(Some("developer")), "D");
        assert_eq!(asagi_capcode(Some("verified")), "V");
        assert_eq!(asagi_capcode(Some("founder")), "F");
        assert_eq!(asagi_capcode(Some("manager")), "G");
        assert_eq!(asagi_capcode(Some("something_new")), "M");
    }

    #[test]
    fn op_row_mapping() {
        let row = PostRow::from_post(&op(), false);
        assert_eq!(row.num, 100);
        assert_eq!(row.subnum, 0);
        assert_eq!(row.thread_num, 100);
        assert!(row.op);
        assert_eq!(row.timestamp, 1_571_420_000);
        assert_eq!(row.media_orig.as_deref(), Some("1717755968123.jpg"));
        assert_eq!(row.preview_orig.as_deref(), Some("1717755968123s.jpg"));
        assert_eq!(row.media_filename.as_deref(), Some("photo & co.jpg"));
        assert_eq!(row.media_hash.as_deref(), Some("rl2m2jcoQVkkBVZUqpJTVA=="));
        assert_eq!(row.media_size, 123_456);
        assert_eq!(row.media_w, 800);
        assert_eq!(row.preview_w, 250);
        assert_eq!(row.name.as_deref(), Some("Anonymous & friends"));
        assert_eq!(row.title.as_deref(), Some("it's a thread"));
        // Markup is preserved.
        assert_eq!(row.comment.as_deref(), Some("first <br> post"));
        assert_eq!(row.capcode, "N");
        assert_eq!(row.exif.as_deref(), Some(r#"{"uniqueIps":31}"#));
    }

    #[test]
    fn reply_row_mapping() {
        let post: Post = serde_json::from_str(
            r#"{"no": 105, "resto": 100, "time": 1571421000, "com": "bump"}"#,
        )
        .unwrap();
        let row = PostRow::from_post(&post, false);
        assert_eq!(row.thread_num, 100);
        assert!(!row.op);
        assert!(row.media_orig.is_none());
        assert!(row.preview_orig.is_none());
        assert!(row.exif.is_none());
        assert_eq!(row.media_size, 0);
    }

    #[test]
    fn archived_threads_do_not_count_as_locked() {
        let post: Post = serde_json::from_str(
            r#"{"no": 100, "resto": 0, "time": 1571420000, "closed": 1, "archived": 1,
                "archived_on": 1571430000}"#,
        )
        .unwrap();
        let row = PostRow::from_post(&post, false);
        assert!(!row.locked);
        assert_eq!(row.timestamp_expired, 1_571_430_000);

        let post: Post = serde_json::from_str(
            r#"{"no": 100, "resto": 0, "time": 1571420000, "closed": 1}"#,
        )
        .unwrap();
        assert!(PostRow::from_post(&post, false).locked);
    }

    #[test]
    fn stats_row_times() {
        let thread: CatalogThread = serde_json::from_str(
            r#"{"no": 100, "resto": 0, "time": 1571420000, "last_modified": 1571431000,
                "replies": 2, "images": 1}"#,
        )
        .unwrap();
        let posts: Vec<Post> = serde_json::from_str(
            r#"[{"no": 100, "resto": 0, "time": 1571420000},
                {"no": 105, "resto": 100, "time": 1571425000},
                {"no": 106, "resto": 100, "time": 1571424000}]"#,
        )
        .unwrap();
        let stats = ThreadStats {
            replies: 2,
            images: 1,
            most_recent_reply_no: Some(106),
        };

        let row = ThreadStatsRow::build(&thread, &posts, &stats, false);
        assert_eq!(row.thread_num, 100);
        assert_eq!(row.time_op, 1_571_420_000);
        assert_eq!(row.time_last, 1_571_425_000);
        assert_eq!(row.time_bump, 1_571_425_000);
        assert_eq!(row.time_last_modified, 1_571_431_000);
        assert_eq!(row.nreplies, 2);
        assert!(row.time_ghost.is_none());

        // A thread with no observed posts this loop falls back to the OP time.
        let row = ThreadStatsRow::build(&thread, &[], &stats, false);
        assert_eq!(row.time_last, 1_571_420_000);
    }

    #[test]
    fn timestamp_adjustment() {
        // 2019-10-18 17:33:20 UTC is 13:33:20 in New York (EDT, UTC-4).
        assert_eq!(1_571_420_000u64.adjust(false), 1_571_420_000);
        assert_eq!(1_571_420_000u64.adjust(true), 1_571_420_000 - 4 * 3600);
    }
}
