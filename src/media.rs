//! Media download policy: which files this loop's posts actually need, given board rules, banned
//! hashes, dedup, and what's already on disk. Downloads themselves happen in the fetcher.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};

use crate::config::{BoardConfig, MediaConfig, RuleSource};
use crate::four_chan::{Board, Post, PostImage};


/// Media class: picks the directory shard, the URL template, and the download pacing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MediaKind {
    Full,
    Thumb,
}

impl MediaKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            MediaKind::Full => "image",
            MediaKind::Thumb => "thumb",
        }
    }
}

/// One compiled download rule slot: a plain switch, or a regex that must full-match the relevant
/// post's plain-text subject or comment.
pub enum DownloadRule {
    Flag(bool),
    Pattern(Regex),
}

impl DownloadRule {
    pub fn compile(source: &RuleSource) -> Result<Self, regex::Error> {
        match source {
            RuleSource::Flag(flag) => Ok(DownloadRule::Flag(*flag)),
            RuleSource::Pattern(pattern) => Ok(DownloadRule::Pattern(
                RegexBuilder::new(&format!("^(?:{})$", pattern))
                    .case_insensitive(true)
                    .build()?,
            )),
        }
    }

    fn applies(&self, post: &Post) -> bool {
        match self {
            DownloadRule::Flag(flag) => *flag,
            DownloadRule::Pattern(regex) => {
                let (subject, comment) = post.plain_text();
                (!subject.is_empty() && regex.is_match(&subject))
                    || (!comment.is_empty() && regex.is_match(&comment))
            }
        }
    }
}

/// A board's six rule slots, compiled once up front.
pub struct MediaRules {
    fm_thread: DownloadRule,
    fm_op: DownloadRule,
    fm_post: DownloadRule,
    th_thread: DownloadRule,
    th_op: DownloadRule,
    th_post: DownloadRule,
}

impl MediaRules {
    pub fn compile(config: &BoardConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            fm_thread: DownloadRule::compile(&config.dl_fm_thread)?,
            fm_op: DownloadRule::compile(&config.dl_fm_op)?,
            fm_post: DownloadRule::compile(&config.dl_fm_post)?,
            th_thread: DownloadRule::compile(&config.dl_th_thread)?,
            th_op: DownloadRule::compile(&config.dl_th_op)?,
            th_post: DownloadRule::compile(&config.dl_th_post)?,
        })
    }
}

/// The remote names a full media file after its `tim` plus the original extension.
pub fn full_filename(image: &PostImage) -> String {
    format!("{}{}", image.time_millis, image.ext)
}

/// Thumbnails reuse the `tim` with an `s.jpg` suffix.
pub fn thumb_filename(image: &PostImage) -> String {
    format!("{}s.jpg", image.time_millis)
}

/// `<media_root>/<board>/<class>/F[0:4]/F[4:6]/F` for a media filename `F`.
pub fn media_path(root: &Path, board: &Board, kind: MediaKind, filename: &str) -> PathBuf {
    assert!(filename.len() >= 6 && filename.is_char_boundary(4) && filename.is_char_boundary(6));
    let mut path = root.to_path_buf();
    path.push(board.as_str());
    path.push(kind.dir_name());
    path.push(&filename[0..4]);
    path.push(&filename[4..6]);
    path.push(filename);
    path
}

/// Videos get their own download pacing.
pub fn is_video(filename: &str) -> bool {
    filename.ends_with(".webm") || filename.ends_with(".mp4") || filename.ends_with(".gif")
}

/// A `{board}_images` row, as consulted by the policy.
#[derive(Clone, Debug)]
pub struct ImageRow {
    pub media: Option<String>,
    pub banned: bool,
}

/// A single planned download.
#[derive(Clone, Debug)]
pub struct MediaRequest {
    pub kind: MediaKind,
    pub tim: u64,
    pub ext: String,
    /// Target (and remote) filename.
    pub filename: String,
    pub expected_size: Option<u64>,
    /// Base64 md5, for verification and the image-row upsert. Full media only.
    pub md5: Option<String>,
}

/// One thread's posts for download planning: the OP (whose text drives the thread-scope rules)
/// plus whatever posts this loop fetched or adopted.
pub struct ThreadMedia<'a> {
    pub op: &'a Post,
    pub posts: &'a [Post],
}

/// Work out every file this loop has to download.
///
/// Per post and media class: rule first, then the banned-hash and duplicate-hash skips (full media
/// only), then the target path's own existence. Thumbnail work is suppressed entirely when
/// thumbnails are synthesized from full media instead.
pub fn plan_downloads(
    board: &Board,
    rules: &MediaRules,
    media: &MediaConfig,
    threads: &[ThreadMedia],
    images: &HashMap<String, ImageRow>,
) -> Vec<MediaRequest> {
    let mut requests = Vec::new();

    for thread in threads {
        let fm_thread = rules.fm_thread.applies(thread.op);
        let th_thread = rules.th_thread.applies(thread.op);

        for post in thread.posts {
            let image = match &post.image {
                Some(image) => image,
                None => continue,
            };

            let (fm_rule, th_rule) = if post.is_op() {
                (&rules.fm_op, &rules.th_op)
            } else {
                (&rules.fm_post, &rules.th_post)
            };

            if fm_thread || fm_rule.applies(post) {
                if let Some(request) = plan_full(board, media, image, images) {
                    requests.push(request);
                }
            }

            if !media.make_thumbnails && (th_thread || th_rule.applies(post)) {
                if let Some(request) = plan_thumb(board, media, image) {
                    requests.push(request);
                }
            }
        }
    }

    requests
}

fn plan_full(
    board: &Board,
    media: &MediaConfig,
    image: &PostImage,
    images: &HashMap<String, ImageRow>,
) -> Option<MediaRequest> {
    let row = images.get(&image.md5);

    // A banned hash is never written to disk.
    if row.map_or(false, |row| row.banned) {
        return None;
    }

    // Another post already stored this hash under a (possibly different) filename.
    if media.skip_duplicate_files {
        if let Some(stored) = row.and_then(|row| row.media.as_ref()) {
            if media_path(&media.media_save_path, board, MediaKind::Full, stored).is_file() {
                return None;
            }
        }
    }

    let filename = full_filename(image);
    if media_path(&media.media_save_path, board, MediaKind::Full, &filename).is_file() {
        return None;
    }

    Some(MediaRequest {
        kind: MediaKind::Full,
        tim: image.time_millis,
        ext: image.ext.clone(),
        filename,
        expected_size: Some(u64::from(image.filesize)),
        md5: Some(image.md5.clone()),
    })
}

fn plan_thumb(board: &Board, media: &MediaConfig, image: &PostImage) -> Option<MediaRequest> {
    let filename = thumb_filename(image);
    if media_path(&media.media_save_path, board, MediaKind::Thumb, &filename).is_file() {
        return None;
    }

    Some(MediaRequest {
        kind: MediaKind::Thumb,
        tim: image.time_millis,
        ext: ".jpg".to_string(),
        filename,
        expected_size: None,
        md5: None,
    })
}
