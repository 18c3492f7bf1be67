//! 4chan-style API definitions.

use std::fmt;

use failure::Fail;
use serde::{Deserialize, Deserializer, Serialize};

use crate::html;

mod tests;

/// Extensions the remote serves as post attachments. Anything else is rejected.
pub const MEDIA_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webm", ".pdf", ".swf"];

/// Capcodes the remote hands out. Anything else is rejected.
pub const CAPCODES: &[&str] = &[
    "mod",
    "admin",
    "admin_highlight",
    "developer",
    "verified",
    "founder",
    "manager",
];

const MAX_NAME_LEN: usize = 256;
const MAX_TRIP_LEN: usize = 64;
const MAX_ID_LEN: usize = 16;
const MAX_COUNTRY_LEN: usize = 64;
const MAX_SUBJECT_LEN: usize = 1024;
const MAX_COMMENT_LEN: usize = 65_536;
const MAX_FILENAME_LEN: usize = 1024;

/// A board name as configured (e.g. `g` or `po`).
#[derive(Clone, Debug, Deserialize, Serialize, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[serde(transparent)]
pub struct Board(String);

impl Board {
    /// Board names end up in URLs and SQL identifiers, so only short lowercase alphanumeric names
    /// are accepted.
    pub fn new(name: &str) -> Result<Self, ValidationError> {
        let valid = !name.is_empty()
            && name.len() <= 16
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
        if valid {
            Ok(Board(name.to_string()))
        } else {
            Err(ValidationError::BadBoardName(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A wrapper struct used to deserialize the outer JSON object of a thread.
#[derive(Debug, Deserialize)]
pub struct PostsWrapper {
    pub posts: Vec<Post>,
}

/// A page of `catalog.json`.
#[derive(Debug, Deserialize)]
pub struct CatalogPage {
    /// 1-based page number. Zero means the remote didn't send one; the catalog falls back to the
    /// page's ordinal.
    #[serde(default)]
    pub page: u64,
    pub threads: Vec<CatalogThread>,
}

/// An OP thread as the catalog presents it: the OP post plus board-position metadata and a preview
/// of the most recent replies.
#[derive(Debug, Deserialize)]
pub struct CatalogThread {
    #[serde(flatten)]
    pub post: Post,
    pub last_modified: u64,
    #[serde(default)]
    pub replies: u64,
    #[serde(default)]
    pub images: u64,
    #[serde(default)]
    pub last_replies: Vec<Post>,
}

impl CatalogThread {
    pub fn no(&self) -> u64 {
        self.post.no
    }

    /// The best guess at when this thread last saw activity.
    pub fn bump_time(&self) -> u64 {
        if self.last_modified != 0 {
            self.last_modified
        } else {
            self.post.time
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.post.validate()?;
        if self.last_modified == 0 {
            return Err(ValidationError::ZeroField {
                no: self.post.no,
                field: "last_modified",
            });
        }
        for reply in &self.last_replies {
            reply.validate()?;
        }
        Ok(())
    }
}

/// A struct representing a post.
///
/// Unused fields are omitted; unknown fields are tolerated.
#[derive(Clone, Debug, Deserialize)]
pub struct Post {
    // Required fields
    pub no: u64,
    #[serde(rename = "resto")]
    pub reply_to: u64,
    pub time: u64,

    // Optional fields
    /// Only blank when name is blank and trip is provided
    pub name: Option<String>,
    pub trip: Option<String>,
    /// Displays if board has DISPLAY_ID set
    pub id: Option<String>,
    pub capcode: Option<String>,
    pub country: Option<String>,
    pub country_name: Option<String>,
    #[serde(rename = "sub")]
    pub subject: Option<String>,
    #[serde(rename = "com")]
    pub comment: Option<String>,
    /// Only present on OPs.
    pub unique_ips: Option<u32>,

    /// Set when a moderator removed the post's file. The remote drops the other file fields at
    /// the same time, so this can't live inside [`PostImage`].
    #[serde(rename = "filedeleted")]
    #[serde(deserialize_with = "num_to_bool")]
    #[serde(default)]
    pub file_deleted: bool,

    #[serde(flatten)]
    pub op_data: OpData,

    #[serde(flatten)]
    pub image: Option<PostImage>,
}

impl Post {
    pub fn is_op(&self) -> bool {
        self.reply_to == 0
    }

    /// The thread this post belongs to: itself if OP, its reply target otherwise.
    pub fn thread_no(&self) -> u64 {
        if self.is_op() {
            self.no
        } else {
            self.reply_to
        }
    }

    /// Subject and comment with tags stripped and entities unescaped, for filter matching.
    pub fn plain_text(&self) -> (String, String) {
        let subject = self.subject.as_ref().map_or_else(String::new, |s| {
            html::plain_text(s)
        });
        let comment = self.comment.as_ref().map_or_else(String::new, |c| {
            html::plain_text(c)
        });
        (subject, comment)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let no = self.no;
        if no == 0 {
            return Err(ValidationError::ZeroField { no, field: "no" });
        }
        if self.time == 0 {
            return Err(ValidationError::ZeroField { no, field: "time" });
        }

        check_len(no, "name", &self.name, MAX_NAME_LEN)?;
        check_len(no, "trip", &self.trip, MAX_TRIP_LEN)?;
        check_len(no, "id", &self.id, MAX_ID_LEN)?;
        check_len(no, "country", &self.country, MAX_COUNTRY_LEN)?;
        check_len(no, "country_name", &self.country_name, MAX_COUNTRY_LEN)?;
        check_len(no, "sub", &self.subject, MAX_SUBJECT_LEN)?;
        check_len(no, "com", &self.comment, MAX_COMMENT_LEN)?;

        if let Some(capcode) = &self.capcode {
            if !CAPCODES.contains(&capcode.as_str()) {
                return Err(ValidationError::BadCapcode {
                    no,
                    capcode: capcode.clone(),
                });
            }
        }

        if let Some(image) = &self.image {
            image.validate(no)?;
        }
        Ok(())
    }
}

/// A struct representing the OP data of a post.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct OpData {
    #[serde(deserialize_with = "num_to_bool")]
    #[serde(default)]
    pub sticky: bool,
    #[serde(deserialize_with = "num_to_bool")]
    #[serde(default)]
    pub closed: bool,
    #[serde(deserialize_with = "num_to_bool")]
    #[serde(default)]
    pub archived: bool,
    pub archived_on: Option<u64>,
}

/// A struct representing the image data of a post.
#[derive(Clone, Debug, Deserialize)]
pub struct PostImage {
    pub filename: String,
    pub ext: String,
    #[serde(rename = "tim")]
    pub time_millis: u64,
    #[serde(rename = "fsize")]
    pub filesize: u32,
    pub md5: String,
    #[serde(rename = "w")]
    pub image_width: u16,
    #[serde(rename = "h")]
    pub image_height: u16,
    #[serde(rename = "tn_w")]
    pub thumbnail_width: u8,
    #[serde(rename = "tn_h")]
    pub thumbnail_height: u8,
    #[serde(deserialize_with = "num_to_bool")]
    #[serde(default)]
    pub spoiler: bool,
}

impl PostImage {
    fn validate(&self, no: u64) -> Result<(), ValidationError> {
        if self.time_millis == 0 {
            return Err(ValidationError::ZeroField { no, field: "tim" });
        }
        if self.filename.len() > MAX_FILENAME_LEN {
            return Err(ValidationError::Oversized {
                no,
                field: "filename",
                limit: MAX_FILENAME_LEN,
            });
        }
        if !MEDIA_EXTENSIONS.contains(&self.ext.as_str()) {
            return Err(ValidationError::BadExtension {
                no,
                ext: self.ext.clone(),
            });
        }
        if !is_base64_md5(&self.md5) {
            return Err(ValidationError::BadMd5 {
                no,
                md5: self.md5.clone(),
            });
        }
        Ok(())
    }
}

/// A wrapper struct used to deserialize `boards.json`.
#[derive(Deserialize)]
pub struct BoardsWrapper {
    pub boards: Vec<BoardInfo>,
}

/// Per-board capabilities from `boards.json`. Unused fields are omitted.
#[derive(Deserialize)]
pub struct BoardInfo {
    pub board: Board,
    #[serde(deserialize_with = "num_to_bool")]
    #[serde(default)]
    pub is_archived: bool,
}

/// The remote reports md5 hashes as exactly 24 characters of base64.
fn is_base64_md5(md5: &str) -> bool {
    md5.len() == 24
        && md5
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

fn check_len(
    no: u64,
    field: &'static str,
    value: &Option<String>,
    limit: usize,
) -> Result<(), ValidationError> {
    match value {
        Some(v) if v.len() > limit => Err(ValidationError::Oversized { no, field, limit }),
        _ => Ok(()),
    }
}

#[derive(Debug, Fail)]
pub enum ValidationError {
    #[fail(display = "post {} has a zero `{}` field", no, field)]
    ZeroField { no: u64, field: &'static str },

    #[fail(display = "post {} has an unrecognized extension `{}`", no, ext)]
    BadExtension { no: u64, ext: String },

    #[fail(display = "post {} has a malformed md5 `{}`", no, md5)]
    BadMd5 { no: u64, md5: String },

    #[fail(display = "post {} has an unrecognized capcode `{}`", no, capcode)]
    BadCapcode { no: u64, capcode: String },

    #[fail(display = "post {} field `{}` exceeds {} bytes", no, field, limit)]
    Oversized {
        no: u64,
        field: &'static str,
        limit: usize,
    },

    #[fail(display = "catalog lists thread {} more than once", _0)]
    DuplicateThread(u64),

    #[fail(display = "thread {} has inconsistent reply targets", _0)]
    InvalidReplyTo(u64),

    #[fail(display = "invalid board name `{}`", _0)]
    BadBoardName(String),
}

fn num_to_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let n: u8 = Deserialize::deserialize(deserializer)?;
    if n == 1 {
        Ok(true)
    } else if n == 0 {
        Ok(false)
    } else {
        use serde::de::Error;
        Err(D::Error::custom("Numeric boolean was not 0 or 1"))
    }
}
