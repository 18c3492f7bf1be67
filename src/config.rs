//! Configuration file parsing.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Duration;

use failure::{Error, Fail, ResultExt};
use serde::Deserialize;

use crate::four_chan::Board;

/// The main configuration file struct.
#[derive(Clone, Deserialize)]
pub struct Config {
    pub scraping: ScrapingConfig,
    pub network: NetworkConfig,
    pub database: DatabaseConfig,
    pub media: MediaConfig,
    #[serde(default)]
    pub deletion: DeletionConfig,
    #[serde(default)]
    pub asagi_compat: AsagiCompatibilityConfig,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    pub boards: BTreeMap<Board, BoardConfig>,
}

/// A struct for scraping configuration.
#[derive(Clone, Deserialize)]
pub struct ScrapingConfig {
    /// Seconds to sleep between two iterations of a board's loop.
    pub loop_cooldown_sec: f64,
    /// Re-consider every catalog thread once on the first loop after a restart.
    #[serde(default)]
    pub ignore_thread_cache: bool,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl ScrapingConfig {
    pub fn loop_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.loop_cooldown_sec)
    }
}

/// The struct for the request pacing configuration section.
#[derive(Clone, Deserialize)]
pub struct NetworkConfig {
    /// Seconds to wait after every JSON API request.
    pub request_cooldown_sec: f64,
    /// Seconds to wait after downloading a video (.webm/.mp4/.gif).
    pub video_cooldown_sec: f64,
    /// Seconds to wait after downloading any other media file.
    pub image_cooldown_sec: f64,
    /// Add a uniform [0, 1) s jitter to every cooldown.
    #[serde(default)]
    pub add_random: bool,
    /// Disable conditional GETs (`If-Modified-Since`) entirely.
    #[serde(default)]
    pub ignore_http_cache: bool,
    #[serde(default)]
    pub retry_backoff: RetryBackoffConfig,
}

impl NetworkConfig {
    pub fn request_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.request_cooldown_sec)
    }

    pub fn video_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.video_cooldown_sec)
    }

    pub fn image_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.image_cooldown_sec)
    }
}

/// Exponential backoff for retried media downloads.
#[derive(Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryBackoffConfig {
    pub base_sec: f64,
    pub factor: u32,
    pub max_sec: f64,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            base_sec: 4.0,
            factor: 2,
            max_sec: 16.0,
        }
    }
}

impl RetryBackoffConfig {
    pub fn base(&self) -> Duration {
        Duration::from_secs_f64(self.base_sec)
    }

    pub fn max(&self) -> Duration {
        Duration::from_secs_f64(self.max_sec)
    }
}

/// Storage backend selection. The schema itself is installed separately.
#[derive(Clone, Deserialize)]
#[serde(tag = "db_type", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Mysql { url: String },
    Sqlite { path: PathBuf },
}

/// A struct for media download configuration.
#[derive(Clone, Deserialize)]
pub struct MediaConfig {
    pub media_save_path: PathBuf,
    /// Thumbnails are synthesized from full media by an external encoder instead of being
    /// downloaded.
    #[serde(default)]
    pub make_thumbnails: bool,
    #[serde(default)]
    pub download_files_with_mismatched_md5: bool,
    #[serde(default)]
    pub skip_duplicate_files: bool,
}

/// Thresholds for the missing-thread classifier. A thread that vanished from the catalog while
/// still recently bumped, on an early page, and below the reply threshold was evidently not
/// pruned by normal eviction.
#[derive(Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DeletionConfig {
    pub not_deleted_if_bump_age_exceeds_n_min: u64,
    pub not_deleted_if_page_n_reached: u64,
    pub not_deleted_if_n_replies: u64,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            not_deleted_if_bump_age_exceeds_n_min: 60,
            not_deleted_if_page_n_reached: 5,
            not_deleted_if_n_replies: 30,
        }
    }
}

/// A struct for Asagi compatibility configuration.
#[derive(Clone, Copy, Default, Deserialize)]
pub struct AsagiCompatibilityConfig {
    /// Shift epoch timestamps to America/New_York wall-clock time before persisting.
    #[serde(default)]
    pub adjust_timestamps: bool,
}

/// API and media URL templates. `{board}`, `{thread_id}`, `{tim}`, and `{ext}` are substituted.
#[derive(Clone, Deserialize)]
pub struct EndpointsConfig {
    #[serde(default = "default_url_catalog")]
    pub url_catalog: String,
    #[serde(default = "default_url_thread")]
    pub url_thread: String,
    #[serde(default = "default_url_archive")]
    pub url_archive: String,
    #[serde(default = "default_url_boards")]
    pub url_boards: String,
    #[serde(default = "default_url_full_media")]
    pub url_full_media: String,
    #[serde(default = "default_url_thumbnail")]
    pub url_thumbnail: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            url_catalog: default_url_catalog(),
            url_thread: default_url_thread(),
            url_archive: default_url_archive(),
            url_boards: default_url_boards(),
            url_full_media: default_url_full_media(),
            url_thumbnail: default_url_thumbnail(),
        }
    }
}

impl EndpointsConfig {
    pub fn catalog_url(&self, board: &Board) -> String {
        self.url_catalog.replace("{board}", board.as_str())
    }

    pub fn thread_url(&self, board: &Board, no: u64) -> String {
        self.url_thread
            .replace("{board}", board.as_str())
            .replace("{thread_id}", &no.to_string())
    }

    pub fn archive_url(&self, board: &Board) -> String {
        self.url_archive.replace("{board}", board.as_str())
    }

    pub fn boards_url(&self) -> String {
        self.url_boards.clone()
    }

    pub fn full_media_url(&self, board: &Board, tim: u64, ext: &str) -> String {
        self.url_full_media
            .replace("{board}", board.as_str())
            .replace("{tim}", &tim.to_string())
            .replace("{ext}", ext)
    }

    pub fn thumbnail_url(&self, board: &Board, tim: u64) -> String {
        self.url_thumbnail
            .replace("{board}", board.as_str())
            .replace("{tim}", &tim.to_string())
    }
}

/// One board's filtering and download rules.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Case-insensitive regex; a match on subject or comment rejects the thread.
    pub blacklist: Option<String>,
    /// Case-insensitive regex; when configured, only matching threads are archived.
    pub whitelist: Option<String>,
    /// Minimum total characters in the OP comment's plain text.
    pub op_comment_min_chars: Option<usize>,
    /// Minimum distinct codepoints in the OP comment's plain text.
    pub op_comment_min_chars_unique: Option<usize>,
    /// Persist post rows. Stats, deletion flagging, and media still happen when off.
    pub thread_text: Option<bool>,

    pub dl_fm_thread: RuleSource,
    pub dl_fm_op: RuleSource,
    pub dl_fm_post: RuleSource,
    pub dl_th_thread: RuleSource,
    pub dl_th_op: RuleSource,
    pub dl_th_post: RuleSource,
}

impl BoardConfig {
    pub fn thread_text(&self) -> bool {
        self.thread_text.unwrap_or(true)
    }
}

/// A download rule slot: a plain switch, or a regex that must full-match the relevant post's
/// plain text.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum RuleSource {
    Flag(bool),
    Pattern(String),
}

impl Default for RuleSource {
    fn default() -> Self {
        RuleSource::Flag(false)
    }
}

/// Configuration parsing errors.
#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "`loop_cooldown_sec` must be at least 1 second (preferably 10 or more)")]
    ShortLoopCooldown,

    #[fail(display = "`request_cooldown_sec` must be positive")]
    ZeroRequestCooldown,

    #[fail(display = "at least one `[boards.<name>]` section is required")]
    NoBoards,
}

/// Read the configuration file `magpie.toml` and parse it.
pub fn parse_config() -> Result<Config, Error> {
    let file = File::open("magpie.toml").context("Could not open magpie.toml")?;
    let mut buf_reader = BufReader::new(file);
    let mut contents = String::new();
    buf_reader
        .read_to_string(&mut contents)
        .context("Could not read magpie.toml")?;

    let config: Config = toml::from_str(&contents).context("Could not parse magpie.toml")?;

    if config.boards.is_empty() {
        return Err(ConfigError::NoBoards.into());
    }
    if config.scraping.loop_cooldown_sec < 1.0 {
        return Err(ConfigError::ShortLoopCooldown.into());
    } else if config.scraping.loop_cooldown_sec < 10.0 {
        warn!("API rules recommend a minimum `loop_cooldown_sec` of 10 seconds");
        warn!("A very short `loop_cooldown_sec` may cause the API to return old data");
    }
    if config.network.request_cooldown_sec <= 0.0 {
        return Err(ConfigError::ZeroRequestCooldown.into());
    }

    Ok(config)
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_url_catalog() -> String {
    "https://a.4cdn.org/{board}/catalog.json".to_string()
}

fn default_url_thread() -> String {
    "https://a.4cdn.org/{board}/thread/{thread_id}.json".to_string()
}

fn default_url_archive() -> String {
    "https://a.4cdn.org/{board}/archive.json".to_string()
}

fn default_url_boards() -> String {
    "https://a.4cdn.org/boards.json".to_string()
}

fn default_url_full_media() -> String {
    "https://i.4cdn.org/{board}/{tim}{ext}".to_string()
}

fn default_url_thumbnail() -> String {
    "https://i.4cdn.org/{board}/{tim}s.jpg".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::four_chan::Board;

    fn minimal(db: &str) -> String {
        format!(
            r#"
            [scraping]
            loop_cooldown_sec = 90.0
            [network]
            request_cooldown_sec = 1.2
            video_cooldown_sec = 3.2
            image_cooldown_sec = 2.2
            [database]
            {}
            [media]
            media_save_path = "media"
            [boards.po]
            dl_fm_thread = true
            dl_th_thread = "model.*thread"
            "#,
            db
        )
    }

    #[test]
    fn parses_sqlite_and_mysql_backends() {
        let config: Config = toml::from_str(&minimal(
            "db_type = \"sqlite\"\npath = \"magpie.db\"",
        ))
        .unwrap();
        match config.database {
            DatabaseConfig::Sqlite { ref path } => assert_eq!(path.to_str(), Some("magpie.db")),
            _ => panic!("expected the sqlite backend"),
        }

        let config: Config = toml::from_str(&minimal(
            "db_type = \"mysql\"\nurl = \"mysql://magpie@localhost/archive\"",
        ))
        .unwrap();
        match config.database {
            DatabaseConfig::Mysql { ref url } => assert!(url.starts_with("mysql://")),
            _ => panic!("expected the mysql backend"),
        }
    }

    #[test]
    fn rule_slots_take_bools_or_patterns() {
        let config: Config = toml::from_str(&minimal(
            "db_type = \"sqlite\"\npath = \"magpie.db\"",
        ))
        .unwrap();
        let board = config.boards.get(&Board::new("po").unwrap()).unwrap();
        match board.dl_fm_thread {
            RuleSource::Flag(true) => {}
            _ => panic!("expected a boolean rule"),
        }
        match board.dl_th_thread {
            RuleSource::Pattern(ref pattern) => assert_eq!(pattern, "model.*thread"),
            _ => panic!("expected a pattern rule"),
        }
        // Unset slots default off.
        match board.dl_fm_post {
            RuleSource::Flag(false) => {}
            _ => panic!("expected the default rule"),
        }
        assert!(board.thread_text());
    }

    #[test]
    fn optional_sections_fall_back_to_defaults() {
        let config: Config = toml::from_str(&minimal(
            "db_type = \"sqlite\"\npath = \"magpie.db\"",
        ))
        .unwrap();
        assert_eq!(config.deletion.not_deleted_if_bump_age_exceeds_n_min, 60);
        assert_eq!(config.deletion.not_deleted_if_page_n_reached, 5);
        assert_eq!(config.deletion.not_deleted_if_n_replies, 30);
        assert!(!config.asagi_compat.adjust_timestamps);
        assert!(config.endpoints.url_catalog.contains("{board}"));
        assert_eq!(
            config
                .endpoints
                .thread_url(&Board::new("po").unwrap(), 123),
            "https://a.4cdn.org/po/thread/123.json"
        );
        assert_eq!(
            config
                .endpoints
                .full_media_url(&Board::new("po").unwrap(), 1_717_755_968_123, ".webm"),
            "https://i.4cdn.org/po/1717755968123.webm"
        );
    }
}
