//! Persistent scraper state: per-board thread caches and the HTTP `Last-Modified` cache.
//!
//! None of these caches are authoritative. The relational tables are the source of truth for
//! posts; the caches only exist to avoid redundant network and database work, and all of them are
//! bounded so a long-running scrape can't grow without limit.

use std::collections::HashMap;
use std::fs;
use std::hash::Hash;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

mod tests;

/// Per-board bound for thread_cache, thread_stats, and thread_meta.
pub const PER_BOARD_CACHE_CAP: usize = 200;
/// Bound for the URL-keyed `Last-Modified` header cache.
pub const HTTP_CACHE_CAP: usize = 500;

/// A map that holds at most `cap` entries. Eviction is explicit: callers invoke
/// [`evict_stale`](BoundedMap::evict_stale) with a staleness key, and the map drops the stalest
/// entries down to `cap` minus a little slack (so stickies and other long-lived entries don't
/// cause an eviction on every single insert).
#[derive(Clone, Debug)]
pub struct BoundedMap<K: Copy + Eq + Hash, V> {
    map: HashMap<K, V>,
    cap: usize,
}

impl<K: Copy + Eq + Hash, V> BoundedMap<K, V> {
    const SLACK: usize = 10;

    pub fn new(cap: usize) -> Self {
        Self {
            map: HashMap::new(),
            cap,
        }
    }

    pub fn from_map(map: HashMap<K, V>, cap: usize) -> Self {
        Self { map, cap }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.map.insert(key, value);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }

    pub fn as_map(&self) -> &HashMap<K, V> {
        &self.map
    }

    /// Drop the stalest entries (smallest `staleness` value first) if the map has outgrown its
    /// bound.
    pub fn evict_stale<T, F>(&mut self, staleness: F)
    where
        T: Ord,
        F: Fn(&V) -> T,
    {
        let count = self.map.len();
        if count <= self.cap {
            return;
        }
        let excess = count - self.cap + Self::SLACK;
        let mut pairs: Vec<(K, T)> = self
            .map
            .iter()
            .map(|(key, value)| (*key, staleness(value)))
            .collect();
        pairs.sort_by(|a, b| a.1.cmp(&b.1));
        for (key, _) in pairs.into_iter().take(excess) {
            self.map.remove(&key);
        }
    }
}

/// Cached per-thread reply statistics, used to decide whether a catalog incremental update can
/// stand in for a full thread fetch.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ThreadStats {
    #[serde(default)]
    pub replies: u64,
    #[serde(default)]
    pub images: u64,
    pub most_recent_reply_no: Option<u64>,
}

/// Catalog position metadata for the missing-thread classifier, serialized as `[page, bump_time]`.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ThreadMeta(pub u64, pub u64);

impl ThreadMeta {
    pub fn page(&self) -> u64 {
        self.0
    }

    pub fn bump_time(&self) -> u64 {
        self.1
    }
}

/// One board's segment of the thread caches. Each board actor owns exactly one of these.
#[derive(Clone, Debug)]
pub struct BoardState {
    pub thread_cache: BoundedMap<u64, u64>,
    pub thread_stats: BoundedMap<u64, ThreadStats>,
    pub thread_meta: BoundedMap<u64, ThreadMeta>,
}

impl Default for BoardState {
    fn default() -> Self {
        Self {
            thread_cache: BoundedMap::new(PER_BOARD_CACHE_CAP),
            thread_stats: BoundedMap::new(PER_BOARD_CACHE_CAP),
            thread_meta: BoundedMap::new(PER_BOARD_CACHE_CAP),
        }
    }
}

impl BoardState {
    pub fn from_snapshot(snapshot: BoardStateSnapshot) -> Self {
        Self {
            thread_cache: BoundedMap::from_map(snapshot.thread_cache, PER_BOARD_CACHE_CAP),
            thread_stats: BoundedMap::from_map(snapshot.thread_stats, PER_BOARD_CACHE_CAP),
            thread_meta: BoundedMap::from_map(snapshot.thread_meta, PER_BOARD_CACHE_CAP),
        }
    }

    /// Record a thread's catalog `last_modified`, returning `true` when it changed (or the thread
    /// is new) and the thread should be processed. The cache is updated either way.
    pub fn note_last_modified(&mut self, no: u64, last_modified: u64) -> bool {
        let cached = self.thread_cache.get(&no).cloned();
        self.thread_cache.insert(no, last_modified);
        match cached {
            Some(prev) => prev != last_modified,
            None => true,
        }
    }

    /// Oldest threads (by their cached `last_modified`) fall out first.
    pub fn prune_thread_cache(&mut self) {
        self.thread_cache.evict_stale(|&last_modified| last_modified);
    }

    pub fn stats(&self, no: u64) -> Option<&ThreadStats> {
        self.thread_stats.get(&no)
    }

    /// Update a thread's cached stats. `most_recent_reply_no` never moves backwards while the
    /// thread is tracked, even if the newest reply was deleted between observations.
    pub fn record_stats(
        &mut self,
        no: u64,
        replies: u64,
        images: u64,
        most_recent_reply_no: Option<u64>,
    ) {
        let prev = self
            .thread_stats
            .get(&no)
            .and_then(|stats| stats.most_recent_reply_no);
        let most_recent_reply_no = match (prev, most_recent_reply_no) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.thread_stats.insert(
            no,
            ThreadStats {
                replies,
                images,
                most_recent_reply_no,
            },
        );
        self.thread_stats
            .evict_stale(|stats| stats.most_recent_reply_no.unwrap_or(0));
    }

    pub fn meta(&self, no: u64) -> Option<&ThreadMeta> {
        self.thread_meta.get(&no)
    }

    pub fn track_meta(&mut self, no: u64, page: u64, bump_time: u64) {
        self.thread_meta.insert(no, ThreadMeta(page, bump_time));
    }

    /// Least-recently-bumped threads fall out first.
    pub fn prune_thread_meta(&mut self) {
        self.thread_meta.evict_stale(|meta| meta.bump_time());
    }

    pub fn remove_meta(&mut self, no: u64) {
        self.thread_meta.remove(&no);
    }

    pub fn snapshot(&self) -> BoardStateSnapshot {
        BoardStateSnapshot {
            thread_cache: self.thread_cache.as_map().clone(),
            thread_stats: self.thread_stats.as_map().clone(),
            thread_meta: self.thread_meta.as_map().clone(),
        }
    }
}

/// A plain-map copy of a board's caches, cheap to ship to the state keeper for persistence.
#[derive(Clone, Debug, Default)]
pub struct BoardStateSnapshot {
    pub thread_cache: HashMap<u64, u64>,
    pub thread_stats: HashMap<u64, ThreadStats>,
    pub thread_meta: HashMap<u64, ThreadMeta>,
}

/// URL → HTTP `Last-Modified` header cache for conditional requests. Bounded; the
/// insertion-oldest entry is dropped on overflow. Re-setting a URL keeps its original insertion
/// position, like the file-backed dict it replaces.
#[derive(Clone, Debug)]
pub struct HttpCache {
    entries: HashMap<String, (u64, String)>,
    seq: u64,
    cap: usize,
}

impl HttpCache {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            seq: 0,
            cap,
        }
    }

    pub fn from_map(map: HashMap<String, String>, cap: usize) -> Self {
        let mut cache = Self::new(cap);
        for (url, header) in map {
            cache.set(url, header);
        }
        cache
    }

    pub fn get(&self, url: &str) -> Option<&str> {
        self.entries.get(url).map(|(_, header)| header.as_str())
    }

    pub fn set(&mut self, url: String, header: String) {
        let seq = match self.entries.get(&url) {
            Some(&(seq, _)) => seq,
            None => {
                self.seq += 1;
                self.seq
            }
        };
        self.entries.insert(url, (seq, header));

        if self.entries.len() > self.cap {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, &(seq, _))| seq)
                .map(|(url, _)| url.clone());
            if let Some(url) = oldest {
                self.entries.remove(&url);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .map(|(url, (_, header))| (url.clone(), header.clone()))
            .collect()
    }
}

// On-disk shapes of the four cache files under `cache/`. Boards are keyed by name; serde_json
// writes the u64 thread ids as JSON string keys and reads them back.
pub type ThreadCacheFile = HashMap<String, HashMap<u64, u64>>;
pub type ThreadStatsFile = HashMap<String, HashMap<u64, ThreadStats>>;
pub type ThreadMetaFile = HashMap<String, HashMap<u64, ThreadMeta>>;
pub type HttpCacheFile = HashMap<String, String>;

/// Serialize `value` to a sibling temp file, then rename over `path`, so a crash mid-write never
/// leaves a truncated cache file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec(value)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

/// Read a JSON cache file, treating a missing or unreadable file as an empty cache.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.is_file() {
        return None;
    }
    match fs::File::open(path) {
        Ok(file) => match serde_json::from_reader(io::BufReader::new(file)) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("Ignoring malformed cache file {}: {}", path.display(), err);
                None
            }
        },
        Err(err) => {
            warn!("Could not open cache file {}: {}", path.display(), err);
            None
        }
    }
}
