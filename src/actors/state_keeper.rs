//! An actor which owns the merged, on-disk view of every board's caches.
//!
//! Board actors ship their cache segments here after each loop; the fetcher ships its header
//! cache. Every file is written to a sibling temp path and renamed, so an interrupt can never
//! leave a truncated cache behind.

use std::collections::HashMap;
use std::path::PathBuf;

use actix::prelude::*;
use serde::Serialize;

use crate::four_chan::Board;
use crate::state::{
    read_json, write_json_atomic, BoardStateSnapshot, HttpCacheFile, ThreadCacheFile,
    ThreadMetaFile, ThreadStatsFile,
};

pub struct StateKeeper {
    dir: PathBuf,
    thread_cache: ThreadCacheFile,
    thread_stats: ThreadStatsFile,
    thread_meta: ThreadMetaFile,
    http_cache: HttpCacheFile,
}

impl StateKeeper {
    pub fn new(dir: PathBuf) -> Self {
        let thread_cache = read_json(&dir.join("thread_cache.json")).unwrap_or_default();
        let thread_stats = read_json(&dir.join("thread_stats.json")).unwrap_or_default();
        let thread_meta = read_json(&dir.join("thread_meta.json")).unwrap_or_default();
        let http_cache = read_json(&dir.join("http_cache.json")).unwrap_or_default();

        Self {
            dir,
            thread_cache,
            thread_stats,
            thread_meta,
            http_cache,
        }
    }

    /// The loaded cache segment for one board, handed to its actor at startup.
    pub fn board_state(&self, board: &Board) -> BoardStateSnapshot {
        BoardStateSnapshot {
            thread_cache: self
                .thread_cache
                .get(board.as_str())
                .cloned()
                .unwrap_or_default(),
            thread_stats: self
                .thread_stats
                .get(board.as_str())
                .cloned()
                .unwrap_or_default(),
            thread_meta: self
                .thread_meta
                .get(board.as_str())
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// The loaded header cache, handed to the fetcher at startup.
    pub fn http_cache(&self) -> HashMap<String, String> {
        self.http_cache.clone()
    }

    fn write<T: Serialize>(&self, name: &str, value: &T) {
        let path = self.dir.join(name);
        if let Err(err) = write_json_atomic(&path, value) {
            error!("Could not write {}: {}", path.display(), err);
        }
    }

    fn write_board_caches(&self) {
        self.write("thread_cache.json", &self.thread_cache);
        self.write("thread_stats.json", &self.thread_stats);
        self.write("thread_meta.json", &self.thread_meta);
    }
}

impl Actor for StateKeeper {
    type Context = Context<Self>;

    fn stopping(&mut self, _ctx: &mut Self::Context) -> Running {
        self.write_board_caches();
        self.write("http_cache.json", &self.http_cache);
        Running::Stop
    }
}

#[derive(Message)]
pub struct PersistBoardState(pub Board, pub BoardStateSnapshot);

impl Handler<PersistBoardState> for StateKeeper {
    type Result = ();

    fn handle(&mut self, msg: PersistBoardState, _: &mut Self::Context) {
        let PersistBoardState(board, snapshot) = msg;
        let board = board.to_string();
        self.thread_cache.insert(board.clone(), snapshot.thread_cache);
        self.thread_stats.insert(board.clone(), snapshot.thread_stats);
        self.thread_meta.insert(board, snapshot.thread_meta);
        self.write_board_caches();
    }
}

#[derive(Message)]
pub struct PersistHttpCache(pub HashMap<String, String>);

impl Handler<PersistHttpCache> for StateKeeper {
    type Result = ();

    fn handle(&mut self, msg: PersistHttpCache, _: &mut Self::Context) {
        self.http_cache = msg.0;
        self.write("http_cache.json", &self.http_cache);
    }
}
