//! An actor which runs one board's scrape loop.
//!
//! Each iteration is a strictly ordered pipeline: fetch the catalog, refresh thread metadata,
//! filter, classify threads that vanished from the catalog, update posts (catalog increments or
//! full fetches), commit to the database, then plan and enqueue media downloads. The board's DB
//! writes for a loop always complete before its media downloads begin.
//!
//! Every board owns its own segment of the caches, so boards can loop independently; the shared
//! fetcher keeps the actual request rate under one cooldown schedule.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::fut;
use actix::prelude::*;
use chrono::prelude::*;
use failure::{Error, Fail, ResultExt};
use futures::future::{self, Either};
use futures::prelude::*;
use futures::stream;
use rand::Rng;
use tokio::timer::Delay;

use super::database::{
    CommitThread, Database, DbError, GetActiveThreads, GetExistingPostNums, GetImageRows,
    MarkPostsDeleted, MarkThreadsArchived, MarkThreadsDeleted,
};
use super::fetcher::{FetchArchive, FetchCatalog, FetchMedia, FetchThread, Fetched, Fetcher};
use super::state_keeper::{PersistBoardState, StateKeeper};
use crate::asagi::{PostRow, ThreadStatsRow};
use crate::catalog::Catalog;
use crate::config::{BoardConfig, Config};
use crate::filter::{self, FilterRules};
use crate::four_chan::{Board, Post, ValidationError};
use crate::media::{self, MediaRules};
use crate::posts::{self, Disappearance};
use crate::state::{BoardState, BoardStateSnapshot};

/// Pause before the single retry of a failed batch write.
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(250);

/// Consecutive critical failures before the whole system gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

type Step<I> = Box<ActorFuture<Item = I, Error = LoopError, Actor = BoardScraper>>;

#[derive(Debug, Fail)]
enum LoopError {
    /// The remote served something outside the closed schema; this board's loop is abandoned and
    /// nothing from it is written.
    #[fail(display = "validation failed: {}", _0)]
    Validation(ValidationError),

    /// A batch write failed twice; this board's loop is abandoned.
    #[fail(display = "database error: {}", _0)]
    Db(DbError),

    /// An actor's mailbox is gone, which a later loop cannot fix by itself.
    #[fail(display = "mailbox error: {}", _0)]
    Mailbox(MailboxError),
}

/// Everything one iteration accumulates on its way through the pipeline.
struct LoopCtx {
    catalog: Catalog,
    unmodified: usize,
    modified: Vec<u64>,
    missing: Vec<u64>,
    pruned: Vec<u64>,
    archived: Vec<u64>,
    deleted_threads: Vec<u64>,
    outcomes: Vec<ThreadOutcome>,
    write_items: Vec<(Vec<PostRow>, ThreadStatsRow)>,
    deleted_posts: Vec<u64>,
    catalog_updates: usize,
    full_fetches: usize,
    downloads: usize,
}

impl LoopCtx {
    fn new(catalog: Catalog, outcome: filter::FilterOutcome) -> Self {
        Self {
            catalog,
            unmodified: outcome.unmodified,
            modified: outcome.modified,
            missing: vec![],
            pruned: vec![],
            archived: vec![],
            deleted_threads: vec![],
            outcomes: vec![],
            write_items: vec![],
            deleted_posts: vec![],
            catalog_updates: 0,
            full_fetches: 0,
            downloads: 0,
        }
    }
}

struct ThreadWork {
    no: u64,
    existing: HashSet<u64>,
    action: ThreadAction,
}

enum ThreadAction {
    /// The catalog preview provably contains exactly the new replies; adopt them without a GET.
    CatalogUpdate(Vec<Post>),
    FullFetch,
}

struct ThreadOutcome {
    no: u64,
    posts: Vec<Post>,
    deleted: Vec<u64>,
    from_catalog: bool,
    /// The thread fetch returned nothing usable this loop; try again next time.
    skipped: bool,
}

impl ThreadOutcome {
    fn skip(no: u64) -> Self {
        Self {
            no,
            posts: vec![],
            deleted: vec![],
            from_catalog: false,
            skipped: true,
        }
    }
}

pub struct BoardScraper {
    board: Board,
    config: Arc<Config>,
    board_config: BoardConfig,
    filter_rules: FilterRules,
    media_rules: MediaRules,
    has_archive: bool,
    state: BoardState,
    fetcher: Addr<Fetcher>,
    database: Addr<Database>,
    state_keeper: Addr<StateKeeper>,
    loop_no: u64,
    consecutive_failures: u32,
}

impl Actor for BoardScraper {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.start_iteration(ctx);
    }

    fn stopping(&mut self, _ctx: &mut Self::Context) -> Running {
        self.persist_state();
        Running::Stop
    }
}

impl BoardScraper {
    pub fn new(
        board: Board,
        config: Arc<Config>,
        has_archive: bool,
        snapshot: BoardStateSnapshot,
        fetcher: Addr<Fetcher>,
        database: Addr<Database>,
        state_keeper: Addr<StateKeeper>,
    ) -> Result<Self, Error> {
        let board_config = config.boards.get(&board).cloned().unwrap_or_default();
        let filter_rules = FilterRules::compile(&board_config)
            .with_context(|_| format!("Invalid filter pattern for board {}", board))?;
        let media_rules = MediaRules::compile(&board_config)
            .with_context(|_| format!("Invalid download rule pattern for board {}", board))?;

        Ok(Self {
            board,
            config,
            board_config,
            filter_rules,
            media_rules,
            has_archive,
            state: BoardState::from_snapshot(snapshot),
            fetcher,
            database,
            state_keeper,
            loop_no: 1,
            consecutive_failures: 0,
        })
    }

    fn persist_state(&self) {
        self.state_keeper
            .do_send(PersistBoardState(self.board.clone(), self.state.snapshot()));
    }

    fn start_iteration(&mut self, ctx: &mut Context<Self>) {
        info!("/{}/: Loop #{} started", self.board, self.loop_no);
        let started = Instant::now();

        let iteration = self.run_iteration().then(move |res, act, ctx| {
            match res {
                Ok(lctx) => act.finish_iteration(lctx, started, ctx),
                Err(err) => act.handle_failure(err, ctx),
            }
            fut::ok(())
        });
        ctx.spawn(iteration);
    }

    fn run_iteration(&mut self) -> Step<Option<LoopCtx>> {
        let step = self
            .fetcher
            .send(FetchCatalog(self.board.clone()))
            .map_err(LoopError::Mailbox)
            .into_actor(self)
            .and_then(|res, act, _ctx| -> Step<Option<LoopCtx>> {
                let pages = match res {
                    Ok(Fetched::Fresh(pages)) => pages,
                    Ok(Fetched::NotModified) => {
                        debug!("/{}/: Catalog not modified", act.board);
                        return Box::new(fut::ok(None));
                    }
                    Err(err) => {
                        warn!("/{}/: Failed to fetch catalog: {}", act.board, err);
                        return Box::new(fut::ok(None));
                    }
                };

                let catalog = match Catalog::build(act.board.clone(), pages) {
                    Ok(catalog) => catalog,
                    Err(err) => return Box::new(fut::err(LoopError::Validation(err))),
                };
                if catalog.is_empty() {
                    warn!("/{}/: Catalog is empty", act.board);
                    return Box::new(fut::ok(None));
                }
                debug!("/{}/: Downloaded catalog ({} threads)", act.board, catalog.len());

                Box::new(act.scan_catalog(catalog).map(|lctx, _act, _ctx| Some(lctx)))
            });
        Box::new(step)
    }

    /// Refresh thread metadata, filter the catalog, then run the rest of the pipeline.
    fn scan_catalog(&mut self, catalog: Catalog) -> Step<LoopCtx> {
        for thread in catalog.threads() {
            let page = catalog.page(thread.no()).unwrap_or(0);
            self.state.track_meta(thread.no(), page, thread.bump_time());
        }
        self.state.prune_thread_meta();

        let seed_all = self.config.scraping.ignore_thread_cache && self.loop_no == 1;
        if seed_all {
            info!(
                "/{}/: Ignoring cached modification times on the first loop",
                self.board
            );
        }
        let outcome = filter::filter_catalog(&catalog, &self.filter_rules, &mut self.state, seed_all);
        debug!(
            "/{}/: {} thread(s) unmodified, {} queued",
            self.board,
            outcome.unmodified,
            outcome.modified.len()
        );

        let lctx = LoopCtx::new(catalog, outcome);

        let step = self
            .database
            .send(GetActiveThreads(self.board.clone()))
            .map_err(LoopError::Mailbox)
            .into_actor(self)
            .and_then(move |res, act, _ctx| -> Step<LoopCtx> {
                let active = match res {
                    Ok(active) => active,
                    Err(err) => return Box::new(fut::err(LoopError::Db(err))),
                };
                act.classify_missing(lctx, active)
            })
            .and_then(|lctx, act, _ctx| act.fetch_posts_step(lctx))
            .and_then(|lctx, act, _ctx| act.write_step(lctx))
            .and_then(|lctx, act, _ctx| act.media_step(lctx));
        Box::new(step)
    }

    /// Work out which tracked threads vanished from the catalog and what their disappearance
    /// means. The archive index is consulted at most once per loop, and only when some thread
    /// actually looks moderator-removed.
    fn classify_missing(&mut self, mut lctx: LoopCtx, active: HashSet<u64>) -> Step<LoopCtx> {
        let mut tracked: HashSet<u64> = active;
        tracked.extend(self.state.thread_meta.keys());

        let now = Utc::now().timestamp() as u64;
        let mut candidates = vec![];
        for &no in &tracked {
            if lctx.catalog.contains(no) {
                continue;
            }
            lctx.missing.push(no);
            let verdict = posts::classify_missing_thread(
                self.state.meta(no),
                self.state.stats(no),
                &self.config.deletion,
                now,
            );
            match verdict {
                Disappearance::Inconclusive => {}
                Disappearance::Pruned => lctx.pruned.push(no),
                Disappearance::ProbablyRemoved => candidates.push(no),
            }
        }

        if !lctx.missing.is_empty() {
            info!(
                "/{}/: {} thread(s) no longer in catalog",
                self.board,
                lctx.missing.len()
            );
        }

        if candidates.is_empty() {
            return Box::new(fut::ok(lctx));
        }
        if !self.has_archive {
            // No archive to consult; a removed-looking thread can only have been deleted.
            lctx.deleted_threads = candidates;
            return Box::new(fut::ok(lctx));
        }

        let step = self
            .fetcher
            .send(FetchArchive(self.board.clone()))
            .map_err(LoopError::Mailbox)
            .into_actor(self)
            .map(move |res, act, _ctx| {
                let archived: HashSet<u64> = match res {
                    Ok(Fetched::Fresh(nos)) => nos.into_iter().collect(),
                    Ok(Fetched::NotModified) => HashSet::new(),
                    Err(err) => {
                        warn!("/{}/: Failed to fetch archive: {}", act.board, err);
                        HashSet::new()
                    }
                };
                for no in candidates {
                    if archived.contains(&no) {
                        lctx.archived.push(no);
                    } else {
                        lctx.deleted_threads.push(no);
                    }
                }
                lctx
            });
        Box::new(step)
    }

    /// Update every filtered thread, preferring catalog increments over full fetches, and fold
    /// the results into the board's stats cache.
    fn fetch_posts_step(&mut self, lctx: LoopCtx) -> Step<LoopCtx> {
        let step = self
            .database
            .send(GetExistingPostNums(self.board.clone(), lctx.modified.clone()))
            .map_err(LoopError::Mailbox)
            .into_actor(self)
            .and_then(move |res, act, _ctx| -> Step<LoopCtx> {
                let mut existing = match res {
                    Ok(map) => map,
                    Err(err) => return Box::new(fut::err(LoopError::Db(err))),
                };

                let mut works = vec![];
                for &no in &lctx.modified {
                    let thread = match lctx.catalog.thread(no) {
                        Some(thread) => thread,
                        None => continue,
                    };
                    let existing_pids = existing.remove(&no).unwrap_or_default();

                    let eligible = posts::can_use_catalog_update(
                        thread,
                        act.state.stats(no),
                        lctx.catalog.last_replies(no),
                    );
                    let action = if eligible {
                        let last_seen = act
                            .state
                            .stats(no)
                            .and_then(|stats| stats.most_recent_reply_no)
                            .unwrap_or(0);
                        let fresh: Vec<Post> = posts::catalog_update_posts(
                            lctx.catalog.last_replies(no).unwrap_or(&[]),
                            last_seen,
                        )
                        .into_iter()
                        .filter(|post| !existing_pids.contains(&post.no))
                        .collect();
                        if fresh.is_empty() {
                            ThreadAction::FullFetch
                        } else {
                            ThreadAction::CatalogUpdate(fresh)
                        }
                    } else {
                        ThreadAction::FullFetch
                    };

                    works.push(ThreadWork {
                        no,
                        existing: existing_pids,
                        action,
                    });
                }

                let fetcher = act.fetcher.clone();
                let board = act.board.clone();
                let future = stream::iter_ok::<_, LoopError>(works)
                    .and_then(move |work| process_thread(work, &fetcher, &board))
                    .collect();

                Box::new(
                    fut::wrap_future::<_, Self>(future)
                        .map(move |outcomes, act, _ctx| act.apply_outcomes(lctx, outcomes)),
                )
            });
        Box::new(step)
    }

    fn apply_outcomes(&mut self, mut lctx: LoopCtx, outcomes: Vec<ThreadOutcome>) -> LoopCtx {
        let adjust = self.config.asagi_compat.adjust_timestamps;
        let thread_text = self.board_config.thread_text();

        for outcome in &outcomes {
            if outcome.skipped {
                continue;
            }
            if outcome.from_catalog {
                lctx.catalog_updates += 1;
                debug!(
                    "/{}/: No. {}: adopted {} post(s) from the catalog",
                    self.board,
                    outcome.no,
                    outcome.posts.len()
                );
            } else {
                lctx.full_fetches += 1;
                debug!("/{}/: No. {}: fetched thread", self.board, outcome.no);
            }

            let thread = match lctx.catalog.thread(outcome.no) {
                Some(thread) => thread,
                None => continue,
            };

            let most_recent = outcome.posts.iter().map(|post| post.no).max();
            self.state
                .record_stats(outcome.no, thread.replies, thread.images, most_recent);
            let stats = self.state.stats(outcome.no).cloned().unwrap_or_default();
            let stats_row = ThreadStatsRow::build(thread, &outcome.posts, &stats, adjust);

            let rows: Vec<PostRow> = if thread_text {
                outcome
                    .posts
                    .iter()
                    .map(|post| PostRow::from_post(post, adjust))
                    .collect()
            } else {
                vec![]
            };

            lctx.write_items.push((rows, stats_row));
            lctx.deleted_posts.extend(outcome.deleted.iter().cloned());
        }

        if lctx.catalog_updates > 0 {
            info!(
                "/{}/: Updated {} thread(s) from catalog data",
                self.board, lctx.catalog_updates
            );
        }
        if lctx.full_fetches > 0 {
            info!("/{}/: Fetched {} thread(s) fully", self.board, lctx.full_fetches);
        }

        lctx.outcomes = outcomes;
        lctx
    }

    /// Commit every thread (posts + stats in one transaction each), flag deletions and archivals,
    /// and only then drop the metadata of classified missing threads.
    fn write_step(&mut self, mut lctx: LoopCtx) -> Step<LoopCtx> {
        let database = self.database.clone();
        let board = self.board.clone();

        let items = std::mem::replace(&mut lctx.write_items, vec![]);
        let deleted_posts = lctx.deleted_posts.clone();
        let deleted_threads = lctx.deleted_threads.clone();
        let archived = lctx.archived.clone();

        if !deleted_posts.is_empty() {
            info!("/{}/: Posts deleted: {:?}", self.board, deleted_posts);
        }
        if !deleted_threads.is_empty() {
            info!(
                "/{}/: Threads deleted by moderator: {:?}",
                self.board, deleted_threads
            );
        }
        if !archived.is_empty() {
            info!("/{}/: Threads archived: {:?}", self.board, archived);
        }

        let commits = {
            let database = database.clone();
            let board = board.clone();
            stream::iter_ok::<_, LoopError>(items)
                .and_then(move |(rows, stats)| {
                    send_with_retry(&database, CommitThread(board.clone(), rows, Some(stats)))
                })
                .collect()
                .map(|_| ())
        };

        let d1 = database.clone();
        let d2 = database.clone();
        let b1 = board.clone();
        let b2 = board.clone();
        let future = commits
            .and_then(move |_| send_with_retry(&database, MarkPostsDeleted(board, deleted_posts)))
            .and_then(move |_| send_with_retry(&d1, MarkThreadsDeleted(b1, deleted_threads)))
            .and_then(move |_| send_with_retry(&d2, MarkThreadsArchived(b2, archived)));

        let step = fut::wrap_future::<_, Self>(future).map(move |_, act, _ctx| {
            // Metadata for missing threads goes away only after the writes stuck.
            for &no in &lctx.missing {
                act.state.remove_meta(no);
            }
            lctx
        });
        Box::new(step)
    }

    /// Resolve the download policy for everything this loop observed and enqueue the results.
    fn media_step(&mut self, lctx: LoopCtx) -> Step<LoopCtx> {
        let mut hashes: Vec<String> = vec![];
        let mut seen = HashSet::new();
        for outcome in &lctx.outcomes {
            for post in &outcome.posts {
                if let Some(image) = &post.image {
                    if seen.insert(image.md5.clone()) {
                        hashes.push(image.md5.clone());
                    }
                }
            }
        }

        let step = self
            .database
            .send(GetImageRows(self.board.clone(), hashes))
            .map_err(LoopError::Mailbox)
            .into_actor(self)
            .and_then(move |res, act, _ctx| -> Step<LoopCtx> {
                let images = match res {
                    Ok(images) => images,
                    Err(err) => return Box::new(fut::err(LoopError::Db(err))),
                };

                let mut lctx = lctx;
                let plan = {
                    let mut threads = vec![];
                    for outcome in &lctx.outcomes {
                        if outcome.skipped || outcome.posts.is_empty() {
                            continue;
                        }
                        if let Some(thread) = lctx.catalog.thread(outcome.no) {
                            threads.push(media::ThreadMedia {
                                op: &thread.post,
                                posts: &outcome.posts,
                            });
                        }
                    }
                    media::plan_downloads(
                        &act.board,
                        &act.media_rules,
                        &act.config.media,
                        &threads,
                        &images,
                    )
                };

                lctx.downloads = plan.len();
                if !plan.is_empty() {
                    act.fetcher.do_send(FetchMedia(act.board.clone(), plan));
                }
                Box::new(fut::ok(lctx))
            });
        Box::new(step)
    }

    fn finish_iteration(&mut self, lctx: Option<LoopCtx>, started: Instant, ctx: &mut Context<Self>) {
        if let Some(lctx) = lctx {
            let summary = nonzero_list_format!(
                "{} unmodified",
                lctx.unmodified,
                "{} catalog-updated",
                lctx.catalog_updates,
                "{} fully fetched",
                lctx.full_fetches,
                "{} archived",
                lctx.archived.len(),
                "{} deleted",
                lctx.deleted_threads.len(),
                "{} pruned",
                lctx.pruned.len(),
                "{} download(s) queued",
                lctx.downloads,
            );
            if !summary.is_empty() {
                info!("/{}/: {}", self.board, summary);
            }
        }

        info!(
            "/{}/: Loop #{} completed in {:.1}s",
            self.board,
            self.loop_no,
            started.elapsed().as_secs_f64(),
        );

        self.loop_no += 1;
        self.consecutive_failures = 0;
        self.persist_state();
        self.schedule_next(self.loop_cooldown(), ctx);
    }

    fn handle_failure(&mut self, err: LoopError, ctx: &mut Context<Self>) {
        match err {
            LoopError::Validation(err) => {
                error!("/{}/: Aborting loop: {}", self.board, err);
                self.loop_no += 1;
                self.persist_state();
                self.schedule_next(self.loop_cooldown(), ctx);
            }
            LoopError::Db(err) => {
                error!(
                    "/{}/: Aborting loop after database error: {}",
                    self.board, err
                );
                self.loop_no += 1;
                self.persist_state();
                self.schedule_next(self.loop_cooldown(), ctx);
            }
            LoopError::Mailbox(err) => {
                self.consecutive_failures += 1;
                error!(
                    "/{}/: Critical error ({} consecutive): {}",
                    self.board, self.consecutive_failures, err
                );
                self.persist_state();

                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    error!(
                        "Critical error count reached {}, exiting",
                        MAX_CONSECUTIVE_FAILURES
                    );
                    System::current().stop();
                    return;
                }

                let backoff = Duration::from_secs(u64::from(self.consecutive_failures) * 60);
                info!(
                    "/{}/: Sleeping {}s, maybe the issue will resolve itself by then",
                    self.board,
                    backoff.as_secs()
                );
                self.schedule_next(backoff, ctx);
            }
        }
    }

    fn loop_cooldown(&self) -> Duration {
        let cooldown = self.config.scraping.loop_cooldown();
        if self.config.network.add_random {
            cooldown + Duration::from_millis(rand::thread_rng().gen_range(0..1000))
        } else {
            cooldown
        }
    }

    fn schedule_next(&mut self, delay: Duration, ctx: &mut Context<Self>) {
        ctx.run_later(delay, |act, ctx| act.start_iteration(ctx));
    }
}

fn process_thread(
    work: ThreadWork,
    fetcher: &Addr<Fetcher>,
    board: &Board,
) -> Box<Future<Item = ThreadOutcome, Error = LoopError>> {
    let ThreadWork {
        no,
        existing,
        action,
    } = work;

    match action {
        ThreadAction::CatalogUpdate(posts) => Box::new(future::ok(ThreadOutcome {
            no,
            posts,
            deleted: vec![],
            from_catalog: true,
            skipped: false,
        })),
        ThreadAction::FullFetch => {
            let board = board.clone();
            Box::new(
                fetcher
                    .send(FetchThread(board.clone(), no))
                    .map_err(LoopError::Mailbox)
                    .and_then(move |res| match res {
                        Ok(Fetched::Fresh(posts)) => {
                            if posts.is_empty()
                                || posts[0].no != no
                                || posts[0].reply_to != 0
                                || posts.iter().skip(1).any(|post| post.reply_to != no)
                            {
                                return Err(LoopError::Validation(
                                    ValidationError::InvalidReplyTo(no),
                                ));
                            }
                            for post in &posts {
                                post.validate().map_err(LoopError::Validation)?;
                            }

                            let found: HashSet<u64> = posts.iter().map(|post| post.no).collect();
                            let deleted: Vec<u64> = existing
                                .iter()
                                .cloned()
                                .filter(|num| !found.contains(num))
                                .collect();

                            Ok(ThreadOutcome {
                                no,
                                posts,
                                deleted,
                                from_catalog: false,
                                skipped: false,
                            })
                        }
                        Ok(Fetched::NotModified) => Ok(ThreadOutcome::skip(no)),
                        Err(err) => {
                            // Absence of data; the next loop will try again.
                            warn!("/{}/: No. {}: Failed to fetch thread: {}", board, no, err);
                            Ok(ThreadOutcome::skip(no))
                        }
                    }),
            )
        }
    }
}

/// Send a write to the database, retrying once after a short pause. A second failure aborts the
/// caller's loop.
fn send_with_retry<M>(database: &Addr<Database>, msg: M) -> Box<Future<Item = (), Error = LoopError>>
where
    M: Message<Result = Result<(), DbError>> + Clone + Send + 'static,
    Database: Handler<M>,
    <Database as Actor>::Context: actix::dev::ToEnvelope<Database, M>,
{
    let retry_msg = msg.clone();
    let retry_database = database.clone();

    Box::new(
        database
            .send(msg)
            .map_err(LoopError::Mailbox)
            .and_then(move |res| match res {
                Ok(()) => Either::A(future::ok(())),
                Err(err) => {
                    warn!("Batch write failed, retrying once: {}", err);
                    Either::B(
                        Delay::new(Instant::now() + WRITE_RETRY_PAUSE)
                            .then(move |_| retry_database.send(retry_msg))
                            .map_err(LoopError::Mailbox)
                            .and_then(|res| res.map_err(LoopError::Db)),
                    )
                }
            }),
    )
}
