//! An actor which fetches catalogs, threads, archive indices, and media from the remote API.
//!
//! All JSON requests funnel through a single paced channel, so the per-host request rate stays
//! governed by one cooldown schedule no matter how many boards are scraping. Media downloads get
//! their own channels, paced per media class.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix::prelude::*;
use failure::{Error, ResultExt};
use futures::future::{self, Either};
use futures::prelude::*;
use futures::sync::mpsc::{self, Sender};
use hyper::client::{Client, HttpConnector};
use hyper::header::{self, HeaderValue};
use hyper::{Body, Request, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::prelude::FutureExt as TokioFutureExt;
use tokio::runtime::Runtime;

use super::database::{Database, RecordImage};
use super::state_keeper::{PersistHttpCache, StateKeeper};
use crate::config::{Config, EndpointsConfig};
use crate::four_chan::Board;
use crate::media::{self, MediaKind, MediaRequest};
use crate::state::HttpCache;

mod error;
mod messages;
mod pace;
mod retry;

pub use self::error::{FetchError, Fetched};
pub use self::messages::*;

use self::pace::{PaceSettings, StreamExt};
use self::retry::{backlog_channel, MediaDownload};

type HttpsClient = Client<HttpsConnector<HttpConnector>>;

const API_CHANNEL_CAPACITY: usize = 500;
const MEDIA_CHANNEL_CAPACITY: usize = 1000;

/// Read timeout for a single JSON request. Media bodies are bounded by their expected size
/// instead.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the header cache is shipped to the state keeper.
const PERSIST_INTERVAL: Duration = Duration::from_secs(60);

/// Below this loop cooldown, connections never sit idle long enough to go stale.
const RECYCLE_MIN_LOOP_COOLDOWN: f64 = 15.0;

pub struct Fetcher {
    client: Arc<HttpsClient>,
    http_cache: HttpCache,
    ignore_http_cache: bool,
    endpoints: EndpointsConfig,
    api_sender: Sender<Box<Future<Item = (), Error = ()>>>,
    image_sender: Sender<(Board, MediaRequest)>,
    video_sender: Sender<(Board, MediaRequest)>,
    state_keeper: Addr<StateKeeper>,
    recycle_interval: Option<Duration>,
    // Media futures need their own runtime because tokio::fs functions can't run on the
    // current_thread runtime that Actix provides
    runtime: Runtime,
}

impl Actor for Fetcher {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.run_interval(PERSIST_INTERVAL, |act, _ctx| act.persist_http_cache());

        if let Some(interval) = self.recycle_interval {
            ctx.run_interval(interval, |act, _ctx| match HttpsConnector::new(2) {
                Ok(https) => {
                    act.client = Arc::new(Client::builder().build::<_, Body>(https));
                }
                Err(err) => error!("Could not recycle the HTTP client: {}", err),
            });
        }
    }

    fn stopping(&mut self, _ctx: &mut Self::Context) -> Running {
        self.persist_http_cache();
        Running::Stop
    }
}

impl Fetcher {
    pub fn create(
        config: &Config,
        database: Addr<Database>,
        state_keeper: Addr<StateKeeper>,
        http_cache: HttpCache,
    ) -> Result<Addr<Self>, Error> {
        Ok(Self::new(config, database, state_keeper, http_cache)?.start())
    }

    fn new(
        config: &Config,
        database: Addr<Database>,
        state_keeper: Addr<StateKeeper>,
        http_cache: HttpCache,
    ) -> Result<Self, Error> {
        let mut runtime = Runtime::new().context("Could not create media runtime")?;
        let https = HttpsConnector::new(2).context("Could not create HttpsConnector")?;
        let client = Arc::new(Client::builder().build::<_, Body>(https));

        let api_sender = {
            let (sender, receiver) = mpsc::channel(API_CHANNEL_CAPACITY);
            Arbiter::spawn(
                receiver
                    .pace(PaceSettings {
                        cooldown: config.network.request_cooldown(),
                        jitter: config.network.add_random,
                    })
                    .for_each(|_| Ok(())),
            );
            sender
        };

        let image_sender = media_pipeline(
            &mut runtime,
            &client,
            &database,
            config,
            PaceSettings {
                cooldown: config.network.image_cooldown(),
                jitter: config.network.add_random,
            },
        );
        let video_sender = media_pipeline(
            &mut runtime,
            &client,
            &database,
            config,
            PaceSettings {
                cooldown: config.network.video_cooldown(),
                jitter: config.network.add_random,
            },
        );

        let recycle_interval = if config.scraping.loop_cooldown_sec >= RECYCLE_MIN_LOOP_COOLDOWN {
            Some(config.scraping.loop_cooldown())
        } else {
            None
        };

        Ok(Self {
            client,
            http_cache,
            ignore_http_cache: config.network.ignore_http_cache,
            endpoints: config.endpoints.clone(),
            api_sender,
            image_sender,
            video_sender,
            state_keeper,
            recycle_interval,
            runtime,
        })
    }

    fn persist_http_cache(&self) {
        self.state_keeper
            .do_send(PersistHttpCache(self.http_cache.snapshot()));
    }

    /// GET a JSON endpoint through the conditional-request cache.
    ///
    /// 200 parses the body and records the response's `Last-Modified`; 304 records the header and
    /// returns `NotModified` without touching the body; everything else is an error the caller
    /// treats as absence of data.
    fn fetch_json<T: DeserializeOwned + 'static>(
        &self,
        url: String,
        fetcher: Addr<Fetcher>,
    ) -> Box<Future<Item = Fetched<T>, Error = FetchError>> {
        let uri: Uri = match url.parse() {
            Ok(uri) => uri,
            Err(err) => return Box::new(future::err(FetchError::from(err))),
        };

        let mut request = Request::get(uri).body(Body::default()).unwrap();
        let use_cache = !self.ignore_http_cache;
        if use_cache {
            if let Some(cached) = self.http_cache.get(&url) {
                if let Ok(value) = HeaderValue::from_str(cached) {
                    request.headers_mut().insert(header::IF_MODIFIED_SINCE, value);
                }
            }
        }

        let future = self
            .client
            .request(request)
            .from_err()
            .and_then(move |res| {
                let status = res.status();
                let last_modified = res
                    .headers()
                    .get(header::LAST_MODIFIED)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);

                let update: Box<Future<Item = (), Error = FetchError>> =
                    match (use_cache, last_modified) {
                        (true, Some(header)) => Box::new(
                            fetcher
                                .send(UpdateLastModified(url.clone(), header))
                                .from_err(),
                        ),
                        _ => Box::new(future::ok(())),
                    };

                let body: Box<Future<Item = Fetched<hyper::Chunk>, Error = FetchError>> =
                    match status {
                        StatusCode::OK => {
                            Box::new(res.into_body().concat2().from_err().map(Fetched::Fresh))
                        }
                        StatusCode::NOT_MODIFIED => Box::new(future::ok(Fetched::NotModified)),
                        StatusCode::NOT_FOUND => {
                            Box::new(future::err(FetchError::NotFound(url.clone())))
                        }
                        status => Box::new(future::err(status.into())),
                    };

                update.and_then(|_| body)
            })
            .and_then(|fetched| match fetched {
                Fetched::Fresh(body) => Ok(Fetched::Fresh(serde_json::from_slice(&body)?)),
                Fetched::NotModified => Ok(Fetched::NotModified),
            })
            .timeout(REQUEST_TIMEOUT)
            .map_err(|err| err.into_inner().unwrap_or(FetchError::TimedOut));

        Box::new(future)
    }
}

fn media_pipeline(
    runtime: &mut Runtime,
    client: &Arc<HttpsClient>,
    database: &Addr<Database>,
    config: &Config,
    settings: PaceSettings,
) -> Sender<(Board, MediaRequest)> {
    let (sender, receiver) = mpsc::channel(MEDIA_CHANNEL_CAPACITY);
    let (backlog_sender, backlog) = backlog_channel(MEDIA_CHANNEL_CAPACITY);

    let client = client.clone();
    let database = database.clone();
    let media_root = config.media.media_save_path.clone();
    let endpoints = config.endpoints.clone();
    let retry_backoff = config.network.retry_backoff;
    let allow_mismatched_md5 = config.media.download_files_with_mismatched_md5;

    let future = receiver
        .map(move |(board, request): (Board, MediaRequest)| {
            MediaDownload::new(board, request, &retry_backoff)
        })
        .select(backlog)
        .map(move |download| {
            let backlog_sender = backlog_sender.clone();
            fetch_media(
                &download,
                &client,
                &database,
                media_root.clone(),
                endpoints.clone(),
                allow_mismatched_md5,
            )
            .or_else(move |err| {
                let will_retry = download.has_attempts_left() && err.is_transient();

                match err {
                    // The planner raced an earlier download for the same file; nothing to do.
                    FetchError::ExistingMedia => {}
                    _ => error!(
                        "/{}/: Failed to fetch media {}, {}retrying: {}",
                        download.board,
                        download.request.filename,
                        if will_retry { "" } else { "not " },
                        err
                    ),
                }

                if will_retry {
                    Either::A(
                        backlog_sender
                            .send(download)
                            .map(|_| ())
                            .map_err(|err| error!("{}", err)),
                    )
                } else {
                    Either::B(future::ok(()))
                }
            })
        })
        .pace(settings)
        .for_each(|_| Ok(()));
    runtime.spawn(future);
    sender
}

fn fetch_media(
    download: &MediaDownload,
    client: &Arc<HttpsClient>,
    database: &Addr<Database>,
    media_root: PathBuf,
    endpoints: EndpointsConfig,
    allow_mismatched_md5: bool,
) -> impl Future<Item = (), Error = FetchError> {
    let board = download.board.clone();
    let request = download.request.clone();

    let target = media::media_path(&media_root, &board, request.kind, &request.filename);
    if target.exists() {
        return Either::A(future::err(FetchError::ExistingMedia));
    }

    let mut tmp_dir = media_root.clone();
    tmp_dir.push(board.as_str());
    tmp_dir.push("tmp");
    let mut tmp_path = tmp_dir.clone();
    tmp_path.push(&request.filename);

    let url = match request.kind {
        MediaKind::Full => endpoints.full_media_url(&board, request.tim, &request.ext),
        MediaKind::Thumb => endpoints.thumbnail_url(&board, request.tim),
    };
    // A short random query string keeps intermediate caches from serving stale copies.
    let busted = format!("{}?{:08x}", url, rand::thread_rng().gen::<u32>());
    let uri: Uri = match busted.parse() {
        Ok(uri) => uri,
        Err(err) => return Either::A(future::err(FetchError::from(err))),
    };

    let client = client.clone();
    let database = database.clone();
    let db_board = board.clone();
    let db_filename = request.filename.clone();
    let log_filename = request.filename.clone();
    let kind = request.kind;
    let record_md5 = request.md5.clone();
    let expected_size = request.expected_size;
    let expected_md5 = request.md5.clone();

    let future = client
        .get(uri)
        .from_err()
        .and_then(move |res| match res.status() {
            StatusCode::OK => Ok(res),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound(url)),
            status => Err(status.into()),
        })
        .and_then(|res| res.into_body().concat2().from_err())
        .and_then(move |body| {
            verify_body(&body, expected_size, expected_md5.as_ref(), allow_mismatched_md5)?;
            Ok(body)
        })
        .and_then(move |body| {
            let dirs = create_dir_0775(&tmp_dir)
                .and_then(|_| create_dir_0775(target.parent().expect("sharded media path")));
            if let Err(err) = dirs {
                return Either::A(future::err(FetchError::from(err)));
            }

            let tmp_create = tmp_path.clone();
            Either::B(
                tokio::fs::File::create(tmp_create)
                    .from_err()
                    .and_then(move |file| tokio::io::write_all(file, body).from_err())
                    .and_then(move |(file, _)| {
                        drop(file);
                        tokio::fs::rename(tmp_path, target).from_err()
                    }),
            )
        })
        .and_then(move |_| {
            debug!("/{}/: Wrote {}", board, log_filename);
            match (kind, record_md5) {
                (MediaKind::Full, Some(hash)) => Either::A(
                    database
                        .send(RecordImage(db_board, hash, db_filename))
                        .from_err::<FetchError>()
                        .map(|res| {
                            if let Err(err) = res {
                                error!("Failed to record image row: {}", err);
                            }
                        }),
                ),
                _ => Either::B(future::ok(())),
            }
        });
    Either::B(future)
}

/// Check a downloaded media body against what the post promised. An oversized body means the
/// remote served the wrong file; an md5 mismatch is fatal unless configured otherwise.
fn verify_body(
    body: &[u8],
    expected_size: Option<u64>,
    expected_md5: Option<&String>,
    allow_mismatched_md5: bool,
) -> Result<(), FetchError> {
    if body.is_empty() {
        return Err(FetchError::EmptyBody);
    }

    if let Some(expected) = expected_size {
        if body.len() as u64 > expected {
            return Err(FetchError::OversizedBody {
                actual: body.len() as u64,
                expected,
            });
        }
    }

    if let Some(expected) = expected_md5 {
        let computed = base64::encode(*md5::compute(body));
        if &computed != expected {
            if allow_mismatched_md5 {
                warn!(
                    "Keeping media with mismatched md5: expected {}, computed {}",
                    expected, computed
                );
            } else {
                return Err(FetchError::Md5Mismatch {
                    expected: expected.clone(),
                    computed,
                });
            }
        }
    }

    Ok(())
}

/// Media directories are created mode 0775.
fn create_dir_0775(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o775)
            .create(path)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
    }
}
