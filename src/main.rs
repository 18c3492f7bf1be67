extern crate actix;
extern crate env_logger;
extern crate failure;
extern crate futures;
extern crate hyper;
extern crate hyper_tls;
#[macro_use]
extern crate log;
#[macro_use]
extern crate magpie;
extern crate serde_json;
extern crate tokio;

use std::collections::HashSet;
use std::fs;
use std::process;
use std::sync::Arc;

use actix::prelude::*;
use failure::{Error, ResultExt};
use futures::prelude::*;
use hyper::Client;
use hyper_tls::HttpsConnector;
use tokio::runtime::Runtime;

use magpie::actors::*;
use magpie::config::{self, Config};
use magpie::four_chan::{Board, BoardsWrapper};
use magpie::state::{self, HttpCache, HTTP_CACHE_CAP};

fn main() {
    env_logger::init();

    let config = config::parse_config().unwrap_or_else(|err| {
        log_error!(err.as_fail());
        process::exit(1);
    });
    let config = Arc::new(config);

    let keeper = StateKeeper::new(config.scraping.cache_dir.clone());

    let boards_with_archive = load_boards_with_archive(&config).unwrap_or_else(|err| {
        log_error!(err.as_fail());
        process::exit(1);
    });
    info!("{} board(s) have archive support", boards_with_archive.len());

    let sys = System::new("magpie");

    // Stop the system gracefully on SIGINT/SIGTERM so every actor flushes its caches on the way
    // out.
    let _signals = actix::actors::signal::DefaultSignalsHandler::default().start();

    let database = Database::new(&config.database, config.asagi_compat.adjust_timestamps)
        .unwrap_or_else(|err| {
            error!("Database initialization error: {}", err);
            process::exit(1);
        })
        .start();

    let http_cache = HttpCache::from_map(keeper.http_cache(), HTTP_CACHE_CAP);
    let board_states: Vec<_> = config
        .boards
        .keys()
        .map(|board| (board.clone(), keeper.board_state(board)))
        .collect();
    let state_keeper = keeper.start();

    let fetcher = Fetcher::create(
        &config,
        database.clone(),
        state_keeper.clone(),
        http_cache,
    )
    .unwrap_or_else(|err| {
        log_error!(err.as_fail());
        process::exit(1);
    });

    for (board, snapshot) in board_states {
        let has_archive = boards_with_archive.contains(&board);
        BoardScraper::new(
            board,
            config.clone(),
            has_archive,
            snapshot,
            fetcher.clone(),
            database.clone(),
            state_keeper.clone(),
        )
        .unwrap_or_else(|err| {
            log_error!(err.as_fail());
            process::exit(1);
        })
        .start();
    }

    sys.run();
}

/// Consult `boards.json` once to learn which boards keep an archive. The response is cached on
/// disk so restarts don't depend on the network.
fn load_boards_with_archive(config: &Config) -> Result<HashSet<Board>, Error> {
    let path = config.scraping.cache_dir.join("boards.json");

    let wrapper: BoardsWrapper = match state::read_json(&path) {
        Some(wrapper) => {
            info!("Loaded boards.json from {}", path.display());
            wrapper
        }
        None => {
            let url = config.endpoints.boards_url();
            info!("Fetching {}", url);

            let mut runtime = Runtime::new().context("Could not create runtime")?;
            let https = HttpsConnector::new(1).context("Could not create HttpsConnector")?;
            let client = Client::builder().build::<_, hyper::Body>(https);
            let uri: hyper::Uri = url.parse::<hyper::Uri>().context("Invalid boards.json URL")?;

            let body = runtime
                .block_on(client.get(uri).and_then(|res| res.into_body().concat2()))
                .context("Could not fetch boards.json")?;
            drop(client);
            runtime.shutdown_now().wait().ok();

            let wrapper: BoardsWrapper =
                serde_json::from_slice(&body).context("Could not parse boards.json")?;

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("Could not create the cache directory")?;
            }
            fs::write(&path, &body).context("Could not cache boards.json")?;
            wrapper
        }
    };

    if wrapper.boards.is_empty() {
        return Err(failure::err_msg("boards.json lists no boards"));
    }

    let with_archive: HashSet<Board> = wrapper
        .boards
        .into_iter()
        .filter(|board| board.is_archived)
        .map(|board| board.board)
        .collect();
    if with_archive.is_empty() {
        warn!("No board has archive support; vanished threads can only be deleted or pruned");
    }
    Ok(with_archive)
}
