use actix::dev::{MessageResponse, ResponseChannel};
use actix::prelude::*;
use futures::prelude::*;
use futures::sync::mpsc::Sender;

use super::*;
use crate::four_chan::{Board, CatalogPage, Post, PostsWrapper};
use crate::media::{self, MediaRequest};

/// An Actix `MessageResponse` which queues a request future in the paced channel while the caller
/// waits on the response channel.
pub struct RateLimitedResponse<I, E> {
    pub sender: Sender<Box<Future<Item = (), Error = ()>>>,
    pub future: Box<Future<Item = I, Error = E>>,
}

impl<A, M, I: 'static, E: 'static> MessageResponse<A, M> for RateLimitedResponse<I, E>
where
    A: Actor,
    M: Message<Result = Result<I, E>>,
{
    fn handle<R: ResponseChannel<M>>(self, _: &mut A::Context, tx: Option<R>) {
        Arbiter::spawn(
            self.sender
                .send(Box::new(self.future.then(move |res| {
                    if let Some(tx) = tx {
                        tx.send(res);
                    }
                    Ok(())
                })))
                .map(|_| ())
                .map_err(|err| error!("Failed to queue request future: {}", err)),
        )
    }
}

// Request futures run detached inside the paced channel, so they can't borrow the Fetcher. The
// Fetcher instead sends a message to itself to record a response's Last-Modified header.
#[derive(Message)]
pub struct UpdateLastModified(pub String, pub String);

impl Handler<UpdateLastModified> for Fetcher {
    type Result = ();

    fn handle(&mut self, msg: UpdateLastModified, _: &mut Self::Context) {
        self.http_cache.set(msg.0, msg.1);
    }
}

pub struct FetchCatalog(pub Board);
impl Message for FetchCatalog {
    type Result = Result<Fetched<Vec<CatalogPage>>, FetchError>;
}

impl Handler<FetchCatalog> for Fetcher {
    type Result = RateLimitedResponse<Fetched<Vec<CatalogPage>>, FetchError>;

    fn handle(&mut self, msg: FetchCatalog, ctx: &mut Self::Context) -> Self::Result {
        RateLimitedResponse {
            sender: self.api_sender.clone(),
            future: self.fetch_json(self.endpoints.catalog_url(&msg.0), ctx.address()),
        }
    }
}

pub struct FetchThread(pub Board, pub u64);
impl Message for FetchThread {
    type Result = Result<Fetched<Vec<Post>>, FetchError>;
}

impl Handler<FetchThread> for Fetcher {
    type Result = RateLimitedResponse<Fetched<Vec<Post>>, FetchError>;

    fn handle(&mut self, msg: FetchThread, ctx: &mut Self::Context) -> Self::Result {
        let future = self
            .fetch_json::<PostsWrapper>(self.endpoints.thread_url(&msg.0, msg.1), ctx.address())
            .map(|fetched| fetched.map(|wrapper| wrapper.posts));
        RateLimitedResponse {
            sender: self.api_sender.clone(),
            future: Box::new(future),
        }
    }
}

pub struct FetchArchive(pub Board);
impl Message for FetchArchive {
    type Result = Result<Fetched<Vec<u64>>, FetchError>;
}

impl Handler<FetchArchive> for Fetcher {
    type Result = RateLimitedResponse<Fetched<Vec<u64>>, FetchError>;

    fn handle(&mut self, msg: FetchArchive, ctx: &mut Self::Context) -> Self::Result {
        RateLimitedResponse {
            sender: self.api_sender.clone(),
            future: self.fetch_json(self.endpoints.archive_url(&msg.0), ctx.address()),
        }
    }
}

/// Media downloads are fire-and-forget: results land on disk and in the images table.
#[derive(Message)]
pub struct FetchMedia(pub Board, pub Vec<MediaRequest>);

impl Handler<FetchMedia> for Fetcher {
    type Result = ();

    fn handle(&mut self, msg: FetchMedia, _: &mut Self::Context) {
        // If a media future panics, the media runtime will crash and the senders will close. The
        // Actix system has its own runtime, so it won't crash. But, we can't recover from a media
        // runtime panic, so if the media runtime crashes we crash the Actix system as well.
        if self.image_sender.is_closed() || self.video_sender.is_closed() {
            panic!("Media sender is closed");
        }

        let FetchMedia(board, requests) = msg;
        for request in requests {
            let sender = if media::is_video(&request.filename) {
                self.video_sender.clone()
            } else {
                self.image_sender.clone()
            };
            self.runtime.spawn(
                sender
                    .send((board.clone(), request))
                    .map(|_| ())
                    .map_err(|err| error!("{}", err)),
            );
        }
    }
}
