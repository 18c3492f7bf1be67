//! Failed media downloads wait out an exponential backoff before re-entering the pipeline.

use std::time::Duration;

use futures::{
    prelude::*,
    stream::Fuse,
    sync::mpsc::{self, Receiver, Sender},
};
use tokio::timer::DelayQueue;

use crate::config::RetryBackoffConfig;
use crate::four_chan::Board;
use crate::media::MediaRequest;

/// One media download together with its retry budget. Every trip through the backlog multiplies
/// the next delay by the configured factor; once the delay passes the cap, the file is given up
/// on until some later loop wants it again.
pub struct MediaDownload {
    pub board: Board,
    pub request: MediaRequest,
    delay: Duration,
    factor: u32,
    max: Duration,
}

impl MediaDownload {
    pub fn new(board: Board, request: MediaRequest, config: &RetryBackoffConfig) -> Self {
        Self {
            board,
            request,
            delay: config.base(),
            factor: config.factor,
            max: config.max(),
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.delay <= self.max
    }
}

/// The backlog of failed downloads. Downloads sent to the paired `Sender` sit in a timer for
/// their current delay and come back out of this stream once it elapses, with the next delay
/// already escalated. Callers check [`MediaDownload::has_attempts_left`] before re-queueing; the
/// backlog itself never drops anything.
pub struct Backlog {
    pending: Fuse<Receiver<MediaDownload>>,
    timer: DelayQueue<MediaDownload>,
}

pub fn backlog_channel(buffer: usize) -> (Sender<MediaDownload>, Backlog) {
    let (sender, receiver) = mpsc::channel(buffer);
    let backlog = Backlog {
        pending: receiver.fuse(),
        timer: DelayQueue::new(),
    };
    (sender, backlog)
}

impl Stream for Backlog {
    type Item = MediaDownload;
    type Error = ();

    fn poll(&mut self) -> Poll<Option<MediaDownload>, ()> {
        let mut closed = false;

        loop {
            match self.pending.poll()? {
                Async::Ready(Some(mut download)) => {
                    let wait = download.delay;
                    download.delay *= download.factor;
                    self.timer.insert(download, wait);
                }
                Async::NotReady => break,
                Async::Ready(None) => {
                    closed = true;
                    break;
                }
            }
        }

        match self.timer.poll() {
            Ok(Async::Ready(Some(expired))) => Ok(Async::Ready(Some(expired.into_inner()))),
            Ok(Async::NotReady) => Ok(Async::NotReady),
            Ok(Async::Ready(None)) => {
                if closed {
                    Ok(Async::Ready(None))
                } else {
                    Ok(Async::NotReady)
                }
            }
            // A failed timer can't be waited out or shed; nothing sensible is left to do.
            Err(err) => panic!("Media retry timer failed: {}", err),
        }
    }
}
