use std::time::{Duration, Instant};

use futures::prelude::*;
use futures::stream::Fuse;
use rand::Rng;
use tokio::timer::Delay;

/// Pacing for one request class.
#[derive(Clone, Copy)]
pub struct PaceSettings {
    /// Slept after every request before the next one may start.
    pub cooldown: Duration,
    /// Add a uniform [0, 1) s jitter to every cooldown.
    pub jitter: bool,
}

/// An adapter for a stream of futures which runs one future at a time and sleeps the configured
/// cooldown between completing one and starting the next. Requests of a class therefore never
/// hit the remote faster than the cooldown allows, no matter how many are queued.
#[must_use = "streams do nothing unless polled"]
pub struct Pace<S>
where
    S: Stream,
    S::Item: IntoFuture,
{
    stream: Fuse<S>,
    active: Option<<S::Item as IntoFuture>::Future>,
    delay: Option<Delay>,
    settings: PaceSettings,
}

impl<S> Pace<S>
where
    S: Stream,
    S::Item: IntoFuture<Error = <S as Stream>::Error>,
{
    pub fn new(stream: S, settings: PaceSettings) -> Self {
        Self {
            stream: stream.fuse(),
            active: None,
            delay: None,
            settings,
        }
    }

    fn arm_cooldown(&mut self) {
        let mut cooldown = self.settings.cooldown;
        if self.settings.jitter {
            cooldown += Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        }
        self.delay = Some(Delay::new(Instant::now() + cooldown));
    }
}

impl<S> Stream for Pace<S>
where
    S: Stream,
    S::Item: IntoFuture<Error = <S as Stream>::Error>,
{
    type Item = <S::Item as IntoFuture>::Item;
    type Error = <S as Stream>::Error;

    fn poll(&mut self) -> Poll<Option<Self::Item>, Self::Error> {
        if let Some(delay) = self.delay.as_mut() {
            match delay.poll() {
                Ok(Async::Ready(())) => self.delay = None,
                Ok(Async::NotReady) => return Ok(Async::NotReady),
                Err(err) => {
                    // There's not much we can do here. If the timer has shutdown, something has
                    // really gone wrong. If the timer is at capacity, something has also gone
                    // wrong, and we can't shed load because that would require dropping ourselves.
                    panic!("Timer error: {}", err);
                }
            }
        }

        if self.active.is_none() {
            match self.stream.poll()? {
                Async::Ready(Some(item)) => self.active = Some(item.into_future()),
                Async::Ready(None) => return Ok(Async::Ready(None)),
                Async::NotReady => return Ok(Async::NotReady),
            }
        }

        match self.active.as_mut().expect("no active future").poll() {
            Ok(Async::Ready(value)) => {
                self.active = None;
                self.arm_cooldown();
                Ok(Async::Ready(Some(value)))
            }
            Ok(Async::NotReady) => Ok(Async::NotReady),
            Err(err) => {
                self.active = None;
                self.arm_cooldown();
                Err(err)
            }
        }
    }
}

pub trait StreamExt: Sized {
    fn pace(self, settings: PaceSettings) -> Pace<Self>
    where
        Self: Stream,
        <Self as Stream>::Item: IntoFuture<Error = <Self as Stream>::Error>;
}

impl<T: Sized> StreamExt for T {
    fn pace(self, settings: PaceSettings) -> Pace<Self>
    where
        Self: Stream,
        <Self as Stream>::Item: IntoFuture<Error = <Self as Stream>::Error>,
    {
        Pace::new(self, settings)
    }
}
