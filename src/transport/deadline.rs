//! Absolute I/O deadlines for poll-based streams

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::Context;
use tokio::time::{Instant, Sleep};

/// An optional point in time after which an operation fails with `TimedOut`.
///
/// Once passed, the deadline keeps failing operations until it is moved or
/// cleared.
#[derive(Debug, Default)]
pub struct Deadline {
    at: Option<Instant>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    /// Set or clear (`None`) the deadline
    pub fn set(&mut self, at: Option<Instant>) {
        self.at = at;
        match (at, self.sleep.as_mut()) {
            (Some(at), Some(sleep)) => sleep.as_mut().reset(at),
            (Some(at), None) => self.sleep = Some(Box::pin(tokio::time::sleep_until(at))),
            (None, _) => self.sleep = None,
        }
    }

    pub fn get(&self) -> Option<Instant> {
        self.at
    }

    /// `Err(TimedOut)` once the deadline has passed. Otherwise registers the
    /// task to be woken when it does.
    pub fn poll_check(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if let Some(sleep) = self.sleep.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "i/o deadline exceeded",
                ));
            }
        }
        Ok(())
    }
}
