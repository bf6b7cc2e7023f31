use std::{
    error::Error,
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use async_io::Timer;
use pin_project_lite::pin_project;

pin_project! {
    /// Bounds a future with an async-io timer, mirroring tokio's `Timeout`.
    pub struct Timeout<F> {
        #[pin]
        future: F,
        #[pin]
        deadline: Timer,
    }
}

impl<F> Timeout<F> {
    pub(super) fn new(future: F, dur: Duration) -> Timeout<F> {
        Timeout {
            future,
            deadline: Timer::after(dur),
        }
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(v) = this.future.poll(cx) {
            return Poll::Ready(Ok(v));
        }
        match this.deadline.poll(cx) {
            Poll::Ready(_) => Poll::Ready(Err(Elapsed(()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// An error returned when a future times out.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Elapsed(());

impl Error for Elapsed {}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        "future has timed out".fmt(f)
    }
}
