//! Accumulation windows: how long a batch stays open for new keys.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_timer::Delay;
use serde::{Deserialize, Serialize};

/// How long a batch keeps accepting keys after it is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    /// Stay open until the scheduler has had one chance to poll every other
    /// ready future. Every load issued during the same round of polling
    /// ends up in the same batch.
    #[default]
    Tick,

    /// Stay open for a fixed amount of time. Useful when the loads come from
    /// independent tasks (or threads) rather than from one joined future.
    Delay(Duration),
}

impl Window {
    pub(crate) fn start(&self) -> WindowFuture {
        match *self {
            Window::Tick => WindowFuture::Tick { yielded: false },
            Window::Delay(duration) => WindowFuture::Delay(Delay::new(duration)),
        }
    }
}

#[derive(Debug)]
pub(crate) enum WindowFuture {
    Tick { yielded: bool },
    Delay(Delay),
}

impl Future for WindowFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        match self.get_mut() {
            WindowFuture::Tick { yielded: true } => Poll::Ready(()),
            WindowFuture::Tick { yielded } => {
                *yielded = true;
                ctx.waker().wake_by_ref();
                Poll::Pending
            }
            WindowFuture::Delay(delay) => Pin::new(delay).poll(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{task::noop_waker, FutureExt};

    #[test]
    fn tick_yields_exactly_once() {
        let waker = noop_waker();
        let mut ctx = Context::from_waker(&waker);
        let mut window = Window::Tick.start();

        assert_eq!(window.poll_unpin(&mut ctx), Poll::Pending);
        assert_eq!(window.poll_unpin(&mut ctx), Poll::Ready(()));
    }

    #[test]
    fn delay_window_elapses() {
        let window = Window::Delay(Duration::from_millis(5)).start();
        futures::executor::block_on(window);
    }
}
