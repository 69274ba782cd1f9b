//! Timing primitives shared by the intercom runtime.
//!
//! - [`ActivityTimer`]: tracks when a peer was last heard from.
//! - [`Ticker`]: a background thread invoking a callback on a fixed cadence, with a
//!   cancellation that is complete by the time [`Ticker::stop`] returns.

use core::{ops::ControlFlow, time::Duration};
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

/// A lightweight wrapper around [`Instant`] used to track inactivity.
/// Stores the instant at which the timer was last reset.
///
/// ```
/// # use intercom_utils::ActivityTimer;
/// let mut timer = ActivityTimer::new();
///
/// // we have heard from the peer.
/// timer.reset();
///
/// assert!(timer.elapsed() < core::time::Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityTimer(Instant);

impl Default for ActivityTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTimer {
    /// Creates a new timer starting at the current instant.
    #[inline(always)]
    pub fn new() -> Self {
        Self(Instant::now())
    }

    /// Resets the timer to start measuring elapsed time from now.
    #[inline(always)]
    pub fn reset(&mut self) {
        *self = Self::new()
    }

    /// The instant of the last reset.
    #[inline(always)]
    pub const fn last_reset(&self) -> Instant {
        self.0
    }

    /// Returns the amount of time elapsed since the last reset.
    #[inline(always)]
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }

    /// Returns the instant at which the timer will have been idle for `timeout`.
    #[inline(always)]
    pub fn deadline(&self, timeout: Duration) -> Instant {
        self.0 + timeout
    }
}

/// A background thread calling a function every `period`.
///
/// The first call happens one full period after spawning. If a call overruns, the
/// following ones are rescheduled from the current instant instead of bursting to
/// catch up.
///
/// The callback ends the ticker by returning [`ControlFlow::Break`]. Otherwise,
/// [`stop`](Self::stop) (or dropping the ticker) ends it: once `stop` returns, the
/// callback is not running and will never run again.
#[derive(Debug)]
pub struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Ticker {
    /// Spawns a new, named ticker thread.
    pub fn spawn(
        name: impl Into<String>,
        period: Duration,
        mut tick: impl FnMut() -> ControlFlow<()> + Send + 'static,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new().name(name.into()).spawn(move || {
            let mut next_tick = Instant::now() + period;

            loop {
                if thread_stop.load(Ordering::Acquire) {
                    break;
                }

                let now = Instant::now();

                // spurious wakeups land here too
                if now < next_tick {
                    thread::park_timeout(next_tick - now);
                    continue;
                }

                if tick().is_break() {
                    break;
                }

                next_tick += period;

                let now = Instant::now();
                if next_tick < now {
                    log::trace!("ticker overran, rescheduling");
                    next_tick = now + period;
                }
            }
        })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Returns whether the ticker thread has exited (stopped, or broke out by itself).
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|handle| handle.is_finished())
    }

    /// Stops the ticker and waits for its thread to exit.
    ///
    /// Calling this from within the tick callback itself only requests the stop: the
    /// thread exits right after the current call returns.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);

        let Some(handle) = self.handle.take() else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            return;
        }

        handle.thread().unpark();

        if handle.join().is_err() {
            log::error!("ticker thread panicked");
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn activity_timer_deadline() {
        let timer = ActivityTimer::new();
        let start = timer.last_reset();

        assert_eq!(
            timer.deadline(Duration::from_secs(10)),
            start + Duration::from_secs(10)
        );
    }

    #[test]
    fn ticker_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::clone(&count);

        let mut ticker = Ticker::spawn("test-ticker", Duration::from_millis(2), move || {
            ticks.fetch_add(1, Ordering::Relaxed);
            ControlFlow::Continue(())
        })
        .unwrap();

        while count.load(Ordering::Relaxed) < 3 {
            thread::sleep(Duration::from_millis(1));
        }

        ticker.stop();
        assert!(ticker.is_finished());

        let after_stop = count.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::Relaxed), after_stop);
    }

    #[test]
    fn stop_does_not_wait_for_a_long_period() {
        let mut ticker =
            Ticker::spawn("idle-ticker", Duration::from_secs(3600), || ControlFlow::Continue(()))
                .unwrap();

        let start = Instant::now();
        ticker.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn ticker_can_break_by_itself() {
        let count = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::clone(&count);

        let ticker = Ticker::spawn("breaking-ticker", Duration::from_millis(1), move || {
            ticks.fetch_add(1, Ordering::Relaxed);
            ControlFlow::Break(())
        })
        .unwrap();

        while !ticker.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
