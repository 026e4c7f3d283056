//! Time source injected into every timed component.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use time::OffsetDateTime;
use tokio::time::Instant;

/// Delay used to let the host commit style changes before a transition starts.
pub const FRAME: Duration = Duration::from_millis(16);

/// Clock shared between components.
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock reads and timer scheduling.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> OffsetDateTime;

    /// Suspend for `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Suspend until the next paint.
    fn next_frame(&self) -> BoxFuture<'static, ()> {
        self.sleep(FRAME)
    }
}

/// Production clock backed by the system time and tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Clock pinned to a chosen date that counts every timer it schedules.
///
/// Time advances with the tokio clock, so under `start_paused` tests the wall-clock date moves
/// exactly as far as the paused timers are advanced.
#[derive(Debug)]
pub struct VirtualClock {
    origin: OffsetDateTime,
    started: Instant,
    sleeps: AtomicUsize,
}

impl VirtualClock {
    /// Clock whose wall-clock time starts at `origin`.
    pub fn new(origin: OffsetDateTime) -> Arc<Self> {
        Arc::new(Self {
            origin,
            started: Instant::now(),
            sleeps: AtomicUsize::new(0),
        })
    }

    /// Number of timers scheduled since construction.
    pub fn scheduled_sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> OffsetDateTime {
        self.origin + self.started.elapsed()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        Box::pin(tokio::time::sleep(duration))
    }
}
