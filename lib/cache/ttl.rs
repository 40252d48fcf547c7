//! Rearm-on-access idle timers.
//!
//! A [`TtlTimer`] stores only a deadline. Rearming moves the deadline forward and, if no driver
//! task is alive for the timer, spawns one. The driver sleeps until the stored deadline and then
//! asks its owner, under the owner's lock, whether the deadline really passed; if the deadline
//! moved in the meantime it simply sleeps again. Deciding and expiring in the same critical
//! section means an access racing with expiry can never be lost.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;

/// Which of an entity's two timers fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Drops the memory snapshot.
    Memory,
    /// Deletes the on-disk file.
    File,
}

/// What a timer driver should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerPoll {
    /// The deadline has not passed yet; sleep until it.
    Sleep(Instant),
    /// The deadline passed; the owner must expire now.
    Fire,
    /// The timer was disarmed; the driver exits.
    Stop,
}

/// Owner of one or more [`TtlTimer`]s.
pub(crate) trait Expire: Send + Sync + 'static {
    /// Poll the `kind` timer and, if it fired, run the expiry. Returns the instant to sleep until,
    /// or `None` if the driver should exit.
    fn on_timer(self: &Arc<Self>, kind: TimerKind) -> Option<Instant>;
}

/// A single idle timer. Not thread-safe on its own; lives inside its owner's locked state.
#[derive(Debug, Default)]
pub(crate) struct TtlTimer {
    deadline: Option<Instant>,
    driver_alive: bool,
}

impl TtlTimer {
    /// Push the deadline to `now + ttl`, spawning a driver task if none is running.
    pub(crate) fn rearm<E: Expire>(&mut self, owner: &Arc<E>, kind: TimerKind, ttl: Duration) {
        self.deadline = Some(Instant::now() + ttl);
        if self.driver_alive {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(?kind, "no tokio runtime available; idle timer not started");
            return;
        };
        self.driver_alive = true;
        handle.spawn(drive(Arc::downgrade(owner), kind));
    }

    /// Cancel the timer. The driver notices on its next wake-up and exits.
    pub(crate) fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Called by the owner from [`Expire::on_timer`].
    pub(crate) fn poll(&mut self, now: Instant) -> TimerPoll {
        match self.deadline {
            None => {
                self.driver_alive = false;
                TimerPoll::Stop
            }
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                self.driver_alive = false;
                TimerPoll::Fire
            }
            Some(deadline) => TimerPoll::Sleep(deadline),
        }
    }
}

async fn drive<E: Expire>(owner: Weak<E>, kind: TimerKind) {
    loop {
        let next = {
            let Some(owner) = owner.upgrade() else {
                return;
            };
            owner.on_timer(kind)
        };
        match next {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Owner {
        timer: Mutex<TtlTimer>,
        fired: AtomicUsize,
    }

    impl Expire for Owner {
        fn on_timer(self: &Arc<Self>, _kind: TimerKind) -> Option<Instant> {
            let mut timer = self
                .timer
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match timer.poll(Instant::now()) {
                TimerPoll::Sleep(at) => Some(at),
                TimerPoll::Fire => {
                    self.fired.fetch_add(1, Ordering::SeqCst);
                    None
                }
                TimerPoll::Stop => None,
            }
        }
    }

    fn owner() -> Arc<Owner> {
        Arc::new(Owner {
            timer: Mutex::new(TtlTimer::default()),
            fired: AtomicUsize::new(0),
        })
    }

    fn rearm(owner: &Arc<Owner>, ttl: Duration) {
        owner
            .timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .rearm(owner, TimerKind::Memory, ttl);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_ttl() {
        let owner = owner();
        rearm(&owner, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(owner.fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(owner.fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(owner.fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_pushes_the_deadline_back() {
        let owner = owner();
        rearm(&owner, Duration::from_secs(10));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            rearm(&owner, Duration::from_secs(10));
        }
        assert_eq!(owner.fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(owner.fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_timer_never_fires() {
        let owner = owner();
        rearm(&owner, Duration::from_secs(1));
        owner
            .timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .disarm();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(owner.fired.load(Ordering::SeqCst), 0);
    }
}
