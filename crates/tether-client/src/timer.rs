//! Timers driven through the socket's command queue.
//!
//! A timer is a sleeping task that posts [`Command::Timer`] back to the
//! socket when it expires. Every arm gets a new generation, so an expiry
//! that races with a cancel or re-arm is recognised as stale and ignored.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;

use crate::channel::ChannelId;
use crate::options::Backoff;
use crate::push::PushId;
use crate::socket::Command;

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    Reconnect,
    Heartbeat,
    HeartbeatTimeout,
    Teardown,
    Rejoin(ChannelId),
    PushTimeout(ChannelId, PushId),
}

pub(crate) struct Timers {
    tx: WeakUnboundedSender<Command>,
    active: HashMap<TimerKey, (u64, JoinHandle<()>)>,
    generation: u64,
}

impl Timers {
    pub(crate) fn new(tx: WeakUnboundedSender<Command>) -> Self {
        Self {
            tx,
            active: HashMap::new(),
            generation: 0,
        }
    }

    /// Arm `key` to fire after `delay`, replacing any pending arm.
    pub(crate) fn schedule(&mut self, key: TimerKey, delay: Duration) {
        self.cancel(key);
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::Timer { key, generation });
            }
        });
        self.active.insert(key, (generation, handle));
    }

    pub(crate) fn cancel(&mut self, key: TimerKey) {
        if let Some((_, handle)) = self.active.remove(&key) {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self, key: TimerKey) -> bool {
        self.active.contains_key(&key)
    }

    /// Accept an expiry. Returns `false` if it belongs to a cancelled or
    /// replaced arm.
    pub(crate) fn fire(&mut self, key: TimerKey, generation: u64) -> bool {
        match self.active.get(&key) {
            Some((current, _)) if *current == generation => {
                self.active.remove(&key);
                true
            }
            _ => false,
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.active.drain() {
            handle.abort();
        }
    }
}

/// A timer retried with backoff.
///
/// `tries` counts expiries since the last reset and selects the next delay.
#[derive(Debug)]
pub(crate) struct RetryTimer {
    key: TimerKey,
    tries: u32,
}

impl RetryTimer {
    pub(crate) fn new(key: TimerKey) -> Self {
        Self { key, tries: 0 }
    }

    pub(crate) fn reset(&mut self, timers: &mut Timers) {
        self.tries = 0;
        timers.cancel(self.key);
    }

    pub(crate) fn schedule(&mut self, timers: &mut Timers, backoff: &Backoff) {
        timers.schedule(self.key, backoff(self.tries + 1));
    }

    pub(crate) fn fired(&mut self) {
        self.tries += 1;
    }

    #[cfg(test)]
    pub(crate) fn key(&self) -> TimerKey {
        self.key
    }

    #[cfg(test)]
    pub(crate) fn tries(&self) -> u32 {
        self.tries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn expect_timer(command: Option<Command>) -> (TimerKey, u64) {
        match command {
            Some(Command::Timer { key, generation }) => (key, generation),
            _ => panic!("expected a timer command"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_makes_previous_expiry_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx.downgrade());

        timers.schedule(TimerKey::Heartbeat, Duration::from_millis(100));
        let first = timers.active[&TimerKey::Heartbeat].0;
        timers.schedule(TimerKey::Heartbeat, Duration::from_millis(200));

        let (key, generation) = expect_timer(rx.recv().await);
        assert_eq!(key, TimerKey::Heartbeat);
        assert_ne!(generation, first);
        assert!(!timers.fire(key, first));
        assert!(timers.fire(key, generation));
        assert!(!timers.is_armed(TimerKey::Heartbeat));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx.downgrade());

        timers.schedule(TimerKey::Reconnect, Duration::from_millis(10));
        timers.cancel(TimerKey::Reconnect);
        timers.schedule(TimerKey::Teardown, Duration::from_millis(50));

        let (key, _) = expect_timer(rx.recv().await);
        assert_eq!(key, TimerKey::Teardown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timer_backoff() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx.downgrade());
        let backoff: Backoff = Arc::new(|tries| Duration::from_millis(u64::from(tries) * 100));
        let mut retry = RetryTimer::new(TimerKey::Reconnect);

        let start = tokio::time::Instant::now();
        retry.schedule(&mut timers, &backoff);
        let (key, generation) = expect_timer(rx.recv().await);
        assert!(timers.fire(key, generation));
        retry.fired();
        assert_eq!(start.elapsed(), Duration::from_millis(100));

        retry.schedule(&mut timers, &backoff);
        let _ = rx.recv().await;
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert_eq!(retry.tries(), 1);

        retry.reset(&mut timers);
        assert_eq!(retry.tries(), 0);
        assert_eq!(retry.key(), TimerKey::Reconnect);
    }
}
