//! Cross-thread counter that wakes the loop.
//!
//! Any thread may call [`CounterHandle::increment`]; the loop later runs the
//! counter's callback once with the accumulated count. All counters share the
//! loop's single [`Waker`] and are checked whenever it fires.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mio::{Token, Waker};

use super::{Outcome, TickCallback};
use crate::error::PollEventError;

/// Thread-safe handle used to increment a counter.
#[derive(Clone)]
pub struct CounterHandle {
    count: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    waker: Arc<Waker>,
    token: Token,
}

impl CounterHandle {
    /// Add one and wake the loop.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Add `n` and wake the loop. Ignored once the counter is closed.
    pub fn add(&self, n: u64) {
        if n == 0 || self.closed.load(Ordering::Acquire) {
            return;
        }
        self.count.fetch_add(n, Ordering::AcqRel);
        if let Err(e) = self.waker.wake() {
            tracing::warn!("Failed to wake event loop for counter {:?}: {}", self.token, e);
        }
    }

    /// Token the counter is registered under.
    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Check if the counter was closed by the loop.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CounterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterHandle")
            .field("token", &self.token)
            .field("count", &self.count.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub struct CounterEvent {
    handle: CounterHandle,
    on_fire: TickCallback,
}

impl CounterEvent {
    pub(crate) fn new(waker: Arc<Waker>, token: Token, on_fire: TickCallback) -> Self {
        Self {
            handle: CounterHandle {
                count: Arc::new(AtomicU64::new(0)),
                closed: Arc::new(AtomicBool::new(false)),
                waker,
                token,
            },
            on_fire,
        }
    }

    pub fn handle(&self) -> CounterHandle {
        self.handle.clone()
    }

    /// Take the accumulated count.
    pub(crate) fn process(&mut self) -> Result<Outcome, PollEventError> {
        if self.handle.is_closed() {
            return Err(PollEventError::AlreadyClosed);
        }
        match self.handle.count.swap(0, Ordering::AcqRel) {
            0 => Ok(Outcome::Idle),
            count => Ok(Outcome::Tick {
                count,
                on_fire: self.on_fire.clone(),
            }),
        }
    }

    pub(crate) fn close(&mut self) {
        self.handle.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;
    use std::rc::Rc;

    fn counter() -> (Poll, CounterEvent) {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(usize::MAX)).unwrap());
        let event = CounterEvent::new(waker, Token(3), Rc::new(|_, _, _| {}));
        (poll, event)
    }

    #[test]
    fn test_counts_accumulate_between_polls() {
        let (_poll, mut event) = counter();
        let handle = event.handle();
        handle.increment();
        handle.increment();
        handle.add(3);

        match event.process().unwrap() {
            Outcome::Tick { count, .. } => assert_eq!(count, 5),
            _ => panic!("expected tick"),
        }
        assert!(matches!(event.process().unwrap(), Outcome::Idle));
    }

    #[test]
    fn test_increment_from_other_thread() {
        let (_poll, mut event) = counter();
        let handle = event.handle();
        std::thread::spawn(move || {
            for _ in 0..100 {
                handle.increment();
            }
        })
        .join()
        .unwrap();

        match event.process().unwrap() {
            Outcome::Tick { count, .. } => assert_eq!(count, 100),
            _ => panic!("expected tick"),
        }
    }

    #[test]
    fn test_closed_counter_ignores_increments() {
        let (_poll, mut event) = counter();
        let handle = event.handle();
        event.close();
        handle.increment();
        assert!(handle.is_closed());
        assert!(matches!(event.process(), Err(PollEventError::AlreadyClosed)));
    }
}
