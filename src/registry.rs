//! Event registry - the poll set plus the token to event map.
//!
//! Tokens are handed out monotonically and never reused, so a stale token
//! held by a [`ConnectionState`](crate::ConnectionState) can never alias a
//! newer event. Socket events are registered with mio; timers and counters
//! are in-loop primitives:
//! - timers are indexed by deadline and fire when the poll timeout elapses
//! - counters share one [`Waker`] registered under [`WAKER_TOKEN`]

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};

use crate::error::{NodeError, PollEventError};
use crate::event::{CounterEvent, CounterHandle, Outcome, PollEvent, PollMode, Readiness, TickCallback};

/// Token of the waker shared by all counters.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// Owns the OS poll set and every registered event.
pub struct EventRegistry {
    poll: Poll,
    waker: Arc<Waker>,
    events: HashMap<Token, PollEvent>,
    next_token: usize,
    timers: BTreeSet<(Instant, Token)>,
    counters: Vec<Token>,
}

impl EventRegistry {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            waker,
            events: HashMap::new(),
            next_token: 0,
            timers: BTreeSet::new(),
            counters: Vec::new(),
        })
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Register an event and return its token.
    pub fn register(&mut self, mut event: PollEvent, mode: PollMode) -> io::Result<Token> {
        let token = self.allocate_token();
        if let Some(source) = event.source_mut() {
            self.poll.registry().register(source, token, mode.interest())?;
        }
        event.set_registration(token, mode);
        if let PollEvent::Timer(timer) = &event {
            if let Some(deadline) = timer.deadline() {
                self.timers.insert((deadline, token));
            }
        }
        tracing::trace!("Registered {} under {:?}", event.label(), token);
        self.events.insert(token, event);
        Ok(token)
    }

    /// Create and register a counter.
    pub(crate) fn add_counter(&mut self, on_fire: TickCallback) -> CounterHandle {
        let token = self.allocate_token();
        let event = CounterEvent::new(self.waker.clone(), token, on_fire);
        let handle = event.handle();
        self.counters.push(token);
        self.events.insert(token, PollEvent::Counter(event));
        handle
    }

    /// Remove an event from the poll set and the map. The event is returned
    /// open; the caller closes it.
    pub fn unregister(&mut self, token: Token) -> Option<PollEvent> {
        let mut event = self.events.remove(&token)?;
        if let Some(source) = event.source_mut() {
            if let Err(e) = self.poll.registry().deregister(source) {
                tracing::debug!("Failed to deregister {:?}: {}", token, e);
            }
        }
        self.forget_index(token, &event);
        Some(event)
    }

    /// Remove an event from the map only, leaving its socket registered so
    /// that a replacement can be [`install`](Self::install)ed under the same
    /// token.
    pub(crate) fn take_for_handoff(&mut self, token: Token) -> Option<PollEvent> {
        let event = self.events.remove(&token)?;
        self.forget_index(token, &event);
        Some(event)
    }

    /// Put a replacement event under a token released by
    /// [`take_for_handoff`](Self::take_for_handoff).
    pub(crate) fn install(&mut self, token: Token, mut event: PollEvent, mode: PollMode) -> io::Result<()> {
        if let Some(source) = event.source_mut() {
            self.poll.registry().reregister(source, token, mode.interest())?;
        }
        event.set_registration(token, mode);
        self.events.insert(token, event);
        Ok(())
    }

    fn forget_index(&mut self, token: Token, event: &PollEvent) {
        match event {
            PollEvent::Timer(timer) => {
                if let Some(deadline) = timer.deadline() {
                    self.timers.remove(&(deadline, token));
                }
            }
            PollEvent::Counter(_) => self.counters.retain(|t| *t != token),
            _ => {}
        }
    }

    /// Change the readiness a socket event is polled for.
    pub fn update_mask(&mut self, token: Token, mode: PollMode) -> io::Result<()> {
        let event = self
            .events
            .get_mut(&token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown token"))?;
        if let Some(source) = event.source_mut() {
            self.poll.registry().reregister(source, token, mode.interest())?;
        }
        event.set_registration(token, mode);
        Ok(())
    }

    pub fn get(&self, token: Token) -> Option<&PollEvent> {
        self.events.get(&token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut PollEvent> {
        self.events.get_mut(&token)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.events.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Registered tokens in registration order.
    pub fn tokens(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self.events.keys().copied().collect();
        tokens.sort();
        tokens
    }

    /// Block until readiness or `timeout`.
    pub(crate) fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(events, timeout) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            other => other,
        }
    }

    /// Time until the earliest armed timer.
    pub(crate) fn next_timer_timeout(&self, now: Instant) -> Option<Duration> {
        self.timers
            .first()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
    }

    /// Timers whose deadline passed, earliest first.
    pub(crate) fn due_timers(&self, now: Instant) -> Vec<Token> {
        self.timers
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .map(|(_, token)| *token)
            .collect()
    }

    /// Arm or disarm a timer.
    pub(crate) fn arm_timer(
        &mut self,
        token: Token,
        duration: Duration,
        repeat: bool,
        now: Instant,
    ) -> Result<Option<Instant>, NodeError> {
        let event = self
            .events
            .get_mut(&token)
            .ok_or(NodeError::UnknownEvent(token.0))?;
        let kind = event.kind();
        let PollEvent::Timer(timer) = event else {
            return Err(NodeError::WrongEventKind {
                token: token.0,
                kind,
                expected: "timer",
            });
        };
        if let Some(old) = timer.deadline() {
            self.timers.remove(&(old, token));
        }
        let deadline = timer.set(now, duration, repeat);
        if let Some(deadline) = deadline {
            self.timers.insert((deadline, token));
        }
        Ok(deadline)
    }

    /// Counters to check when the waker fires.
    pub(crate) fn counter_tokens(&self) -> Vec<Token> {
        self.counters.clone()
    }

    /// Process one event. `None` if the token is not registered.
    pub(crate) fn process(
        &mut self,
        token: Token,
        readiness: Readiness,
        now: Instant,
    ) -> Option<Result<Outcome, PollEventError>> {
        let event = self.events.get_mut(&token)?;
        let old_deadline = match event {
            PollEvent::Timer(timer) => timer.deadline(),
            _ => None,
        };
        let result = event.process(readiness, self.poll.registry(), now);
        if let PollEvent::Timer(timer) = event {
            if let Some(old) = old_deadline {
                self.timers.remove(&(old, token));
            }
            if let Some(new) = timer.deadline() {
                self.timers.insert((new, token));
            }
        }
        Some(result)
    }

    /// Queue bytes on a connection event.
    pub(crate) fn write_to_connection(&mut self, token: Token, data: &[u8]) -> Result<(), PollEventError> {
        match self.events.get_mut(&token) {
            Some(PollEvent::Connection(connection)) => connection.write_data(data, self.poll.registry()),
            _ => Err(PollEventError::AlreadyClosed),
        }
    }

    /// Unregister and close every event.
    pub(crate) fn close_all(&mut self) -> usize {
        let tokens = self.tokens();
        let count = tokens.len();
        for token in tokens {
            if let Some(mut event) = self.unregister(token) {
                event.close();
            }
        }
        count
    }
}
