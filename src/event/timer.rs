//! Deadline timer driven by the loop's poll timeout.

use std::time::{Duration, Instant};

use super::{Outcome, TickCallback};
use crate::error::PollEventError;

pub struct TimerEvent {
    deadline: Option<Instant>,
    interval: Option<Duration>,
    on_fire: TickCallback,
    closed: bool,
}

impl TimerEvent {
    /// Create a disarmed timer.
    pub(crate) fn new(on_fire: TickCallback) -> Self {
        Self {
            deadline: None,
            interval: None,
            on_fire,
            closed: false,
        }
    }

    /// Arm the timer to fire `duration` from `now`, every `duration` if
    /// `repeat`. A zero duration disarms it.
    pub(crate) fn set(&mut self, now: Instant, duration: Duration, repeat: bool) -> Option<Instant> {
        if duration.is_zero() {
            self.disarm();
            return None;
        }
        self.deadline = now.checked_add(duration);
        self.interval = repeat.then_some(duration).filter(|_| self.deadline.is_some());
        self.deadline
    }

    pub(crate) fn disarm(&mut self) {
        self.deadline = None;
        self.interval = None;
    }

    /// Next expiration, `None` while disarmed.
    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[inline]
    pub fn is_repeating(&self) -> bool {
        self.interval.is_some()
    }

    /// Fire if the deadline passed.
    ///
    /// Expirations missed while the loop was busy are reported as one tick
    /// with a count above 1.
    pub(crate) fn process(&mut self, now: Instant) -> Result<Outcome, PollEventError> {
        if self.closed {
            return Err(PollEventError::AlreadyClosed);
        }
        let deadline = match self.deadline {
            Some(deadline) if deadline <= now => deadline,
            _ => return Ok(Outcome::Idle),
        };

        let count = match self.interval {
            Some(interval) => {
                let late = now.duration_since(deadline).as_nanos() / interval.as_nanos();
                let count = u64::try_from(late).unwrap_or(u64::MAX).saturating_add(1);
                let steps = u32::try_from(count).unwrap_or(u32::MAX);
                // Past the representable range, restart the period from now.
                self.deadline = match deadline.checked_add(interval.saturating_mul(steps)) {
                    Some(next) if next > now => Some(next),
                    _ => now.checked_add(interval),
                };
                count
            }
            None => {
                self.deadline = None;
                1
            }
        };
        Ok(Outcome::Tick {
            count,
            on_fire: self.on_fire.clone(),
        })
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn timer() -> TimerEvent {
        TimerEvent::new(Rc::new(|_, _, _| {}))
    }

    fn tick_count(outcome: Outcome) -> Option<u64> {
        match outcome {
            Outcome::Tick { count, .. } => Some(count),
            _ => None,
        }
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut timer = timer();
        let start = Instant::now();
        let deadline = timer.set(start, Duration::from_millis(50), false).unwrap();

        assert_eq!(tick_count(timer.process(start).unwrap()), None);
        assert_eq!(tick_count(timer.process(deadline).unwrap()), Some(1));
        assert_eq!(timer.deadline(), None);
        assert_eq!(tick_count(timer.process(deadline + Duration::from_secs(1)).unwrap()), None);
    }

    #[test]
    fn test_repeating_rearms() {
        let mut timer = timer();
        let start = Instant::now();
        let interval = Duration::from_millis(10);
        timer.set(start, interval, true);
        assert!(timer.is_repeating());

        assert_eq!(tick_count(timer.process(start + interval).unwrap()), Some(1));
        assert_eq!(timer.deadline(), Some(start + interval * 2));
    }

    #[test]
    fn test_repeating_coalesces_missed_expirations() {
        let mut timer = timer();
        let start = Instant::now();
        let interval = Duration::from_millis(10);
        timer.set(start, interval, true);

        let now = start + Duration::from_millis(35);
        assert_eq!(tick_count(timer.process(now).unwrap()), Some(3));
        assert_eq!(timer.deadline(), Some(start + Duration::from_millis(40)));
    }

    #[test]
    fn test_huge_miss_count_does_not_overflow() {
        let mut timer = timer();
        let start = Instant::now();
        let interval = Duration::from_nanos(1);
        timer.set(start, interval, true);

        let now = start + Duration::from_nanos(u64::from(u32::MAX) + 10);
        assert_eq!(tick_count(timer.process(now).unwrap()), Some(u64::from(u32::MAX) + 10));
        assert!(timer.deadline().is_some_and(|next| next > now));
    }

    #[test]
    fn test_unrepresentable_deadline_disarms() {
        let mut timer = timer();
        assert_eq!(timer.set(Instant::now(), Duration::MAX, true), None);
        assert!(!timer.is_repeating());
    }

    #[test]
    fn test_zero_duration_disarms() {
        let mut timer = timer();
        let start = Instant::now();
        timer.set(start, Duration::from_millis(10), true);
        assert_eq!(timer.set(start, Duration::ZERO, true), None);
        assert_eq!(timer.deadline(), None);
        assert!(!timer.is_repeating());
    }

    #[test]
    fn test_closed_timer_errors() {
        let mut timer = timer();
        timer.close();
        assert!(matches!(timer.process(Instant::now()), Err(PollEventError::AlreadyClosed)));
    }
}
