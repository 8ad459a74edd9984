use crate::error::Error;
use crate::platform::Clock;

/// Milliseconds between `since` and `now`, correct across one wraparound of the counter.
#[inline(always)]
pub const fn elapsed(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

/// A point in time a wait gives up at, taken from a [`Clock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Deadline {
    start: u32,
    timeout_ms: u32,
}

impl Deadline {
    pub fn after<C: Clock>(clock: &C, timeout_ms: u32) -> Self {
        Self {
            start: clock.now_ms(),
            timeout_ms,
        }
    }

    /// Starts the window over, used by waits that extend on activity.
    pub fn restart<C: Clock>(&mut self, clock: &C) {
        self.start = clock.now_ms();
    }

    pub fn expired<C: Clock>(&self, clock: &C) -> bool {
        elapsed(clock.now_ms(), self.start) > self.timeout_ms
    }
}

/// Calls `poll` until it yields a value or the deadline passes. `poll` runs at least once.
pub fn poll_until<C, T, F>(clock: &C, deadline: Deadline, mut poll: F) -> Result<T, Error>
where
    C: Clock,
    F: FnMut() -> Option<T>,
{
    loop {
        if let Some(value) = poll() {
            return Ok(value);
        }
        if deadline.expired(clock) {
            return Err(Error::Timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct StepClock(Cell<u32>);

    impl Clock for StepClock {
        fn now_ms(&self) -> u32 {
            let now = self.0.get();
            self.0.set(now.wrapping_add(1));
            now
        }
    }

    #[test]
    fn elapsed_across_wraparound() {
        assert_eq!(elapsed(5, u32::MAX - 4), 10);
        assert_eq!(elapsed(1000, 400), 600);
    }

    #[test]
    fn poll_until_times_out() {
        let clock = StepClock(Cell::new(u32::MAX - 3));
        let deadline = Deadline::after(&clock, 20);
        let mut calls = 0;
        let result: Result<(), Error> = poll_until(&clock, deadline, || {
            calls += 1;
            None
        });
        assert_eq!(result, Err(Error::Timeout));
        assert!(calls >= 20);
    }

    #[test]
    fn poll_until_returns_value() {
        let clock = StepClock(Cell::new(0));
        let deadline = Deadline::after(&clock, 20);
        let mut calls = 0;
        let result = poll_until(&clock, deadline, || {
            calls += 1;
            (calls == 3).then_some(calls)
        });
        assert_eq!(result, Ok(3));
    }
}
