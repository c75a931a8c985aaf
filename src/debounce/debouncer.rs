//! Settlement state machine.
//!
//! Pure logic with no clock, no observers and no locking: callers pass the
//! current instant in. [`DebouncedStore`](super::DebouncedStore) wraps it
//! with a clock and an observer list.

use std::time::{Duration, Instant};

/// The last published value plus the raw value currently waiting to settle.
#[derive(Debug, Clone, PartialEq)]
pub struct SettledValue<T> {
    /// Last published value, `None` until something settles (or an initial
    /// value was supplied).
    pub value: Option<T>,
    /// Most recent raw value pushed.
    pub last_raw: Option<T>,
    /// When `last_raw` last changed to a distinct value.
    pub last_change: Option<Instant>,
}

impl<T> Default for SettledValue<T> {
    fn default() -> Self {
        Self {
            value: None,
            last_raw: None,
            last_change: None,
        }
    }
}

/// What a single observation did to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The raw value differed from the previous one; timer re-armed.
    Armed,
    /// Same raw value, quiet period not yet elapsed.
    Waiting,
    /// Same raw value, quiet period elapsed, published as the new settled value.
    Settled,
    /// Same raw value and quiet period elapsed, but it already is the settled value.
    Unchanged,
    /// Nothing pending (only returned by `poll` before the first push).
    Empty,
}

/// Turns a stream of raw observations into settled values.
#[derive(Debug, Clone)]
pub struct Debouncer<T> {
    quiet_period: Duration,
    state: SettledValue<T>,
}

impl<T: Clone + PartialEq> Debouncer<T> {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            state: SettledValue::default(),
        }
    }

    /// Creates a debouncer whose settled value starts as `initial`.
    pub fn with_initial(quiet_period: Duration, initial: T) -> Self {
        Self {
            quiet_period,
            state: SettledValue {
                value: Some(initial),
                ..SettledValue::default()
            },
        }
    }

    /// Records a raw observation taken at `now`.
    ///
    /// A value different from the previous raw value re-arms the timer. The
    /// same value again publishes once `now - last_change >= quiet_period`.
    /// Comparison is against the previous raw value, not the settled one, so
    /// an A→B→A bounce re-arms the timer at the second A.
    pub fn observe(&mut self, raw: T, now: Instant) -> PushOutcome {
        match &self.state.last_raw {
            Some(previous) if *previous == raw => self.evaluate(now),
            _ => {
                self.state.last_raw = Some(raw);
                self.state.last_change = Some(now);
                PushOutcome::Armed
            }
        }
    }

    /// Re-evaluates the pending raw value as if it had been observed again.
    pub fn poll(&mut self, now: Instant) -> PushOutcome {
        if self.state.last_raw.is_none() {
            return PushOutcome::Empty;
        }
        self.evaluate(now)
    }

    fn evaluate(&mut self, now: Instant) -> PushOutcome {
        let Some(since) = self.state.last_change else {
            return PushOutcome::Empty;
        };
        if now.saturating_duration_since(since) < self.quiet_period {
            return PushOutcome::Waiting;
        }
        if self.state.value == self.state.last_raw {
            return PushOutcome::Unchanged;
        }
        self.state.value = self.state.last_raw.clone();
        PushOutcome::Settled
    }

    /// The last published value.
    pub fn settled(&self) -> Option<&T> {
        self.state.value.as_ref()
    }

    /// The raw value waiting to settle.
    pub fn pending(&self) -> Option<&T> {
        self.state.last_raw.as_ref()
    }

    /// Time the pending value has been stable for, if any.
    pub fn stable_for(&self, now: Instant) -> Option<Duration> {
        self.state
            .last_change
            .map(|since| now.saturating_duration_since(since))
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    pub fn state(&self) -> &SettledValue<T> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: Duration = Duration::from_millis(50);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_first_push_only_arms() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(Q);

        assert_eq!(debouncer.observe("a", t0), PushOutcome::Armed);
        assert_eq!(debouncer.settled(), None);
        assert_eq!(debouncer.pending(), Some(&"a"));
    }

    #[test]
    fn test_repeat_before_quiet_period_waits() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(Q);

        debouncer.observe("a", t0);
        assert_eq!(debouncer.observe("a", t0 + ms(49)), PushOutcome::Waiting);
        assert_eq!(debouncer.settled(), None);
    }

    #[test]
    fn test_repeat_at_exact_quiet_period_settles() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(Q);

        debouncer.observe("a", t0);
        assert_eq!(debouncer.observe("a", t0 + Q), PushOutcome::Settled);
        assert_eq!(debouncer.settled(), Some(&"a"));
    }

    #[test]
    fn test_settled_value_is_not_republished() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(Q);

        debouncer.observe("a", t0);
        debouncer.observe("a", t0 + ms(60));
        assert_eq!(debouncer.observe("a", t0 + ms(200)), PushOutcome::Unchanged);
    }

    #[test]
    fn test_initial_value_suppresses_identical_settlement() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::with_initial(Q, false);

        debouncer.observe(false, t0);
        assert_eq!(debouncer.observe(false, t0 + ms(80)), PushOutcome::Unchanged);
        assert_eq!(debouncer.settled(), Some(&false));
    }

    #[test]
    fn test_alternation_never_settles() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(Q);

        for step in 0..100u64 {
            let value = if step % 2 == 0 { "a" } else { "b" };
            let outcome = debouncer.observe(value, t0 + ms(step * 30));
            assert_eq!(outcome, PushOutcome::Armed);
        }
        assert_eq!(debouncer.settled(), None);
    }

    #[test]
    fn test_bounce_back_rearms_timer() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(Q);

        debouncer.observe("a", t0);
        debouncer.observe("a", t0 + ms(60));
        assert_eq!(debouncer.settled(), Some(&"a"));

        debouncer.observe("b", t0 + ms(70));
        assert_eq!(debouncer.observe("a", t0 + ms(80)), PushOutcome::Armed);
        // 40ms after the bounce: still waiting even though "a" is the settled value.
        assert_eq!(debouncer.observe("a", t0 + ms(120)), PushOutcome::Waiting);
        assert_eq!(debouncer.observe("a", t0 + ms(130)), PushOutcome::Unchanged);
    }

    #[test]
    fn test_poll_settles_without_new_observation() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(Q);

        assert_eq!(debouncer.poll(t0), PushOutcome::Empty);
        debouncer.observe(true, t0);
        assert_eq!(debouncer.poll(t0 + ms(10)), PushOutcome::Waiting);
        assert_eq!(debouncer.poll(t0 + ms(50)), PushOutcome::Settled);
        assert_eq!(debouncer.settled(), Some(&true));
    }

    #[test]
    fn test_zero_quiet_period_settles_on_second_push() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(Duration::ZERO);

        assert_eq!(debouncer.observe(1, t0), PushOutcome::Armed);
        assert_eq!(debouncer.observe(1, t0), PushOutcome::Settled);
    }

    #[test]
    fn test_stable_for_tracks_last_change() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(Q);
        assert_eq!(debouncer.stable_for(t0), None);

        debouncer.observe("x", t0);
        debouncer.observe("x", t0 + ms(20));
        assert_eq!(debouncer.stable_for(t0 + ms(30)), Some(ms(30)));
    }
}
