//! Offline replay of recorded observations.
//!
//! A replay log has one observation per line, `<offset_ms>\t<text>`, with
//! offsets counted from the start of the recording. Blank lines and lines
//! starting with `#` are skipped:
//!
//! ```text
//! # offset_ms<TAB>text
//! 0	H
//! 10	He
//! 20	Hel
//! ```
//!
//! The log is replayed through a [`DebouncedStore`] on a mock clock. Like a
//! camera analyzer, the replay re-pushes the latest observation every frame
//! until the next one arrives, so text recognised once keeps being seen.

use crate::clock::MockClock;
use crate::debounce::DebouncedStore;
use crate::error::{Result, SettleError};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// One line of a replay log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub at_ms: u64,
    pub text: String,
}

/// A value that settled during a replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settlement {
    /// Offset of the push that published the value.
    pub at_ms: u64,
    pub value: String,
    /// Pushes made so far, frame re-pushes included.
    pub pushes: usize,
}

/// How to replay a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOptions {
    pub quiet_period: Duration,
    /// Re-push interval; `None` replays only the logged observations and
    /// polls once at the end for the trailing edge.
    pub frame_interval: Option<Duration>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(crate::defaults::QUIET_PERIOD_MS.unsigned_abs()),
            frame_interval: Some(Duration::from_millis(crate::defaults::FRAME_INTERVAL_MS)),
        }
    }
}

/// Parses a replay log.
///
/// Offsets must not decrease; the text after the tab is kept verbatim,
/// including an empty string.
pub fn parse_log(input: &str) -> Result<Vec<Observation>> {
    let mut observations: Vec<Observation> = Vec::new();
    for (index, raw_line) in input.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim_end_matches('\r');
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let (offset, text) = line.split_once('\t').ok_or_else(|| SettleError::ReplayParse {
            line: line_no,
            message: "expected '<offset_ms><TAB><text>'".to_string(),
        })?;
        let at_ms: u64 = offset.trim().parse().map_err(|_| SettleError::ReplayParse {
            line: line_no,
            message: format!("invalid offset '{}'", offset.trim()),
        })?;
        if let Some(previous) = observations.last()
            && at_ms < previous.at_ms
        {
            return Err(SettleError::ReplayParse {
                line: line_no,
                message: format!("offset {at_ms} is before the previous offset {}", previous.at_ms),
            });
        }

        observations.push(Observation {
            at_ms,
            text: text.to_string(),
        });
    }
    Ok(observations)
}

fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Replays `observations` and returns every settlement in order.
pub fn replay(observations: &[Observation], options: &ReplayOptions) -> Result<Vec<Settlement>> {
    let frame_ms = match options.frame_interval {
        Some(interval) if whole_millis(interval) == 0 => {
            return Err(SettleError::ConfigInvalidValue {
                key: "frame_interval".to_string(),
                message: "must be at least 1ms".to_string(),
            });
        }
        Some(interval) => Some(whole_millis(interval)),
        None => None,
    };
    let Some(last) = observations.last() else {
        return Ok(Vec::new());
    };

    let clock = MockClock::new();
    let mut store = DebouncedStore::new(options.quiet_period)?
        .with_clock(Arc::new(clock.clone()))
        .with_name("replay");

    let pushes = Arc::new(AtomicUsize::new(0));
    let settlements = Arc::new(Mutex::new(Vec::new()));
    {
        let clock = clock.clone();
        let pushes = Arc::clone(&pushes);
        let settlements = Arc::clone(&settlements);
        store.subscribe(move |value: &String| {
            settlements
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Settlement {
                    at_ms: whole_millis(clock.elapsed()),
                    value: value.clone(),
                    pushes: pushes.load(Ordering::SeqCst),
                });
        });
    }

    let quiet_ms = whole_millis(options.quiet_period);
    let mut replayer = Replayer {
        clock: &clock,
        store: &mut store,
        pushes: &pushes,
    };
    match frame_ms {
        Some(frame_ms) => replay_frames(&mut replayer, observations, quiet_ms, frame_ms),
        None => {
            for observation in observations {
                replayer.push_at(u128::from(observation.at_ms), &observation.text);
            }
            clock.advance_to(Duration::from_millis(last.at_ms.saturating_add(quiet_ms)));
            store.poll();
        }
    }
    store.teardown();

    let settlements = settlements
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    tracing::debug!(
        observations = observations.len(),
        pushes = pushes.load(Ordering::SeqCst),
        settlements = settlements.len(),
        "replay finished"
    );
    Ok(settlements)
}

struct Replayer<'a> {
    clock: &'a MockClock,
    store: &'a mut DebouncedStore<String>,
    pushes: &'a AtomicUsize,
}

impl Replayer<'_> {
    fn push_at(&mut self, at_ms: u128, text: &str) {
        let at_ms = u64::try_from(at_ms).unwrap_or(u64::MAX);
        self.clock.advance_to(Duration::from_millis(at_ms));
        self.count(1);
        self.store.push(text.to_string());
    }

    /// Counts pushes that are skipped because they cannot change the store.
    fn count(&self, pushes: u128) {
        let pushes = usize::try_from(pushes).unwrap_or(usize::MAX);
        let total = self.pushes.load(Ordering::SeqCst).saturating_add(pushes);
        self.pushes.store(total, Ordering::SeqCst);
    }
}

/// Frame re-pushes land on `origin + k * interval` for `k >= 1`.
struct FrameGrid {
    origin: u128,
    interval: u128,
}

impl FrameGrid {
    /// Frames at or before `at`.
    fn count_through(&self, at: u128) -> u128 {
        at.saturating_sub(self.origin) / self.interval
    }

    /// The first frame at or after `at`.
    fn first_from(&self, at: u128) -> u128 {
        let k = at.saturating_sub(self.origin).div_ceil(self.interval).max(1);
        self.origin + k * self.interval
    }
}

/// Replays with a re-push every frame.
///
/// Between two observations the pushed text never changes, so of all the
/// frames in that gap only the first one past the quiet period can settle
/// anything. That frame is pushed; the rest are only counted, which keeps
/// long gaps cheap.
fn replay_frames(
    replayer: &mut Replayer<'_>,
    observations: &[Observation],
    quiet_ms: u64,
    frame_ms: u64,
) {
    let Some(first) = observations.first() else {
        return;
    };
    let grid = FrameGrid {
        origin: u128::from(first.at_ms),
        interval: u128::from(frame_ms),
    };
    let quiet = u128::from(quiet_ms);
    let end = observations.last().map_or(0, |last| {
        (u128::from(last.at_ms) + quiet + grid.interval).min(u128::from(u64::MAX))
    });

    let mut previous: Option<&str> = None;
    let mut changed_at = 0;
    for (index, observation) in observations.iter().enumerate() {
        let at = u128::from(observation.at_ms);
        let text = observation.text.as_str();
        if previous != Some(text) {
            previous = Some(text);
            changed_at = at;
        }
        // A frame due at the same offset merges into this push.
        replayer.push_at(at, text);

        let until = observations
            .get(index + 1)
            .map_or(end, |next| u128::from(next.at_ms).saturating_sub(1).max(at));
        let frames = grid.count_through(until) - grid.count_through(at);
        if frames == 0 {
            continue;
        }
        let decisive = grid.first_from((changed_at + quiet).max(at + 1));
        if decisive <= until {
            let through_decisive = grid.count_through(decisive) - grid.count_through(at);
            replayer.count(through_decisive - 1);
            replayer.push_at(decisive, text);
            replayer.count(frames - through_decisive);
        } else {
            replayer.count(frames);
        }
    }
}
