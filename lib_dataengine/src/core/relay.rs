//! # Relay
//!
//! A relay batches every consumer of one source that asked for the same
//! polling interval and alignment. It owns a single timer; each tick asks the
//! provider for a refresh and notifies its subscribers once fresh data exists.
//! When a tick finds nothing new the relay goes *pending*, and the next flush
//! of its source notifies it, so a relay that ticks just before a real update
//! does not wait a full extra interval for it.
//!
//! The relay itself holds no timer handle into the runtime: the registry actor
//! keeps the `DelayQueue` and the relay only remembers its slot key and the
//! instant it is due.

use crate::core::consumer::{ConsumerId, Subscriber};
use crate::error::EngineError;
use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::time::delay_queue;

/// Lowest polling interval a relay will ever run at.
pub const MIN_POLLING_INTERVAL: Duration = Duration::from_millis(50);

/// Aligned ticks land this long after the wall-clock boundary.
pub const ALIGNMENT_SKEW: Duration = Duration::from_millis(500);

/// Longest delay a relay or polling timer is ever armed with.
pub const MAX_TIMER_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const MINUTE_TOLERANCE_SECS: u32 = 2;
const HOUR_TOLERANCE_SECS: u32 = 10;

/// Wall-clock alignment of a relay's ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IntervalAlignment {
    /// Tick every `interval` from the moment the relay was created.
    #[default]
    None,
    /// Snap ticks to just after the top of the minute.
    AlignToMinute,
    /// Snap ticks to just after the top of the hour.
    AlignToHour,
}

impl FromStr for IntervalAlignment {
    type Err = EngineError;

    /// Accepts `none`, `minute`, `hour` and the serialised variant names, ignoring case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(IntervalAlignment::None),
            "minute" | "aligntominute" => Ok(IntervalAlignment::AlignToMinute),
            "hour" | "aligntohour" => Ok(IntervalAlignment::AlignToHour),
            other => Err(EngineError::ConfigError(format!("unknown alignment '{}'", other))),
        }
    }
}

/// Identity of a relay inside its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RelayKey {
    pub(crate) interval: Duration,
    pub(crate) alignment: IntervalAlignment,
}

/// # Clamp Interval
///
/// Normalises a requested polling interval before a relay is looked up.
///
/// ## Logic:
/// 1.  A zero interval means "event driven" and is returned untouched.
/// 2.  Otherwise the interval is floored at `max(50ms, min_update_interval)`
///     and capped at [`MAX_TIMER_DELAY`].
/// 3.  The result is rounded down to a multiple of 50ms.
pub fn clamp_interval(requested: Duration, min_update_interval_ms: i64) -> Duration {
    if requested.is_zero() {
        return Duration::ZERO;
    }

    let step = MIN_POLLING_INTERVAL.as_millis() as u64;
    let floor = step.max(min_update_interval_ms.max(0) as u64);
    let ceiling = MAX_TIMER_DELAY.as_millis() as u64;
    let millis = (requested.min(MAX_TIMER_DELAY).as_millis() as u64).max(floor).min(ceiling);
    Duration::from_millis(millis - millis % step)
}

/// Length of the wall-clock period an alignment snaps to, in milliseconds.
fn period_millis(alignment: IntervalAlignment) -> Option<u64> {
    match alignment {
        IntervalAlignment::None => None,
        IntervalAlignment::AlignToMinute => Some(60_000),
        IntervalAlignment::AlignToHour => Some(3_600_000),
    }
}

/// Time left from `now` until the next minute or hour boundary.
fn until_boundary(alignment: IntervalAlignment, now: NaiveTime) -> Option<Duration> {
    let period = period_millis(alignment)?;
    let millis_into_minute =
        u64::from(now.second()) * 1000 + u64::from((now.nanosecond() / 1_000_000).min(999));
    let offset = match alignment {
        IntervalAlignment::AlignToHour => u64::from(now.minute()) * 60_000 + millis_into_minute,
        _ => millis_into_minute,
    };
    Some(Duration::from_millis(period - offset))
}

/// # Alignment Correction
///
/// Checks a tick of an aligned relay against the wall clock.
///
/// A minute-aligned tick is on time up to 2s past the boundary, an hour-aligned
/// one up to 10s (and within the first minute). An on-time tick returns `None`;
/// otherwise the returned delay moves the next tick to the following boundary
/// plus [`ALIGNMENT_SKEW`].
pub fn alignment_correction(alignment: IntervalAlignment, now: NaiveTime) -> Option<Duration> {
    let on_time = match alignment {
        IntervalAlignment::None => return None,
        IntervalAlignment::AlignToMinute => now.second() <= MINUTE_TOLERANCE_SECS,
        IntervalAlignment::AlignToHour => now.minute() < 1 && now.second() <= HOUR_TOLERANCE_SECS,
    };

    if on_time {
        None
    } else {
        until_boundary(alignment, now).map(|left| left + ALIGNMENT_SKEW)
    }
}

/// # Relay
///
/// Fan-out node for one `(interval, alignment)` pair of one source.
#[derive(Debug)]
pub(crate) struct Relay {
    pub(crate) key: RelayKey,
    pub(crate) subscribers: BTreeMap<ConsumerId, Subscriber>,
    pub(crate) pending: bool,
    pub(crate) next_fire_at: Instant,
    pub(crate) timer: Option<delay_queue::Key>,
    /// The armed tick was scheduled immediately, off any boundary.
    pub(crate) unaligned_tick: bool,
}

impl Relay {
    pub(crate) fn new(key: RelayKey) -> Self {
        Self {
            key,
            subscribers: BTreeMap::new(),
            pending: false,
            next_fire_at: Instant::now(),
            timer: None,
            unaligned_tick: false,
        }
    }

    /// Delay before the first tick. Immediate relays fire in the next quantum;
    /// aligned ones are snapped to the next boundary.
    pub(crate) fn first_delay(&self, immediate: bool, now: NaiveTime) -> Duration {
        if immediate {
            return Duration::ZERO;
        }
        match until_boundary(self.key.alignment, now) {
            Some(left) => left + ALIGNMENT_SKEW,
            None => self.key.interval,
        }
    }

    /// Delay before the tick following the one that just ran. Aligned relays
    /// land on the first boundary (plus skew) at least one interval away.
    pub(crate) fn next_delay(&self, now: NaiveTime) -> Duration {
        let (Some(left), Some(period)) = (
            until_boundary(self.key.alignment, now),
            period_millis(self.key.alignment),
        ) else {
            return self.key.interval;
        };
        let delay = (left + ALIGNMENT_SKEW).as_millis() as u64;
        let interval = self.key.interval.as_millis() as u64;
        let periods = interval.saturating_sub(delay).div_ceil(period);
        Duration::from_millis(delay + periods * period)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
