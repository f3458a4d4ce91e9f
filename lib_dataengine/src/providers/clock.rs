//! # Clock Provider
//!
//! Serves the wall clock as sources. `Local` and `UTC` are always available;
//! any IANA time zone name (`Europe/Athens`, `America/New_York`) is produced
//! on demand. Each source carries:
//!
//! - `Time`: `HH:MM:SS`
//! - `Date`: `YYYY-MM-DD`
//! - `Timezone`: the source name
//! - `Offset`: seconds east of UTC
//! - `Timestamp`: Unix seconds
//!
//! The provider only writes when asked to refresh, so consumers pick their
//! cadence through their relay interval and alignment.

use std::collections::HashMap;
use std::fmt::Display;

use chrono::{DateTime, Local, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::core::data_set::{DataSet, Value};
use crate::core::provider::{EngineContext, SourceProvider};

/// Source name of the local time zone.
pub const LOCAL_SOURCE: &str = "Local";
/// Source name of UTC.
pub const UTC_SOURCE: &str = "UTC";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zone {
    Local,
    Utc,
    Named(Tz),
}

impl Zone {
    fn resolve(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case(LOCAL_SOURCE) {
            return Some(Zone::Local);
        }
        if name.eq_ignore_ascii_case(UTC_SOURCE) {
            return Some(Zone::Utc);
        }
        name.parse::<Tz>().ok().map(Zone::Named)
    }

    fn reading(&self, name: &str, at: DateTime<Utc>) -> DataSet {
        match self {
            Zone::Local => reading(&at.with_timezone(&Local), name),
            Zone::Utc => reading(&at, name),
            Zone::Named(tz) => reading(&at.with_timezone(tz), name),
        }
    }
}

fn reading<T: TimeZone>(at: &DateTime<T>, name: &str) -> DataSet
where
    T::Offset: Display,
{
    [
        ("Time", Value::from(at.format("%H:%M:%S").to_string())),
        ("Date", Value::from(at.format("%Y-%m-%d").to_string())),
        ("Timezone", Value::from(name)),
        ("Offset", Value::from(at.offset().fix().local_minus_utc())),
        ("Timestamp", Value::from(at.timestamp())),
    ]
    .into_iter()
    .collect()
}

/// # Clock Provider
///
/// Remembers the zone of every source it produced, so refreshes skip the
/// time zone lookup.
#[derive(Debug, Default)]
pub struct ClockProvider {
    zones: HashMap<String, Zone>,
}

impl ClockProvider {
    /// Provider with no source produced yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is a source this provider can produce.
    pub fn supports(name: &str) -> bool {
        Zone::resolve(name).is_some()
    }

    /// Data of `name` at instant `at`, `None` for an unknown zone.
    pub fn reading_at(name: &str, at: DateTime<Utc>) -> Option<DataSet> {
        Zone::resolve(name).map(|zone| zone.reading(name, at))
    }
}

impl SourceProvider for ClockProvider {
    fn source_requested(&mut self, name: &str, ctx: &mut EngineContext<'_>) -> bool {
        let Some(zone) = Zone::resolve(name) else {
            log::debug!("[{}] no time zone named '{}'", ctx.engine_name(), name);
            return false;
        };
        self.zones.insert(name.to_string(), zone);
        ctx.set_data_set(name, &zone.reading(name, Utc::now()));
        true
    }

    fn update_source(&mut self, name: &str, ctx: &mut EngineContext<'_>) -> bool {
        let zone = match self.zones.get(name) {
            Some(zone) => *zone,
            None => match Zone::resolve(name) {
                Some(zone) => zone,
                None => return false,
            },
        };
        ctx.set_data_set(name, &zone.reading(name, Utc::now()));
        true
    }

    fn sources(&self) -> Option<Vec<String>> {
        Some(vec![LOCAL_SOURCE.to_string(), UTC_SOURCE.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::EngineConfig;
    use crate::core::consumer::Consumer;
    use crate::core::registry::SourceRegistry;
    use crate::core::relay::IntervalAlignment;
    use std::time::Duration;

    fn fixed_instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 30, 45).unwrap()
    }

    #[test]
    fn test_resolves_builtin_and_iana_names() {
        assert!(ClockProvider::supports("Local"));
        assert!(ClockProvider::supports("utc"));
        assert!(ClockProvider::supports("Europe/Athens"));
        assert!(!ClockProvider::supports("Mars/Olympus_Mons"));
    }

    #[test]
    fn test_utc_reading() {
        let data = ClockProvider::reading_at("UTC", fixed_instant()).unwrap();
        assert_eq!(data.get("Time"), Some(&Value::from("12:30:45")));
        assert_eq!(data.get("Date"), Some(&Value::from("2024-01-15")));
        assert_eq!(data.get("Timezone"), Some(&Value::from("UTC")));
        assert_eq!(data.get("Offset"), Some(&Value::from(0)));
        assert_eq!(data.get("Timestamp"), Some(&Value::from(fixed_instant().timestamp())));
    }

    #[test]
    fn test_named_zone_applies_offset() {
        // Athens is UTC+2 in January.
        let data = ClockProvider::reading_at("Europe/Athens", fixed_instant()).unwrap();
        assert_eq!(data.get("Time"), Some(&Value::from("14:30:45")));
        assert_eq!(data.get("Offset"), Some(&Value::from(7200)));
        assert!(ClockProvider::reading_at("Nowhere/Special", fixed_instant()).is_none());
    }

    #[tokio::test]
    async fn test_registry_creates_clock_sources_on_demand() {
        let registry = SourceRegistry::spawn(EngineConfig::named("time"), Box::new(ClockProvider::new()), None);
        let (consumer, mut rx) = Consumer::new("clock-view");

        assert!(
            registry
                .connect("UTC", &consumer, Duration::ZERO, IntervalAlignment::None)
                .await
        );
        let update = rx.recv().await.unwrap();
        assert_eq!(update.source, "UTC");
        assert_eq!(update.data.get("Timezone"), Some(&Value::from("UTC")));

        assert!(
            !registry
                .connect("Nowhere/Special", &consumer, Duration::ZERO, IntervalAlignment::None)
                .await
        );
        assert_eq!(registry.sources().await, vec!["Local".to_string(), "UTC".to_string()]);
    }
}
