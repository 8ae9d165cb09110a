//! Time wrapper types
//!
//! [`SystemTime`] wraps the standard library time point with an [ISO8601]
//! compliant human readable formatting and serde implementation, so wire
//! types and persisted schedules keep a stable textual representation.
//!
//! [ISO8601]: https://en.wikipedia.org/wiki/ISO_8601

use chrono::prelude::{DateTime, TimeZone as _, Utc};
use chrono::SecondsFormat;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str, time};

/// time in seconds and nanoseconds since [UNIX Epoch]
///
/// The human readable formatting is [ISO8601] compliant.
///
/// [ISO8601]: https://en.wikipedia.org/wiki/ISO_8601
/// [UNIX Epoch]: https://en.wikipedia.org/wiki/Unix_time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SystemTime(time::SystemTime);

impl SystemTime {
    /// get the current time in seconds since [UNIX Epoch]
    ///
    /// [UNIX Epoch]: https://en.wikipedia.org/wiki/Unix_time
    #[inline]
    pub fn now() -> Self {
        SystemTime(time::SystemTime::now())
    }

    fn utc_date_time(&self) -> DateTime<Utc> {
        let timestamps = self.0.duration_since(time::UNIX_EPOCH).unwrap();
        Utc.timestamp_opt(timestamps.as_secs() as i64, timestamps.subsec_nanos())
            .unwrap()
    }

    pub fn duration_since(
        &self,
        earlier: SystemTime,
    ) -> Result<time::Duration, time::SystemTimeError> {
        self.0.duration_since(earlier.0)
    }
}

impl From<time::SystemTime> for SystemTime {
    fn from(system_time: time::SystemTime) -> Self {
        SystemTime(system_time)
    }
}

impl From<SystemTime> for time::SystemTime {
    fn from(system_time: SystemTime) -> Self {
        system_time.0
    }
}

impl fmt::Display for SystemTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.utc_date_time()
            .to_rfc3339_opts(SecondsFormat::AutoSi, true)
            .fmt(f)
    }
}

impl str::FromStr for SystemTime {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let date_time = DateTime::parse_from_rfc3339(s)?;
        let seconds = date_time.timestamp() as u64;
        let nanos = date_time.timestamp_subsec_nanos();
        Ok(SystemTime(
            time::UNIX_EPOCH + time::Duration::new(seconds, nanos),
        ))
    }
}

impl Serialize for SystemTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SystemTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
