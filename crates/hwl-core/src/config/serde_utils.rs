//! Serde adapters for configuration durations
//!
//! Timeouts are written as whole seconds and backoff delays as whole
//! milliseconds, e.g. `connect_timeout = 10` or `initial_delay = 250`.
//! Use them with `#[serde(with = "...")]`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

fn serialize_units<S: Serializer>(units: u128, serializer: S) -> Result<S::Ok, S::Error> {
    let units = u64::try_from(units)
        .map_err(|_| serde::ser::Error::custom("duration does not fit in 64 bits"))?;
    serializer.serialize_u64(units)
}

/// `Duration` as whole seconds
pub mod duration_secs {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_units(u128::from(duration.as_secs()), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// `Duration` as whole milliseconds
pub mod duration_millis {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_units(duration.as_millis(), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "duration_secs")]
        connect: Duration,
        #[serde(with = "duration_millis")]
        retry: Duration,
    }

    #[test]
    fn test_units_in_toml() {
        let parsed: Timeouts = toml::from_str("connect = 30\nretry = 250").unwrap();
        assert_eq!(parsed.connect, Duration::from_secs(30));
        assert_eq!(parsed.retry, Duration::from_millis(250));
    }

    #[test]
    fn test_sub_second_timeout_truncates() {
        let written = toml::to_string(&Timeouts {
            connect: Duration::from_millis(1500),
            retry: Duration::from_millis(1500),
        })
        .unwrap();
        assert!(written.contains("connect = 1\n"));
        assert!(written.contains("retry = 1500"));
    }

    #[test]
    fn test_negative_rejected() {
        assert!(toml::from_str::<Timeouts>("connect = -1\nretry = 0").is_err());
    }
}
