use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bar duration for market data aggregation.
///
/// Boundary arithmetic is done in UTC on unix millisecond timestamps; daily
/// bars open at midnight UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Duration of this timeframe in minutes
    pub fn to_minutes(&self) -> usize {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        }
    }

    /// Duration in seconds
    pub fn to_seconds(&self) -> i64 {
        (self.to_minutes() * 60) as i64
    }

    /// Duration in milliseconds
    pub fn to_millis(&self) -> i64 {
        self.to_seconds() * 1000
    }

    /// Wire representation used by the broker bridge and the control plane
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }

    /// All timeframes in ascending order
    pub fn all() -> Vec<Timeframe> {
        vec![
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
        ]
    }

    /// Returns the open timestamp (in ms) of the period containing the given
    /// timestamp. Daily periods open at midnight UTC.
    pub fn period_start(&self, timestamp_ms: i64) -> i64 {
        let timestamp_sec = timestamp_ms / 1000;
        let period_sec = self.to_seconds();
        let period_start_sec = timestamp_sec - (timestamp_sec % period_sec);
        period_start_sec * 1000
    }

    /// Checks if a timestamp lies exactly on a period boundary
    pub fn is_period_start(&self, timestamp_ms: i64) -> bool {
        self.period_start(timestamp_ms) == timestamp_ms
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "M1" => Ok(Timeframe::M1),
            "M5" => Ok(Timeframe::M5),
            "M15" => Ok(Timeframe::M15),
            "M30" => Ok(Timeframe::M30),
            "H1" => Ok(Timeframe::H1),
            "H4" => Ok(Timeframe::H4),
            "D1" => Ok(Timeframe::D1),
            _ => Err(anyhow!(
                "Invalid timeframe: '{}'. Valid options: M1, M5, M15, M30, H1, H4, D1",
                s
            )),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_minutes() {
        assert_eq!(Timeframe::M1.to_minutes(), 1);
        assert_eq!(Timeframe::M30.to_minutes(), 30);
        assert_eq!(Timeframe::H4.to_minutes(), 240);
        assert_eq!(Timeframe::D1.to_minutes(), 1440);
    }

    #[test]
    fn test_from_str() {
        assert_eq!(Timeframe::from_str("M1").unwrap(), Timeframe::M1);
        assert_eq!(Timeframe::from_str("m5").unwrap(), Timeframe::M5);
        assert_eq!(Timeframe::from_str("H1").unwrap(), Timeframe::H1);
        assert_eq!(Timeframe::from_str("d1").unwrap(), Timeframe::D1);
        assert!(Timeframe::from_str("W1").is_err());
    }

    #[test]
    fn test_period_start() {
        let tf = Timeframe::H1;
        // 2024-01-01 00:00:00 UTC = 1704067200000 ms
        let base = 1704067200000i64;

        assert_eq!(tf.period_start(base), base);
        assert_eq!(tf.period_start(base + 35 * 60 * 1000), base);
        assert_eq!(
            tf.period_start(base + 60 * 60 * 1000),
            base + 60 * 60 * 1000
        );
        assert_eq!(
            tf.period_start(base + 95 * 60 * 1000),
            base + 60 * 60 * 1000
        );
    }

    #[test]
    fn test_daily_period_starts_at_midnight_utc() {
        let tf = Timeframe::D1;
        let midnight = 1704067200000i64; // 2024-01-01 00:00:00 UTC

        assert!(tf.is_period_start(midnight));
        assert_eq!(tf.period_start(midnight + 13 * 3600 * 1000), midnight);
        assert!(!tf.is_period_start(midnight + 3600 * 1000));
    }

    #[test]
    fn test_wire_round_trip() {
        for tf in Timeframe::all() {
            assert_eq!(Timeframe::from_str(tf.as_str()).unwrap(), tf);
        }
    }
}
