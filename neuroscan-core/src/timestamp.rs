//! Scan timestamps: the `YYYYMMDD_HHMMSS` key shared by every artifact of a scan.
//!
//! Lexicographic order of the string form equals chronological order, so the
//! newtype derives `Ord` on the inner string.

use chrono::{Duration, Local, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ScanTimestamp(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid scan timestamp '{0}': expected YYYYMMDD_HHMMSS")]
pub struct InvalidTimestamp(pub String);

impl ScanTimestamp {
    pub fn from_datetime(at: NaiveDateTime) -> Self {
        Self(at.format(TIMESTAMP_FORMAT).to_string())
    }

    /// Mint a timestamp for the current local wall-clock second.
    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    pub fn parse(s: &str) -> Result<Self, InvalidTimestamp> {
        // chrono accepts single-digit fields, so pin the length as well
        if s.len() != 15 {
            return Err(InvalidTimestamp(s.to_string()));
        }
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .map(|_| Self(s.to_string()))
            .map_err(|_| InvalidTimestamp(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_datetime(&self) -> NaiveDateTime {
        // The inner string is validated on every construction path.
        NaiveDateTime::parse_from_str(&self.0, TIMESTAMP_FORMAT).unwrap_or_default()
    }

    /// The timestamp one second later; used to step past collisions.
    pub fn next_second(&self) -> Self {
        Self::from_datetime(self.to_datetime() + Duration::seconds(1))
    }
}

impl fmt::Display for ScanTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ScanTimestamp {
    type Err = InvalidTimestamp;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for ScanTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
