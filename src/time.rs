use crate::config;
use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Display;
use std::ops::Deref;

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A wrapper for [`chrono::DateTime`] in the configured time zone that
/// serializes as a tagged JSON object:
/// `{"_type": "datetime", "value": "YYYY-MM-DD HH:MM:SS.ffffff"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DateTime(chrono::DateTime<Tz>);

impl DateTime {
    pub fn now() -> Self {
        Utc::now().with_timezone(&config::timezone()).into()
    }

    pub fn today() -> Date {
        Self::now().date()
    }

    pub fn date(&self) -> Date {
        Date(self.0.date_naive())
    }

    /// Converts epoch seconds into a wall-clock instant in the configured zone.
    pub fn from_timestamp(seconds: i64) -> Option<Self> {
        chrono::DateTime::from_timestamp(seconds, 0).map(|instant| instant.with_timezone(&config::timezone()).into())
    }
}

impl Deref for DateTime {
    type Target = chrono::DateTime<Tz>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<chrono::DateTime<Tz>> for DateTime {
    fn from(value: chrono::DateTime<Tz>) -> Self {
        DateTime(value)
    }
}

impl Display for DateTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format(DATETIME_FORMAT))
    }
}

impl Serialize for DateTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let local = self.0.with_timezone(&config::timezone());
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("_type", "datetime")?;
        map.serialize_entry("value", &local.format(DATETIME_FORMAT).to_string())?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for DateTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tagged = Tagged::deserialize(deserializer)?;
        if tagged.kind != "datetime" {
            return Err(serde::de::Error::custom(format!("expected _type datetime, found {}", tagged.kind)));
        }
        let naive = NaiveDateTime::parse_from_str(&tagged.value, DATETIME_FORMAT).map_err(serde::de::Error::custom)?;
        config::timezone()
            .from_local_datetime(&naive)
            .earliest()
            .map(DateTime)
            .ok_or_else(|| serde::de::Error::custom(format!("{} does not exist in the configured zone", tagged.value)))
    }
}

/// A calendar date, serialized as `{"_type": "date", "value": "YYYY-MM-DD"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Date(NaiveDate);

impl Date {
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Date)
    }

    /// Midnight at the start of this date in the configured zone.
    pub fn midnight(&self) -> DateTime {
        let instant = config::timezone()
            .from_local_datetime(&self.0.and_hms_opt(0, 0, 0).unwrap())
            .earliest()
            .unwrap();
        DateTime(instant)
    }

    pub fn next_day(&self) -> Self {
        Date(self.0.succ_opt().unwrap())
    }

    /// The first day of the month following this date's month.
    pub fn first_of_next_month(&self) -> Self {
        let (year, month) = match self.0.month() {
            12 => (self.0.year() + 1, 1),
            month => (self.0.year(), month + 1),
        };
        Date(NaiveDate::from_ymd_opt(year, month, 1).unwrap())
    }
}

impl Deref for Date {
    type Target = NaiveDate;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<NaiveDate> for Date {
    fn from(value: NaiveDate) -> Self {
        Date(value)
    }
}

impl Display for Date {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format(DATE_FORMAT))
    }
}

impl Serialize for Date {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("_type", "date")?;
        map.serialize_entry("value", &self.0.format(DATE_FORMAT).to_string())?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Date {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tagged = Tagged::deserialize(deserializer)?;
        if tagged.kind != "date" {
            return Err(serde::de::Error::custom(format!("expected _type date, found {}", tagged.kind)));
        }
        NaiveDate::parse_from_str(&tagged.value, DATE_FORMAT)
            .map(Date)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Deserialize)]
struct Tagged {
    #[serde(rename = "_type")]
    kind: String,
    value: String,
}
