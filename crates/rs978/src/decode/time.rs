use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FisbError;

/**
 * The wire conveys only partial timestamps: usually day+hour+minute,
 * sometimes just hour+minute. Every partial time is lifted to an absolute
 * ISO-8601 UTC instant against an anchor (normally the packet receive
 * time) by filling the missing high-order fields from the anchor and
 * stepping the next-missing-higher unit across wraparounds.
 *
 * Each product class constrains the result to its own window around the
 * anchor; among admissible candidates the one closest to the anchor wins.
 */

#[derive(Debug, PartialEq, Eq, Copy, Clone, Default, Serialize, Deserialize)]
pub struct PartialTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minute: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub second: Option<u32>,
}

impl PartialTime {
    pub fn is_empty(&self) -> bool {
        self.hour.is_none()
    }

    pub fn day_hour_minute(day: u32, hour: u32, minute: u32) -> Self {
        PartialTime {
            day: Some(day),
            hour: Some(hour),
            minute: Some(minute),
            ..Default::default()
        }
    }

    pub fn hour_minute(hour: u32, minute: u32) -> Self {
        PartialTime {
            hour: Some(hour),
            minute: Some(minute),
            ..Default::default()
        }
    }
}

/// Admissible window around the anchor, in seconds
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Horizon {
    pub past_secs: i64,
    pub future_secs: i64,
}

impl Horizon {
    pub const fn new(past_secs: i64, future_secs: i64) -> Self {
        Horizon {
            past_secs,
            future_secs,
        }
    }
}

const HOUR: i64 = 3600;
const DAY: i64 = 86_400;

/// Per-product windows (to be confirmed against the implementer's target
/// standard revision; kept in one place so a revision is a one-line edit)
pub mod horizons {
    use super::{Horizon, DAY, HOUR};

    pub const METAR_OBSERVATION: Horizon = Horizon::new(3 * HOUR, HOUR / 2);
    pub const TAF_ISSUED: Horizon = Horizon::new(6 * HOUR, HOUR);
    /// Anchored on the issue time, not the receive time
    pub const TAF_VALID: Horizon = Horizon::new(0, 30 * HOUR);
    pub const WINDS_VALID: Horizon = Horizon::new(6 * HOUR, 30 * HOUR);
    pub const TWGO_BEGIN: Horizon = Horizon::new(6 * HOUR, 24 * HOUR);
    pub const NOTAM_ACTIVITY: Horizon = Horizon::new(30 * DAY, 365 * DAY);
    /// APDU header times, PIREP observation, image validity
    pub const GENERIC: Horizon = Horizon::new(12 * HOUR, 12 * HOUR);
}

/// The unit stepped across a wraparound: the next missing field above the
/// highest one present
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum StepUnit {
    Year,
    Month,
    Day,
}

/// Lift a partial timestamp to an absolute UTC instant.
///
/// Candidates at -2..=+2 steps of the wraparound unit are formed; those
/// inside `[anchor - past, anchor + future]` compete on |candidate -
/// anchor|. No admissible candidate is a time-reconstruction error and the
/// product is dropped upstream.
pub fn resolve(
    partial: &PartialTime,
    anchor: DateTime<Utc>,
    horizon: Horizon,
    product: &'static str,
) -> Result<DateTime<Utc>, FisbError> {
    let hour = partial.hour.ok_or(FisbError::TimeReconstruction {
        product,
        detail: "no time fields on wire".into(),
    })?;
    let minute = partial.minute.unwrap_or(0);
    let second = partial.second.unwrap_or(0);

    let unit = if partial.month.is_some() {
        StepUnit::Year
    } else if partial.day.is_some() {
        StepUnit::Month
    } else {
        StepUnit::Day
    };

    let earliest = anchor - Duration::seconds(horizon.past_secs);
    let latest = anchor + Duration::seconds(horizon.future_secs);

    let mut best: Option<DateTime<Utc>> = None;
    for step in -2i32..=2 {
        let candidate = match unit {
            StepUnit::Year => build(
                anchor.year() + step,
                partial.month.unwrap_or(1),
                partial.day.unwrap_or(1),
                hour,
                minute,
                second,
            ),
            StepUnit::Month => {
                let months = anchor.year() * 12 + anchor.month0() as i32 + step;
                build(
                    months.div_euclid(12),
                    months.rem_euclid(12) as u32 + 1,
                    partial.day.unwrap_or(1),
                    hour,
                    minute,
                    second,
                )
            }
            StepUnit::Day => {
                let date = anchor.date_naive() + Duration::days(step as i64);
                build(
                    date.year(),
                    date.month(),
                    date.day(),
                    hour,
                    minute,
                    second,
                )
            }
        };
        let Some(candidate) = candidate else { continue };
        if candidate < earliest || candidate > latest {
            continue;
        }
        let closer = match best {
            None => true,
            Some(current) => {
                distance(candidate, anchor) < distance(current, anchor)
            }
        };
        if closer {
            best = Some(candidate);
        }
    }

    best.ok_or_else(|| FisbError::TimeReconstruction {
        product,
        detail: format!("{partial:?} has no candidate within window of {anchor}"),
    })
}

fn build(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> Option<DateTime<Utc>> {
    // Invalid combinations (day 31 in a 30-day month borrowed from the
    // anchor) simply produce no candidate at this step
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
}

fn distance(a: DateTime<Utc>, b: DateTime<Utc>) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// Format used for every emitted time field
pub fn to_iso8601(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_metar_observation() {
        let partial = PartialTime::day_hour_minute(14, 7, 15);
        let resolved = resolve(
            &partial,
            anchor("2021-05-14T07:18:00Z"),
            horizons::METAR_OBSERVATION,
            "METAR",
        )
        .unwrap();
        assert_eq!(to_iso8601(&resolved), "2021-05-14T07:15:00Z");
    }

    #[test]
    fn test_month_wraparound_backwards() {
        // Observation on the 31st received just after midnight on the 1st
        let partial = PartialTime::day_hour_minute(31, 23, 55);
        let resolved = resolve(
            &partial,
            anchor("2021-06-01T00:10:00Z"),
            horizons::METAR_OBSERVATION,
            "METAR",
        )
        .unwrap();
        assert_eq!(to_iso8601(&resolved), "2021-05-31T23:55:00Z");
    }

    #[test]
    fn test_year_wraparound_forward() {
        // NOTAM activity next January, received in late December
        let partial = PartialTime {
            month: Some(1),
            day: Some(5),
            hour: Some(12),
            minute: Some(0),
            ..Default::default()
        };
        let resolved = resolve(
            &partial,
            anchor("2021-12-28T09:00:00Z"),
            horizons::NOTAM_ACTIVITY,
            "NOTAM",
        )
        .unwrap();
        assert_eq!(to_iso8601(&resolved), "2022-01-05T12:00:00Z");
    }

    #[test]
    fn test_hour_only_wraps_to_previous_day() {
        let partial = PartialTime::hour_minute(23, 50);
        let resolved = resolve(
            &partial,
            anchor("2021-05-15T00:05:00Z"),
            horizons::GENERIC,
            "image",
        )
        .unwrap();
        assert_eq!(to_iso8601(&resolved), "2021-05-14T23:50:00Z");
    }

    #[test]
    fn test_outside_window_is_error() {
        // Five hours stale is outside the METAR window
        let partial = PartialTime::day_hour_minute(14, 2, 0);
        let result = resolve(
            &partial,
            anchor("2021-05-14T07:18:00Z"),
            horizons::METAR_OBSERVATION,
            "METAR",
        );
        assert!(matches!(
            result,
            Err(FisbError::TimeReconstruction { .. })
        ));
    }

    #[test]
    fn test_tie_break_prefers_nearest() {
        // Received 23:00: today's 06:00 is 17 h stale (outside the 6 h
        // past window), tomorrow's is 7 h ahead and wins
        let partial = PartialTime::hour_minute(6, 0);
        let resolved = resolve(
            &partial,
            anchor("2021-05-14T23:00:00Z"),
            horizons::WINDS_VALID,
            "WINDS",
        )
        .unwrap();
        assert_eq!(to_iso8601(&resolved), "2021-05-15T06:00:00Z");
    }

    #[test]
    fn test_roundtrip_serialization() {
        let partial = PartialTime::day_hour_minute(14, 7, 15);
        let resolved = resolve(
            &partial,
            anchor("2021-05-14T07:18:00Z"),
            horizons::METAR_OBSERVATION,
            "METAR",
        )
        .unwrap();
        let serialized = to_iso8601(&resolved);
        let reparsed: DateTime<Utc> = serialized.parse().unwrap();
        assert_eq!(reparsed, resolved);
    }

    #[test]
    fn test_invalid_day_for_borrowed_month() {
        // Day 31 with the anchor in June: June 31 does not exist, the
        // admissible candidate comes from stepping back to May
        let partial = PartialTime::day_hour_minute(31, 23, 0);
        let resolved = resolve(
            &partial,
            anchor("2021-06-01T01:00:00Z"),
            horizons::METAR_OBSERVATION,
            "METAR",
        )
        .unwrap();
        assert_eq!(to_iso8601(&resolved), "2021-05-31T23:00:00Z");
    }
}
