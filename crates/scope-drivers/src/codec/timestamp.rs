//! Instrument wall-clock time.
//!
//! Instruments report trigger times as broken-down local time. They are
//! converted to seconds since the Unix epoch plus a femtosecond remainder
//! using the host's local time zone, which also absorbs the DST offset the
//! instruments do not apply themselves.

use chrono::{Local, NaiveDate, NaiveDateTime, TimeZone};
use scope_core::FS_PER_SECOND;

/// Broken-down trigger time as stored in a `WAVEDESC`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentTime {
    /// Seconds within the minute, with fraction.
    pub seconds: f64,
    pub minutes: u8,
    pub hours: u8,
    pub days: u8,
    pub months: u8,
    pub year: u16,
}

impl Default for InstrumentTime {
    fn default() -> Self {
        Self {
            seconds: 0.0,
            minutes: 0,
            hours: 0,
            days: 1,
            months: 1,
            year: 2000,
        }
    }
}

impl InstrumentTime {
    /// Broken-down form of a local date-time, for the simulated instruments.
    pub fn from_local(dt: &NaiveDateTime, fraction: f64) -> Self {
        use chrono::{Datelike, Timelike};
        Self {
            seconds: f64::from(dt.second()) + fraction,
            minutes: dt.minute() as u8,
            hours: dt.hour() as u8,
            days: dt.day() as u8,
            months: dt.month() as u8,
            year: dt.year() as u16,
        }
    }

    /// `(seconds since epoch, femtoseconds)`; `None` if the fields do not
    /// form a valid date.
    pub fn to_epoch(&self) -> Option<(i64, i64)> {
        let whole = self.seconds.floor();
        let date = NaiveDate::from_ymd_opt(
            i32::from(self.year),
            u32::from(self.months),
            u32::from(self.days),
        )?;
        let naive = date.and_hms_opt(
            u32::from(self.hours),
            u32::from(self.minutes),
            whole as u32,
        )?;
        let local = Local.from_local_datetime(&naive).earliest()?;
        let fs = ((self.seconds - whole) * FS_PER_SECOND as f64).round() as i64;
        Some((local.timestamp(), fs))
    }
}

/// Convert nanoseconds since 2000-01-01 00:00 instrument-local time (the
/// LeCroy digital capture epoch) to `(seconds since epoch, femtoseconds)`.
pub fn from_y2k_nanos(nanos: i64) -> Option<(i64, i64)> {
    let epoch = NaiveDate::from_ymd_opt(2000, 1, 1)?.and_hms_opt(0, 0, 0)?;
    let naive = epoch + chrono::Duration::seconds(nanos.div_euclid(1_000_000_000));
    let local = Local.from_local_datetime(&naive).earliest()?;
    Some((local.timestamp(), nanos.rem_euclid(1_000_000_000) * 1_000_000))
}

/// Current host time, for families that report no trigger timestamp.
pub fn now() -> (i64, i64) {
    let now = chrono::Utc::now();
    (
        now.timestamp(),
        i64::from(now.timestamp_subsec_nanos()) * 1_000_000,
    )
}

/// Keeps delivered start times strictly increasing.
///
/// A start that is not later than the previous one is replaced by the
/// previous start plus one femtosecond.
#[derive(Debug, Default, Clone)]
pub struct MonotonicStart {
    last: Option<(i64, i64)>,
}

impl MonotonicStart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, candidate: (i64, i64)) -> (i64, i64) {
        let start = match self.last {
            Some(last) if candidate <= last => {
                let fs = last.1 + 1;
                if fs >= FS_PER_SECOND {
                    (last.0 + 1, fs - FS_PER_SECOND)
                } else {
                    (last.0, fs)
                }
            }
            _ => candidate,
        };
        self.last = Some(start);
        start
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
