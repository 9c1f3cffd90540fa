//! Schedule expressions and slot arithmetic.
//!
//! Slots are computed from the wall clock only, never from when a run finished, so a slow
//! run never shifts a job's future slots. Interval schedules are aligned to UTC epoch
//! boundaries (an `hourly` job fires at the top of each hour, a `6h` job at 00/06/12/18).
//!
//! Accepted forms (case-insensitive):
//! - `disabled`
//! - `hourly`, `daily`, `weekly` (weekly = Monday 00:00 UTC)
//! - `<n>m`, `<n>h`, `<n>d`
//! - `daily@HH:MM`
//! - `weekly@<weekday>@HH:MM`

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use std::fmt;
use std::str::FromStr;

use crate::errors::{VaultError, VaultResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Never fires on its own; manual enqueue still works.
    Disabled,
    /// Every `n` minutes, aligned to the UNIX epoch.
    Every { minutes: u32 },
    DailyAt { at: NaiveTime },
    WeeklyAt { day: Weekday, at: NaiveTime },
}

impl Schedule {
    pub fn parse(expr: &str) -> VaultResult<Self> {
        let lowered = expr.trim().to_ascii_lowercase();
        let invalid = || VaultError::InvalidSchedule(expr.to_string());
        let schedule = match lowered.as_str() {
            "disabled" | "off" | "none" => Schedule::Disabled,
            "hourly" => Schedule::Every { minutes: 60 },
            "daily" => Schedule::Every { minutes: 1440 },
            "weekly" => Schedule::WeeklyAt {
                day: Weekday::Mon,
                at: NaiveTime::MIN,
            },
            other => {
                if let Some(rest) = other.strip_prefix("daily@") {
                    Schedule::DailyAt {
                        at: parse_time(rest).ok_or_else(invalid)?,
                    }
                } else if let Some(rest) = other.strip_prefix("weekly@") {
                    let (day, time) = rest.split_once('@').ok_or_else(invalid)?;
                    Schedule::WeeklyAt {
                        day: Weekday::from_str(day).map_err(|_| invalid())?,
                        at: parse_time(time).ok_or_else(invalid)?,
                    }
                } else {
                    parse_interval(other).ok_or_else(invalid)?
                }
            }
        };
        Ok(schedule)
    }

    /// First slot strictly after `t`, or `None` for a disabled schedule.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Schedule::Disabled => None,
            Schedule::Every { minutes } => {
                let period = i64::from(minutes) * 60;
                let slot = (t.timestamp().div_euclid(period) + 1) * period;
                Utc.timestamp_opt(slot, 0).single()
            }
            Schedule::DailyAt { at } => {
                let today = Utc.from_utc_datetime(&t.date_naive().and_time(at));
                Some(if today > t {
                    today
                } else {
                    today + Duration::days(1)
                })
            }
            Schedule::WeeklyAt { day, at } => {
                let offset = (7 + day.num_days_from_monday() as i64
                    - t.weekday().num_days_from_monday() as i64)
                    % 7;
                let candidate = Utc
                    .from_utc_datetime(&t.date_naive().and_time(at))
                    + Duration::days(offset);
                Some(if candidate > t {
                    candidate
                } else {
                    candidate + Duration::days(7)
                })
            }
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Schedule::Disabled)
    }

    /// Human-readable description for status output.
    pub fn description(&self) -> String {
        match *self {
            Schedule::Disabled => "disabled".to_string(),
            Schedule::Every { minutes: 60 } => "every hour".to_string(),
            Schedule::Every { minutes: 1440 } => "daily at midnight UTC".to_string(),
            Schedule::Every { minutes } if minutes % 1440 == 0 => {
                format!("every {} days", minutes / 1440)
            }
            Schedule::Every { minutes } if minutes % 60 == 0 => {
                format!("every {} hours", minutes / 60)
            }
            Schedule::Every { minutes } => format!("every {} minutes", minutes),
            Schedule::DailyAt { at } => format!("daily at {} UTC", at.format("%H:%M")),
            Schedule::WeeklyAt { day, at } => {
                format!("every {} at {} UTC", day, at.format("%H:%M"))
            }
        }
    }
}

impl FromStr for Schedule {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schedule::parse(s)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

fn parse_interval(s: &str) -> Option<Schedule> {
    if s.len() < 2 {
        return None;
    }
    let (count, unit) = s.split_at(s.len() - 1);
    let count: u32 = count.parse().ok()?;
    let minutes = match unit {
        "m" => Some(count),
        "h" => count.checked_mul(60),
        "d" => count.checked_mul(1440),
        _ => None,
    }?;
    (minutes > 0).then_some(Schedule::Every { minutes })
}
