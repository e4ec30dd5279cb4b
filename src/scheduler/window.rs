//! Active-hours window
//!
//! Work is only dispatched inside the configured daily window. The window
//! is evaluated in the site's timezone, configured as a fixed UTC offset,
//! and supports overnight ranges like 22:00 to 06:00.

use chrono::{Datelike, FixedOffset, Local, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActiveWindow {
    /// When disabled the window is always open.
    pub enabled: bool,
    /// Start time, HH:MM.
    pub start_time: String,
    /// End time, HH:MM.
    pub end_time: String,
    /// Days of the week to run (0 = Monday, 6 = Sunday).
    pub days: Vec<u8>,
    /// Site-local timezone as minutes east of UTC. Host local time is used
    /// when absent.
    pub utc_offset_minutes: Option<i32>,
}

impl Default for ActiveWindow {
    fn default() -> Self {
        Self {
            enabled: false,
            start_time: "07:00".to_string(),
            end_time: "23:00".to_string(),
            days: vec![0, 1, 2, 3, 4, 5, 6],
            utc_offset_minutes: None,
        }
    }
}

fn weekday_index(weekday: Weekday) -> u8 {
    match weekday {
        Weekday::Mon => 0,
        Weekday::Tue => 1,
        Weekday::Wed => 2,
        Weekday::Thu => 3,
        Weekday::Fri => 4,
        Weekday::Sat => 5,
        Weekday::Sun => 6,
    }
}

impl ActiveWindow {
    /// Check whether work may run right now.
    pub fn is_open(&self) -> bool {
        let (time, day) = match self.utc_offset_minutes.and_then(|m| FixedOffset::east_opt(m * 60))
        {
            Some(offset) => {
                let now = Utc::now().with_timezone(&offset);
                (now.time(), weekday_index(now.weekday()))
            }
            None => {
                let now = Local::now();
                (now.time(), weekday_index(now.weekday()))
            }
        };
        self.is_open_at(time, day)
    }

    fn is_open_at(&self, time: NaiveTime, day: u8) -> bool {
        if !self.enabled {
            return true;
        }

        if !self.days.contains(&day) {
            debug!(day, days = ?self.days, "outside scheduled days");
            return false;
        }

        let start = match NaiveTime::parse_from_str(&self.start_time, "%H:%M") {
            Ok(t) => t,
            Err(_) => {
                debug!(start = %self.start_time, "invalid window start, treating as open");
                return true;
            }
        };
        let end = match NaiveTime::parse_from_str(&self.end_time, "%H:%M") {
            Ok(t) => t,
            Err(_) => {
                debug!(end = %self.end_time, "invalid window end, treating as open");
                return true;
            }
        };

        // Overnight windows wrap around midnight.
        if start > end {
            return time >= start || time <= end;
        }
        time >= start && time <= end
    }

    /// Seconds until the window closes, for logging.
    pub fn seconds_until_close(&self) -> Option<i64> {
        if !self.enabled {
            return None;
        }
        let now = match self.utc_offset_minutes.and_then(|m| FixedOffset::east_opt(m * 60)) {
            Some(offset) => Utc::now().with_timezone(&offset).time(),
            None => Local::now().time(),
        };
        let end = NaiveTime::parse_from_str(&self.end_time, "%H:%M").ok()?;
        let now_secs = now.num_seconds_from_midnight() as i64;
        let end_secs = end.num_seconds_from_midnight() as i64;
        let mut delta = end_secs - now_secs;
        if delta < 0 {
            delta += 24 * 3600;
        }
        Some(delta)
    }
}
