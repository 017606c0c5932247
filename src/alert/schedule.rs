use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// One active window: a start and end time of day plus the days of the
/// week it applies to. An end before the start wraps past midnight.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SchedulePeriod {
    /// "hh:mm", inclusive.
    pub start: String,
    /// "hh:mm", exclusive.
    pub end: String,
    /// Lowercase three-letter day names. Empty means every day.
    #[serde(default)]
    pub days: Vec<String>,
}

/// When a rule is allowed to fire. A rule with no schedule, or a schedule
/// with no periods, is always active. Times are interpreted at the
/// configured UTC offset (UTC when unspecified).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Schedule {
    #[serde(default)]
    pub periods: Vec<SchedulePeriod>,
    /// Minutes east of UTC for interpreting the period times.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").ok()
}

fn day_matches(days: &[String], weekday: Weekday) -> bool {
    if days.is_empty() {
        return true;
    }
    let name = match weekday {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    };
    days.iter().any(|day| day.to_ascii_lowercase() == name)
}

impl Schedule {
    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }

    /// Whether at least one period contains the given instant. Malformed
    /// period times never match.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if self.periods.is_empty() {
            return true;
        }

        let local = now + Duration::minutes(self.utc_offset_minutes as i64);
        let time = NaiveTime::from_hms_opt(local.hour(), local.minute(), local.second())
            .expect("clock components are in range");
        let weekday = local.weekday();

        self.periods.iter().any(|period| {
            let (start, end) = match (parse_hhmm(&period.start), parse_hhmm(&period.end)) {
                (Some(start), Some(end)) => (start, end),
                _ => return false,
            };
            if !day_matches(&period.days, weekday) {
                return false;
            }
            if start <= end {
                start <= time && time < end
            } else {
                // Overnight window, e.g. 22:00 to 06:00.
                time >= start || time < end
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(weekday_date: (i32, u32, u32), hour: u32, minute: u32) -> DateTime<Utc> {
        let (year, month, day) = weekday_date;
        Utc.with_ymd_and_hms(year, month, day, hour, minute, 0).unwrap()
    }

    // 2024-03-04 is a Monday.
    const MONDAY: (i32, u32, u32) = (2024, 3, 4);
    const SATURDAY: (i32, u32, u32) = (2024, 3, 9);

    fn business_hours() -> Schedule {
        Schedule {
            periods: vec![SchedulePeriod {
                start: "09:00".to_owned(),
                end: "17:00".to_owned(),
                days: vec!["mon".to_owned(), "tue".to_owned(), "wed".to_owned(),
                           "thu".to_owned(), "fri".to_owned()],
            }],
            utc_offset_minutes: 0,
        }
    }

    #[test]
    fn empty_schedule_is_always_active() {
        assert!(Schedule::default().is_active_at(at(MONDAY, 3, 0)));
    }

    #[test]
    fn inside_and_outside_the_window() {
        let schedule = business_hours();
        assert!(schedule.is_active_at(at(MONDAY, 9, 0)));
        assert!(schedule.is_active_at(at(MONDAY, 12, 30)));
        assert!(!schedule.is_active_at(at(MONDAY, 17, 0)));
        assert!(!schedule.is_active_at(at(MONDAY, 8, 59)));
    }

    #[test]
    fn day_set_excludes_weekends() {
        let schedule = business_hours();
        assert!(!schedule.is_active_at(at(SATURDAY, 12, 0)));
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let schedule = Schedule {
            periods: vec![SchedulePeriod {
                start: "22:00".to_owned(),
                end: "06:00".to_owned(),
                days: vec![],
            }],
            utc_offset_minutes: 0,
        };
        assert!(schedule.is_active_at(at(MONDAY, 23, 0)));
        assert!(schedule.is_active_at(at(MONDAY, 2, 0)));
        assert!(!schedule.is_active_at(at(MONDAY, 12, 0)));
    }

    #[test]
    fn utc_offset_shifts_the_window() {
        let mut schedule = business_hours();
        // UTC+2: 08:00 UTC is 10:00 local, inside the window.
        schedule.utc_offset_minutes = 120;
        assert!(schedule.is_active_at(at(MONDAY, 8, 0)));
        // 16:00 UTC is 18:00 local, outside.
        assert!(!schedule.is_active_at(at(MONDAY, 16, 0)));
    }

    #[test]
    fn malformed_times_never_match() {
        let schedule = Schedule {
            periods: vec![SchedulePeriod {
                start: "not-a-time".to_owned(),
                end: "17:00".to_owned(),
                days: vec![],
            }],
            utc_offset_minutes: 0,
        };
        assert!(!schedule.is_active_at(at(MONDAY, 12, 0)));
    }
}
