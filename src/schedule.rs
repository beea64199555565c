//! Time-of-day and day-of-week session windows.
//!
//! A schedule answers two questions: is the session allowed to be active
//! at an instant, and do two instants fall within the same contiguous
//! window occurrence. The second drives sequence-number resets when a
//! session crosses into a new trading day or week.

use chrono::{
    DateTime, Datelike, Duration as TimeDelta, FixedOffset, NaiveTime, Offset, TimeZone, Timelike,
    Utc, Weekday,
};

/// When a session may be active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSchedule {
    /// No window; the session is always allowed.
    Always,
    /// One window per day, evaluated in the given fixed offset. Windows
    /// may cross midnight (`start > end`).
    Daily {
        start: NaiveTime,
        end: NaiveTime,
        offset: FixedOffset,
    },
    /// One window per week, from `start_day`/`start` to `end_day`/`end`.
    Weekly {
        start_day: Weekday,
        end_day: Weekday,
        start: NaiveTime,
        end: NaiveTime,
        offset: FixedOffset,
    },
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

impl SessionSchedule {
    pub fn daily_utc(start: NaiveTime, end: NaiveTime) -> Self {
        SessionSchedule::Daily { start, end, offset: utc_offset() }
    }

    pub fn daily_in_zone(start: NaiveTime, end: NaiveTime, offset: FixedOffset) -> Self {
        SessionSchedule::Daily { start, end, offset }
    }

    pub fn weekly_utc(start_day: Weekday, end_day: Weekday, start: NaiveTime, end: NaiveTime) -> Self {
        SessionSchedule::Weekly { start_day, end_day, start, end, offset: utc_offset() }
    }

    pub fn weekly_in_zone(
        start_day: Weekday,
        end_day: Weekday,
        start: NaiveTime,
        end: NaiveTime,
        offset: FixedOffset,
    ) -> Self {
        SessionSchedule::Weekly { start_day, end_day, start, end, offset }
    }

    /// Start instant of the window occurrence at or before `t`, plus the
    /// window length. `None` for [`SessionSchedule::Always`].
    fn occurrence(&self, t: DateTime<Utc>) -> Option<(DateTime<Utc>, TimeDelta)> {
        match *self {
            SessionSchedule::Always => None,
            SessionSchedule::Daily { start, end, offset } => {
                let local = t.with_timezone(&offset);
                let mut anchor = match offset
                    .with_ymd_and_hms(
                        local.year(),
                        local.month(),
                        local.day(),
                        start.hour(),
                        start.minute(),
                        start.second(),
                    )
                    .single()
                {
                    Some(a) => a,
                    None => return None,
                };
                if anchor > local {
                    anchor -= TimeDelta::days(1);
                }
                let mut len = end.signed_duration_since(start);
                if len <= TimeDelta::zero() {
                    len += TimeDelta::days(1);
                }
                Some((anchor.with_timezone(&Utc), len))
            }
            SessionSchedule::Weekly { start_day, end_day, start, end, offset } => {
                let local = t.with_timezone(&offset);
                let days_back = (7 + local.weekday().num_days_from_sunday()
                    - start_day.num_days_from_sunday())
                    % 7;
                let date = local.date_naive() - TimeDelta::days(days_back as i64);
                let mut anchor = match offset
                    .from_local_datetime(&date.and_time(start))
                    .single()
                {
                    Some(a) => a,
                    None => return None,
                };
                if anchor > local {
                    anchor -= TimeDelta::days(7);
                }
                let day_span = (7 + end_day.num_days_from_sunday()
                    - start_day.num_days_from_sunday()) as i64
                    % 7;
                let mut len =
                    TimeDelta::days(day_span) + end.signed_duration_since(start);
                if len <= TimeDelta::zero() {
                    len += TimeDelta::days(7);
                }
                Some((anchor.with_timezone(&Utc), len))
            }
        }
    }

    /// Total: every instant is either inside or outside the window.
    pub fn is_in_range(&self, t: DateTime<Utc>) -> bool {
        match self.occurrence(t) {
            None => true,
            Some((anchor, len)) => t.signed_duration_since(anchor) <= len,
        }
    }

    /// True iff both instants fall within the same contiguous occurrence
    /// of the window.
    pub fn is_in_same_range(&self, t1: DateTime<Utc>, t2: DateTime<Utc>) -> bool {
        if !self.is_in_range(t1) || !self.is_in_range(t2) {
            return false;
        }
        match (self.occurrence(t1), self.occurrence(t2)) {
            (None, None) => true,
            (Some((a1, _)), Some((a2, _))) => a1 == a2,
            _ => false,
        }
    }
}
