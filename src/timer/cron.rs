//! Cron expressions.
//!
//! Six whitespace-separated fields:
//!
//! ```text
//! second minute hour day-of-month month day-of-week
//! 0-59   0-59   0-23 1-31         1-12  0-6 (0 = Sunday)
//! ```
//!
//! Each field is a comma-separated list of `*`, `n`, `a-b`, optionally with
//! a `/step` suffix. When both day-of-month and day-of-week are restricted,
//! a day matching either fires.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike};

use crate::error::{Error, Result};

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    sec: u64,
    min: u64,
    hour: u64,
    dom: u64,
    month: u64,
    dow: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

#[inline]
fn bit(mask: u64, n: u32) -> bool {
    mask & (1 << n) != 0
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<(u64, bool)> {
    let err = || Error::InvalidCronExpr(field.to_string());

    let mut mask = 0u64;
    let mut restricted = false;
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((r, s)) => (r, s.parse::<u32>().map_err(|_| err())?),
            None => (item, 1),
        };
        if step == 0 {
            return Err(err());
        }

        let (lo, hi) = if range == "*" {
            (min, max)
        } else {
            restricted = true;
            match range.split_once('-') {
                Some((a, b)) => (
                    a.parse().map_err(|_| err())?,
                    b.parse().map_err(|_| err())?,
                ),
                None => {
                    let n: u32 = range.parse().map_err(|_| err())?;
                    // A bare value with a step ("30/10") ranges to the max.
                    if step > 1 {
                        (n, max)
                    } else {
                        (n, n)
                    }
                }
            }
        };
        if lo < min || hi > max || lo > hi {
            return Err(err());
        }

        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }
    Ok((mask, restricted))
}

impl CronExpr {
    /// Parse a six-field expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(Error::InvalidCronExpr(format!(
                "expected 6 fields, got {}",
                fields.len()
            )));
        }

        let (sec, _) = parse_field(fields[0], 0, 59)?;
        let (min, _) = parse_field(fields[1], 0, 59)?;
        let (hour, _) = parse_field(fields[2], 0, 23)?;
        let (dom, dom_restricted) = parse_field(fields[3], 1, 31)?;
        let (month, _) = parse_field(fields[4], 1, 12)?;
        let (dow, dow_restricted) = parse_field(fields[5], 0, 6)?;

        Ok(Self {
            sec,
            min,
            hour,
            dom,
            month,
            dow,
            dom_restricted,
            dow_restricted,
        })
    }

    fn day_matches<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        let dom = bit(self.dom, t.day());
        let dow = bit(self.dow, t.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// The first instant strictly after `after` matching the expression,
    /// or `None` when nothing matches within four years (e.g. Feb 30).
    pub fn next<Tz: TimeZone>(&self, after: DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let horizon = after.year() + 4;

        let mut t = after.with_nanosecond(0)? + Duration::seconds(1);
        loop {
            if t.year() > horizon {
                return None;
            }

            if !bit(self.month, t.month()) {
                // First instant of the next month.
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = tz.with_ymd_and_hms(y, m, 1, 0, 0, 0).earliest()?;
                continue;
            }
            if !self.day_matches(&t) {
                t = t
                    .date_naive()
                    .succ_opt()?
                    .and_hms_opt(0, 0, 0)?
                    .and_local_timezone(tz.clone())
                    .earliest()?;
                continue;
            }
            if !bit(self.hour, t.hour()) {
                t = t.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.min, t.minute()) {
                t = t.with_second(0)? + Duration::minutes(1);
                continue;
            }
            if !bit(self.sec, t.second()) {
                t = t + Duration::seconds(1);
                continue;
            }
            return Some(t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_every_second() {
        let e = CronExpr::parse("* * * * * *").unwrap();
        let n = e.next(at("2026-03-01T10:00:00Z")).unwrap();
        assert_eq!(n, at("2026-03-01T10:00:01Z"));
    }

    #[test]
    fn test_fixed_second_of_minute() {
        let e = CronExpr::parse("30 * * * * *").unwrap();
        assert_eq!(
            e.next(at("2026-03-01T10:00:00Z")).unwrap(),
            at("2026-03-01T10:00:30Z")
        );
        // Strictly after: sitting on the match rolls to the next minute.
        assert_eq!(
            e.next(at("2026-03-01T10:00:30Z")).unwrap(),
            at("2026-03-01T10:01:30Z")
        );
    }

    #[test]
    fn test_daily_at_midnight() {
        let e = CronExpr::parse("0 0 0 * * *").unwrap();
        assert_eq!(
            e.next(at("2026-03-01T10:30:00Z")).unwrap(),
            at("2026-03-02T00:00:00Z")
        );
    }

    #[test]
    fn test_step_minutes() {
        let e = CronExpr::parse("0 */15 * * * *").unwrap();
        assert_eq!(
            e.next(at("2026-03-01T10:07:12Z")).unwrap(),
            at("2026-03-01T10:15:00Z")
        );
    }

    #[test]
    fn test_month_rollover() {
        let e = CronExpr::parse("0 0 0 1 * *").unwrap();
        assert_eq!(
            e.next(at("2026-03-15T00:00:00Z")).unwrap(),
            at("2026-04-01T00:00:00Z")
        );
    }

    #[test]
    fn test_specific_month_and_day() {
        let e = CronExpr::parse("0 0 12 25 12 *").unwrap();
        assert_eq!(
            e.next(at("2026-03-01T00:00:00Z")).unwrap(),
            at("2026-12-25T12:00:00Z")
        );
    }

    #[test]
    fn test_weekday_only() {
        // Sundays at 08:00. 2026-03-01 is a Sunday.
        let e = CronExpr::parse("0 0 8 * * 0").unwrap();
        assert_eq!(
            e.next(at("2026-03-01T09:00:00Z")).unwrap(),
            at("2026-03-08T08:00:00Z")
        );
    }

    #[test]
    fn test_dom_or_dow_when_both_restricted() {
        // Day 15 or Sundays. From Mon 2026-03-02, the first Sunday
        // (2026-03-08) comes before the 15th.
        let e = CronExpr::parse("0 0 0 15 * 0").unwrap();
        assert_eq!(
            e.next(at("2026-03-02T00:00:00Z")).unwrap(),
            at("2026-03-08T00:00:00Z")
        );
    }

    #[test]
    fn test_impossible_date_returns_none() {
        let e = CronExpr::parse("0 0 0 30 2 *").unwrap();
        assert!(e.next(at("2026-01-01T00:00:00Z")).is_none());
    }

    #[test]
    fn test_ranges_and_lists() {
        let e = CronExpr::parse("0 0 9-17 * * 1-5").unwrap();
        // Friday 2026-03-06 17:00 is the last slot of the week...
        assert_eq!(
            e.next(at("2026-03-06T16:30:00Z")).unwrap(),
            at("2026-03-06T17:00:00Z")
        );
        // ...after it, Monday 09:00.
        assert_eq!(
            e.next(at("2026-03-06T17:00:00Z")).unwrap(),
            at("2026-03-09T09:00:00Z")
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(CronExpr::parse("* * * * *").is_err());
        assert!(CronExpr::parse("60 * * * * *").is_err());
        assert!(CronExpr::parse("* * 24 * * *").is_err());
        assert!(CronExpr::parse("* * * 0 * *").is_err());
        assert!(CronExpr::parse("* * * * 13 *").is_err());
        assert!(CronExpr::parse("* * * * * 7").is_err());
        assert!(CronExpr::parse("*/0 * * * * *").is_err());
        assert!(CronExpr::parse("5-2 * * * * *").is_err());
        assert!(CronExpr::parse("x * * * * *").is_err());
    }
}
