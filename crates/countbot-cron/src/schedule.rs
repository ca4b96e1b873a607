//! Cron expression evaluation in Asia/Shanghai.
//!
//! Expressions are standard 5-field POSIX cron (`*/N`, lists, ranges, named
//! weekdays). The `cron` crate wants a seconds field, so a `0` is prepended
//! before parsing. Asia/Shanghai has been fixed at UTC+8 since 1991, so a
//! constant offset is used rather than a tz database.

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use cron::Schedule;

use crate::error::{CronError, Result};

fn shanghai_offset() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("fixed +08:00 offset is valid")
}

/// Current Beijing wall-clock time, naive.
pub fn now_shanghai() -> NaiveDateTime {
    Utc::now().with_timezone(&shanghai_offset()).naive_local()
}

/// Timestamp format stored in the jobs table. Compares lexically.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_time(t: NaiveDateTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Prepend the seconds field expected by the `cron` crate.
fn normalize(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        _ => Err(CronError::InvalidSchedule(format!(
            "expected 5 fields, got {}: {expr}",
            fields.len()
        ))),
    }
}

fn parse(expr: &str) -> Result<Schedule> {
    let normalized = normalize(expr)?;
    Schedule::from_str(&normalized)
        .map_err(|e| CronError::InvalidSchedule(format!("{expr}: {e}")))
}

pub fn validate_schedule(expr: &str) -> bool {
    parse(expr).is_ok()
}

/// Next fire instant strictly after `base` (defaults to now), Beijing time.
pub fn calculate_next_run(expr: &str, base: Option<NaiveDateTime>) -> Result<NaiveDateTime> {
    let schedule = parse(expr)?;
    let base = base.unwrap_or_else(now_shanghai);
    let offset = shanghai_offset();
    let base_aware: DateTime<FixedOffset> = base
        .and_local_timezone(offset)
        .single()
        .ok_or_else(|| CronError::InvalidSchedule(format!("ambiguous base time: {base}")))?;

    schedule
        .after(&base_aware)
        .next()
        .map(|dt| dt.naive_local())
        .ok_or_else(|| CronError::InvalidSchedule(format!("schedule never fires: {expr}")))
}

/// Human-readable Chinese rendering of a 5-field expression. Falls back to
/// the raw expression when it doesn't match the simple patterns.
pub fn describe_schedule(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return expr.to_string();
    }
    let (minute, hour, day, month, weekday) = (fields[0], fields[1], fields[2], fields[3], fields[4]);

    let mut parts: Vec<String> = Vec::new();

    if minute == "*" {
        parts.push("每分钟".to_string());
    } else if let Some(step) = minute.strip_prefix("*/") {
        parts.push(format!("每 {step} 分钟"));
    } else {
        parts.push(format!("在第 {minute} 分钟"));
    }

    if hour == "*" {
        parts.push("每小时".to_string());
    } else if let Some(step) = hour.strip_prefix("*/") {
        parts.push(format!("每 {step} 小时"));
    } else {
        parts.push(format!("在 {hour} 点"));
    }

    if day != "*" {
        parts.push(format!("每月第 {day} 天"));
    }
    if month != "*" {
        parts.push(format!("在 {month} 月"));
    }
    if weekday != "*" {
        let name = match weekday {
            "0" | "7" => "周日",
            "1" => "周一",
            "2" => "周二",
            "3" => "周三",
            "4" => "周四",
            "5" => "周五",
            "6" => "周六",
            other => other,
        };
        parts.push(format!("在{name}"));
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    #[test]
    fn valid_expressions_pass_validation() {
        assert!(validate_schedule("0 * * * *"));
        assert!(validate_schedule("*/5 * * * *"));
        assert!(validate_schedule("30 9 * * 1-5"));
        assert!(validate_schedule("0 8 1,15 * *"));
    }

    #[test]
    fn invalid_expressions_fail_validation() {
        assert!(!validate_schedule("not a cron"));
        assert!(!validate_schedule("* * * *"));
        assert!(!validate_schedule("99 * * * *"));
        assert!(!validate_schedule(""));
    }

    #[test]
    fn validation_iff_next_run_computes() {
        for expr in ["0 * * * *", "*/3 * * * *", "bogus", "61 0 * * *"] {
            assert_eq!(
                validate_schedule(expr),
                calculate_next_run(expr, None).is_ok(),
                "{expr}"
            );
        }
    }

    #[test]
    fn hourly_job_fires_at_the_next_top_of_hour() {
        let base = at(2026, 3, 10, 14, 30);
        let next = calculate_next_run("0 * * * *", Some(base)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 15, 0));
    }

    #[test]
    fn next_run_is_strictly_after_the_base() {
        let base = at(2026, 3, 10, 15, 0);
        let next = calculate_next_run("0 * * * *", Some(base)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 16, 0));
    }

    #[test]
    fn late_night_job_rolls_across_midnight() {
        let base = at(2026, 3, 10, 23, 59);
        let next = calculate_next_run("59 23 * * *", Some(base)).unwrap();
        assert_eq!(next, at(2026, 3, 11, 23, 59));
    }

    #[test]
    fn every_minute_step() {
        let base = at(2026, 3, 10, 14, 0);
        let next = calculate_next_run("*/1 * * * *", Some(base)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 14, 1));
    }

    #[test]
    fn weekday_schedule_skips_the_weekend() {
        // 2026-03-13 is a Friday.
        let base = at(2026, 3, 13, 10, 0);
        let next = calculate_next_run("30 9 * * 1-5", Some(base)).unwrap();
        assert_eq!(next, at(2026, 3, 16, 9, 30));
    }

    #[test]
    fn descriptions_cover_common_shapes() {
        assert_eq!(describe_schedule("* * * * *"), "每分钟 每小时");
        assert!(describe_schedule("*/5 * * * *").contains("每 5 分钟"));
        assert!(describe_schedule("0 9 * * 1").contains("在 9 点"));
        assert!(describe_schedule("0 9 * * 1").contains("周一"));
        assert_eq!(describe_schedule("garbage"), "garbage");
    }

    #[test]
    fn time_format_compares_lexically() {
        let earlier = format_time(at(2026, 3, 10, 9, 0));
        let later = format_time(at(2026, 3, 10, 15, 0));
        assert!(earlier < later);
    }
}
