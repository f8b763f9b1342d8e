//! Natural time-expression parsing for time-scoped recall.
//!
//! A thin helper, not an NLP engine: a handful of regexes over the
//! phrasings that actually reach the service (`yesterday`, `last week`,
//! `3 days ago`, ISO dates). Anything unrecognized is a validation
//! error so callers know the window was not applied.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{Error, Result};

static RELATIVE_AGO: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)\b(\d+)\s+(minute|hour|day|week|month)s?\s+ago\b").unwrap()
});

static LAST_N: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)\b(?:last|past)\s+(\d+)\s+(minute|hour|day|week|month)s?\b").unwrap()
});

static ISO_DATE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap()
});

const fn unit_seconds(unit: &str) -> f64 {
    match unit.as_bytes() {
        b"minute" => 60.0,
        b"hour" => 3_600.0,
        b"day" => 86_400.0,
        b"week" => 604_800.0,
        // Calendar months vary; 30 days is close enough for a recall window.
        _ => 2_592_000.0,
    }
}

fn day_bounds(date: NaiveDate) -> Option<(f64, f64)> {
    let start = Utc
        .from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
        .single()?;
    let end = start + Duration::days(1);
    #[allow(clippy::cast_precision_loss)]
    let bounds = (
        start.timestamp_millis() as f64 / 1_000.0,
        end.timestamp_millis() as f64 / 1_000.0,
    );
    Some(bounds)
}

/// Parses a natural time expression into a `(start, end)` window of
/// float UTC seconds.
///
/// Recognized forms include `today`, `yesterday`, `this week`,
/// `last week`, `this month`, `last month`, `N <unit>s ago`,
/// `last N <unit>s`, and `YYYY-MM-DD`.
///
/// # Errors
///
/// Returns [`Error::Validation`] for expressions none of the recognizers
/// match.
pub fn parse_time_expression(expression: &str, now: DateTime<Utc>) -> Result<(f64, f64)> {
    let text = expression.trim().to_lowercase();
    #[allow(clippy::cast_precision_loss)]
    let now_ts = now.timestamp_millis() as f64 / 1_000.0;
    let today = now.date_naive();

    if text.contains("today") {
        if let Some(bounds) = day_bounds(today) {
            return Ok((bounds.0, now_ts));
        }
    }
    if text.contains("yesterday") {
        if let Some(bounds) = today.pred_opt().and_then(day_bounds) {
            return Ok(bounds);
        }
    }
    if text.contains("this week") {
        let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
        if let Some(bounds) = day_bounds(monday) {
            return Ok((bounds.0, now_ts));
        }
    }
    if text.contains("last week") {
        let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
        let last_monday = monday - Duration::days(7);
        if let (Some(start), Some(end)) = (day_bounds(last_monday), day_bounds(monday)) {
            return Ok((start.0, end.0));
        }
    }
    if text.contains("this month") {
        if let Some(first) = today.with_day(1).and_then(day_bounds) {
            return Ok((first.0, now_ts));
        }
    }
    if text.contains("last month") {
        let first_of_this = today.with_day(1);
        let first_of_last = first_of_this
            .and_then(|d| d.pred_opt())
            .and_then(|d| d.with_day(1));
        if let (Some(start), Some(end)) = (
            first_of_last.and_then(day_bounds),
            first_of_this.and_then(day_bounds),
        ) {
            return Ok((start.0, end.0));
        }
    }

    if let Some(caps) = RELATIVE_AGO.captures(&text) {
        let amount: f64 = caps[1].parse().unwrap_or(0.0);
        let span = unit_seconds(&caps[2].to_lowercase());
        let point = now_ts - amount * span;
        // "3 days ago" means that day, not an instant: widen to the unit.
        return Ok((point - span / 2.0, point + span / 2.0));
    }
    if let Some(caps) = LAST_N.captures(&text) {
        let amount: f64 = caps[1].parse().unwrap_or(0.0);
        let span = unit_seconds(&caps[2].to_lowercase());
        return Ok((now_ts - amount * span, now_ts));
    }
    if let Some(caps) = ISO_DATE.captures(&text) {
        let date = NaiveDate::from_ymd_opt(
            caps[1].parse().unwrap_or(1970),
            caps[2].parse().unwrap_or(1),
            caps[3].parse().unwrap_or(1),
        );
        if let Some(bounds) = date.and_then(day_bounds) {
            return Ok(bounds);
        }
    }

    Err(Error::Validation(format!(
        "unrecognized time expression: '{expression}'"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        // Wednesday 2024-04-17 15:30:00 UTC
        Utc.with_ymd_and_hms(2024, 4, 17, 15, 30, 0).single().unwrap()
    }

    #[test]
    fn test_yesterday_is_a_full_day() {
        let (start, end) = parse_time_expression("yesterday", fixed_now()).unwrap();
        assert!((end - start - 86_400.0).abs() < 1.0);
        let start_dt = Utc.timestamp_opt(start as i64, 0).single().unwrap();
        assert_eq!(start_dt.date_naive().to_string(), "2024-04-16");
    }

    #[test]
    fn test_today_ends_now() {
        let now = fixed_now();
        let (start, end) = parse_time_expression("today", now).unwrap();
        assert!((end - now.timestamp() as f64).abs() < 1.0);
        assert!(end - start < 86_400.0);
    }

    #[test]
    fn test_last_week_is_monday_to_monday() {
        let (start, end) = parse_time_expression("last week", fixed_now()).unwrap();
        assert!((end - start - 7.0 * 86_400.0).abs() < 1.0);
        let start_dt = Utc.timestamp_opt(start as i64, 0).single().unwrap();
        assert_eq!(start_dt.date_naive().to_string(), "2024-04-08");
    }

    #[test]
    fn test_n_days_ago_window() {
        let now = fixed_now();
        let (start, end) = parse_time_expression("3 days ago", now).unwrap();
        let center = now.timestamp() as f64 - 3.0 * 86_400.0;
        assert!(start < center && center < end);
    }

    #[test]
    fn test_last_n_days() {
        let now = fixed_now();
        let (start, end) = parse_time_expression("last 14 days", now).unwrap();
        assert!((end - now.timestamp() as f64).abs() < 1.0);
        assert!((end - start - 14.0 * 86_400.0).abs() < 1.0);
    }

    #[test]
    fn test_iso_date() {
        let (start, end) = parse_time_expression("2024-01-15", fixed_now()).unwrap();
        assert!((end - start - 86_400.0).abs() < 1.0);
        let start_dt = Utc.timestamp_opt(start as i64, 0).single().unwrap();
        assert_eq!(start_dt.date_naive().to_string(), "2024-01-15");
    }

    #[test]
    fn test_unrecognized_expression_is_validation_error() {
        let err = parse_time_expression("the before times", fixed_now()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_embedded_expression_in_query() {
        let (start, end) =
            parse_time_expression("what did I decide last week about auth", fixed_now()).unwrap();
        assert!(end > start);
    }
}
