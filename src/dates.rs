// src/dates.rs
//! Relative date expressions and time-window arithmetic.
//!
//! Query configurations carry dates as either absolute `YYYY-MM-DD` values
//! or human expressions ("90 days ago", "now"). The remote API only accepts
//! the absolute form, so everything funnels through [`resolve_date`].

use chrono::{Days, Months, NaiveDate, Utc};

use crate::error::AppError;

/// Today's date in UTC. Split out so tests pass a fixed date instead.
pub fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

/// Resolves a date expression to an absolute date.
///
/// Accepts `now`/`today`, `yesterday`, `N days/weeks/months/years ago`,
/// and absolute `YYYY-MM-DD` values.
pub fn resolve_date(expr: &str, today: NaiveDate) -> Result<NaiveDate, AppError> {
    let expr = expr.trim().to_lowercase();
    match expr.as_str() {
        "now" | "today" => return Ok(today),
        "yesterday" => {
            return today
                .checked_sub_days(Days::new(1))
                .ok_or_else(|| AppError::InvalidDate(expr.clone()))
        }
        _ => {}
    }

    if let Ok(date) = NaiveDate::parse_from_str(&expr, "%Y-%m-%d") {
        return Ok(date);
    }

    let mut parts = expr.split_whitespace();
    let (count, unit, ago) = (parts.next(), parts.next(), parts.next());
    if ago != Some("ago") || parts.next().is_some() {
        return Err(AppError::InvalidDate(expr));
    }
    let count: u64 = count
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| AppError::InvalidDate(expr.clone()))?;

    let resolved = match unit {
        Some("day") | Some("days") => today.checked_sub_days(Days::new(count)),
        Some("week") | Some("weeks") => today.checked_sub_days(Days::new(count * 7)),
        Some("month") | Some("months") => today.checked_sub_months(Months::new(count as u32)),
        Some("year") | Some("years") => today.checked_sub_months(Months::new(count as u32 * 12)),
        _ => None,
    };
    resolved.ok_or(AppError::InvalidDate(expr))
}

/// Window covered by a `last_3d` / `last_7d` / `last_30d` preset.
pub fn preset_window(preset: &str, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let days = match preset {
        "last_3d" => 3,
        "last_7d" => 7,
        "last_30d" => 30,
        _ => return None,
    };
    let since = today.checked_sub_days(Days::new(days))?;
    Some((since, today))
}

/// Every calendar day in `[since, until]`, inclusive.
pub fn day_span(since: NaiveDate, until: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut current = since;
    while current <= until {
        days.push(current);
        match current.checked_add_days(Days::new(1)) {
            Some(next) => current = next,
            None => break,
        }
    }
    days
}

/// Extracts a `date_preset=last_Nd` preset from a raw parameter string.
pub fn preset_from_parameters(parameters: &str) -> Option<&str> {
    parameters
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| k.trim() == "date_preset")
        .map(|(_, v)| v.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn resolves_relative_expressions() {
        let today = date("2024-06-15");
        assert_eq!(resolve_date("now", today).unwrap(), today);
        assert_eq!(resolve_date("today", today).unwrap(), today);
        assert_eq!(resolve_date("yesterday", today).unwrap(), date("2024-06-14"));
        assert_eq!(
            resolve_date("90 days ago", today).unwrap(),
            date("2024-03-17")
        );
        assert_eq!(
            resolve_date("2 weeks ago", today).unwrap(),
            date("2024-06-01")
        );
        assert_eq!(
            resolve_date("3 months ago", today).unwrap(),
            date("2024-03-15")
        );
    }

    #[test]
    fn resolves_absolute_dates() {
        let today = date("2024-06-15");
        assert_eq!(
            resolve_date("2023-01-31", today).unwrap(),
            date("2023-01-31")
        );
    }

    #[test]
    fn rejects_garbage() {
        let today = date("2024-06-15");
        assert!(resolve_date("sometime soon", today).is_err());
        assert!(resolve_date("days ago", today).is_err());
    }

    #[test]
    fn preset_windows_span_their_days() {
        let today = date("2024-06-15");
        let (since, until) = preset_window("last_7d", today).unwrap();
        assert_eq!(since, date("2024-06-08"));
        assert_eq!(until, today);
        assert!(preset_window("lifetime", today).is_none());
    }

    #[test]
    fn day_span_is_inclusive() {
        let days = day_span(date("2024-06-14"), date("2024-06-16"));
        assert_eq!(
            days,
            vec![date("2024-06-14"), date("2024-06-15"), date("2024-06-16")]
        );
        assert_eq!(day_span(date("2024-06-14"), date("2024-06-14")).len(), 1);
    }

    #[test]
    fn extracts_date_preset_parameter() {
        assert_eq!(
            preset_from_parameters("level=ad&date_preset=last_30d&breakdowns=country"),
            Some("last_30d")
        );
        assert_eq!(preset_from_parameters("level=ad"), None);
    }
}
