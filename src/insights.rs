// src/insights.rs
//! Parser for the insights mini-language embedded in `fields` strings.
//!
//! A pathless insights query selects its metrics through a compact DSL:
//!
//! ```text
//! insights.metric(page_fans,page_views_total).period(day).since(90 days ago)
//! ```
//!
//! Each `.clause(args)` becomes a request parameter. `since`/`until`
//! arguments are date expressions resolved to `YYYY-MM-DD`; clauses the
//! parser does not recognize pass through verbatim so future DSL additions
//! keep working without a code change here.

use chrono::NaiveDate;

use crate::dates::resolve_date;
use crate::error::AppError;

/// One `.name(args)` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub name: String,
    pub args: String,
}

/// Parses an insights `fields` string into request parameters.
pub fn parse_insights_fields(
    fields: &str,
    today: NaiveDate,
) -> Result<Vec<(String, String)>, AppError> {
    let mut params = Vec::new();
    for clause in scan_clauses(fields)? {
        let value = match clause.name.as_str() {
            "metric" => clause
                .args
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .collect::<Vec<_>>()
                .join(","),
            "since" | "until" => resolve_date(&clause.args, today)?
                .format("%Y-%m-%d")
                .to_string(),
            // Forward-compatible: unknown clauses become parameters as-is.
            _ => clause.args.trim().to_string(),
        };
        if !value.is_empty() {
            params.push((clause.name, value));
        }
    }
    Ok(params)
}

/// Splits `insights.a(x).b(y)` into its clauses.
///
/// The leading `insights` token carries no arguments and is skipped.
/// Clause arguments run to the matching close paren, so metric lists
/// containing commas or spaces survive intact.
fn scan_clauses(fields: &str) -> Result<Vec<Clause>, AppError> {
    let trimmed = fields.trim();
    let rest = trimmed.strip_prefix("insights").ok_or_else(|| {
        AppError::InvalidQuery {
            query: trimmed.chars().take(60).collect(),
            reason: "insights DSL must start with 'insights'".to_string(),
        }
    })?;

    let mut clauses = Vec::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            continue;
        }
        if c != '.' {
            return Err(AppError::InvalidQuery {
                query: trimmed.chars().take(60).collect(),
                reason: format!("expected '.' before clause, found '{c}'"),
            });
        }
        let mut name = String::new();
        for c in chars.by_ref() {
            if c == '(' {
                break;
            }
            name.push(c);
        }
        let mut args = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == ')' {
                closed = true;
                break;
            }
            args.push(c);
        }
        if name.is_empty() || !closed {
            return Err(AppError::InvalidQuery {
                query: trimmed.chars().take(60).collect(),
                reason: format!("unterminated clause '{name}'"),
            });
        }
        clauses.push(Clause {
            name: name.trim().to_string(),
            args,
        });
    }
    Ok(clauses)
}
