// src/api/pagination.rs
//! Pagination controller: drives repeated page fetches for one query.
//!
//! The sequence is finite and strictly sequential; each page depends on
//! the previous page's `paging.next` link, and is never restarted.
//! Continuation is decided after every page by [`continuation`], and the
//! limit-backoff signal from the transport rewrites the current page's
//! `limit` before re-issuing the same page.

use chrono::Utc;
use serde_json::Value;
use url::Url;

use super::transport::{SendOutcome, Transport};
use crate::config::QueryRow;
use crate::constants::RECENT_SINCE_THRESHOLD_SECS;
use crate::error::{mask_access_tokens, AppError};
use crate::policy::ExtractionPolicy;

/// Continuation knobs for one pagination sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaginationPolicy {
    /// Stop after a page whose data array is empty, even with a next link.
    pub stop_on_empty_response: bool,
    /// Refuse a next link that narrows the requested time window.
    pub time_based_pagination: bool,
}

impl PaginationPolicy {
    pub fn for_query(row: &QueryRow) -> Self {
        Self {
            stop_on_empty_response: row.stop_on_empty_response,
            time_based_pagination: row.time_based_pagination,
        }
    }
}

/// Transient state for one pagination sequence.
#[derive(Debug)]
struct PageContext {
    limit: u32,
    backoff_retries: u32,
}

/// Where the next fetch goes.
enum Target {
    First,
    Next(String),
}

/// What to do after inspecting a page.
#[derive(Debug, PartialEq, Eq)]
pub enum NextVerdict {
    Follow(String),
    Stop,
}

/// Fetches all pages for a logical query, returning each page body.
///
/// `base_params` excludes `limit`, which this controller owns so it can
/// shrink it under backoff.
pub async fn paginate(
    transport: &Transport<'_>,
    path: &str,
    base_params: &[(String, String)],
    initial_limit: u32,
    policy: &ExtractionPolicy,
    pagination: &PaginationPolicy,
) -> Result<Vec<Value>, AppError> {
    let mut pages = Vec::new();
    let mut ctx = PageContext {
        limit: initial_limit.max(policy.limit_floor),
        backoff_retries: 0,
    };
    let mut target = Target::First;

    loop {
        let Some(page) = fetch_page(transport, path, base_params, &target, &mut ctx, policy).await?
        else {
            // The whole page was a known ignorable error; nothing follows it.
            break;
        };

        let verdict = continuation(&page, pagination, Utc::now().timestamp());
        pages.push(page);
        ctx.backoff_retries = 0;

        match verdict {
            NextVerdict::Stop => break,
            NextVerdict::Follow(url) => target = Target::Next(url),
        }
    }

    Ok(pages)
}

/// Fetches one page, re-issuing it with a halved limit on backoff signals.
async fn fetch_page(
    transport: &Transport<'_>,
    path: &str,
    base_params: &[(String, String)],
    target: &Target,
    ctx: &mut PageContext,
    policy: &ExtractionPolicy,
) -> Result<Option<Value>, AppError> {
    loop {
        let outcome = match target {
            Target::First => {
                let mut params = base_params.to_vec();
                params.push(("limit".to_string(), ctx.limit.to_string()));
                transport.get(path, &params).await?
            }
            Target::Next(url) => transport.get_url(&rewrite_limit(url, ctx.limit)).await?,
        };

        match outcome {
            SendOutcome::Payload(value) => return Ok(Some(value)),
            SendOutcome::Skipped(reason) => {
                log::warn!("Skipping page: {reason}");
                return Ok(None);
            }
            SendOutcome::Backoff => {
                ctx.backoff_retries += 1;
                if ctx.backoff_retries > policy.max_limit_retries {
                    return Err(AppError::BackoffExhausted {
                        context: mask_access_tokens(path),
                        retries: ctx.backoff_retries - 1,
                    });
                }
                let halved = (ctx.limit / 2).max(policy.limit_floor);
                log::warn!(
                    "Limit backoff: shrinking page limit {} -> {} and retrying in {:?}",
                    ctx.limit,
                    halved,
                    policy.limit_backoff_delay
                );
                ctx.limit = halved;
                tokio::time::sleep(policy.limit_backoff_delay).await;
            }
        }
    }
}

/// Decides whether to follow the page's next link.
///
/// Rules, in order: the empty-page stop, the time-window stop, then the
/// timestamp sanity checks the API's own pagination URLs require (a
/// `since` at the present means historical data is exhausted; a future
/// `until` is dropped rather than followed verbatim).
pub fn continuation(page: &Value, policy: &PaginationPolicy, now_ts: i64) -> NextVerdict {
    let data_len = page.get("data").and_then(Value::as_array).map(Vec::len);
    if policy.stop_on_empty_response && data_len == Some(0) {
        return NextVerdict::Stop;
    }

    let Some(next) = page
        .pointer("/paging/next")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    else {
        return NextVerdict::Stop;
    };

    let Ok(mut url) = Url::parse(next) else {
        log::warn!("Unparseable next link: {}", mask_access_tokens(next));
        return NextVerdict::Stop;
    };

    let since = query_param(&url, "since");
    let until = query_param(&url, "until");

    if policy.time_based_pagination && (since.is_some() || until.is_some()) {
        // The API silently narrowed the requested window; following would
        // corrupt the incremental range.
        return NextVerdict::Stop;
    }

    let since_ts = since.as_deref().and_then(parse_unix_ts);
    let until_ts = until.as_deref().and_then(parse_unix_ts);
    let recent_cutoff = now_ts - RECENT_SINCE_THRESHOLD_SECS;

    if let Some(since_ts) = since_ts {
        if until_ts.is_none() && since_ts > recent_cutoff {
            return NextVerdict::Stop;
        }
    }
    if let Some(until_ts) = until_ts {
        if until_ts > now_ts {
            match since_ts {
                Some(since_ts) if since_ts > recent_cutoff => return NextVerdict::Stop,
                _ => {
                    // Window still has history behind it; just trim the
                    // future end rather than asking for data from tomorrow.
                    remove_query_param(&mut url, "until");
                }
            }
        }
    }

    NextVerdict::Follow(url.to_string())
}

/// Rewrites the `limit` parameter of a next link to the controller's
/// current (possibly shrunken) limit.
fn rewrite_limit(next_url: &str, limit: u32) -> String {
    let Ok(mut url) = Url::parse(next_url) else {
        return next_url.to_string();
    };
    remove_query_param(&mut url, "limit");
    url.query_pairs_mut().append_pair("limit", &limit.to_string());
    url.to_string()
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

fn remove_query_param(url: &mut Url, name: &str) {
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != name)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut().clear();
    for (k, v) in &remaining {
        url.query_pairs_mut().append_pair(k, v);
    }
    if remaining.is_empty() {
        url.set_query(None);
    }
}

/// A 10-digit unix timestamp, or nothing.
fn parse_unix_ts(value: &str) -> Option<i64> {
    if value.len() == 10 && value.bytes().all(|b| b.is_ascii_digit()) {
        value.parse().ok()
    } else {
        None
    }
}
