// src/api/dispatcher.rs
//! Query dispatcher: turns one configured query into graph API traffic.
//!
//! Decides batched vs. per-ID execution, resolves the credential for each
//! target, fans out day-split sub-requests, and composes the transport,
//! pagination controller, and async job poller into a flat sequence of
//! `(source metadata, raw body)` records for the flattener.

use chrono::NaiveDate;
use serde_json::Value;

use super::async_job::{fetch_result_pages, poll_to_completion, start_job};
use super::pagination::{paginate, PaginationPolicy};
use super::tokens::{ResolvedToken, TokenCache};
use super::transport::{classify_error_object, SendOutcome, Transport};
use super::GraphApi;
use crate::config::{Account, QueryRow, QueryType};
use crate::dates::{self, today_utc};
use crate::error::AppError;
use crate::insights::parse_insights_fields;
use crate::policy::ExtractionPolicy;

/// Where a fetched body came from, for flattening and table naming.
#[derive(Debug, Clone)]
pub struct SourceMeta {
    /// The configured account the data belongs to.
    pub account_id: String,
    /// Dotted hierarchy position of the response root.
    pub graph_node: String,
}

/// One raw response body with its provenance.
#[derive(Debug)]
pub struct FetchedRecord {
    pub source: SourceMeta,
    pub body: Value,
}

/// Metrics only the Instagram insights surface serves; their presence
/// marks a query subject to the API's hard window cap.
const IG_INSIGHTS_METRICS: &[&str] = &["follower_count", "reach", "impressions", "profile_views"];

/// The API rejects Instagram insights windows longer than this many days.
const MAX_IG_INSIGHTS_WINDOW_DAYS: i64 = 30;

/// A single extraction target: the configured account plus the ID the
/// requests are addressed to (`fb_page_id` when set, else the account ID).
#[derive(Debug, Clone)]
struct Target {
    account: Account,
    request_id: String,
}

impl Target {
    fn from_account(account: &Account) -> Self {
        let request_id = account
            .fb_page_id
            .clone()
            .unwrap_or_else(|| account.id.clone());
        Self {
            account: account.clone(),
            request_id,
        }
    }
}

pub struct QueryDispatcher<'a> {
    api: &'a dyn GraphApi,
    tokens: &'a TokenCache,
    policy: &'a ExtractionPolicy,
    today: NaiveDate,
}

impl<'a> QueryDispatcher<'a> {
    pub fn new(api: &'a dyn GraphApi, tokens: &'a TokenCache, policy: &'a ExtractionPolicy) -> Self {
        Self::with_today(api, tokens, policy, today_utc())
    }

    /// Pins "today" for deterministic date resolution in tests.
    pub fn with_today(
        api: &'a dyn GraphApi,
        tokens: &'a TokenCache,
        policy: &'a ExtractionPolicy,
        today: NaiveDate,
    ) -> Self {
        Self {
            api,
            tokens,
            policy,
            today,
        }
    }

    /// Executes one query against its resolved targets.
    pub async fn execute(
        &self,
        row: &QueryRow,
        accounts: &[Account],
    ) -> Result<Vec<FetchedRecord>, AppError> {
        let targets = self.resolve_targets(row, accounts);
        if targets.is_empty() {
            log::warn!("Query '{}' resolved no target IDs", row.name);
            return Ok(Vec::new());
        }

        match row.query_type {
            QueryType::AsyncInsights => self.execute_async(row, &targets).await,
            QueryType::Nested if row.is_batchable() && targets.len() > 1 => {
                self.execute_batch(row, &targets).await
            }
            QueryType::Nested => self.execute_per_id(row, &targets).await,
        }
    }

    /// Explicit IDs when configured, else every configured account.
    /// Explicit IDs keep their configured account entry when one exists so
    /// token resolution still sees `fb_page_id`.
    fn resolve_targets(&self, row: &QueryRow, accounts: &[Account]) -> Vec<Target> {
        match row.query.explicit_ids() {
            Some(ids) => ids
                .into_iter()
                .map(|id| {
                    accounts
                        .iter()
                        .find(|a| a.id == id)
                        .map(Target::from_account)
                        .unwrap_or_else(|| Target::from_account(&Account::bare(id)))
                })
                .collect(),
            None => accounts.iter().map(Target::from_account).collect(),
        }
    }

    // -----------------------------------------------------------------
    // Batched execution
    // -----------------------------------------------------------------

    /// One multi-ID call; per-ID errors are isolated and retried
    /// individually with that ID's own token.
    async fn execute_batch(
        &self,
        row: &QueryRow,
        targets: &[Target],
    ) -> Result<Vec<FetchedRecord>, AppError> {
        let ids: Vec<&str> = targets.iter().map(|t| t.request_id.as_str()).collect();
        log::info!(
            "Batch fetching '{}' for {} IDs in one call",
            row.name,
            ids.len()
        );

        let mut params = vec![("ids".to_string(), ids.join(","))];
        if !row.query.fields.trim().is_empty() {
            params.push(("fields".to_string(), row.query.fields.clone()));
        }
        params.push(self.tokens.user().param());

        let transport = Transport::new(self.api, self.policy);
        let payload = match transport.get("", &params).await {
            Ok(SendOutcome::Payload(value)) => value,
            Ok(SendOutcome::Skipped(reason)) => {
                log::warn!("Batch call for '{}' skipped: {reason}", row.name);
                return Ok(Vec::new());
            }
            Ok(SendOutcome::Backoff) => {
                // A multi-ID call has no page limit to shrink; split it.
                log::warn!(
                    "Batch call for '{}' hit a limit, splitting into per-ID requests",
                    row.name
                );
                return self.execute_per_id(row, targets).await;
            }
            Err(e) if e.to_string().to_lowercase().contains("page access token") => {
                log::info!("Batch call requires page tokens, falling back to per-ID requests");
                return self.execute_per_id(row, targets).await;
            }
            Err(e) => return Err(e),
        };

        let Value::Object(entries) = payload else {
            return Err(AppError::MalformedResponse(
                "multi-ID response was not an object keyed by ID".to_string(),
            ));
        };

        let graph_node = graph_node_for(row, false);
        let mut records = Vec::new();
        let mut retry: Vec<Target> = Vec::new();
        for target in targets {
            let Some(entry) = entries.get(&target.request_id) else {
                continue;
            };
            if let Some(error) = entry.get("error") {
                let remote = classify_error_object(error, 400);
                log::warn!(
                    "Batch entry for {} failed ({}): {}; retrying individually",
                    target.request_id,
                    remote.kind,
                    remote.message
                );
                retry.push(target.clone());
                continue;
            }
            records.push(FetchedRecord {
                source: SourceMeta {
                    account_id: target.account.id.clone(),
                    graph_node: graph_node.clone(),
                },
                body: entry.clone(),
            });
        }

        if !retry.is_empty() {
            records.extend(self.execute_per_id(row, &retry).await?);
        }
        Ok(records)
    }

    // -----------------------------------------------------------------
    // Per-ID execution
    // -----------------------------------------------------------------

    async fn execute_per_id(
        &self,
        row: &QueryRow,
        targets: &[Target],
    ) -> Result<Vec<FetchedRecord>, AppError> {
        let needs_page_token = self.policy.requires_page_token(row);
        let graph_node = graph_node_for(row, needs_page_token);
        let mut records = Vec::new();

        for target in targets {
            let token = if needs_page_token {
                self.tokens
                    .resolve_page_token(self.api, self.policy, &target.account)
                    .await
            } else {
                self.tokens.user()
            };

            // Calls sharing a rate-limit bucket run one at a time.
            let gate = self.tokens.gate(&token.token);
            let _permit = gate.acquire().await.expect("gate is never closed");

            for window in self.sub_windows(row)? {
                let pages = self.fetch_sequence(row, target, &token, window).await?;
                records.extend(pages.into_iter().map(|body| FetchedRecord {
                    source: SourceMeta {
                        account_id: target.account.id.clone(),
                        graph_node: graph_node.clone(),
                    },
                    body,
                }));
            }
        }
        Ok(records)
    }

    /// One pagination sequence for one target and one time window.
    async fn fetch_sequence(
        &self,
        row: &QueryRow,
        target: &Target,
        token: &ResolvedToken,
        window: Option<NaiveDate>,
    ) -> Result<Vec<Value>, AppError> {
        let (path, mut params) = self.build_request(row, &target.request_id, window)?;
        params.push(token.param());

        let transport = Transport::new(self.api, self.policy);
        let pagination = PaginationPolicy::for_query(row);
        let limit = row
            .query
            .limit
            .unwrap_or(self.policy.default_page_limit);

        paginate(&transport, &path, &params, limit, self.policy, &pagination).await
    }

    /// Endpoint path and parameters for one request, before token and limit.
    fn build_request(
        &self,
        row: &QueryRow,
        request_id: &str,
        window: Option<NaiveDate>,
    ) -> Result<(String, Vec<(String, String)>), AppError> {
        let query = &row.query;
        let mut params: Vec<(String, String)> = Vec::new();

        let path = if query.path.trim().is_empty() && query.is_insights_fields() {
            // The insights DSL routes to the dedicated endpoint with its
            // clauses as parameters instead of a fields selection.
            params.extend(parse_insights_fields(&query.fields, self.today)?);
            format!("{request_id}/insights")
        } else {
            if !query.fields.trim().is_empty() {
                params.push(("fields".to_string(), query.fields.clone()));
            }
            if query.path.trim().is_empty() {
                request_id.to_string()
            } else {
                format!("{request_id}/{}", query.path.trim())
            }
        };

        if !query.since.trim().is_empty() {
            let since = dates::resolve_date(&query.since, self.today)?;
            upsert_param(&mut params, "since", &since.format("%Y-%m-%d").to_string());
        }
        if !query.until.trim().is_empty() {
            let until = dates::resolve_date(&query.until, self.today)?;
            upsert_param(&mut params, "until", &until.format("%Y-%m-%d").to_string());
        }

        if let Some(raw) = query.parameters.as_deref() {
            for (k, v) in raw
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.trim(), v.trim()))
            {
                upsert_param(&mut params, k, v);
            }
        }

        // A day window overrides whatever range the query configured.
        if let Some(day) = window {
            let day = day.format("%Y-%m-%d").to_string();
            upsert_param(&mut params, "since", &day);
            upsert_param(&mut params, "until", &day);
        }

        if query.path.trim().is_empty() && query.is_insights_fields() {
            self.check_ig_insights_window(row, &params)?;
        }

        Ok((path, params))
    }

    /// Instagram insights requests are capped at a 30 day window; failing
    /// before the request beats the API's unhelpful 400 reply.
    fn check_ig_insights_window(
        &self,
        row: &QueryRow,
        params: &[(String, String)],
    ) -> Result<(), AppError> {
        let fields = &row.query.fields;
        if !IG_INSIGHTS_METRICS.iter().any(|m| fields.contains(m)) {
            return Ok(());
        }
        let date_of = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k == key)
                .and_then(|(_, v)| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
        };
        // Unparseable or absent dates are the API's problem.
        let Some(since) = date_of("since") else {
            return Ok(());
        };
        let until = date_of("until").unwrap_or(self.today);
        let span = (until - since).num_days();
        if span > MAX_IG_INSIGHTS_WINDOW_DAYS {
            return Err(AppError::InvalidQuery {
                query: row.name.clone(),
                reason: format!(
                    "Instagram insights queries cannot exceed {MAX_IG_INSIGHTS_WINDOW_DAYS} \
                     days; this one spans {span} days ({since} to {until}). \
                     Reduce the date range to {MAX_IG_INSIGHTS_WINDOW_DAYS} days or less"
                ),
            });
        }
        Ok(())
    }

    /// The day fan-out: `None` means "one request with the configured
    /// window"; `Some(day)` pins both ends of the window to that day.
    fn sub_windows(&self, row: &QueryRow) -> Result<Vec<Option<NaiveDate>>, AppError> {
        if !row.split_time_range_by_day {
            return Ok(vec![None]);
        }
        let Some((since, until)) = self.query_window(row)? else {
            return Ok(vec![None]);
        };
        if since >= until {
            return Ok(vec![None]);
        }
        Ok(dates::day_span(since, until).into_iter().map(Some).collect())
    }

    /// The query's overall time window, from `since`/`until` or a
    /// `date_preset` parameter.
    fn query_window(&self, row: &QueryRow) -> Result<Option<(NaiveDate, NaiveDate)>, AppError> {
        let query = &row.query;
        if !query.since.trim().is_empty() {
            let since = dates::resolve_date(&query.since, self.today)?;
            let until = if query.until.trim().is_empty() {
                self.today
            } else {
                dates::resolve_date(&query.until, self.today)?
            };
            return Ok(Some((since, until)));
        }
        if let Some(preset) = query
            .parameters
            .as_deref()
            .and_then(dates::preset_from_parameters)
        {
            return Ok(dates::preset_window(preset, self.today));
        }
        Ok(None)
    }

    // -----------------------------------------------------------------
    // Async insights execution
    // -----------------------------------------------------------------

    /// Starts every job first, then polls each to completion and fetches
    /// its result set. Jobs always run with the user token against the
    /// ad-account ID.
    async fn execute_async(
        &self,
        row: &QueryRow,
        targets: &[Target],
    ) -> Result<Vec<FetchedRecord>, AppError> {
        let token = self.tokens.user();
        let token_params = vec![token.param()];
        let transport = Transport::new(self.api, self.policy);
        let graph_node = graph_node_for(row, false);

        let gate = self.tokens.gate(&token.token);

        let mut started = Vec::new();
        {
            // Hold the gate for the start burst only; polling is light and
            // must not block other queries sharing the user token.
            let _permit = gate.acquire().await.expect("gate is never closed");
            for target in targets {
                for window in self.sub_windows(row)? {
                    let mut params = self.async_start_params(row, window);
                    params.push(token.param());
                    match start_job(&transport, &target.request_id, &params).await {
                        Ok(Some(job)) => started.push((target.clone(), job)),
                        Ok(None) => {}
                        Err(e) => {
                            log::error!(
                                "Failed to start async job for {}: {e}",
                                target.request_id
                            );
                            return Err(e);
                        }
                    }
                }
            }
        }

        let limit = row.query.limit.unwrap_or(self.policy.default_page_limit);
        let pagination = PaginationPolicy::for_query(row);
        let mut records = Vec::new();
        for (target, mut job) in started {
            poll_to_completion(&transport, &mut job, &token_params, self.policy).await?;
            let pages = fetch_result_pages(
                &transport,
                &job,
                &token_params,
                limit,
                self.policy,
                &pagination,
            )
            .await?;
            records.extend(pages.into_iter().map(|body| FetchedRecord {
                source: SourceMeta {
                    account_id: target.account.id.clone(),
                    graph_node: graph_node.clone(),
                },
                body,
            }));
        }
        Ok(records)
    }

    fn async_start_params(&self, row: &QueryRow, window: Option<NaiveDate>) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = row
            .query
            .parameters
            .as_deref()
            .map(|raw| {
                raw.split('&')
                    .filter_map(|pair| pair.split_once('='))
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                    .collect()
            })
            .unwrap_or_default();

        if let Some(day) = window {
            let day = day.format("%Y-%m-%d").to_string();
            params.retain(|(k, _)| k != "date_preset" && k != "time_range");
            params.push((
                "time_range".to_string(),
                format!(r#"{{"since":"{day}","until":"{day}"}}"#),
            ));
        }
        params
    }
}

/// Dotted hierarchy position of a query's response root.
///
/// Everything starts at `page`; async insights and DSL insights queries
/// land in `page_insights`; a configured path becomes the first nesting
/// level.
pub fn graph_node_for(row: &QueryRow, is_page_token: bool) -> String {
    if row.query_type == QueryType::AsyncInsights {
        return "page_insights".to_string();
    }
    let query = &row.query;
    if query.path.trim().is_empty() {
        if is_page_token && query.fields.contains("insights") {
            return "page_insights".to_string();
        }
        return "page".to_string();
    }
    format!("page_{}", query.path.trim())
}

fn upsert_param(params: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(entry) = params.iter_mut().find(|(k, _)| k == key) {
        entry.1 = value.to_string();
    } else {
        params.push((key.to_string(), value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccessToken, QueryConfig};
    use pretty_assertions::assert_eq;

    fn nested_row(name: &str, query: QueryConfig) -> QueryRow {
        QueryRow {
            id: 1,
            name: name.to_string(),
            query_type: QueryType::Nested,
            run_by_id: false,
            disabled: false,
            split_time_range_by_day: false,
            time_based_pagination: false,
            stop_on_empty_response: false,
            query,
        }
    }

    fn dispatcher_parts() -> (TokenCache, ExtractionPolicy) {
        (
            TokenCache::new(AccessToken::new("USER_TOKEN").unwrap()),
            ExtractionPolicy::default(),
        )
    }

    struct NoApi;

    #[async_trait::async_trait]
    impl GraphApi for NoApi {
        async fn get(
            &self,
            _path: &str,
            _params: &[(String, String)],
        ) -> Result<crate::api::HttpReply, AppError> {
            unreachable!("pure-function tests never hit the API")
        }
        async fn get_url(&self, _url: &str) -> Result<crate::api::HttpReply, AppError> {
            unreachable!()
        }
        async fn post(
            &self,
            _path: &str,
            _params: &[(String, String)],
        ) -> Result<crate::api::HttpReply, AppError> {
            unreachable!()
        }
    }

    fn fixed_today() -> NaiveDate {
        NaiveDate::parse_from_str("2024-06-15", "%Y-%m-%d").unwrap()
    }

    #[test]
    fn insights_dsl_routes_to_insights_endpoint() {
        let (tokens, policy) = dispatcher_parts();
        let api = NoApi;
        let dispatcher = QueryDispatcher::with_today(&api, &tokens, &policy, fixed_today());
        let row = nested_row(
            "page",
            QueryConfig {
                fields: "insights.metric(page_fans).period(day)".to_string(),
                ..Default::default()
            },
        );

        let (path, params) = dispatcher.build_request(&row, "123", None).unwrap();
        assert_eq!(path, "123/insights");
        assert!(params.contains(&("metric".to_string(), "page_fans".to_string())));
        assert!(params.contains(&("period".to_string(), "day".to_string())));
    }

    #[test]
    fn plain_fields_stay_a_fields_parameter() {
        let (tokens, policy) = dispatcher_parts();
        let api = NoApi;
        let dispatcher = QueryDispatcher::with_today(&api, &tokens, &policy, fixed_today());
        let row = nested_row(
            "feed",
            QueryConfig {
                path: "feed".to_string(),
                fields: "message,created_time".to_string(),
                since: "7 days ago".to_string(),
                ..Default::default()
            },
        );

        let (path, params) = dispatcher.build_request(&row, "123", None).unwrap();
        assert_eq!(path, "123/feed");
        assert!(params.contains(&("fields".to_string(), "message,created_time".to_string())));
        assert!(params.contains(&("since".to_string(), "2024-06-08".to_string())));
    }

    #[test]
    fn day_window_overrides_configured_range() {
        let (tokens, policy) = dispatcher_parts();
        let api = NoApi;
        let dispatcher = QueryDispatcher::with_today(&api, &tokens, &policy, fixed_today());
        let row = nested_row(
            "feed",
            QueryConfig {
                path: "feed".to_string(),
                since: "2024-06-01".to_string(),
                until: "2024-06-10".to_string(),
                ..Default::default()
            },
        );
        let day = NaiveDate::parse_from_str("2024-06-03", "%Y-%m-%d").unwrap();

        let (_, params) = dispatcher.build_request(&row, "123", Some(day)).unwrap();
        assert!(params.contains(&("since".to_string(), "2024-06-03".to_string())));
        assert!(params.contains(&("until".to_string(), "2024-06-03".to_string())));
    }

    #[test]
    fn day_split_fans_out_one_window_per_day() {
        let (tokens, policy) = dispatcher_parts();
        let api = NoApi;
        let dispatcher = QueryDispatcher::with_today(&api, &tokens, &policy, fixed_today());
        let mut row = nested_row(
            "feed",
            QueryConfig {
                path: "feed".to_string(),
                since: "2024-06-10".to_string(),
                until: "2024-06-12".to_string(),
                ..Default::default()
            },
        );
        row.split_time_range_by_day = true;

        let windows = dispatcher.sub_windows(&row).unwrap();
        assert_eq!(windows.len(), 3);
        assert!(windows.iter().all(Option::is_some));

        row.split_time_range_by_day = false;
        assert_eq!(dispatcher.sub_windows(&row).unwrap(), vec![None]);
    }

    #[test]
    fn preset_parameters_produce_a_window() {
        let (tokens, policy) = dispatcher_parts();
        let api = NoApi;
        let dispatcher = QueryDispatcher::with_today(&api, &tokens, &policy, fixed_today());
        let mut row = nested_row(
            "ads",
            QueryConfig {
                parameters: Some("level=ad&date_preset=last_3d".to_string()),
                ..Default::default()
            },
        );
        row.split_time_range_by_day = true;

        let windows = dispatcher.sub_windows(&row).unwrap();
        assert_eq!(windows.len(), 4); // 3 days back through today, inclusive
    }

    #[test]
    fn instagram_insights_window_is_capped() {
        let (tokens, policy) = dispatcher_parts();
        let api = NoApi;
        let dispatcher = QueryDispatcher::with_today(&api, &tokens, &policy, fixed_today());
        let row = nested_row(
            "ig",
            QueryConfig {
                fields: "insights.metric(follower_count).period(day)".to_string(),
                since: "2024-01-01".to_string(),
                until: "2024-06-10".to_string(),
                ..Default::default()
            },
        );

        let err = dispatcher.build_request(&row, "ig_1", None).unwrap_err();
        match err {
            AppError::InvalidQuery { query, reason } => {
                assert_eq!(query, "ig");
                assert!(reason.contains("cannot exceed 30 days"));
            }
            other => panic!("expected an invalid-query error, got {other:?}"),
        }

        // Within the cap the request goes through.
        let row = nested_row(
            "ig",
            QueryConfig {
                fields: "insights.metric(follower_count).period(day)".to_string(),
                since: "2024-06-01".to_string(),
                until: "2024-06-10".to_string(),
                ..Default::default()
            },
        );
        assert!(dispatcher.build_request(&row, "ig_1", None).is_ok());

        // Page metrics have no such cap.
        let row = nested_row(
            "page",
            QueryConfig {
                fields: "insights.metric(page_fans).period(day)".to_string(),
                since: "2024-01-01".to_string(),
                until: "2024-06-10".to_string(),
                ..Default::default()
            },
        );
        assert!(dispatcher.build_request(&row, "123", None).is_ok());
    }

    #[test]
    fn graph_node_reflects_path_and_insights() {
        let plain = nested_row("q", QueryConfig::default());
        assert_eq!(graph_node_for(&plain, false), "page");

        let feed = nested_row(
            "q",
            QueryConfig {
                path: "feed".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(graph_node_for(&feed, true), "page_feed");

        let insights = nested_row(
            "q",
            QueryConfig {
                fields: "insights.metric(page_fans)".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(graph_node_for(&insights, true), "page_insights");

        let mut ads = nested_row("q", QueryConfig::default());
        ads.query_type = QueryType::AsyncInsights;
        assert_eq!(graph_node_for(&ads, false), "page_insights");
    }
}
