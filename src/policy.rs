// src/policy.rs
//! Extraction policy: the configurable tables that drive flattening,
//! token resolution, and retry behavior.
//!
//! The authoritative column and trigger lists diverged between historical
//! implementations of this extractor, so they are exposed here as one
//! struct rather than hard-coded at the use sites. Components take an
//! `&ExtractionPolicy`; callers that need different lists build their own.

use std::time::Duration;

use crate::config::{QueryRow, QueryType};
use crate::constants::DEFAULT_PAGE_LIMIT;

/// Column prefix used to order a table's columns: columns named here appear
/// first, in this order; everything else follows alphabetically.
pub const PREFERRED_COLUMNS_ORDER: &[&str] = &[
    "id",
    "ex_account_id",
    "fb_graph_node",
    "parent_id",
    "name",
    "key1",
    "key2",
    "ads_action_name",
    "action_type",
    "action_reaction",
    "value",
    "period",
    "end_time",
    "title",
    "publisher_platform",
];

/// Ordered primary-key candidates. A table's primary key is this list
/// filtered to the columns the table actually has. `parent_id` sits
/// directly after `id` so incremental-load deduplication always keys on
/// the structural parent when the column exists.
pub const PRIMARY_KEY_CANDIDATES: &[&str] = &[
    "id",
    "parent_id",
    "key1",
    "key2",
    "end_time",
    "account_id",
    "campaign_id",
    "date_start",
    "date_stop",
    "ads_action_name",
    "action_type",
    "action_reaction",
    "ad_id",
    "publisher_platform",
    "adset_id",
];

/// Endpoint paths that can only be read with a page-scoped token.
const PAGE_TOKEN_PATHS: &[&str] = &["insights", "feed", "posts", "ratings", "likes", "stories"];

/// Field-selection substrings that force a page-scoped token.
const PAGE_TOKEN_FIELD_TRIGGERS: &[&str] = &["insights", "likes", "from", "username"];

/// Ad performance fields whose values are action-breakdown arrays;
/// each element fans out to its own row in an `_insights` table.
const ACTION_STATS_FIELDS: &[&str] = &[
    "actions",
    "properties",
    "conversion_values",
    "action_values",
    "canvas_component_avg_pct_view",
    "cost_per_10_sec_video_view",
    "cost_per_action_type",
    "cost_per_unique_action_type",
    "unique_actions",
    "video_10_sec_watched_actions",
    "video_15_sec_watched_actions",
    "video_30_sec_watched_actions",
    "video_avg_pct_watched_actions",
    "video_avg_percent_watched_actions",
    "video_avg_sec_watched_actions",
    "video_avg_time_watched_actions",
    "video_complete_watched_actions",
    "video_p100_watched_actions",
    "video_p25_watched_actions",
    "video_p50_watched_actions",
    "video_p75_watched_actions",
    "video_p95_watched_actions",
    "cost_per_conversion",
    "cost_per_outbound_click",
    "website_ctr",
    "website_purchase_roas",
    "purchase_roas",
    "outbound_clicks",
    "conversions",
    "video_play_actions",
    "video_thruplay_watched_actions",
];

/// List-valued metadata fields that are stored as one JSON-text column
/// instead of being flattened into child tables.
const SERIALIZED_LIST_FIELDS: &[&str] = &["issues_info", "frequency_control_specs"];

/// Ad columns copied from the source row onto each action row.
pub const ACTION_COMMON_COLUMNS: &[&str] = &[
    "account_id",
    "ad_id",
    "adset_id",
    "campaign_id",
    "date_start",
    "date_stop",
];

/// Extra columns carried when the query is an action-breakdown query.
pub const ACTION_BREAKDOWN_EXTRA_COLUMNS: &[&str] = &["account_name", "campaign_name"];

/// All policy knobs in one place.
#[derive(Debug, Clone)]
pub struct ExtractionPolicy {
    pub preferred_columns: Vec<String>,
    pub primary_key_candidates: Vec<String>,
    pub page_token_paths: Vec<String>,
    pub page_token_field_triggers: Vec<String>,
    pub action_stats_fields: Vec<String>,
    pub serialized_list_fields: Vec<String>,

    /// Starting page size when the query does not configure one.
    pub default_page_limit: u32,
    /// Limit halving never goes below this.
    pub limit_floor: u32,
    /// Delay before re-issuing a page after a rate/size-limit signal.
    pub limit_backoff_delay: Duration,
    /// How many limit-backoff retries before the error becomes fatal.
    pub max_limit_retries: u32,
    /// How many times a transient (5xx) error is retried as-is.
    pub max_transient_retries: u32,
    /// Delay between transient retries.
    pub transient_retry_delay: Duration,

    /// Interval between async job status polls.
    pub poll_interval: Duration,
    /// Hard cap on status polls before the job times out.
    pub max_poll_attempts: u32,
}

impl Default for ExtractionPolicy {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            preferred_columns: owned(PREFERRED_COLUMNS_ORDER),
            primary_key_candidates: owned(PRIMARY_KEY_CANDIDATES),
            page_token_paths: owned(PAGE_TOKEN_PATHS),
            page_token_field_triggers: owned(PAGE_TOKEN_FIELD_TRIGGERS),
            action_stats_fields: owned(ACTION_STATS_FIELDS),
            serialized_list_fields: owned(SERIALIZED_LIST_FIELDS),
            default_page_limit: DEFAULT_PAGE_LIMIT,
            limit_floor: 1,
            limit_backoff_delay: Duration::from_secs(60),
            max_limit_retries: 5,
            max_transient_retries: 3,
            transient_retry_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: 60,
        }
    }
}

impl ExtractionPolicy {
    /// Whether a query must be issued with a page-scoped token.
    ///
    /// Async insights queries run against ad-account IDs with the user
    /// token; everything else depends on the path and field triggers.
    pub fn requires_page_token(&self, row: &QueryRow) -> bool {
        if row.query_type == QueryType::AsyncInsights {
            return false;
        }
        let path = row.query.path.trim();
        if self.page_token_paths.iter().any(|p| p == path) {
            return true;
        }
        let fields = row.query.fields.as_str();
        self.page_token_field_triggers
            .iter()
            .any(|t| fields.contains(t.as_str()))
    }

    pub fn is_action_stats_field(&self, field: &str) -> bool {
        self.action_stats_fields.iter().any(|f| f == field)
    }

    pub fn is_serialized_list_field(&self, field: &str) -> bool {
        self.serialized_list_fields.iter().any(|f| f == field)
    }

    /// Derives the primary key for a table from its observed column set.
    ///
    /// Candidates are filtered to present columns in candidate order.
    /// `parent_id` is always part of the key when the column exists,
    /// regardless of how the candidate list is customized.
    pub fn primary_key_for<S: AsRef<str>>(&self, columns: &[S]) -> Vec<String> {
        let has = |name: &str| columns.iter().any(|c| c.as_ref() == name);
        let mut key: Vec<String> = self
            .primary_key_candidates
            .iter()
            .filter(|cand| has(cand))
            .cloned()
            .collect();
        if has("parent_id") && !key.iter().any(|k| k == "parent_id") {
            let pos = if key.first().map(String::as_str) == Some("id") {
                1
            } else {
                0
            };
            key.insert(pos, "parent_id".to_string());
        }
        if key.is_empty() && has("id") {
            key.push("id".to_string());
        }
        key
    }

    /// Orders a table's columns: preferred prefix first, rest alphabetical.
    pub fn order_columns<S: AsRef<str>>(&self, columns: &[S]) -> Vec<String> {
        let mut ordered: Vec<String> = self
            .preferred_columns
            .iter()
            .filter(|p| columns.iter().any(|c| c.as_ref() == p.as_str()))
            .cloned()
            .collect();
        let mut rest: Vec<String> = columns
            .iter()
            .map(|c| c.as_ref().to_string())
            .filter(|c| !self.preferred_columns.contains(c))
            .collect();
        rest.sort();
        rest.dedup();
        ordered.extend(rest);
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;
    use pretty_assertions::assert_eq;

    fn row(query_type: QueryType, path: &str, fields: &str) -> QueryRow {
        QueryRow {
            id: 1,
            name: "test".to_string(),
            query_type,
            run_by_id: false,
            disabled: false,
            split_time_range_by_day: false,
            time_based_pagination: false,
            stop_on_empty_response: false,
            query: QueryConfig {
                path: path.to_string(),
                fields: fields.to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn page_token_required_for_feed_path() {
        let policy = ExtractionPolicy::default();
        assert!(policy.requires_page_token(&row(QueryType::Nested, "feed", "message")));
    }

    #[test]
    fn page_token_required_for_insights_fields() {
        let policy = ExtractionPolicy::default();
        assert!(policy.requires_page_token(&row(
            QueryType::Nested,
            "",
            "insights.metric(page_fans)"
        )));
        assert!(policy.requires_page_token(&row(QueryType::Nested, "", "message,from")));
    }

    #[test]
    fn async_insights_never_needs_page_token() {
        let policy = ExtractionPolicy::default();
        assert!(!policy.requires_page_token(&row(QueryType::AsyncInsights, "", "insights")));
    }

    #[test]
    fn plain_query_needs_no_page_token() {
        let policy = ExtractionPolicy::default();
        assert!(!policy.requires_page_token(&row(QueryType::Nested, "", "name,category")));
    }

    #[test]
    fn primary_key_filters_candidates_in_order() {
        let policy = ExtractionPolicy::default();
        let key = policy.primary_key_for(&["end_time", "message", "id", "key1"]);
        assert_eq!(key, vec!["id", "key1", "end_time"]);
    }

    #[test]
    fn primary_key_always_keeps_parent_id() {
        let mut policy = ExtractionPolicy::default();
        // Even if a customized candidate list omits parent_id entirely.
        policy.primary_key_candidates = vec!["id".to_string(), "end_time".to_string()];
        let key = policy.primary_key_for(&["id", "parent_id", "end_time"]);
        assert_eq!(key, vec!["id", "parent_id", "end_time"]);
    }

    #[test]
    fn column_order_is_preferred_prefix_then_alphabetical() {
        let policy = ExtractionPolicy::default();
        let cols = policy.order_columns(&["zeta", "id", "alpha", "parent_id", "name"]);
        assert_eq!(cols, vec!["id", "parent_id", "name", "alpha", "zeta"]);
    }
}
