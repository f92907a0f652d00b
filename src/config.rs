// src/config.rs
//! Command-line input and the typed extraction configuration.
//!
//! The configuration file is the contract with the scheduler that invokes
//! this tool: a JSON document naming the accounts to extract and the
//! queries to run against them. `RunConfig::resolve` validates CLI input,
//! file contents, and environment credentials into one immutable object
//! that drives the whole run.

use std::fmt;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::constants::DEFAULT_API_VERSION;
use crate::error::AppError;

/// Access token credential. Redacted in Debug and Display so it can never
/// leak through formatting; the raw value is only reachable via `as_str`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Result<Self, AppError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::MissingConfiguration(
                "access token cannot be empty".to_string(),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken(---ACCESS-TOKEN---)")
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "---ACCESS-TOKEN---")
    }
}

/// Which action this invocation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunAction {
    /// Full extraction run: execute all enabled queries, write tables.
    Run,
    /// List pages the token can manage.
    Accounts,
    /// List ad accounts the token can manage.
    Adaccounts,
    /// List Instagram business accounts linked to managed pages.
    Igaccounts,
    /// Introspect the configured token.
    DebugToken,
}

/// Parsed and validated command-line input.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CommandLineInput {
    /// Path to the JSON configuration file
    pub config_file: PathBuf,

    /// Action to perform
    #[arg(long, value_enum, default_value_t = RunAction::Run)]
    pub action: RunAction,

    /// Directory where tables and manifests are written
    #[arg(short = 'o', long, default_value = "out/tables")]
    pub output_dir: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Number of concurrent query workers (default: auto)
    #[arg(long)]
    pub concurrency: Option<usize>,
}

/// One extraction target.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub business_name: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub category_list: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub tasks: Option<Vec<String>>,
    /// Set when the account is an Instagram business account owned by a
    /// Facebook page; page-token lookup goes through this ID.
    #[serde(default)]
    pub fb_page_id: Option<String>,
}

impl Account {
    /// Synthesizes a bare account for an explicitly listed ID that has no
    /// entry in the configured account map.
    pub fn bare(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            account_id: None,
            business_name: None,
            currency: None,
            category: None,
            category_list: None,
            tasks: None,
            fb_page_id: None,
        }
    }
}

/// The kind of execution a query row asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum QueryType {
    #[serde(rename = "nested-query")]
    Nested,
    #[serde(rename = "async-insights-query")]
    AsyncInsights,
}

/// Request-shaping part of a query row.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct QueryConfig {
    /// Endpoint suffix appended to the target ID; may be empty.
    #[serde(default)]
    pub path: String,
    /// Field selection, possibly embedding the insights DSL.
    #[serde(default)]
    pub fields: String,
    /// Explicit comma-separated target IDs; empty means "derive from
    /// configured accounts".
    #[serde(default)]
    pub ids: String,
    /// Page size; falls back to the policy default when absent.
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub since: String,
    #[serde(default)]
    pub until: String,
    /// Raw query-string parameters merged into the request as-is.
    #[serde(default)]
    pub parameters: Option<String>,
}

impl QueryConfig {
    /// Explicit IDs as a trimmed list, or `None` when unset.
    pub fn explicit_ids(&self) -> Option<Vec<String>> {
        let ids: Vec<String> = self
            .ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            None
        } else {
            Some(ids)
        }
    }

    /// Whether the fields string is the insights DSL rather than a plain
    /// field selection.
    pub fn is_insights_fields(&self) -> bool {
        self.fields.trim_start().starts_with("insights")
    }
}

/// A named extraction unit from the configuration file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct QueryRow {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub query_type: QueryType,
    #[serde(rename = "run-by-id", default)]
    pub run_by_id: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(rename = "split-time-range-by-day", default)]
    pub split_time_range_by_day: bool,
    #[serde(rename = "time-based-pagination", default)]
    pub time_based_pagination: bool,
    #[serde(rename = "stop-on-empty-response", default)]
    pub stop_on_empty_response: bool,
    pub query: QueryConfig,
}

impl QueryRow {
    /// Whether multiple target IDs may be merged into one multi-ID call.
    ///
    /// The test is uniform across query types: only an empty path with
    /// per-ID execution disabled is batchable. (Async rows still start
    /// their jobs per account because the start call is target-specific.)
    pub fn is_batchable(&self) -> bool {
        self.query.path.trim().is_empty() && !self.run_by_id
    }
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub accounts: IndexMap<String, Account>,
    #[serde(default)]
    pub queries: Vec<QueryRow>,
    #[serde(rename = "api-version", default = "default_api_version")]
    pub api_version: String,
    /// When true a fatal per-query error aborts the run instead of being
    /// recorded and skipped.
    #[serde(rename = "fail-on-error", default)]
    pub fail_on_error: bool,
}

impl Configuration {
    pub fn from_json(path: &str, raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw).map_err(|source| AppError::ConfigParse {
            path: path.to_string(),
            source,
        })
    }

    pub fn enabled_queries(&self) -> impl Iterator<Item = &QueryRow> {
        self.queries.iter().filter(|q| !q.disabled)
    }
}

/// Resolved run configuration: validated and ready to drive the pipeline.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub configuration: Configuration,
    pub user_token: AccessToken,
    /// App credentials for token introspection; optional because only the
    /// debug-token action needs them.
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    pub action: RunAction,
    pub output_dir: PathBuf,
    pub verbose: bool,
    pub concurrency: Option<usize>,
}

impl RunConfig {
    /// Resolves a complete run configuration from CLI input, the
    /// configuration file, and environment credentials.
    pub fn resolve(cli: CommandLineInput) -> Result<Self, AppError> {
        let path = cli.config_file.display().to_string();
        let raw = std::fs::read_to_string(&cli.config_file).map_err(|e| {
            AppError::MissingConfiguration(format!("cannot read configuration file {path}: {e}"))
        })?;
        let configuration = Configuration::from_json(&path, &raw)?;

        let token_str = std::env::var("GRAPH_ACCESS_TOKEN").map_err(|_| {
            AppError::MissingConfiguration(
                "GRAPH_ACCESS_TOKEN environment variable not set".to_string(),
            )
        })?;
        let user_token = AccessToken::new(token_str)?;

        Ok(Self {
            configuration,
            user_token,
            app_id: std::env::var("GRAPH_APP_ID").ok(),
            app_secret: std::env::var("GRAPH_APP_SECRET").ok(),
            action: cli.action,
            output_dir: cli.output_dir,
            verbose: cli.verbose,
            concurrency: cli.concurrency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"{
        "api-version": "v23.0",
        "accounts": {
            "page_1": {"id": "page_1", "name": "Main Page", "fb_page_id": "fbp_9"},
            "ig_1": {"id": "ig_1", "name": "IG Account"}
        },
        "queries": [
            {
                "id": 1,
                "name": "feed",
                "type": "nested-query",
                "query": {"path": "feed", "fields": "message,comments{id,message}", "limit": 100}
            },
            {
                "id": 2,
                "name": "ads",
                "type": "async-insights-query",
                "run-by-id": true,
                "split-time-range-by-day": true,
                "query": {"parameters": "level=ad&date_preset=last_7d"}
            },
            {
                "id": 3,
                "name": "off",
                "type": "nested-query",
                "disabled": true,
                "query": {}
            }
        ]
    }"#;

    #[test]
    fn parses_full_configuration() {
        let config = Configuration::from_json("sample.json", SAMPLE).unwrap();
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.queries.len(), 3);
        assert_eq!(config.api_version, "v23.0");

        let feed = &config.queries[0];
        assert_eq!(feed.query_type, QueryType::Nested);
        assert_eq!(feed.query.limit, Some(100));
        assert!(!feed.run_by_id);

        let ads = &config.queries[1];
        assert_eq!(ads.query_type, QueryType::AsyncInsights);
        assert!(ads.run_by_id);
        assert!(ads.split_time_range_by_day);
        assert_eq!(
            ads.query.parameters.as_deref(),
            Some("level=ad&date_preset=last_7d")
        );
    }

    #[test]
    fn enabled_queries_skips_disabled() {
        let config = Configuration::from_json("sample.json", SAMPLE).unwrap();
        let names: Vec<&str> = config.enabled_queries().map(|q| q.name.as_str()).collect();
        assert_eq!(names, vec!["feed", "ads"]);
    }

    #[test]
    fn batchable_requires_empty_path_and_no_run_by_id() {
        let config = Configuration::from_json("sample.json", SAMPLE).unwrap();
        assert!(!config.queries[0].is_batchable()); // has a path
        assert!(!config.queries[1].is_batchable()); // run-by-id
        assert!(config.queries[2].is_batchable());
    }

    #[test]
    fn explicit_ids_are_trimmed() {
        let query = QueryConfig {
            ids: " 1, 2 ,,3 ".to_string(),
            ..Default::default()
        };
        assert_eq!(
            query.explicit_ids(),
            Some(vec!["1".to_string(), "2".to_string(), "3".to_string()])
        );
        assert_eq!(QueryConfig::default().explicit_ids(), None);
    }

    #[test]
    fn token_never_appears_in_debug_output() {
        let token = AccessToken::new("EAABverysecret").unwrap();
        assert!(!format!("{token:?}").contains("EAABverysecret"));
        assert!(!format!("{token}").contains("EAABverysecret"));
    }
}
