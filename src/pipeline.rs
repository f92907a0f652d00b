// src/pipeline.rs
//! Run orchestration: query fan-out, row accumulation, and output.
//!
//! One worker task per enabled query, bounded by a run-wide slot count.
//! Calls sharing a token serialize further down in the dispatcher, so the
//! fan-out here never self-inflicts rate limiting. Every worker produces
//! an independent `TableSet`; the sets merge into one run-wide set whose
//! schemas are only frozen once all rows are known.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::api::pagination::{paginate, PaginationPolicy};
use crate::api::transport::{SendOutcome, Transport};
use crate::api::{GraphApi, GraphHttpClient, QueryDispatcher, TokenCache};
use crate::config::{Account, QueryRow, RunAction, RunConfig};
use crate::error::AppError;
use crate::flatten::{FinalTable, FlattenContext, Row, TableSet};
use crate::output::{self, OutputReport};
use crate::policy::ExtractionPolicy;

/// What a run produced, for logging and exit status.
#[derive(Debug)]
pub struct RunSummary {
    pub tables_written: usize,
    pub rows_written: usize,
    /// Queries that failed while `fail_on_error` was off.
    pub failed_queries: Vec<String>,
    pub output: OutputReport,
}

/// Full extraction run against the live endpoint.
pub async fn run(config: &RunConfig) -> Result<RunSummary, AppError> {
    let api = GraphHttpClient::new(&config.configuration.api_version)?;
    run_with_api(config, Arc::new(api)).await
}

/// Run entry with an injected API implementation. Tests pass mocks here.
pub async fn run_with_api(
    config: &RunConfig,
    api: Arc<dyn GraphApi>,
) -> Result<RunSummary, AppError> {
    let policy = Arc::new(ExtractionPolicy::default());
    let tokens = Arc::new(TokenCache::new(config.user_token.clone()));
    let accounts: Arc<Vec<Account>> = Arc::new(
        config
            .configuration
            .accounts
            .values()
            .cloned()
            .collect(),
    );

    let queries: Vec<QueryRow> = config.configuration.enabled_queries().cloned().collect();
    log::info!(
        "Starting extraction: {} queries over {} accounts",
        queries.len(),
        accounts.len()
    );

    // Network-bound workers; a handful is plenty before the remote
    // rate limits dominate.
    let workers = config
        .concurrency
        .unwrap_or_else(|| num_cpus::get().clamp(2, 8))
        .clamp(1, 16);
    let slots = Arc::new(Semaphore::new(workers));

    let mut join_set = JoinSet::new();
    for row in queries {
        let api = Arc::clone(&api);
        let tokens = Arc::clone(&tokens);
        let policy = Arc::clone(&policy);
        let accounts = Arc::clone(&accounts);
        let slots = Arc::clone(&slots);

        join_set.spawn(async move {
            let _slot = slots.acquire_owned().await.expect("slot pool never closes");
            let outcome = execute_query(api.as_ref(), &tokens, &policy, &row, &accounts).await;
            (row.name.clone(), outcome)
        });
    }

    let mut all_rows = TableSet::new();
    let mut failed_queries = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        let (name, outcome) =
            joined.map_err(|e| AppError::Internal(format!("query worker panicked: {e}")))?;
        match outcome {
            Ok(set) => all_rows.merge(set),
            Err(e) if config.configuration.fail_on_error => {
                log::error!("Query '{name}' failed: {e}");
                return Err(e);
            }
            Err(e) => {
                log::error!("Query '{name}' failed, continuing: {e}");
                failed_queries.push(name);
            }
        }
    }

    let mut tables = vec![accounts_table(&accounts, &policy)];
    tables.extend(all_rows.into_final_tables(&policy));

    let rows_written: usize = tables.iter().map(|t| t.rows.len()).sum();
    let tables_written = tables.len();
    let plan = output::plan_tables(&config.output_dir, &tables);
    let report = output::deliver(plan)?;

    log::info!(
        "Extraction finished: {} tables, {} rows, {} failed queries",
        tables_written,
        rows_written,
        failed_queries.len()
    );
    Ok(RunSummary {
        tables_written,
        rows_written,
        failed_queries,
        output: report,
    })
}

/// One query: dispatch, then flatten every fetched body.
async fn execute_query(
    api: &dyn GraphApi,
    tokens: &TokenCache,
    policy: &ExtractionPolicy,
    row: &QueryRow,
    accounts: &[Account],
) -> Result<TableSet, AppError> {
    log::info!("Processing query '{}'", row.name);
    let dispatcher = QueryDispatcher::new(api, tokens, policy);
    let records = dispatcher.execute(row, accounts).await?;

    let mut set = TableSet::new();
    for record in &records {
        let ctx = FlattenContext::new(row, &record.source.account_id, policy);
        set.merge(ctx.flatten(&record.body, &record.source.graph_node));
    }
    log::debug!("Query '{}' produced {} bodies", row.name, records.len());
    Ok(set)
}

/// The configured accounts as their own table, written full-load with a
/// plain `id` key.
fn accounts_table(accounts: &[Account], policy: &ExtractionPolicy) -> FinalTable {
    let mut rows = Vec::new();
    for account in accounts {
        let mut row = Row::new();
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(v) = value {
                row.insert(key.to_string(), v);
            }
        };
        put("account_id", account.account_id.clone().map(Value::from));
        put("id", Some(Value::from(account.id.clone())));
        if !account.name.is_empty() {
            put("name", Some(Value::from(account.name.clone())));
        }
        put(
            "business_name",
            account.business_name.clone().map(Value::from),
        );
        put("currency", account.currency.clone().map(Value::from));
        put("category", account.category.clone().map(Value::from));
        put(
            "category_list",
            account
                .category_list
                .as_ref()
                .map(|list| Value::from(json!(list).to_string())),
        );
        put(
            "tasks",
            account
                .tasks
                .as_ref()
                .map(|tasks| Value::from(json!(tasks).to_string())),
        );
        put("fb_page_id", account.fb_page_id.clone().map(Value::from));
        rows.push(row);
    }

    let mut union: Vec<String> = Vec::new();
    for row in &rows {
        for key in row.keys() {
            if !union.iter().any(|c| c == key) {
                union.push(key.clone());
            }
        }
    }
    FinalTable {
        name: "accounts".to_string(),
        columns: policy.order_columns(&union),
        primary_key: vec!["id".to_string()],
        incremental: false,
        rows,
    }
}

// ---------------------------------------------------------------------
// Sync actions
// ---------------------------------------------------------------------

/// Executes the configured sync action and returns its JSON result.
pub async fn sync_action(config: &RunConfig) -> Result<Value, AppError> {
    let api = GraphHttpClient::new(&config.configuration.api_version)?;
    sync_action_with_api(config, &api).await
}

pub async fn sync_action_with_api(
    config: &RunConfig,
    api: &dyn GraphApi,
) -> Result<Value, AppError> {
    let policy = ExtractionPolicy::default();
    let tokens = TokenCache::new(config.user_token.clone());
    match config.action {
        RunAction::Accounts => {
            list_entities(
                api,
                &policy,
                &tokens,
                "me/accounts",
                "id,business_name,name,category",
            )
            .await
        }
        RunAction::Adaccounts => {
            list_entities(
                api,
                &policy,
                &tokens,
                "me/adaccounts",
                "account_id,id,business_name,name,currency",
            )
            .await
        }
        RunAction::Igaccounts => instagram_accounts(api, &policy, &tokens).await,
        RunAction::DebugToken => debug_token(api, &policy, config).await,
        RunAction::Run => Err(AppError::Internal(
            "run action is not a sync action".to_string(),
        )),
    }
}

/// Lists every entity from a paged listing endpoint.
async fn list_entities(
    api: &dyn GraphApi,
    policy: &ExtractionPolicy,
    tokens: &TokenCache,
    path: &str,
    fields: &str,
) -> Result<Value, AppError> {
    let params = vec![
        ("fields".to_string(), fields.to_string()),
        tokens.user().param(),
    ];
    let transport = Transport::new(api, policy);
    let pagination = PaginationPolicy {
        stop_on_empty_response: false,
        time_based_pagination: false,
    };
    let pages = paginate(
        &transport,
        path,
        &params,
        policy.default_page_limit,
        policy,
        &pagination,
    )
    .await?;

    let mut entities = Vec::new();
    for page in pages {
        if let Some(data) = page.get("data").and_then(Value::as_array) {
            entities.extend(data.iter().cloned());
        }
    }
    Ok(Value::Array(entities))
}

/// Instagram business accounts linked to managed pages, reshaped so the
/// IG account ID leads and the owning page becomes `fb_page_id`.
async fn instagram_accounts(
    api: &dyn GraphApi,
    policy: &ExtractionPolicy,
    tokens: &TokenCache,
) -> Result<Value, AppError> {
    let pages = list_entities(
        api,
        policy,
        tokens,
        "me/accounts",
        "instagram_business_account,name,category",
    )
    .await?;

    let mut accounts = Vec::new();
    if let Some(entries) = pages.as_array() {
        for entry in entries {
            let Some(ig_id) = entry
                .pointer("/instagram_business_account/id")
                .and_then(Value::as_str)
            else {
                continue;
            };
            accounts.push(json!({
                "id": ig_id,
                "fb_page_id": entry.get("id").cloned().unwrap_or(Value::Null),
                "name": entry.get("name").cloned().unwrap_or(Value::Null),
                "category": entry.get("category").cloned().unwrap_or(Value::Null),
            }));
        }
    }
    Ok(Value::Array(accounts))
}

/// Token introspection. The issuing app ID is stripped from the result
/// before it is surfaced.
async fn debug_token(
    api: &dyn GraphApi,
    policy: &ExtractionPolicy,
    config: &RunConfig,
) -> Result<Value, AppError> {
    let (Some(app_id), Some(app_secret)) = (config.app_id.as_deref(), config.app_secret.as_deref())
    else {
        return Err(AppError::MissingConfiguration(
            "token introspection needs GRAPH_APP_ID and GRAPH_APP_SECRET".to_string(),
        ));
    };

    let params = vec![
        (
            "input_token".to_string(),
            config.user_token.as_str().to_string(),
        ),
        (
            "access_token".to_string(),
            format!("{app_id}|{app_secret}"),
        ),
    ];
    let transport = Transport::new(api, policy);
    let mut payload = match transport.get("debug_token", &params).await? {
        SendOutcome::Payload(value) => value,
        SendOutcome::Skipped(reason) => {
            return Err(AppError::MalformedResponse(format!(
                "token introspection skipped: {reason}"
            )))
        }
        SendOutcome::Backoff => {
            return Err(AppError::BackoffExhausted {
                context: "debug_token".to_string(),
                retries: 0,
            })
        }
    };

    if let Some(data) = payload.get_mut("data").and_then(Value::as_object_mut) {
        data.remove("app_id");
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn account(id: &str) -> Account {
        Account::bare(id)
    }

    #[test]
    fn accounts_table_is_full_load_keyed_on_id() {
        let policy = ExtractionPolicy::default();
        let mut a = account("page_1");
        a.name = "Main".to_string();
        a.currency = Some("EUR".to_string());
        let table = accounts_table(&[a, account("page_2")], &policy);

        assert_eq!(table.name, "accounts");
        assert_eq!(table.primary_key, vec!["id"]);
        assert!(!table.incremental);
        assert_eq!(table.rows.len(), 2);
        assert!(table.columns.contains(&"currency".to_string()));
        // The bare account contributes no currency cell
        assert_eq!(table.rows[1].get("currency"), None);
    }

    #[test]
    fn accounts_table_serializes_list_metadata() {
        let policy = ExtractionPolicy::default();
        let mut a = account("page_1");
        a.tasks = Some(vec!["ANALYZE".to_string(), "ADVERTISE".to_string()]);
        let table = accounts_table(&[a], &policy);

        let tasks = table.rows[0].get("tasks").unwrap().as_str().unwrap();
        assert_eq!(tasks, r#"["ANALYZE","ADVERTISE"]"#);
    }
}
