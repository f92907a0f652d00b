//! Batched multi-ID dispatch: per-ID errors inside a batch response are
//! isolated and retried individually instead of failing the whole call.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use graph2table::api::{GraphApi, HttpReply, QueryDispatcher, TokenCache};
use graph2table::config::{AccessToken, Account, QueryConfig, QueryRow, QueryType};
use graph2table::error::AppError;
use graph2table::policy::ExtractionPolicy;

/// Serves one multi-ID batch where ID 2 fails with an ignorable error,
/// then serves ID 2 individually.
struct BatchServer {
    calls: Mutex<Vec<String>>,
}

impl BatchServer {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl GraphApi for BatchServer {
    async fn get(&self, path: &str, params: &[(String, String)]) -> Result<HttpReply, AppError> {
        self.calls.lock().push(path.to_string());
        let body = match path {
            "" => {
                let ids = params
                    .iter()
                    .find(|(k, _)| k == "ids")
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default();
                assert_eq!(ids, "1,2,3");
                json!({
                    "1": {"id": "1", "name": "Page One"},
                    "2": {"error": {
                        "code": 100,
                        "error_subcode": 2108006,
                        "message": "Media posted before business account conversion"
                    }},
                    "3": {"id": "3", "name": "Page Three"}
                })
            }
            "2" => json!({"id": "2", "name": "Page Two"}),
            other => panic!("unexpected path {other}"),
        };
        Ok(HttpReply {
            status: 200,
            body: body.to_string(),
        })
    }

    async fn get_url(&self, _url: &str) -> Result<HttpReply, AppError> {
        panic!("no pagination expected")
    }

    async fn post(&self, _path: &str, _params: &[(String, String)]) -> Result<HttpReply, AppError> {
        panic!("no job start expected")
    }
}

fn batchable_query() -> QueryRow {
    QueryRow {
        id: 1,
        name: "pages".to_string(),
        query_type: QueryType::Nested,
        run_by_id: false,
        disabled: false,
        split_time_range_by_day: false,
        time_based_pagination: false,
        stop_on_empty_response: false,
        query: QueryConfig {
            fields: "name".to_string(),
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn failed_batch_entry_is_retried_individually() {
    let server = BatchServer::new();
    let tokens = TokenCache::new(AccessToken::new("USER").unwrap());
    let policy = ExtractionPolicy::default();
    let dispatcher = QueryDispatcher::new(&server, &tokens, &policy);

    let accounts = vec![Account::bare("1"), Account::bare("2"), Account::bare("3")];
    let records = dispatcher
        .execute(&batchable_query(), &accounts)
        .await
        .unwrap();

    // IDs 1 and 3 from the batch, ID 2 from the individual retry.
    assert_eq!(records.len(), 3);
    let mut ids: Vec<&str> = records
        .iter()
        .filter_map(|r| r.body.get("id").and_then(|v| v.as_str()))
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["1", "2", "3"]);

    let calls = server.calls.lock().clone();
    assert_eq!(calls, vec!["", "2"]);
}

#[tokio::test]
async fn explicit_ids_override_configured_accounts() {
    let server = BatchServer::new();
    let tokens = TokenCache::new(AccessToken::new("USER").unwrap());
    let policy = ExtractionPolicy::default();
    let dispatcher = QueryDispatcher::new(&server, &tokens, &policy);

    let mut row = batchable_query();
    row.query.ids = "1,2,3".to_string();
    // Configured accounts are ignored when explicit IDs are set.
    let accounts = vec![Account::bare("other")];
    let records = dispatcher.execute(&row, &accounts).await.unwrap();
    assert_eq!(records.len(), 3);
}
