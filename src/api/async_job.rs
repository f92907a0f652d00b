// src/api/async_job.rs
//! Async insights job control: start, poll to completion, fetch results.
//!
//! Aggregated ad insights are not answered synchronously; the API hands
//! back a `report_run_id` whose status must be polled until the job
//! reaches a terminal state, after which the result set is fetched like
//! any other paginated collection.

use serde_json::Value;

use super::pagination::{paginate, PaginationPolicy};
use super::transport::{SendOutcome, Transport};
use crate::error::AppError;
use crate::policy::ExtractionPolicy;

/// Remote job status as reported by `async_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl JobStatus {
    fn parse(status: &str) -> Self {
        match status {
            "Job Completed" => Self::Completed,
            "Job Failed" => Self::Failed,
            "Job Skipped" => Self::Skipped,
            _ => Self::Running,
        }
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Skipped)
    }
}

/// One started aggregation job.
#[derive(Debug)]
pub struct AsyncJob {
    pub report_run_id: String,
    pub percent_complete: u8,
    pub poll_count: u32,
    pub status: JobStatus,
}

/// Prefixes an ad-account ID with `act_` unless it already carries it.
pub fn ad_account_path(account_id: &str) -> String {
    if account_id.starts_with("act_") {
        account_id.to_string()
    } else {
        format!("act_{account_id}")
    }
}

/// Starts an insights job for one ad account.
///
/// Returns `None` when the API accepted the call but produced no
/// `report_run_id`: there is nothing to poll, the query yields no data.
pub async fn start_job(
    transport: &Transport<'_>,
    account_id: &str,
    params: &[(String, String)],
) -> Result<Option<AsyncJob>, AppError> {
    let path = format!("{}/insights", ad_account_path(account_id));
    log::info!("Starting async insights job: {path}");

    let value = match transport.post(&path, params).await? {
        SendOutcome::Payload(value) => value,
        SendOutcome::Skipped(reason) => {
            log::warn!("Async job start skipped for {account_id}: {reason}");
            return Ok(None);
        }
        SendOutcome::Backoff => {
            // Job starts are cheap; a throttled start is surfaced rather
            // than juggling a limit that does not exist on a POST.
            return Err(AppError::BackoffExhausted {
                context: path,
                retries: 0,
            });
        }
    };

    let Some(report_run_id) = value.get("report_run_id").and_then(Value::as_str) else {
        log::warn!("No report_run_id in async insights response for {account_id}");
        return Ok(None);
    };

    log::info!("Async job started with report ID {report_run_id}");
    Ok(Some(AsyncJob {
        report_run_id: report_run_id.to_string(),
        percent_complete: 0,
        poll_count: 0,
        status: JobStatus::Running,
    }))
}

/// Polls the job until it completes, fails, or exhausts the poll cap.
pub async fn poll_to_completion(
    transport: &Transport<'_>,
    job: &mut AsyncJob,
    token_params: &[(String, String)],
    policy: &ExtractionPolicy,
) -> Result<(), AppError> {
    loop {
        job.poll_count += 1;

        let value = match transport.get(&job.report_run_id, token_params).await? {
            SendOutcome::Payload(value) => value,
            SendOutcome::Skipped(reason) => {
                return Err(AppError::AsyncJobFailed {
                    report_run_id: job.report_run_id.clone(),
                    status: reason,
                })
            }
            SendOutcome::Backoff => Value::Null,
        };

        if let Some(status) = value.get("async_status").and_then(Value::as_str) {
            job.status = JobStatus::parse(status);
            job.percent_complete = value
                .get("async_percent_completion")
                .and_then(Value::as_u64)
                .unwrap_or(0)
                .min(100) as u8;

            log::info!(
                "Async job {}: {}% complete, status: {status}",
                job.report_run_id,
                job.percent_complete
            );

            if job.status == JobStatus::Completed && job.percent_complete == 100 {
                return Ok(());
            }
            if job.status.is_terminal_failure() {
                return Err(AppError::AsyncJobFailed {
                    report_run_id: job.report_run_id.clone(),
                    status: status.to_string(),
                });
            }
        }

        if job.poll_count >= policy.max_poll_attempts {
            return Err(AppError::AsyncJobTimeout {
                report_run_id: job.report_run_id.clone(),
                polls: job.poll_count,
            });
        }
        tokio::time::sleep(policy.poll_interval).await;
    }
}

/// Fetches the completed job's result set, paginating as needed.
pub async fn fetch_result_pages(
    transport: &Transport<'_>,
    job: &AsyncJob,
    token_params: &[(String, String)],
    limit: u32,
    policy: &ExtractionPolicy,
    pagination: &PaginationPolicy,
) -> Result<Vec<Value>, AppError> {
    let path = format!("{}/insights", job.report_run_id);
    paginate(transport, &path, token_params, limit, policy, pagination).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{GraphApi, HttpReply};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn ad_account_prefix_is_added_once() {
        assert_eq!(ad_account_path("123"), "act_123");
        assert_eq!(ad_account_path("act_123"), "act_123");
    }

    /// Serves a scripted sequence of poll replies.
    struct PollServer {
        replies: Vec<&'static str>,
        cursor: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl GraphApi for PollServer {
        async fn get(
            &self,
            _path: &str,
            _params: &[(String, String)],
        ) -> Result<HttpReply, AppError> {
            let i = self.cursor.fetch_add(1, Ordering::SeqCst);
            let body = self.replies[i.min(self.replies.len() - 1)];
            Ok(HttpReply {
                status: 200,
                body: body.to_string(),
            })
        }

        async fn get_url(&self, _url: &str) -> Result<HttpReply, AppError> {
            unreachable!("not used in this test")
        }

        async fn post(
            &self,
            _path: &str,
            _params: &[(String, String)],
        ) -> Result<HttpReply, AppError> {
            Ok(HttpReply {
                status: 200,
                body: r#"{"report_run_id": "rr_1"}"#.to_string(),
            })
        }
    }

    fn fast_policy() -> ExtractionPolicy {
        ExtractionPolicy {
            poll_interval: Duration::from_millis(1),
            ..ExtractionPolicy::default()
        }
    }

    #[tokio::test]
    async fn polls_until_completed() {
        let api = PollServer {
            replies: vec![
                r#"{"async_status": "Job Running", "async_percent_completion": 0}"#,
                r#"{"async_status": "Job Running", "async_percent_completion": 50}"#,
                r#"{"async_status": "Job Completed", "async_percent_completion": 100}"#,
            ],
            cursor: AtomicUsize::new(0),
        };
        let policy = fast_policy();
        let transport = Transport::new(&api, &policy);

        let mut job = start_job(&transport, "123", &[]).await.unwrap().unwrap();
        assert_eq!(job.report_run_id, "rr_1");

        poll_to_completion(&transport, &mut job, &[], &policy)
            .await
            .unwrap();
        assert_eq!(job.poll_count, 3);
        assert_eq!(job.percent_complete, 100);
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn failed_job_is_fatal() {
        let api = PollServer {
            replies: vec![
                r#"{"async_status": "Job Running", "async_percent_completion": 10}"#,
                r#"{"async_status": "Job Failed", "async_percent_completion": 10}"#,
            ],
            cursor: AtomicUsize::new(0),
        };
        let policy = fast_policy();
        let transport = Transport::new(&api, &policy);

        let mut job = start_job(&transport, "123", &[]).await.unwrap().unwrap();
        let err = poll_to_completion(&transport, &mut job, &[], &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AsyncJobFailed { .. }));
    }

    #[tokio::test]
    async fn poll_cap_times_out() {
        let api = PollServer {
            replies: vec![r#"{"async_status": "Job Running", "async_percent_completion": 99}"#],
            cursor: AtomicUsize::new(0),
        };
        let policy = ExtractionPolicy {
            max_poll_attempts: 4,
            ..fast_policy()
        };
        let transport = Transport::new(&api, &policy);

        let mut job = start_job(&transport, "123", &[]).await.unwrap().unwrap();
        let err = poll_to_completion(&transport, &mut job, &[], &policy)
            .await
            .unwrap_err();
        match err {
            AppError::AsyncJobTimeout { polls, .. } => assert_eq!(polls, 4),
            other => panic!("expected timeout, got {other}"),
        }
    }
}
