// src/api/transport.rs
//! Rate/limit-aware transport: one logical request, classified.
//!
//! Wraps a single [`GraphApi`] call and sorts the reply into
//! success / backoff-signal / skipped / fatal. Transient (5xx) errors are
//! retried here with a small ceiling; the limit-halving backoff is the
//! caller's job because only the caller owns the page limit.

use serde_json::Value;

use super::{GraphApi, HttpReply};
use crate::constants::ERROR_BODY_PREVIEW_LENGTH;
use crate::error::{mask_access_tokens, AppError, GraphErrorKind};
use crate::error_recovery::retry_with_backoff;
use crate::policy::ExtractionPolicy;

/// What became of one logical request.
#[derive(Debug)]
pub enum SendOutcome {
    /// Parsed JSON payload.
    Payload(Value),
    /// Rate/size-limit signal: halve the limit, wait, re-issue.
    Backoff,
    /// A known ignorable error; the item yields no data and is dropped.
    Skipped(String),
}

/// A classified view of the JSON error envelope.
#[derive(Debug)]
pub struct RemoteError {
    pub kind: GraphErrorKind,
    pub message: String,
}

/// Extracts `code`, `error_subcode`, and the combined message text from a
/// graph error object (`{"message": ..., "code": ..., ...}`).
pub fn classify_error_object(error: &Value, status: u16) -> RemoteError {
    let code = error.get("code").and_then(Value::as_i64);
    let subcode = error.get("error_subcode").and_then(Value::as_i64);
    let mut message = String::new();
    for field in ["message", "error_user_title", "error_user_msg"] {
        if let Some(text) = error.get(field).and_then(Value::as_str) {
            if !message.is_empty() {
                message.push(' ');
            }
            message.push_str(text);
        }
    }
    let lowered = message.to_lowercase();
    RemoteError {
        kind: GraphErrorKind::classify(status, code, subcode, &lowered),
        message: mask_access_tokens(&message),
    }
}

/// Classifies a raw reply into an outcome or an error.
///
/// Transient classifications come back as errors so the retry wrapper can
/// re-issue them; everything fatal is an error too.
pub fn evaluate_reply(reply: &HttpReply) -> Result<SendOutcome, AppError> {
    if reply.is_success() {
        let value: Value = serde_json::from_str(&reply.body).map_err(|e| {
            AppError::MalformedResponse(format!(
                "{e}: {}",
                mask_access_tokens(preview(&reply.body))
            ))
        })?;
        return Ok(SendOutcome::Payload(value));
    }

    let envelope: Value = serde_json::from_str(&reply.body).unwrap_or(Value::Null);
    let remote = match envelope.get("error") {
        Some(error) => classify_error_object(error, reply.status),
        None => RemoteError {
            kind: GraphErrorKind::classify(reply.status, None, None, &reply.body.to_lowercase()),
            message: mask_access_tokens(preview(&reply.body)).to_string(),
        },
    };

    match remote.kind {
        GraphErrorKind::RateLimited | GraphErrorKind::ReduceData => Ok(SendOutcome::Backoff),
        GraphErrorKind::IgnorableItem => Ok(SendOutcome::Skipped(remote.message)),
        kind => Err(AppError::graph_service(kind, reply.status, &remote.message)),
    }
}

fn preview(body: &str) -> &str {
    match body.char_indices().nth(ERROR_BODY_PREVIEW_LENGTH) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Classified transport over a [`GraphApi`].
pub struct Transport<'a> {
    api: &'a dyn GraphApi,
    policy: &'a ExtractionPolicy,
}

impl<'a> Transport<'a> {
    pub fn new(api: &'a dyn GraphApi, policy: &'a ExtractionPolicy) -> Self {
        Self { api, policy }
    }

    pub async fn get(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<SendOutcome, AppError> {
        self.with_transient_retry(|| async { evaluate_reply(&self.api.get(path, params).await?) })
            .await
    }

    pub async fn get_url(&self, url: &str) -> Result<SendOutcome, AppError> {
        self.with_transient_retry(|| async { evaluate_reply(&self.api.get_url(url).await?) })
            .await
    }

    pub async fn post(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<SendOutcome, AppError> {
        self.with_transient_retry(|| async { evaluate_reply(&self.api.post(path, params).await?) })
            .await
    }

    async fn with_transient_retry<F, Fut>(&self, operation: F) -> Result<SendOutcome, AppError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<SendOutcome, AppError>>,
    {
        retry_with_backoff(
            operation,
            self.policy.max_transient_retries.max(1),
            self.policy.transient_retry_delay,
            self.policy.transient_retry_delay * 4,
        )
        .await
    }
}
