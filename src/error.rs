// src/error.rs
//! Application error types with structured error handling.
//!
//! Error types form the vocabulary for failure modes in the system.
//! The remote service reports everything as HTTP errors with a JSON body;
//! [`GraphErrorKind`] classifies those into the retry/drop/fail taxonomy
//! the protocol components act on, while [`AppError`] is the surface the
//! rest of the crate propagates.
//!
//! Token values never survive into error text: every message that could
//! carry a query string or payload passes through [`mask_access_tokens`].

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::constants::TOKEN_PLACEHOLDER;

static QUERY_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"access_token=[^&\s]+").expect("static regex"));
static JSON_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""access_token"\s*:\s*"[^"]+""#).expect("static regex"));

/// Replaces access token values with a fixed placeholder.
///
/// Applied to every log line and error message that may embed a request
/// URL, query string, or response payload.
pub fn mask_access_tokens(text: &str) -> String {
    let masked = QUERY_TOKEN_RE.replace_all(text, format!("access_token={TOKEN_PLACEHOLDER}"));
    JSON_TOKEN_RE
        .replace_all(&masked, format!(r#""access_token": "{TOKEN_PLACEHOLDER}""#))
        .into_owned()
}

/// Classification of a remote error into the retry taxonomy.
///
/// Instead of matching magic message strings at every call site, the
/// classification happens once and the components dispatch on this enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// "User request limit reached": halve the page limit, wait, retry.
    RateLimited,
    /// "Please reduce the amount of data": same backoff treatment.
    ReduceData,
    /// Server-side 5xx, retried as-is with a small ceiling.
    Transient,
    /// Known per-item errors that are dropped rather than retried
    /// (business-conversion media, 30-day window, vanished objects).
    IgnorableItem,
    /// Authentication or authorization failure, never retried.
    AuthFailure,
    /// Malformed query: bad field, bad path, bad parameter.
    BadQuery,
    /// Anything the classifier does not recognize.
    Unknown,
}

impl GraphErrorKind {
    /// Classifies a remote error from its HTTP status and parsed body parts.
    ///
    /// `code`/`subcode` come from the JSON error envelope when present;
    /// `message` is the lowercased concatenation of the error message
    /// fields, since the remote service spreads detail across several.
    pub fn classify(status: u16, code: Option<i64>, subcode: Option<i64>, message: &str) -> Self {
        if Self::is_ignorable_item(code, subcode, message) {
            return Self::IgnorableItem;
        }
        if message.contains("reduce the amount of data") {
            return Self::ReduceData;
        }
        if message.contains("request limit reached") {
            return Self::RateLimited;
        }
        if status >= 500 {
            return Self::Transient;
        }
        if status == 401 || code == Some(190) || message.contains("access token") {
            return Self::AuthFailure;
        }
        if status == 400 {
            return Self::BadQuery;
        }
        Self::Unknown
    }

    /// Per-item errors that yield empty data instead of failing the query.
    fn is_ignorable_item(code: Option<i64>, subcode: Option<i64>, message: &str) -> bool {
        // Media posted before business-account conversion (100/2108006).
        if code == Some(100) && subcode == Some(2108006) {
            return true;
        }
        // Object deleted or inaccessible (100/33).
        if code == Some(100) && subcode == Some(33) {
            return true;
        }
        message.contains("media posted before business account conversion")
            || message.contains("there cannot be more than 30 days")
            || message.contains("does not exist, cannot be loaded due to missing permissions")
    }

    /// Whether the request may be re-issued (with or without backoff).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::ReduceData | Self::Transient)
    }

    /// Whether the caller should halve the page limit before retrying.
    pub fn wants_limit_backoff(&self) -> bool {
        matches!(self, Self::RateLimited | Self::ReduceData)
    }
}

impl fmt::Display for GraphErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate_limited"),
            Self::ReduceData => write!(f, "reduce_data"),
            Self::Transient => write!(f, "transient"),
            Self::IgnorableItem => write!(f, "ignorable_item"),
            Self::AuthFailure => write!(f, "auth_failure"),
            Self::BadQuery => write!(f, "bad_query"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Main application error type.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Missing configuration: {0}")]
    MissingConfiguration(String),

    #[error("Failed to parse configuration file {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Network failure: {0}")]
    NetworkFailure(#[from] reqwest::Error),

    #[error("Graph API error ({kind}, HTTP {status}): {message}")]
    GraphService {
        kind: GraphErrorKind,
        status: u16,
        message: String,
    },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Async insights job {report_run_id} ended with status {status}")]
    AsyncJobFailed {
        report_run_id: String,
        status: String,
    },

    #[error("Async insights job {report_run_id} did not complete within {polls} polls")]
    AsyncJobTimeout { report_run_id: String, polls: u32 },

    #[error("Rate-limit backoff exhausted after {retries} retries for {context}")]
    BackoffExhausted { context: String, retries: u32 },

    #[error("Invalid date expression: {0}")]
    InvalidDate(String),

    #[error("Invalid query '{query}': {reason}")]
    InvalidQuery { query: String, reason: String },

    #[error("Filesystem IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Builds a service error with the message already masked.
    pub fn graph_service(kind: GraphErrorKind, status: u16, message: &str) -> Self {
        Self::GraphService {
            kind,
            status,
            message: mask_access_tokens(message),
        }
    }

    /// The classification of this error, when it came from the remote API.
    pub fn graph_kind(&self) -> Option<&GraphErrorKind> {
        match self {
            Self::GraphService { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::MalformedResponse(err.to_string())
    }
}

/// Result type alias for convenience
pub type Result<T, E = AppError> = std::result::Result<T, E>;
