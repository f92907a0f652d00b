// src/api/mod.rs
//! Graph API interaction: transport, token resolution, pagination,
//! async job control, and query dispatch.
//!
//! The seam between protocol logic and HTTP lives in [`GraphApi`]:
//! every component above the wire depends on this trait, never on
//! reqwest details, so the state machines are testable against mocks.

pub mod async_job;
pub mod client;
pub mod dispatcher;
pub mod pagination;
pub mod tokens;
pub mod transport;

use crate::error::AppError;

/// A raw HTTP exchange result, before any classification.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The ability to exchange requests with the versioned graph endpoint.
///
/// `path` is relative to the versioned root (`me/accounts`, `{id}/feed`);
/// `get_url` takes the absolute `paging.next` URLs the API hands back.
#[async_trait::async_trait]
pub trait GraphApi: Send + Sync {
    async fn get(&self, path: &str, params: &[(String, String)]) -> Result<HttpReply, AppError>;
    async fn get_url(&self, url: &str) -> Result<HttpReply, AppError>;
    async fn post(&self, path: &str, params: &[(String, String)]) -> Result<HttpReply, AppError>;
}

pub use client::GraphHttpClient;
pub use dispatcher::{FetchedRecord, QueryDispatcher, SourceMeta};
pub use tokens::{ResolvedToken, TokenCache, TokenSource};
