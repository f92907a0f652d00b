// src/api/client.rs
//! Thin reqwest wrapper implementing [`GraphApi`].
//!
//! Handles URL construction and request/response I/O without any
//! classification or business logic. Every logged URL passes through
//! token masking first.

use reqwest::Client;
use serde_json::Value;

use super::{GraphApi, HttpReply};
use crate::constants::GRAPH_API_BASE_URL;
use crate::error::{mask_access_tokens, AppError};

/// HTTP client bound to one API version of the graph endpoint.
#[derive(Clone)]
pub struct GraphHttpClient {
    client: Client,
    base_url: String,
    api_version: String,
}

impl GraphHttpClient {
    pub fn new(api_version: &str) -> Result<Self, AppError> {
        Self::with_base_url(GRAPH_API_BASE_URL, api_version)
    }

    /// Used by tests to point the client at a local server.
    pub fn with_base_url(base_url: &str, api_version: &str) -> Result<Self, AppError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_version: api_version.to_string(),
        })
    }

    fn versioned_url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            format!("{}/{}/", self.base_url, self.api_version)
        } else {
            format!("{}/{}/{}", self.base_url, self.api_version, path)
        }
    }

    async fn into_reply(response: reqwest::Response) -> Result<HttpReply, AppError> {
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpReply { status, body })
    }
}

#[async_trait::async_trait]
impl GraphApi for GraphHttpClient {
    async fn get(&self, path: &str, params: &[(String, String)]) -> Result<HttpReply, AppError> {
        let url = self.versioned_url(path);
        log::debug!("GET {}", mask_access_tokens(&url));
        let response = self.client.get(&url).query(params).send().await?;
        Self::into_reply(response).await
    }

    async fn get_url(&self, url: &str) -> Result<HttpReply, AppError> {
        log::debug!("GET {}", mask_access_tokens(url));
        let response = self.client.get(url).send().await?;
        Self::into_reply(response).await
    }

    async fn post(&self, path: &str, params: &[(String, String)]) -> Result<HttpReply, AppError> {
        let url = self.versioned_url(path);
        log::debug!("POST {}", mask_access_tokens(&url));
        // The job-start endpoint takes its parameters as a JSON body.
        let body: serde_json::Map<String, Value> = params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let response = self.client.post(&url).json(&body).send().await?;
        Self::into_reply(response).await
    }
}
