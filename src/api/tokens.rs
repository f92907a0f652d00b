// src/api/tokens.rs
//! Token resolution and caching for one extraction run.
//!
//! Two credentials exist: the process-wide user token and page-scoped
//! tokens fetched from `me/accounts`. Resolution never fails an
//! extraction outright: the chain cache → details-fallback → user token
//! always produces something, and the provenance travels with the value
//! so callers can log a warning on the last resort.
//!
//! The cache is scoped to the run (owned by the run context), not a
//! process global, and also owns the per-token rate-limit gates.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};

use super::transport::{SendOutcome, Transport};
use super::GraphApi;
use crate::config::{AccessToken, Account};
use crate::error::AppError;
use crate::policy::ExtractionPolicy;

/// Where a resolved token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Query did not need a page token; the user token was used directly.
    User,
    /// Page token from the cached `me/accounts` fetch.
    PageTokenCache,
    /// Page token fetched via `GET /{id}?fields=access_token`.
    PageDetailsFallback,
    /// No page token available; fell back to the user token.
    UserTokenFallback,
}

/// A chosen token plus its provenance.
#[derive(Debug, Clone)]
pub struct ResolvedToken {
    pub token: AccessToken,
    pub source: TokenSource,
}

impl ResolvedToken {
    /// The `access_token` request parameter for this token.
    pub fn param(&self) -> (String, String) {
        ("access_token".to_string(), self.token.as_str().to_string())
    }
}

/// Run-scoped token cache and per-token rate-limit gates.
pub struct TokenCache {
    user_token: AccessToken,
    page_tokens: Mutex<Option<HashMap<String, AccessToken>>>,
    gates: parking_lot::Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl TokenCache {
    pub fn new(user_token: AccessToken) -> Self {
        Self {
            user_token,
            page_tokens: Mutex::new(None),
            gates: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// The user token with direct provenance.
    pub fn user(&self) -> ResolvedToken {
        ResolvedToken {
            token: self.user_token.clone(),
            source: TokenSource::User,
        }
    }

    /// Resolves the page-scoped token for one account.
    ///
    /// Order: cached page token (keyed by `fb_page_id` when set, else the
    /// account ID), then a direct details fetch, then the user token.
    pub async fn resolve_page_token(
        &self,
        api: &dyn GraphApi,
        policy: &ExtractionPolicy,
        account: &Account,
    ) -> ResolvedToken {
        let key = account.fb_page_id.as_deref().unwrap_or(&account.id);

        if let Some(token) = self.cached_page_token(api, key).await {
            return ResolvedToken {
                token,
                source: TokenSource::PageTokenCache,
            };
        }

        match self.fetch_page_details_token(api, policy, &account.id).await {
            Ok(Some(token)) => {
                return ResolvedToken {
                    token,
                    source: TokenSource::PageDetailsFallback,
                }
            }
            Ok(None) => {}
            Err(e) => log::debug!("Page details token fetch failed for {}: {}", account.id, e),
        }

        log::warn!(
            "No page token available for account {}, falling back to the user token",
            account.id
        );
        ResolvedToken {
            token: self.user_token.clone(),
            source: TokenSource::UserTokenFallback,
        }
    }

    async fn cached_page_token(&self, api: &dyn GraphApi, key: &str) -> Option<AccessToken> {
        let mut cache = self.page_tokens.lock().await;
        if cache.is_none() {
            *cache = Some(self.fetch_page_token_map(api).await);
        }
        cache.as_ref().and_then(|map| map.get(key).cloned())
    }

    /// One `me/accounts` call for the whole run; failure means an empty map.
    async fn fetch_page_token_map(&self, api: &dyn GraphApi) -> HashMap<String, AccessToken> {
        let params = vec![
            ("fields".to_string(), "id,access_token".to_string()),
            self.user().param(),
        ];
        let reply = match api.get("me/accounts", &params).await {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("Unable to fetch page tokens: {e}");
                return HashMap::new();
            }
        };
        let value: Value = match serde_json::from_str(&reply.body) {
            Ok(value) if reply.is_success() => value,
            _ => {
                log::warn!("Unable to fetch page tokens: HTTP {}", reply.status);
                return HashMap::new();
            }
        };

        let mut map = HashMap::new();
        if let Some(pages) = value.get("data").and_then(Value::as_array) {
            for page in pages {
                let id = page.get("id").and_then(Value::as_str);
                let token = page.get("access_token").and_then(Value::as_str);
                if let (Some(id), Some(token)) = (id, token) {
                    if let Ok(token) = AccessToken::new(token) {
                        map.insert(id.to_string(), token);
                    }
                }
            }
        }
        log::info!("Cached page tokens for {} pages", map.len());
        map
    }

    async fn fetch_page_details_token(
        &self,
        api: &dyn GraphApi,
        policy: &ExtractionPolicy,
        account_id: &str,
    ) -> Result<Option<AccessToken>, AppError> {
        let transport = Transport::new(api, policy);
        let params = vec![
            ("fields".to_string(), "access_token".to_string()),
            self.user().param(),
        ];
        match transport.get(account_id, &params).await? {
            SendOutcome::Payload(value) => Ok(value
                .get("access_token")
                .and_then(Value::as_str)
                .and_then(|t| AccessToken::new(t).ok())),
            _ => Ok(None),
        }
    }

    /// The serialization gate for a token's rate-limit bucket.
    ///
    /// Calls sharing a token must not run concurrently; each token gets a
    /// single-permit semaphore that callers hold for a request sequence.
    pub fn gate(&self, token: &AccessToken) -> Arc<Semaphore> {
        let mut gates = self.gates.lock();
        gates
            .entry(token.as_str().to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::HttpReply;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Mock API that serves a page-token listing and counts calls.
    struct PageTokenServer {
        me_accounts_calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl GraphApi for PageTokenServer {
        async fn get(
            &self,
            path: &str,
            _params: &[(String, String)],
        ) -> Result<HttpReply, AppError> {
            if path == "me/accounts" {
                self.me_accounts_calls.fetch_add(1, Ordering::SeqCst);
                return Ok(HttpReply {
                    status: 200,
                    body: r#"{"data": [{"id": "fbp_9", "access_token": "PAGE_TOKEN_9"}]}"#
                        .to_string(),
                });
            }
            // Details fallback: no token exposed.
            Ok(HttpReply {
                status: 200,
                body: r#"{"id": "whatever"}"#.to_string(),
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
            unreachable!("not used in this test")
        }
    }

    fn account_with_page(id: &str, fb_page_id: &str) -> Account {
        Account {
            fb_page_id: Some(fb_page_id.to_string()),
            ..Account::bare(id)
        }
    }

    #[tokio::test]
    async fn resolves_from_cache_and_fetches_listing_once() {
        let api = PageTokenServer {
            me_accounts_calls: AtomicU32::new(0),
        };
        let policy = ExtractionPolicy::default();
        let cache = TokenCache::new(AccessToken::new("USER_TOKEN").unwrap());

        let account = account_with_page("acc_1", "fbp_9");
        let first = cache.resolve_page_token(&api, &policy, &account).await;
        let second = cache.resolve_page_token(&api, &policy, &account).await;

        assert_eq!(first.source, TokenSource::PageTokenCache);
        assert_eq!(first.token.as_str(), "PAGE_TOKEN_9");
        assert_eq!(second.source, TokenSource::PageTokenCache);
        assert_eq!(api.me_accounts_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn falls_back_to_user_token_with_provenance() {
        let api = PageTokenServer {
            me_accounts_calls: AtomicU32::new(0),
        };
        let policy = ExtractionPolicy::default();
        let cache = TokenCache::new(AccessToken::new("USER_TOKEN").unwrap());

        let account = Account::bare("unknown_acc");
        let resolved = cache.resolve_page_token(&api, &policy, &account).await;
        assert_eq!(resolved.source, TokenSource::UserTokenFallback);
        assert_eq!(resolved.token.as_str(), "USER_TOKEN");
    }

    #[test]
    fn gates_are_shared_per_token() {
        let cache = TokenCache::new(AccessToken::new("USER_TOKEN").unwrap());
        let a = cache.gate(&AccessToken::new("t1").unwrap());
        let b = cache.gate(&AccessToken::new("t1").unwrap());
        let c = cache.gate(&AccessToken::new("t2").unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
