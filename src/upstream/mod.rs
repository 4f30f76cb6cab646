//! Enhanced-RPC provider adapter.
//!
//! Fetches and parses transactions, address histories and token transfers,
//! wrapped in the standard retry policy and guarded by a circuit breaker.
//! Results are cached in the KV store with per-operation TTLs; missing
//! transactions are negative-cached with a bounded TTL.

pub mod circuit_breaker;
pub mod retry;
pub mod types;

pub use circuit_breaker::{BreakerState, BreakerStats, CircuitBreaker};
pub use types::{
    EnhancedTransaction, ParsedTransaction, SwapDirection, SwapInfo, Transfer, TxType,
};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheHit, KvCache};
use crate::classifier;
use crate::error::UpstreamError;

/// Health probe timeout.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
/// Single-transaction fetch timeout.
const TX_TIMEOUT: Duration = Duration::from_secs(10);
/// History-walk timeout.
const HISTORY_TIMEOUT: Duration = Duration::from_secs(30);

/// Cache TTLs per operation.
const TX_CACHE_TTL: Duration = Duration::from_secs(3600);
const TRANSFERS_CACHE_TTL: Duration = Duration::from_secs(300);
const ACTIVITY_CACHE_TTL: Duration = Duration::from_secs(120);

/// Signature page size for the primary recent-activity pass.
const SIGNATURE_PAGE_SIZE: usize = 1000;
/// Enhanced batch-resolve size.
const TX_BATCH_SIZE: usize = 10;
/// Enhanced history page size.
const HISTORY_PAGE_SIZE: usize = 100;
/// Largest token accounts consulted by the fallback pass.
const FALLBACK_TOP_ACCOUNTS: usize = 3;

/// Source of token transfers for the traversal engines. Tests substitute
/// a scripted implementation.
#[async_trait]
pub trait TransferSource: Send + Sync {
    /// Transfers of `token_mint` touching `address`, most recent first.
    async fn token_transfers(
        &self,
        address: &str,
        token_mint: &str,
        limit: usize,
    ) -> Result<Vec<Transfer>, UpstreamError>;
}

/// Pagination options for address history walks.
#[derive(Debug, Clone, Default)]
pub struct HistoryOpts {
    pub limit: usize,
    pub before: Option<String>,
    pub until: Option<String>,
}

/// Provider adapter. Cheap to clone via `Arc`.
pub struct UpstreamClient {
    http: reqwest::Client,
    rpc_url: String,
    api_url: String,
    api_key: String,
    cache: KvCache,
    breaker: Arc<CircuitBreaker>,
}

impl UpstreamClient {
    pub fn new(
        rpc_url: impl Into<String>,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        cache: KvCache,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            rpc_url: rpc_url.into(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            cache,
            breaker: Arc::new(CircuitBreaker::new()),
        }
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    /// Liveness probe against the RPC endpoint.
    pub async fn probe_health(&self) -> bool {
        let result = self
            .guarded(HEALTH_TIMEOUT, || {
                self.rpc_call::<String>("getHealth", serde_json::json!([]))
            })
            .await;
        matches!(result, Ok(Some(ref s)) if s == "ok")
    }

    /// Resolve one transaction. Returns `None` for a signature the chain
    /// does not know (negative-cached), the parsed transaction otherwise.
    pub async fn get_transaction(
        &self,
        signature: &str,
    ) -> Result<Option<ParsedTransaction>, UpstreamError> {
        let cache_key = format!("tx:{}", signature);
        match self.cache.get_json::<ParsedTransaction>(&cache_key).await {
            CacheHit::Value(tx) => return Ok(Some(tx)),
            CacheHit::Negative => return Ok(None),
            CacheHit::Miss => {}
        }

        let params = serde_json::json!([
            signature,
            {"encoding": "jsonParsed", "maxSupportedTransactionVersion": 0}
        ]);
        let result = self
            .guarded(TX_TIMEOUT, || {
                self.rpc_call::<types::RpcTransaction>("getTransaction", params.clone())
            })
            .await?;

        match result {
            Some(raw) => {
                let parsed = raw.into_parsed();
                self.cache.set_json(&cache_key, &parsed, TX_CACHE_TTL).await;
                Ok(Some(parsed))
            }
            None => {
                self.cache.set_negative(&cache_key, TX_CACHE_TTL).await;
                Ok(None)
            }
        }
    }

    /// Walk an address's transaction history, paginating under the hood.
    /// Returns at most `opts.limit` transactions.
    pub async fn get_address_transactions(
        &self,
        address: &str,
        opts: HistoryOpts,
    ) -> Result<Vec<ParsedTransaction>, UpstreamError> {
        let limit = opts.limit.max(1);
        let signatures = self
            .fetch_signatures(address, limit, opts.before.clone(), opts.until.clone())
            .await?;

        let mut transactions = Vec::with_capacity(signatures.len());
        for batch in signatures.chunks(TX_BATCH_SIZE) {
            let fetched = futures::future::join_all(
                batch.iter().map(|sig| self.get_transaction(sig)),
            )
            .await;
            for result in fetched {
                if let Some(tx) = result? {
                    transactions.push(tx);
                }
            }
            if transactions.len() >= limit {
                break;
            }
        }
        transactions.truncate(limit);
        Ok(transactions)
    }

    /// Token transfers of `token_mint` touching `address`, flattened from
    /// the enhanced history and converted to exact raw amounts.
    pub async fn get_token_transfers(
        &self,
        address: &str,
        token_mint: &str,
        limit: usize,
    ) -> Result<Vec<Transfer>, UpstreamError> {
        let cache_key = format!("transfers:{}:{}:{}", address, token_mint, limit);
        if let CacheHit::Value(transfers) = self.cache.get_json::<Vec<Transfer>>(&cache_key).await {
            return Ok(transfers);
        }

        let transfers = self
            .collect_transfers_for_address(address, token_mint, limit)
            .await?;

        self.cache
            .set_json(&cache_key, &transfers, TRANSFERS_CACHE_TTL)
            .await;
        Ok(transfers)
    }

    /// Recent activity for a token mint. Two-pass: the mint's own
    /// signature history first; if that yields nothing, the histories of
    /// the owners of the top three largest token accounts.
    pub async fn get_recent_token_activity(
        &self,
        token_mint: &str,
        limit: usize,
    ) -> Result<Vec<Transfer>, UpstreamError> {
        let cache_key = format!("activity:{}:{}", token_mint, limit);
        if let CacheHit::Value(transfers) = self.cache.get_json::<Vec<Transfer>>(&cache_key).await {
            return Ok(transfers);
        }

        let mut transfers = self.activity_from_mint_history(token_mint, limit).await?;

        if transfers.is_empty() {
            debug!(mint = %token_mint, "mint history empty, falling back to largest holders");
            transfers = self.activity_from_largest_holders(token_mint, limit).await?;
        }

        transfers.sort_by(|a, b| b.block_time.cmp(&a.block_time));
        transfers.truncate(limit);

        self.cache
            .set_json(&cache_key, &transfers, ACTIVITY_CACHE_TTL)
            .await;
        Ok(transfers)
    }

    /// Batch-resolve signatures through the enhanced endpoint, in the
    /// provider's batch-size chunks.
    pub async fn get_enhanced_transactions(
        &self,
        signatures: &[String],
    ) -> Result<Vec<EnhancedTransaction>, UpstreamError> {
        let mut transactions = Vec::with_capacity(signatures.len());
        for batch in signatures.chunks(TX_BATCH_SIZE) {
            transactions.extend(self.fetch_enhanced_batch(batch).await?);
        }
        Ok(transactions)
    }

    // -- internals ----------------------------------------------------------

    /// Primary pass: page signatures for the mint, batch-resolve through
    /// the enhanced endpoint, classify each transaction once and emit one
    /// transfer per matching token movement.
    async fn activity_from_mint_history(
        &self,
        token_mint: &str,
        limit: usize,
    ) -> Result<Vec<Transfer>, UpstreamError> {
        let signatures = self.fetch_signatures(token_mint, limit, None, None).await?;

        let mut transfers = Vec::new();
        for batch in signatures.chunks(TX_BATCH_SIZE) {
            let enhanced = self.fetch_enhanced_batch(batch).await?;
            for tx in &enhanced {
                transfers.extend(classifier::transfers_for_mint(tx, token_mint));
            }
            if transfers.len() >= limit {
                break;
            }
        }
        Ok(transfers)
    }

    /// Fallback pass: largest token accounts resolved to their owners,
    /// each owner's enhanced history walked, de-duplicated by
    /// (signature, from_address).
    async fn activity_from_largest_holders(
        &self,
        token_mint: &str,
        limit: usize,
    ) -> Result<Vec<Transfer>, UpstreamError> {
        let largest = self
            .guarded(TX_TIMEOUT, || {
                self.rpc_call::<types::RpcTokenLargestAccounts>(
                    "getTokenLargestAccounts",
                    serde_json::json!([token_mint]),
                )
            })
            .await?;
        let Some(largest) = largest else {
            return Ok(Vec::new());
        };

        let mut transfers: Vec<Transfer> = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();

        for account in largest.value.iter().take(FALLBACK_TOP_ACCOUNTS) {
            let Some(owner) = self.resolve_token_account_owner(&account.address).await? else {
                continue;
            };
            let owner_transfers = self
                .collect_transfers_for_address(&owner, token_mint, limit)
                .await?;
            for transfer in owner_transfers {
                let key = (transfer.signature.clone(), transfer.from_address.clone());
                if seen.insert(key) {
                    transfers.push(transfer);
                }
            }
        }
        Ok(transfers)
    }

    async fn resolve_token_account_owner(
        &self,
        token_account: &str,
    ) -> Result<Option<String>, UpstreamError> {
        let info = self
            .guarded(TX_TIMEOUT, || {
                self.rpc_call::<types::RpcAccountInfo>(
                    "getAccountInfo",
                    serde_json::json!([token_account, {"encoding": "jsonParsed"}]),
                )
            })
            .await?;
        Ok(info
            .and_then(|i| i.value)
            .and_then(|v| v.token_account_owner()))
    }

    /// Enhanced-history walk for one address, classifying per transaction
    /// and keeping transfers of the requested mint.
    async fn collect_transfers_for_address(
        &self,
        address: &str,
        token_mint: &str,
        limit: usize,
    ) -> Result<Vec<Transfer>, UpstreamError> {
        let mut transfers = Vec::new();
        let mut before: Option<String> = None;

        loop {
            let page = self.fetch_enhanced_history(address, before.clone()).await?;
            if page.is_empty() {
                break;
            }
            before = page.last().map(|tx| tx.signature.clone());

            for tx in &page {
                transfers.extend(classifier::transfers_for_mint(tx, token_mint));
            }
            if transfers.len() >= limit || page.len() < HISTORY_PAGE_SIZE {
                break;
            }
        }
        transfers.truncate(limit);
        Ok(transfers)
    }

    async fn fetch_signatures(
        &self,
        address: &str,
        limit: usize,
        before: Option<String>,
        until: Option<String>,
    ) -> Result<Vec<String>, UpstreamError> {
        let mut signatures = Vec::with_capacity(limit);
        let mut cursor = before;

        while signatures.len() < limit {
            let page_size = (limit - signatures.len()).min(SIGNATURE_PAGE_SIZE);
            let mut params = serde_json::json!({"limit": page_size});
            if let Some(ref b) = cursor {
                params["before"] = serde_json::json!(b);
            }
            if let Some(ref u) = until {
                params["until"] = serde_json::json!(u);
            }

            let page = self
                .guarded(HISTORY_TIMEOUT, || {
                    self.rpc_call::<Vec<types::RpcSignatureInfo>>(
                        "getSignaturesForAddress",
                        serde_json::json!([address, params]),
                    )
                })
                .await?
                .unwrap_or_default();
            if page.is_empty() {
                break;
            }

            let page_len = page.len();
            cursor = page.last().map(|s| s.signature.clone());
            signatures.extend(
                page.into_iter()
                    .filter(|s| s.err.is_none() || s.err.as_ref().is_some_and(|e| e.is_null()))
                    .map(|s| s.signature),
            );
            if page_len < page_size {
                break;
            }
        }
        signatures.truncate(limit);
        Ok(signatures)
    }

    async fn fetch_enhanced_batch(
        &self,
        signatures: &[String],
    ) -> Result<Vec<EnhancedTransaction>, UpstreamError> {
        if signatures.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/v0/transactions?api-key={}", self.api_url, self.api_key);
        let body = serde_json::json!({"transactions": signatures});
        self.guarded(TX_TIMEOUT, || self.enhanced_post(&url, body.clone()))
            .await
    }

    async fn fetch_enhanced_history(
        &self,
        address: &str,
        before: Option<String>,
    ) -> Result<Vec<EnhancedTransaction>, UpstreamError> {
        let mut url = format!(
            "{}/v0/addresses/{}/transactions?api-key={}&limit={}",
            self.api_url, address, self.api_key, HISTORY_PAGE_SIZE
        );
        if let Some(b) = before {
            url.push_str(&format!("&before={}", b));
        }
        self.guarded(HISTORY_TIMEOUT, || self.enhanced_get(url.clone()))
            .await
    }

    async fn enhanced_get(&self, url: String) -> Result<Vec<EnhancedTransaction>, UpstreamError> {
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|_| UpstreamError::Unavailable)?;
        Self::decode_enhanced(response).await
    }

    async fn enhanced_post(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<Vec<EnhancedTransaction>, UpstreamError> {
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|_| UpstreamError::Unavailable)?;
        Self::decode_enhanced(response).await
    }

    async fn decode_enhanced(
        response: reqwest::Response,
    ) -> Result<Vec<EnhancedTransaction>, UpstreamError> {
        if response.status().as_u16() == 429 {
            return Err(UpstreamError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(UpstreamError::Unavailable);
        }
        response
            .json::<Vec<EnhancedTransaction>>()
            .await
            .map_err(|e| UpstreamError::BadResponse(e.to_string()))
    }

    async fn rpc_call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, UpstreamError> {
        let url = format!("{}/?api-key={}", self.rpc_url, self.api_key);
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|_| UpstreamError::Unavailable)?;

        if response.status().as_u16() == 429 {
            return Err(UpstreamError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(UpstreamError::Unavailable);
        }

        let payload: types::RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| UpstreamError::BadResponse(e.to_string()))?;

        if let Some(err) = payload.error {
            warn!(method = %method, code = err.code, "rpc error from upstream");
            return Err(UpstreamError::BadResponse(format!(
                "rpc error {}: {}",
                err.code, err.message
            )));
        }
        Ok(payload.result)
    }

    /// Wrap an operation in the retry policy and the circuit breaker.
    async fn guarded<F, Fut, T>(
        &self,
        attempt_timeout: Duration,
        op: F,
    ) -> Result<T, UpstreamError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, UpstreamError>>,
    {
        self.breaker.check().await?;
        let result = retry::with_retry(attempt_timeout, op).await;
        match &result {
            Ok(_) | Err(UpstreamError::BadResponse(_)) => self.breaker.record_success().await,
            Err(_) => self.breaker.record_failure().await,
        }
        result
    }
}

#[async_trait]
impl TransferSource for UpstreamClient {
    async fn token_transfers(
        &self,
        address: &str,
        token_mint: &str,
        limit: usize,
    ) -> Result<Vec<Transfer>, UpstreamError> {
        self.get_token_transfers(address, token_mint, limit).await
    }
}
