//! Batched JSON-RPC over HTTP.
//!
//! Requests for one logical fetch are framed as a JSON-RPC batch array,
//! chunked by `max_batch_size` and issued with at most `max_concurrency`
//! chunks in flight. Individual methods can be routed to dedicated
//! endpoints (tracing nodes are commonly separate from serving nodes).
//! Transport-level failures and rate limiting retry with exponential
//! backoff and jitter; node rejections and decode failures do not.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{stream, StreamExt, TryStreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use async_trait::async_trait;
use bigdecimal::BigDecimal;

use kepler_core::models::blockchain as chain;

use super::{
    codec, BalanceRequest, BlockBatch, BlockTag, EthereumRpc, FetchedBalance, FetchedTokenBalance,
    NextStatus, ReceiptBatch, ReceiptRequest, RpcError, TokenBalanceRequest, TraceRequest,
};

#[derive(Clone, Debug)]
pub struct RpcConfig {
    /// Default endpoint for every method.
    pub url: Url,
    /// Per-method endpoint overrides, e.g. `trace_replayTransaction` to an
    /// archive node.
    pub method_urls: HashMap<String, Url>,
    pub timeout: Duration,
    pub max_batch_size: usize,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl RpcConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method_urls: HashMap::new(),
            timeout: Duration::from_secs(60),
            max_batch_size: 500,
            max_concurrency: 10,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize, Debug)]
struct JsonRpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

pub struct HttpRpcClient {
    client: reqwest::Client,
    config: RpcConfig,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(config: RpcConfig) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| RpcError::Unknown(err.to_string()))?;
        Ok(Self { client, config, next_id: AtomicU64::new(1) })
    }

    fn url_for(&self, method: &str) -> &Url {
        self.config
            .method_urls
            .get(method)
            .unwrap_or(&self.config.url)
    }

    async fn with_retry<T, F, Fut>(&self, mut call: F) -> Result<T, RpcError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let exponent = (attempt - 1).min(10);
                    let base_ms = self.config.retry_base_delay.as_millis() as u64;
                    let delay_ms = base_ms.saturating_mul(1 << exponent);
                    // jitter spreads retries from concurrent range workers
                    let jitter = rand::thread_rng().gen_range(0..=delay_ms / 10 + 1);
                    warn!(attempt, %err, delay_ms = delay_ms + jitter, "rpc retry");
                    sleep(Duration::from_millis(delay_ms + jitter)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn classify_send_error(err: reqwest::Error) -> RpcError {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            RpcError::Transport(err.to_string())
        } else {
            RpcError::Unknown(err.to_string())
        }
    }

    fn classify_status(status: reqwest::StatusCode) -> Option<RpcError> {
        if status.as_u16() == 429 {
            Some(RpcError::RateLimited)
        } else if status.is_server_error() {
            Some(RpcError::Transport(format!("server returned {status}")))
        } else if !status.is_success() {
            Some(RpcError::Unknown(format!("server returned {status}")))
        } else {
            None
        }
    }

    /// One JSON-RPC batch POST; per-entry results in request order.
    async fn post_batch(
        &self,
        method: &str,
        params_list: &[Value],
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let first_id = self
            .next_id
            .fetch_add(params_list.len() as u64, Ordering::Relaxed);
        let requests: Vec<JsonRpcRequest<'_>> = params_list
            .iter()
            .enumerate()
            .map(|(offset, params)| JsonRpcRequest {
                jsonrpc: "2.0",
                id: first_id + offset as u64,
                method,
                params: params.clone(),
            })
            .collect();

        let response = self
            .client
            .post(self.url_for(method).clone())
            .json(&requests)
            .send()
            .await
            .map_err(Self::classify_send_error)?;
        if let Some(err) = Self::classify_status(response.status()) {
            return Err(err);
        }

        let entries: Vec<JsonRpcResponse> = response
            .json()
            .await
            .map_err(|err| RpcError::Decode(err.to_string()))?;

        let mut by_id: HashMap<u64, JsonRpcResponse> =
            entries.into_iter().map(|e| (e.id, e)).collect();
        Ok((0..params_list.len())
            .map(|offset| {
                let id = first_id + offset as u64;
                match by_id.remove(&id) {
                    Some(JsonRpcResponse { error: Some(err), .. }) => {
                        if err.code == -32005 || err.message.to_lowercase().contains("rate limit") {
                            Err(RpcError::RateLimited)
                        } else {
                            Err(RpcError::NodeRejected { code: err.code, message: err.message })
                        }
                    }
                    Some(JsonRpcResponse { result, .. }) => Ok(result.unwrap_or(Value::Null)),
                    None => Err(RpcError::Decode(format!("response for id {id} missing"))),
                }
            })
            .collect())
    }

    /// Chunks the request list and runs the chunks concurrently, preserving
    /// input order in the output.
    async fn call_chunked(
        &self,
        method: &str,
        params_list: Vec<Value>,
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        if params_list.is_empty() {
            return Ok(Vec::new());
        }
        let chunks: Vec<Vec<Value>> = params_list
            .chunks(self.config.max_batch_size)
            .map(|c| c.to_vec())
            .collect();
        debug!(method, requests = params_list.len(), chunks = chunks.len(), "rpc batch");

        let results: Vec<Vec<Result<Value, RpcError>>> = stream::iter(
            chunks
                .into_iter()
                .map(|chunk| async move { self.with_retry(|| self.post_batch(method, &chunk)).await }),
        )
        .buffered(self.config.max_concurrency)
        .try_collect()
        .await?;

        Ok(results.into_iter().flatten().collect())
    }

    async fn call_single(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let mut results = self
            .with_retry(|| self.post_batch(method, std::slice::from_ref(&params)))
            .await?;
        results
            .pop()
            .unwrap_or(Err(RpcError::Decode("empty batch response".to_string())))
    }
}

/// A node error that indicates the request itself is malformed; the entry
/// is dropped from the batch instead of retried.
fn is_entry_droppable(err: &RpcError) -> bool {
    matches!(err, RpcError::NodeRejected { code, .. } if *code == -32602)
}

#[async_trait]
impl EthereumRpc for HttpRpcClient {
    async fn fetch_block_number_by_tag(&self, tag: BlockTag) -> Result<u64, RpcError> {
        let result = self
            .call_single("eth_getBlockByNumber", json!([tag.as_str(), false]))
            .await?;
        let raw: Option<codec::RawBlock> =
            serde_json::from_value(result).map_err(|err| RpcError::Decode(err.to_string()))?;
        let raw = raw.ok_or_else(|| {
            RpcError::Transport(format!("no block for tag {:?} yet", tag.as_str()))
        })?;
        codec::decode_quantity(&raw.number)
    }

    async fn fetch_blocks_by_range(&self, first: u64, last: u64) -> Result<BlockBatch, RpcError> {
        let numbers: Vec<u64> = if first <= last {
            (first..=last).collect()
        } else {
            (last..=first).rev().collect()
        };
        let params: Vec<Value> = numbers
            .iter()
            .map(|n| json!([codec::encode_quantity(*n), true]))
            .collect();

        let mut blocks = Vec::with_capacity(numbers.len());
        let mut transactions = Vec::new();
        let mut next = NextStatus::More;
        for result in self.call_chunked("eth_getBlockByNumber", params).await? {
            let raw: Option<codec::RawBlock> = serde_json::from_value(result?)
                .map_err(|err| RpcError::Decode(err.to_string()))?;
            match raw {
                Some(raw) => {
                    let (block, mut block_transactions) = codec::normalize_block(raw)?;
                    blocks.push(block);
                    transactions.append(&mut block_transactions);
                }
                // the node does not have this height yet
                None => next = NextStatus::EndOfChain,
            }
        }
        Ok(BlockBatch { blocks, transactions, next })
    }

    async fn fetch_transaction_receipts(
        &self,
        requests: &[ReceiptRequest],
    ) -> Result<ReceiptBatch, RpcError> {
        let params: Vec<Value> = requests
            .iter()
            .map(|r| json!([format!("{:#x}", r.hash)]))
            .collect();

        let mut batch = ReceiptBatch::default();
        for (request, result) in requests
            .iter()
            .zip(self.call_chunked("eth_getTransactionReceipt", params).await?)
        {
            let raw: Option<codec::RawReceipt> = serde_json::from_value(result?)
                .map_err(|err| RpcError::Decode(err.to_string()))?;
            // null means not mined yet; retriable by contract
            let raw = raw.ok_or_else(|| {
                RpcError::Transport(format!("receipt for {:#x} not available yet", request.hash))
            })?;
            let (receipt, mut logs) = codec::normalize_receipt(raw, request.gas)?;
            batch.receipts.push(receipt);
            batch.logs.append(&mut logs);
        }
        Ok(batch)
    }

    async fn fetch_balances(
        &self,
        requests: &[BalanceRequest],
    ) -> Result<Vec<FetchedBalance>, RpcError> {
        let params: Vec<Value> = requests
            .iter()
            .map(|r| {
                json!([format!("{:#x}", r.address_hash), codec::encode_quantity(r.block_number)])
            })
            .collect();

        let mut fetched = Vec::with_capacity(requests.len());
        for (request, result) in requests
            .iter()
            .zip(self.call_chunked("eth_getBalance", params).await?)
        {
            match result {
                Ok(value) => {
                    let raw: String = serde_json::from_value(value)
                        .map_err(|err| RpcError::Decode(err.to_string()))?;
                    fetched.push(FetchedBalance {
                        address_hash: request.address_hash.clone(),
                        block_number: request.block_number,
                        value: codec::decode_big_quantity(&raw)?,
                    });
                }
                Err(err) if is_entry_droppable(&err) => {
                    warn!(address = %request.address_hash, %err, "dropping balance request");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(fetched)
    }

    async fn fetch_internal_transactions(
        &self,
        requests: &[TraceRequest],
    ) -> Result<Vec<chain::InternalTransaction>, RpcError> {
        let params: Vec<Value> = requests
            .iter()
            .map(|r| json!([format!("{:#x}", r.transaction_hash), ["trace"]]))
            .collect();

        let mut internal_transactions = Vec::new();
        for (request, result) in requests
            .iter()
            .zip(self.call_chunked("trace_replayTransaction", params).await?)
        {
            let raw: Option<codec::RawTraceResult> = serde_json::from_value(result?)
                .map_err(|err| RpcError::Decode(err.to_string()))?;
            let raw = raw.ok_or_else(|| {
                RpcError::Transport(format!(
                    "trace for {:#x} not available yet",
                    request.transaction_hash
                ))
            })?;
            for (index, entry) in raw.trace.into_iter().enumerate() {
                internal_transactions.push(codec::normalize_trace_entry(
                    request.transaction_hash.clone(),
                    request.block_number,
                    index as u64,
                    entry,
                )?);
            }
        }
        Ok(internal_transactions)
    }

    async fn fetch_token_balances(
        &self,
        requests: &[TokenBalanceRequest],
    ) -> Result<Vec<FetchedTokenBalance>, RpcError> {
        let params: Vec<Value> = requests
            .iter()
            .map(|r| {
                json!([
                    {
                        "to": format!("{:#x}", r.token_contract_address_hash),
                        "data": format!("{:#x}", codec::balance_of_call_data(&r.address_hash)),
                    },
                    codec::encode_quantity(r.block_number)
                ])
            })
            .collect();

        let mut fetched = Vec::with_capacity(requests.len());
        for (request, result) in requests
            .iter()
            .zip(self.call_chunked("eth_call", params).await?)
        {
            match result {
                Ok(value) => {
                    let raw: String = serde_json::from_value(value)
                        .map_err(|err| RpcError::Decode(err.to_string()))?;
                    let value = if raw == "0x" {
                        BigDecimal::from(0)
                    } else {
                        codec::decode_big_quantity(&raw)?
                    };
                    fetched.push(FetchedTokenBalance {
                        address_hash: request.address_hash.clone(),
                        token_contract_address_hash: request.token_contract_address_hash.clone(),
                        block_number: request.block_number,
                        value,
                    });
                }
                Err(err) if is_entry_droppable(&err) => {
                    warn!(
                        address = %request.address_hash,
                        token = %request.token_contract_address_hash,
                        %err,
                        "dropping token balance request"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config_with_trace_url() -> RpcConfig {
        let mut config = RpcConfig::new(Url::parse("http://node:8545").unwrap());
        config.method_urls.insert(
            "trace_replayTransaction".to_string(),
            Url::parse("http://archive:8545").unwrap(),
        );
        config
    }

    #[test]
    fn routes_methods_to_dedicated_endpoints() {
        let client = HttpRpcClient::new(config_with_trace_url()).unwrap();
        assert_eq!(client.url_for("eth_getBalance").as_str(), "http://node:8545/");
        assert_eq!(
            client.url_for("trace_replayTransaction").as_str(),
            "http://archive:8545/"
        );
    }

    #[test]
    fn droppable_entries_are_invalid_params_only() {
        assert!(is_entry_droppable(&RpcError::NodeRejected {
            code: -32602,
            message: "invalid argument".into()
        }));
        assert!(!is_entry_droppable(&RpcError::NodeRejected {
            code: -32000,
            message: "header not found".into()
        }));
        assert!(!is_entry_droppable(&RpcError::RateLimited));
    }
}
