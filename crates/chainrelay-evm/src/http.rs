//! HTTP JSON-RPC client backed by `reqwest`.
//!
//! Retries are handled one level up by [`EvmFetcher`](crate::fetcher::EvmFetcher);
//! this client makes exactly one request per call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::fetcher::{block_from_json, parse_hex_u64, BlockSummary, EvmRpcClient, LogFilter, RawLog};
use crate::rpc::{JsonRpcRequest, JsonRpcResponse, RpcError};

pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RpcError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let req = JsonRpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);
        let resp = self.http.post(&self.url).json(&req).send().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout
            } else {
                RpcError::Http(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // 429 and 5xx are worth retrying, other statuses are not.
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(RpcError::Http(format!("HTTP {}: {body}", status.as_u16())));
            }
            return Err(RpcError::Malformed(format!("HTTP {}: {body}", status.as_u16())));
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| RpcError::Malformed(e.to_string()))?
            .into_result()
    }
}

#[async_trait]
impl EvmRpcClient for HttpRpcClient {
    async fn get_block_number(&self) -> Result<u64, RpcError> {
        let v = self.call("eth_blockNumber", vec![]).await?;
        let hex = v
            .as_str()
            .ok_or_else(|| RpcError::Malformed(format!("eth_blockNumber returned {v}")))?;
        parse_hex_u64(hex)
    }

    async fn get_block(&self, number: u64) -> Result<Option<BlockSummary>, RpcError> {
        let v = self
            .call("eth_getBlockByNumber", vec![json!(format!("0x{number:x}")), json!(false)])
            .await?;
        block_from_json(&v)
    }

    async fn get_logs(&self, from: u64, to: u64, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError> {
        let v = self.call("eth_getLogs", vec![filter.to_params(from, to)]).await?;
        serde_json::from_value(v).map_err(|e| RpcError::Malformed(format!("eth_getLogs: {e}")))
    }
}
