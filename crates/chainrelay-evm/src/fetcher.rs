//! EVM block and log fetcher.
//!
//! Uses JSON-RPC `eth_blockNumber`, `eth_getBlockByNumber` and `eth_getLogs`.
//! Log ranges are split into pages of at most `page_blocks` blocks; every call
//! goes through the [`RetryPolicy`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chainrelay_core::backoff::RetryPolicy;

use crate::rpc::RpcError;

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash", default)]
    pub block_hash: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Result<u64, RpcError> {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u32(&self) -> Result<u32, RpcError> {
        let idx = parse_hex_u64(&self.log_index)?;
        u32::try_from(idx).map_err(|_| RpcError::Malformed(format!("logIndex out of range: {idx}")))
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

/// Minimal block header needed by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub number: u64,
    pub hash: String,
    /// Unix seconds.
    pub timestamp: i64,
}

/// `eth_getLogs` filter: any of `addresses`, topic0 any of `topics0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub addresses: Vec<String>,
    pub topics0: Vec<String>,
}

impl LogFilter {
    pub fn new(addresses: Vec<String>, topics0: Vec<String>) -> Self {
        Self { addresses, topics0 }
    }

    /// JSON-RPC filter object for `[from, to]`.
    pub fn to_params(&self, from: u64, to: u64) -> Value {
        let mut obj = json!({
            "fromBlock": format!("0x{from:x}"),
            "toBlock": format!("0x{to:x}"),
        });
        if !self.addresses.is_empty() {
            obj["address"] = json!(self.addresses);
        }
        if !self.topics0.is_empty() {
            obj["topics"] = json!([self.topics0]);
        }
        obj
    }
}

/// Trait for fetching EVM data from a JSON-RPC provider.
#[async_trait]
pub trait EvmRpcClient: Send + Sync {
    async fn get_block_number(&self) -> Result<u64, RpcError>;
    async fn get_block(&self, number: u64) -> Result<Option<BlockSummary>, RpcError>;
    async fn get_logs(&self, from: u64, to: u64, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError>;
}

/// Wraps an [`EvmRpcClient`] with paging and retries.
#[derive(Clone)]
pub struct EvmFetcher {
    client: Arc<dyn EvmRpcClient>,
    retry: RetryPolicy,
    page_blocks: u64,
}

impl EvmFetcher {
    pub fn new(client: Arc<dyn EvmRpcClient>, retry: RetryPolicy, page_blocks: u64) -> Self {
        Self {
            client,
            retry,
            page_blocks: page_blocks.max(1),
        }
    }

    pub async fn head_block_number(&self) -> Result<u64, RpcError> {
        self.retry
            .run("eth_blockNumber", || self.client.get_block_number())
            .await
    }

    pub async fn block(&self, number: u64) -> Result<Option<BlockSummary>, RpcError> {
        self.retry
            .run("eth_getBlockByNumber", || self.client.get_block(number))
            .await
    }

    /// Fetch all logs in `[from, to]`, one page of `page_blocks` at a time.
    /// Any page that still fails after retries fails the whole range.
    pub async fn logs(&self, from: u64, to: u64, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError> {
        if to < from {
            return Ok(vec![]);
        }
        let mut all_logs = Vec::new();
        let mut start = from;
        while start <= to {
            let end = start.saturating_add(self.page_blocks - 1).min(to);
            let page = self
                .retry
                .run("eth_getLogs", || self.client.get_logs(start, end, filter))
                .await?;
            tracing::trace!(from = start, to = end, logs = page.len(), "log page fetched");
            all_logs.extend(page);
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        Ok(all_logs)
    }
}

/// Parse a hex quantity (with or without `0x`).
pub fn parse_hex_u64(s: &str) -> Result<u64, RpcError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Err(RpcError::Malformed(format!("empty hex quantity '{s}'")));
    }
    u64::from_str_radix(digits, 16).map_err(|e| RpcError::Malformed(format!("bad hex quantity '{s}': {e}")))
}

/// Convert an `eth_getBlockByNumber` result into a [`BlockSummary`].
pub fn block_from_json(v: &Value) -> Result<Option<BlockSummary>, RpcError> {
    if v.is_null() {
        return Ok(None);
    }
    let field = |name: &str| {
        v[name]
            .as_str()
            .ok_or_else(|| RpcError::Malformed(format!("block is missing '{name}'")))
    };
    Ok(Some(BlockSummary {
        number: parse_hex_u64(field("number")?)?,
        hash: field("hash")?.to_string(),
        timestamp: parse_hex_u64(field("timestamp")?)? as i64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1").unwrap(), 1);
        assert_eq!(parse_hex_u64("0xff").unwrap(), 255);
        assert_eq!(parse_hex_u64("1234").unwrap(), 0x1234);
        assert!(parse_hex_u64("0x").is_err());
        assert!(parse_hex_u64("0xzz").is_err());
    }

    #[test]
    fn raw_log_fields() {
        let log: RawLog = serde_json::from_value(json!({
            "address": "0x0",
            "topics": ["0xabc"],
            "data": "0x",
            "blockNumber": "0x12a05f200",
            "transactionHash": "0xdead",
            "logIndex": "0x5"
        }))
        .unwrap();
        assert_eq!(log.block_number_u64().unwrap(), 5_000_000_000);
        assert_eq!(log.log_index_u32().unwrap(), 5);
        assert!(!log.is_removed());
        assert_eq!(log.topic0(), Some("0xabc"));
    }

    #[test]
    fn filter_params() {
        let f = LogFilter::new(vec!["0xc0de".into()], vec!["0xt1".into(), "0xt2".into()]);
        let p = f.to_params(16, 31);
        assert_eq!(p["fromBlock"], "0x10");
        assert_eq!(p["toBlock"], "0x1f");
        assert_eq!(p["address"], json!(["0xc0de"]));
        assert_eq!(p["topics"], json!([["0xt1", "0xt2"]]));
    }

    #[test]
    fn null_block_is_absent() {
        assert_eq!(block_from_json(&Value::Null).unwrap(), None);
        let b = block_from_json(&json!({"number": "0x65", "hash": "0xh", "timestamp": "0x10"}))
            .unwrap()
            .unwrap();
        assert_eq!(b.number, 101);
        assert_eq!(b.timestamp, 16);
        assert!(block_from_json(&json!({"number": "0x65"})).is_err());
    }

    struct RangeRecorder(Mutex<Vec<(u64, u64)>>);

    #[async_trait]
    impl EvmRpcClient for RangeRecorder {
        async fn get_block_number(&self) -> Result<u64, RpcError> {
            Ok(0)
        }
        async fn get_block(&self, _number: u64) -> Result<Option<BlockSummary>, RpcError> {
            Ok(None)
        }
        async fn get_logs(&self, from: u64, to: u64, _f: &LogFilter) -> Result<Vec<RawLog>, RpcError> {
            self.0.lock().unwrap().push((from, to));
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn logs_are_paged() {
        let client = Arc::new(RangeRecorder(Mutex::new(vec![])));
        let fetcher = EvmFetcher::new(client.clone(), RetryPolicy::none(), 10);
        fetcher.logs(101, 125, &LogFilter::default()).await.unwrap();
        assert_eq!(*client.0.lock().unwrap(), vec![(101, 110), (111, 120), (121, 125)]);

        assert!(fetcher.logs(5, 4, &LogFilter::default()).await.unwrap().is_empty());
    }
}
