//! In-memory chain implementing [`EvmRpcClient`], for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::fetcher::{BlockSummary, EvmRpcClient, LogFilter, RawLog};
use crate::rpc::RpcError;

#[derive(Default)]
struct ChainState {
    head: u64,
    logs: Vec<RawLog>,
    timestamps: BTreeMap<u64, i64>,
    fail_next_rpc: usize,
    log_requests: Vec<(u64, u64)>,
}

/// A fake chain whose head, logs and failures are set by the test.
#[derive(Clone, Default)]
pub struct MemoryChain {
    state: Arc<Mutex<ChainState>>,
}

impl MemoryChain {
    pub fn new(head: u64) -> Self {
        let chain = Self::default();
        chain.set_head(head);
        chain
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ChainState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut state)
    }

    pub fn set_head(&self, head: u64) {
        self.with_state(|s| s.head = head);
    }

    pub fn push_log(&self, log: RawLog) {
        self.with_state(|s| s.logs.push(log));
    }

    pub fn set_timestamp(&self, block: u64, timestamp: i64) {
        self.with_state(|s| {
            s.timestamps.insert(block, timestamp);
        });
    }

    /// Make the next `n` RPC calls fail with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.with_state(|s| s.fail_next_rpc = n);
    }

    /// Every `(from, to)` range requested through `eth_getLogs`.
    pub fn log_requests(&self) -> Vec<(u64, u64)> {
        self.with_state(|s| s.log_requests.clone())
    }

    fn injected_failure(&self) -> Result<(), RpcError> {
        self.with_state(|s| {
            if s.fail_next_rpc > 0 {
                s.fail_next_rpc -= 1;
                return Err(RpcError::Http("injected RPC failure".into()));
            }
            Ok(())
        })
    }
}

#[async_trait]
impl EvmRpcClient for MemoryChain {
    async fn get_block_number(&self) -> Result<u64, RpcError> {
        self.injected_failure()?;
        Ok(self.with_state(|s| s.head))
    }

    async fn get_block(&self, number: u64) -> Result<Option<BlockSummary>, RpcError> {
        self.injected_failure()?;
        Ok(self.with_state(|s| {
            (number <= s.head).then(|| BlockSummary {
                number,
                hash: format!("0x{number:064x}"),
                timestamp: s.timestamps.get(&number).copied().unwrap_or(number as i64 * 12),
            })
        }))
    }

    async fn get_logs(&self, from: u64, to: u64, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError> {
        self.injected_failure()?;
        self.with_state(|s| {
            s.log_requests.push((from, to));
            s.logs
                .iter()
                .filter(|log| {
                    let block = log.block_number_u64().unwrap_or(u64::MAX);
                    block >= from && block <= to
                })
                .filter(|log| {
                    filter.addresses.is_empty()
                        || filter.addresses.iter().any(|a| a.eq_ignore_ascii_case(&log.address))
                })
                .filter(|log| {
                    filter.topics0.is_empty()
                        || log
                            .topic0()
                            .is_some_and(|t| filter.topics0.iter().any(|f| f.eq_ignore_ascii_case(t)))
                })
                .cloned()
                .map(Ok)
                .collect()
        })
    }
}
