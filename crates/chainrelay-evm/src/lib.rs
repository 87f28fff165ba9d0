//! chainrelay-evm — EVM log fetcher, normalizer and chain scanner.

pub mod builder;
pub mod fetcher;
pub mod http;
pub mod memory;
pub mod normalize;
pub mod rpc;
pub mod scanner;

pub use builder::ScannerBuilder;
pub use fetcher::{BlockSummary, EvmFetcher, EvmRpcClient, LogFilter, RawLog};
pub use http::HttpRpcClient;
pub use memory::MemoryChain;
pub use normalize::{signature_topic, EventKind, EventSpec, LogNormalizer, Normalized};
pub use chainrelay_core::backoff::{RetryConfig, RetryPolicy};
pub use rpc::RpcError;
pub use scanner::{ChainScanner, ScannerConfig, ScannerState, TickOutcome};
