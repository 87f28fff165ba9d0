//! Raw log → canonical event normalization.
//!
//! Event kinds are selected by topic0, the keccak256 fingerprint of the
//! configured signature, e.g.
//!   keccak256("Transfer(address,address,uint256)")
//!   → 0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef
//!
//! Field layout of the relayed contracts:
//!
//! | kind      | topic1        | topic2 | topic3     | data word 0 |
//! |-----------|---------------|--------|------------|-------------|
//! | relay     | payer         | payee  | command id | amount      |
//! | discovery | entity        | payer  | payee      | amount      |
//!
//! Relay events correlate on the emitting contract; discovery events
//! correlate on the entity they announce. Missing trailing topics simply
//! leave the field empty.

use std::collections::HashMap;

use alloy_primitives::{keccak256, U256};

use chainrelay_core::error::RelayError;
use chainrelay_core::event::{derive_event_id, CanonicalEvent, EventStatus};

use crate::fetcher::{LogFilter, RawLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Relayed as-is with the configured status.
    Relay,
    /// Announces a new entity; relayed once per entity.
    Discovery,
}

/// One configured event signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSpec {
    /// Name part of the signature, used as `event_type`.
    pub name: String,
    pub signature: String,
    /// `0x`-prefixed lowercase keccak256 of `signature`.
    pub topic0: String,
    pub kind: EventKind,
    pub status: EventStatus,
}

impl EventSpec {
    /// Parse `Name(type,...)` with an optional `=STATUS` suffix.
    pub fn parse(raw: &str, kind: EventKind) -> Result<Self, RelayError> {
        let (signature, status) = match raw.split_once('=') {
            Some((sig, status)) => (
                sig.trim(),
                status
                    .parse::<EventStatus>()
                    .map_err(|e| RelayError::Config(format!("{raw}: {e}")))?,
            ),
            None => (raw.trim(), EventStatus::Received),
        };
        let signature: String = signature.chars().filter(|c| !c.is_whitespace()).collect();
        let open = signature
            .find('(')
            .filter(|&i| i > 0 && signature.ends_with(')'))
            .ok_or_else(|| RelayError::Config(format!("'{raw}' is not an event signature like Name(type,...)")))?;
        Ok(Self {
            name: signature[..open].to_string(),
            topic0: signature_topic(&signature),
            signature,
            kind,
            status,
        })
    }
}

/// keccak256 fingerprint of an event signature.
pub fn signature_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
}

/// A canonical event plus the entity it announced, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub event: CanonicalEvent,
    pub discovered: Option<String>,
}

pub struct LogNormalizer {
    chain_id: u64,
    specs: HashMap<String, EventSpec>,
}

impl LogNormalizer {
    pub fn new(chain_id: u64, specs: Vec<EventSpec>) -> Self {
        Self {
            chain_id,
            specs: specs.into_iter().map(|s| (s.topic0.clone(), s)).collect(),
        }
    }

    /// Build from relay and discovery signature lists.
    pub fn from_config(chain_id: u64, relay: &[String], discovery: &[String]) -> Result<Self, RelayError> {
        let mut specs = Vec::with_capacity(relay.len() + discovery.len());
        for raw in relay {
            specs.push(EventSpec::parse(raw, EventKind::Relay)?);
        }
        for raw in discovery {
            specs.push(EventSpec::parse(raw, EventKind::Discovery)?);
        }
        Ok(Self::new(chain_id, specs))
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn specs(&self) -> impl Iterator<Item = &EventSpec> {
        self.specs.values()
    }

    /// `eth_getLogs` filter for one contract and every configured event.
    pub fn filter_for(&self, contract: &str) -> LogFilter {
        let mut topics: Vec<String> = self.specs.keys().cloned().collect();
        topics.sort();
        LogFilter::new(vec![contract.to_ascii_lowercase()], topics)
    }

    /// Normalize one log. `Ok(None)` for logs whose topic0 is not configured.
    pub fn normalize(&self, log: &RawLog, occurred_at: Option<i64>) -> Result<Option<Normalized>, RelayError> {
        let Some(spec) = log.topic0().and_then(|t| self.specs.get(&t.to_ascii_lowercase())) else {
            return Ok(None);
        };

        let block_number = log.block_number_u64()?;
        let log_index = log.log_index_u32()?;
        let tx_hash = log.tx_hash.to_ascii_lowercase();
        let contract = log.address.to_ascii_lowercase();
        let amount = amount_word(&log.data)?;

        let (workflow_id, command_id, payer, payee, discovered) = match spec.kind {
            EventKind::Relay => (
                contract,
                topic_word(log, 3)?.unwrap_or_else(|| tx_hash.clone()),
                topic_address(log, 1)?,
                topic_address(log, 2)?,
                None,
            ),
            EventKind::Discovery => {
                let entity = topic_address(log, 1)?.ok_or_else(|| {
                    RelayError::Decode(format!("{} log {tx_hash}:{log_index} has no entity topic", spec.name))
                })?;
                (
                    entity.clone(),
                    tx_hash.clone(),
                    topic_address(log, 2)?,
                    topic_address(log, 3)?,
                    Some(entity),
                )
            }
        };

        Ok(Some(Normalized {
            event: CanonicalEvent {
                event_id: derive_event_id(self.chain_id, &tx_hash, log_index),
                event_type: spec.name.clone(),
                command_id,
                workflow_id,
                status: spec.status,
                payer,
                payee,
                amount,
                chain_id: self.chain_id,
                occurred_at,
                block_number,
                tx_hash,
                log_index,
            },
            discovered,
        }))
    }
}

fn decode_word(hex_str: &str) -> Result<Vec<u8>, RelayError> {
    let digits = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(digits).map_err(|e| RelayError::Decode(format!("invalid hex '{hex_str}': {e}")))
}

/// Full 32-byte topic at `index`, lowercase.
fn topic_word(log: &RawLog, index: usize) -> Result<Option<String>, RelayError> {
    let Some(topic) = log.topics.get(index) else {
        return Ok(None);
    };
    let bytes = decode_word(topic)?;
    if bytes.len() != 32 {
        return Err(RelayError::Decode(format!("topic {index} is {} bytes, expected 32", bytes.len())));
    }
    Ok(Some(format!("0x{}", hex::encode(bytes))))
}

/// Address packed into the low 20 bytes of the topic at `index`.
fn topic_address(log: &RawLog, index: usize) -> Result<Option<String>, RelayError> {
    let Some(topic) = log.topics.get(index) else {
        return Ok(None);
    };
    let bytes = decode_word(topic)?;
    if bytes.len() != 32 {
        return Err(RelayError::Decode(format!("topic {index} is {} bytes, expected 32", bytes.len())));
    }
    Ok(Some(format!("0x{}", hex::encode(&bytes[12..]))))
}

/// First data word as a decimal `uint256`.
fn amount_word(data: &str) -> Result<Option<String>, RelayError> {
    let bytes = decode_word(data)?;
    if bytes.len() < 32 {
        return Ok(None);
    }
    Ok(Some(U256::from_be_slice(&bytes[..32]).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(tail: &str) -> String {
        format!("0x{tail:0>64}")
    }

    fn log(topics: Vec<String>, data: &str) -> RawLog {
        RawLog {
            address: "0xC0DE000000000000000000000000000000000001".into(),
            topics,
            data: data.into(),
            block_number: "0x65".into(),
            block_hash: "0xbh".into(),
            tx_hash: "0xABCDEF".into(),
            log_index: "0x2".into(),
            removed: None,
        }
    }

    #[test]
    fn transfer_fingerprint() {
        assert_eq!(
            signature_topic("Transfer(address,address,uint256)"),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn parse_spec_with_status() {
        let spec = EventSpec::parse("Refunded(address, address, bytes32)=FAILED", EventKind::Relay).unwrap();
        assert_eq!(spec.name, "Refunded");
        assert_eq!(spec.signature, "Refunded(address,address,bytes32)");
        assert_eq!(spec.status, EventStatus::Failed);
        assert_eq!(spec.topic0, signature_topic("Refunded(address,address,bytes32)"));

        assert!(EventSpec::parse("Refunded", EventKind::Relay).is_err());
        assert!(EventSpec::parse("Refunded(address)=LOST", EventKind::Relay).is_err());
    }

    #[test]
    fn relay_event_layout() {
        let spec = EventSpec::parse("Funded(address,address,bytes32,uint256)", EventKind::Relay).unwrap();
        let n = LogNormalizer::new(1, vec![spec.clone()]);
        let raw = log(
            vec![spec.topic0.clone(), word("aa"), word("bb"), word("c0ffee")],
            &word("3e8"),
        );

        let out = n.normalize(&raw, Some(1_700_000_000)).unwrap().unwrap();
        let ev = out.event;
        assert_eq!(ev.event_type, "Funded");
        assert_eq!(ev.status, EventStatus::Received);
        assert_eq!(ev.payer.as_deref(), Some("0x00000000000000000000000000000000000000aa"));
        assert_eq!(ev.payee.as_deref(), Some("0x00000000000000000000000000000000000000bb"));
        assert_eq!(ev.command_id, word("c0ffee"));
        assert_eq!(ev.workflow_id, "0xc0de000000000000000000000000000000000001");
        assert_eq!(ev.amount.as_deref(), Some("1000"));
        assert_eq!(ev.block_number, 101);
        assert_eq!(ev.log_index, 2);
        assert_eq!(ev.tx_hash, "0xabcdef");
        assert_eq!(ev.event_id, derive_event_id(1, "0xabcdef", 2));
        assert!(out.discovered.is_none());
    }

    #[test]
    fn discovery_event_layout() {
        let spec = EventSpec::parse("EscrowCreated(address,address,address)", EventKind::Discovery).unwrap();
        let n = LogNormalizer::new(5, vec![spec.clone()]);
        let raw = log(vec![spec.topic0.clone(), word("e5c0"), word("aa")], "0x");

        let out = n.normalize(&raw, None).unwrap().unwrap();
        let entity = "0x000000000000000000000000000000000000e5c0";
        assert_eq!(out.discovered.as_deref(), Some(entity));
        assert_eq!(out.event.workflow_id, entity);
        assert_eq!(out.event.command_id, "0xabcdef");
        assert!(out.event.payee.is_none());
        assert!(out.event.amount.is_none());
    }

    #[test]
    fn unknown_topic_is_skipped() {
        let n = LogNormalizer::new(1, vec![]);
        assert!(n.normalize(&log(vec![word("1")], "0x"), None).unwrap().is_none());
        assert!(n.normalize(&log(vec![], "0x"), None).unwrap().is_none());
    }

    #[test]
    fn malformed_topic_is_a_decode_error() {
        let spec = EventSpec::parse("Paid(address)", EventKind::Relay).unwrap();
        let n = LogNormalizer::new(1, vec![spec.clone()]);
        let raw = log(vec![spec.topic0.clone(), "0x12".into()], "0x");
        assert!(matches!(n.normalize(&raw, None), Err(RelayError::Decode(_))));
    }
}
