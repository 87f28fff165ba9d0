//! Google Cloud Pub/Sub over its REST API.
//!
//! Publishing is synchronous per message: `publish` returns once Pub/Sub has
//! assigned a message id. Subscriptions use synchronous pull; a nack sets the
//! ack deadline of the message to zero so it is redelivered right away.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use chainrelay_core::bus::{Acker, BusError, BusMessage, Delivery, MessageBus, Subscription};
use chainrelay_core::config::PubSubConfig;

pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Server-side wait of a pull request before it returns empty.
const PULL_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PubsubMessageOut {
    data: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ordering_key: Option<String>,
}

impl From<&BusMessage> for PubsubMessageOut {
    fn from(message: &BusMessage) -> Self {
        Self {
            data: STANDARD.encode(&message.data),
            attributes: message.attributes.clone(),
            ordering_key: message.ordering_key.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessageIn,
    /// Only populated when the subscription has a dead-letter policy.
    #[serde(default)]
    delivery_attempt: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessageIn {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    message_id: String,
}

/// A received message split into ack id, message id, payload, attributes
/// and delivery attempt.
pub(crate) type ReceivedParts = (String, String, Vec<u8>, BTreeMap<String, String>, u32);

impl ReceivedMessage {
    /// A payload that is not valid base64 comes back empty, so the consumer
    /// rejects it like any other undecodable message.
    pub(crate) fn into_parts(self) -> ReceivedParts {
        let data = match STANDARD.decode(self.message.data.as_bytes()) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(message_id = %self.message.message_id, error = %e, "pubsub payload is not base64");
                Vec::new()
            }
        };
        (
            self.ack_id,
            self.message.message_id,
            data,
            self.message.attributes,
            self.delivery_attempt.unwrap_or(1).max(1),
        )
    }
}

// ─── REST client ──────────────────────────────────────────────────────────────

struct RestClient {
    http: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
    timeout: Duration,
}

impl RestClient {
    async fn post(&self, path: &str, body: &Value, timeout: Duration) -> Result<Value, BusError> {
        let url = format!("{}/v1/{path}", self.endpoint);
        let mut req = self.http.post(&url).json(body).timeout(timeout);
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                BusError::timeout(timeout)
            } else {
                BusError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| BusError::Transport(format!("invalid response from {url}: {e}")))
    }
}

/// Map a non-2xx response. 429 and 5xx are transient, everything else means
/// the request itself is wrong.
pub(crate) fn status_error(status: u16, body: &str) -> BusError {
    if status == 429 || status >= 500 {
        BusError::Transport(format!("HTTP {status}: {body}"))
    } else {
        BusError::Rejected(format!("HTTP {status}: {body}"))
    }
}

// ─── Publisher ────────────────────────────────────────────────────────────────

/// A Pub/Sub topic as a [`MessageBus`].
pub struct PubSubBus {
    client: Arc<RestClient>,
    project_id: String,
    topic_id: String,
}

impl PubSubBus {
    /// Connect to the topic in `config`. Fails if project or topic is unset.
    pub fn new(config: &PubSubConfig, request_timeout: Duration) -> Result<Self, BusError> {
        let project_id = required(&config.project_id, "project_id")?;
        let topic_id = required(&config.topic_id, "topic_id")?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| BusError::Transport(format!("failed to build HTTP client: {e}")))?;
        let endpoint = config
            .endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .unwrap_or(DEFAULT_ENDPOINT)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client: Arc::new(RestClient {
                http,
                endpoint,
                access_token: config.access_token.clone().filter(|t| !t.is_empty()),
                timeout: request_timeout,
            }),
            project_id,
            topic_id,
        })
    }

    pub fn topic_path(&self) -> String {
        format!("projects/{}/topics/{}", self.project_id, self.topic_id)
    }

    pub fn endpoint(&self) -> &str {
        &self.client.endpoint
    }

    /// A pull subscription sharing this bus's HTTP client.
    pub fn subscription(&self, subscription_id: &str) -> PubSubSubscription {
        PubSubSubscription {
            client: self.client.clone(),
            path: format!("projects/{}/subscriptions/{subscription_id}", self.project_id),
        }
    }
}

fn required(value: &Option<String>, what: &str) -> Result<String, BusError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BusError::Rejected(format!("pubsub {what} is not set")))
}

#[async_trait]
impl MessageBus for PubSubBus {
    async fn publish(&self, message: BusMessage) -> Result<String, BusError> {
        let body = json!({ "messages": [PubsubMessageOut::from(&message)] });
        let path = format!("{}:publish", self.topic_path());
        let resp = self.client.post(&path, &body, self.client.timeout).await?;
        let parsed: PublishResponse = serde_json::from_value(resp)
            .map_err(|e| BusError::Transport(format!("invalid publish response: {e}")))?;
        let id = parsed
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| BusError::Transport("publish response carried no message id".into()))?;
        debug!(topic = %self.topic_id, message_id = %id, "published to pubsub");
        Ok(id)
    }

    fn name(&self) -> &str {
        "pubsub"
    }
}

// ─── Subscriber ───────────────────────────────────────────────────────────────

pub struct PubSubSubscription {
    client: Arc<RestClient>,
    path: String,
}

impl PubSubSubscription {
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl Subscription for PubSubSubscription {
    async fn pull(&self, max: usize) -> Result<Vec<Delivery>, BusError> {
        let body = json!({ "maxMessages": max.max(1) });
        let resp = self
            .client
            .post(&format!("{}:pull", self.path), &body, PULL_TIMEOUT)
            .await?;
        let parsed: PullResponse = serde_json::from_value(resp)
            .map_err(|e| BusError::Transport(format!("invalid pull response: {e}")))?;

        let mut deliveries = Vec::with_capacity(parsed.received_messages.len());
        for received in parsed.received_messages {
            let (ack_id, message_id, data, attributes, attempt) = received.into_parts();
            deliveries.push(Delivery::new(
                message_id,
                data,
                attributes,
                attempt,
                Box::new(PubSubAcker {
                    client: self.client.clone(),
                    subscription: self.path.clone(),
                    ack_id,
                }),
            ));
        }
        Ok(deliveries)
    }
}

struct PubSubAcker {
    client: Arc<RestClient>,
    subscription: String,
    ack_id: String,
}

#[async_trait]
impl Acker for PubSubAcker {
    async fn ack(&self) -> Result<(), BusError> {
        let body = json!({ "ackIds": [self.ack_id] });
        self.client
            .post(&format!("{}:acknowledge", self.subscription), &body, self.client.timeout)
            .await
            .map_err(|e| BusError::Ack(e.to_string()))?;
        Ok(())
    }

    async fn nack(&self) -> Result<(), BusError> {
        let body = json!({ "ackIds": [self.ack_id], "ackDeadlineSeconds": 0 });
        self.client
            .post(&format!("{}:modifyAckDeadline", self.subscription), &body, self.client.timeout)
            .await
            .map_err(|e| BusError::Ack(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PubSubConfig {
        PubSubConfig {
            project_id: Some("relay-prod".into()),
            topic_id: Some("escrow-events".into()),
            subscription_id: Some("escrow-events-sub".into()),
            endpoint: Some("http://localhost:8085/".into()),
            access_token: None,
        }
    }

    #[test]
    fn paths_and_endpoint() {
        let bus = PubSubBus::new(&config(), Duration::from_secs(1)).unwrap();
        assert_eq!(bus.topic_path(), "projects/relay-prod/topics/escrow-events");
        assert_eq!(bus.endpoint(), "http://localhost:8085");
        assert_eq!(
            bus.subscription("escrow-events-sub").path(),
            "projects/relay-prod/subscriptions/escrow-events-sub"
        );
    }

    #[test]
    fn missing_topic_is_rejected() {
        let cfg = PubSubConfig {
            topic_id: None,
            ..config()
        };
        assert!(matches!(
            PubSubBus::new(&cfg, Duration::from_secs(1)),
            Err(BusError::Rejected(_))
        ));
    }

    #[test]
    fn outgoing_message_shape() {
        let msg = BusMessage::new(b"{\"event_id\":\"0x1\"}".to_vec())
            .attribute("severity", "info")
            .ordering_key("0xescrow");
        let wire = serde_json::to_value(PubsubMessageOut::from(&msg)).unwrap();
        assert_eq!(wire["data"], STANDARD.encode(b"{\"event_id\":\"0x1\"}"));
        assert_eq!(wire["attributes"]["severity"], "info");
        assert_eq!(wire["orderingKey"], "0xescrow");

        let bare = serde_json::to_value(PubsubMessageOut::from(&BusMessage::new(vec![]))).unwrap();
        assert!(bare.get("attributes").is_none());
        assert!(bare.get("orderingKey").is_none());
    }

    #[test]
    fn pull_response_decodes() {
        let raw = json!({
            "receivedMessages": [
                {
                    "ackId": "ack-1",
                    "message": {
                        "data": STANDARD.encode(b"hello"),
                        "attributes": {"event_id": "0x1"},
                        "messageId": "42",
                        "publishTime": "2024-01-01T00:00:00Z"
                    },
                    "deliveryAttempt": 3
                },
                {
                    "ackId": "ack-2",
                    "message": {"messageId": "43"}
                }
            ]
        });
        let parsed: PullResponse = serde_json::from_value(raw).unwrap();
        let mut parts = parsed.received_messages.into_iter().map(ReceivedMessage::into_parts);

        let (ack_id, message_id, data, attributes, attempt) = parts.next().unwrap();
        assert_eq!((ack_id.as_str(), message_id.as_str()), ("ack-1", "42"));
        assert_eq!(data, b"hello");
        assert_eq!(attributes["event_id"], "0x1");
        assert_eq!(attempt, 3);

        let (_, _, data, _, attempt) = parts.next().unwrap();
        assert!(data.is_empty());
        assert_eq!(attempt, 1);
    }

    #[test]
    fn empty_pull_response() {
        let parsed: PullResponse = serde_json::from_value(json!({})).unwrap();
        assert!(parsed.received_messages.is_empty());
    }

    #[test]
    fn status_mapping() {
        assert!(status_error(503, "").is_retryable());
        assert!(status_error(429, "").is_retryable());
        assert!(matches!(status_error(404, "no topic"), BusError::Rejected(_)));
        assert!(!status_error(403, "").is_retryable());
    }
}
