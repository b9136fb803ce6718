use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::platform::InboundMessage;

/// JSON body posted to the webhook for every non-command message
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayPayload {
    pub chat_id: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub first_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl RelayPayload {
    pub fn from_inbound(msg: &InboundMessage) -> Self {
        Self {
            chat_id: msg.chat_id,
            message: msg.text.clone(),
            username: msg.username.clone(),
            first_name: msg.first_name.clone(),
            last_name: msg.last_name.clone(),
            timestamp: msg
                .received_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            kind: "message",
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("webhook returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Posts a JSON document and returns the parsed reply
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn post_json(&self, body: &Value) -> Result<Value, RelayError>;
}

/// reqwest-backed client pinned to IPv4
pub struct HttpRelayClient {
    client: reqwest::Client,
    url: String,
}

impl HttpRelayClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        // Binding to an IPv4 local address makes the connector skip AAAA
        // results, which hang on hosts with a broken IPv6 route.
        let client = reqwest::Client::builder()
            .local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RelayClient for HttpRelayClient {
    async fn post_json(&self, body: &Value) -> Result<Value, RelayError> {
        let response = self.client.post(&self.url).json(body).send().await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(RelayError::Status { status, body: text });
        }

        Ok(parse_reply(&text))
    }
}

/// Empty bodies become `null`; bodies that are not JSON are kept as a string.
fn parse_reply(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// At-most-once forwarding of messages to the webhook.
///
/// Failures are logged and reported as `None`; nothing is retried.
#[derive(Clone)]
pub struct WebhookRelay {
    client: Arc<dyn RelayClient>,
}

impl WebhookRelay {
    pub fn new(client: Arc<dyn RelayClient>) -> Self {
        Self { client }
    }

    pub async fn forward(&self, payload: &RelayPayload) -> Option<Value> {
        let body = match serde_json::to_value(payload) {
            Ok(body) => body,
            Err(e) => {
                error!("Error sending data to webhook: {}", RelayError::from(e));
                return None;
            }
        };

        debug!("Sending data to webhook: {}", body);

        match self.client.post_json(&body).await {
            Ok(reply) if is_truthy(&reply) => {
                info!("Webhook reply for chat {}: {}", payload.chat_id, reply);
                Some(reply)
            }
            Ok(_) => {
                debug!("Webhook returned an empty reply for chat {}", payload.chat_id);
                None
            }
            Err(RelayError::Status { status, body }) => {
                // Prefer the structured error document when the webhook sent one
                match serde_json::from_str::<Value>(&body) {
                    Ok(details) => error!(%status, %details, "Webhook rejected message"),
                    Err(_) => error!(%status, body = %body, "Webhook rejected message"),
                }
                None
            }
            Err(e) => {
                error!("Error sending data to webhook: {}", e);
                None
            }
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/hook", addr)
    }

    fn relay_for(url: String) -> WebhookRelay {
        let client = HttpRelayClient::new(url, Duration::from_secs(5)).unwrap();
        WebhookRelay::new(Arc::new(client))
    }

    fn sample_payload() -> RelayPayload {
        RelayPayload::from_inbound(&InboundMessage {
            chat_id: 42,
            text: "hello".to_string(),
            username: Some("alice".to_string()),
            first_name: "Alice".to_string(),
            last_name: None,
            received_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        })
    }

    #[test]
    fn test_payload_shape() {
        let body = serde_json::to_value(sample_payload()).unwrap();
        assert_eq!(
            body,
            json!({
                "chatId": 42,
                "message": "hello",
                "username": "alice",
                "firstName": "Alice",
                "timestamp": "2024-05-01T12:30:00.000Z",
                "type": "message",
            })
        );
    }

    #[test]
    fn test_parse_reply_variants() {
        assert_eq!(parse_reply(""), Value::Null);
        assert_eq!(parse_reply("{\"message\":\"hi\"}"), json!({"message": "hi"}));
        assert_eq!(parse_reply("Workflow was started"), json!("Workflow was started"));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!({})));
        assert!(is_truthy(&json!("ok")));
    }

    #[tokio::test]
    async fn test_forward_returns_parsed_reply() {
        let app = Router::new().route(
            "/hook",
            post(|Json(body): Json<Value>| async move {
                Json(json!({ "data": { "message": format!("echo: {}", body["message"].as_str().unwrap_or_default()) } }))
            }),
        );
        let relay = relay_for(serve(app).await);

        let reply = relay.forward(&sample_payload()).await;

        assert_eq!(reply, Some(json!({ "data": { "message": "echo: hello" } })));
    }

    #[tokio::test]
    async fn test_forward_error_status_yields_none() {
        let app = Router::new().route(
            "/hook",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "message": "workflow failed" })),
                )
            }),
        );
        let relay = relay_for(serve(app).await);

        assert_eq!(relay.forward(&sample_payload()).await, None);
    }

    #[tokio::test]
    async fn test_forward_empty_body_yields_none() {
        let app = Router::new().route("/hook", post(|| async { StatusCode::OK }));
        let relay = relay_for(serve(app).await);

        assert_eq!(relay.forward(&sample_payload()).await, None);
    }

    #[tokio::test]
    async fn test_forward_unreachable_endpoint_yields_none() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let relay = relay_for(format!("http://{}/hook", addr));

        assert_eq!(relay.forward(&sample_payload()).await, None);
    }
}
