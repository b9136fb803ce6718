use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info};

use crate::platform::{ChatGateway, InboundMessage};
use crate::relay::{RelayPayload, WebhookRelay};

pub const START_GREETING: &str = "Hello! I'm your Telegram bot. How can I help you?";

/// Static replies keyed by command name (including the leading slash)
#[derive(Debug, Clone)]
pub struct CommandTable {
    replies: HashMap<String, String>,
}

impl Default for CommandTable {
    fn default() -> Self {
        let mut replies = HashMap::new();
        replies.insert("/start".to_string(), START_GREETING.to_string());
        Self { replies }
    }
}

impl CommandTable {
    /// Look up the reply for a command message. Any text that begins with a
    /// known command matches it (`/start@my_bot`, `/starting`); the longest
    /// matching command wins.
    pub fn reply_for(&self, text: &str) -> Option<&str> {
        self.replies
            .iter()
            .filter(|(command, _)| text.starts_with(command.as_str()))
            .max_by_key(|(command, _)| command.len())
            .map(|(_, reply)| reply.as_str())
    }
}

/// Ordered list of field paths tried for the text to send back
#[derive(Debug, Clone)]
pub struct ReplyExtractor {
    paths: Vec<Vec<String>>,
    fallback: String,
}

impl ReplyExtractor {
    /// `paths` are dotted, e.g. `data.message`
    pub fn new<I, S>(paths: I, fallback: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths = paths
            .into_iter()
            .map(|p| p.as_ref().split('.').map(str::to_string).collect())
            .collect();
        Self {
            paths,
            fallback: fallback.into(),
        }
    }

    pub fn extract(&self, reply: &Value) -> String {
        self.paths
            .iter()
            .find_map(|path| lookup(reply, path).and_then(display_text))
            .unwrap_or_else(|| self.fallback.clone())
    }
}

fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(key.as_str()))
}

fn display_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        _ => None,
    }
}

/// What happened to an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Command,
    UnknownCommand,
    Relayed,
    NoReply,
}

/// Sends commands to the static table and everything else through the webhook
pub struct MessageRouter {
    gateway: Arc<dyn ChatGateway>,
    relay: WebhookRelay,
    commands: CommandTable,
    extractor: ReplyExtractor,
}

impl MessageRouter {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        relay: WebhookRelay,
        commands: CommandTable,
        extractor: ReplyExtractor,
    ) -> Self {
        Self {
            gateway,
            relay,
            commands,
            extractor,
        }
    }

    pub async fn route(&self, msg: &InboundMessage) -> Result<RouteOutcome> {
        debug!("Message from chat {}: {}", msg.chat_id, msg.text);

        if msg.text.starts_with('/') {
            return match self.commands.reply_for(&msg.text) {
                Some(reply) => {
                    self.gateway.send_message(msg.chat_id, reply).await?;
                    Ok(RouteOutcome::Command)
                }
                None => {
                    debug!("Ignoring unknown command: {}", msg.text);
                    Ok(RouteOutcome::UnknownCommand)
                }
            };
        }

        let payload = RelayPayload::from_inbound(msg);
        let Some(reply) = self.relay.forward(&payload).await else {
            return Ok(RouteOutcome::NoReply);
        };

        let text = self.extractor.extract(&reply);
        self.gateway.send_message(msg.chat_id, &text).await?;
        info!("Relayed webhook reply to chat {}", msg.chat_id);
        Ok(RouteOutcome::Relayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::FakeGateway;
    use crate::relay::{RelayClient, RelayError};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records payloads and answers with a canned reply (or a failure)
    struct FakeRelay {
        reply: Option<Value>,
        calls: Mutex<Vec<Value>>,
    }

    impl FakeRelay {
        fn replying(reply: Value) -> Arc<Self> {
            Arc::new(Self {
                reply: Some(reply),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: None,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Value> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RelayClient for FakeRelay {
        async fn post_json(&self, body: &Value) -> Result<Value, RelayError> {
            self.calls.lock().unwrap().push(body.clone());
            match &self.reply {
                Some(reply) => Ok(reply.clone()),
                None => Err(RelayError::Status {
                    status: reqwest::StatusCode::BAD_GATEWAY,
                    body: "upstream unavailable".to_string(),
                }),
            }
        }
    }

    fn router(gateway: &Arc<FakeGateway>, relay: &Arc<FakeRelay>) -> MessageRouter {
        MessageRouter::new(
            gateway.clone(),
            WebhookRelay::new(relay.clone()),
            CommandTable::default(),
            ReplyExtractor::new(
                ["message", "data.message", "response.message"],
                "Message received",
            ),
        )
    }

    fn message(text: &str) -> InboundMessage {
        InboundMessage {
            chat_id: 1001,
            text: text.to_string(),
            username: Some("bob".to_string()),
            first_name: "Bob".to_string(),
            last_name: Some("Builder".to_string()),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_start_sends_greeting_without_relay() {
        let gateway = FakeGateway::new();
        let relay = FakeRelay::replying(json!({ "message": "unused" }));
        let router = router(&gateway, &relay);

        for text in ["/start", "/start please", "/start@relay_bot"] {
            assert_eq!(router.route(&message(text)).await.unwrap(), RouteOutcome::Command);
        }

        assert!(relay.calls().is_empty());
        assert_eq!(gateway.sent().len(), 3);
        assert!(gateway.sent().iter().all(|(chat, text)| *chat == 1001 && text == START_GREETING));
    }

    #[tokio::test]
    async fn test_text_starting_with_start_gets_greeting() {
        let gateway = FakeGateway::new();
        let relay = FakeRelay::failing();
        let router = router(&gateway, &relay);

        for text in ["/starting", "/startfoo"] {
            assert_eq!(router.route(&message(text)).await.unwrap(), RouteOutcome::Command);
        }

        assert!(relay.calls().is_empty());
        assert_eq!(
            gateway.sent(),
            vec![
                (1001, START_GREETING.to_string()),
                (1001, START_GREETING.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_command_is_silent() {
        let gateway = FakeGateway::new();
        let relay = FakeRelay::replying(json!({ "message": "unused" }));
        let router = router(&gateway, &relay);

        let outcome = router.route(&message("/help")).await.unwrap();

        assert_eq!(outcome, RouteOutcome::UnknownCommand);
        assert!(relay.calls().is_empty());
        assert!(gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn test_text_is_relayed_once_with_full_payload() {
        let gateway = FakeGateway::new();
        let relay = FakeRelay::replying(json!({ "message": "Got it" }));
        let router = router(&gateway, &relay);

        router.route(&message("what's the weather?")).await.unwrap();

        let calls = relay.calls();
        assert_eq!(calls.len(), 1);
        let body = &calls[0];
        assert_eq!(body["chatId"], 1001);
        assert_eq!(body["message"], "what's the weather?");
        assert_eq!(body["username"], "bob");
        assert_eq!(body["firstName"], "Bob");
        assert_eq!(body["lastName"], "Builder");
        assert_eq!(body["type"], "message");
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));

        assert_eq!(gateway.sent(), vec![(1001, "Got it".to_string())]);
    }

    #[tokio::test]
    async fn test_nested_data_message_is_used() {
        let gateway = FakeGateway::new();
        let relay = FakeRelay::replying(json!({ "data": { "message": "X" } }));
        let router = router(&gateway, &relay);

        router.route(&message("hi")).await.unwrap();

        assert_eq!(gateway.sent(), vec![(1001, "X".to_string())]);
    }

    #[tokio::test]
    async fn test_empty_object_gets_fallback() {
        let gateway = FakeGateway::new();
        let relay = FakeRelay::replying(json!({}));
        let router = router(&gateway, &relay);

        let outcome = router.route(&message("hi")).await.unwrap();

        assert_eq!(outcome, RouteOutcome::Relayed);
        assert_eq!(gateway.sent(), vec![(1001, "Message received".to_string())]);
    }

    #[tokio::test]
    async fn test_relay_failure_sends_nothing() {
        let gateway = FakeGateway::new();
        let relay = FakeRelay::failing();
        let router = router(&gateway, &relay);

        let outcome = router.route(&message("hi")).await.unwrap();

        assert_eq!(outcome, RouteOutcome::NoReply);
        assert_eq!(relay.calls().len(), 1);
        assert!(gateway.sent().is_empty());
    }

    #[test]
    fn test_extraction_order() {
        let extractor = ReplyExtractor::new(
            ["message", "data.message", "response.message"],
            "fallback",
        );

        assert_eq!(
            extractor.extract(&json!({ "message": "top", "data": { "message": "nested" } })),
            "top"
        );
        assert_eq!(
            extractor.extract(&json!({ "message": "", "response": { "message": "deep" } })),
            "deep"
        );
        assert_eq!(extractor.extract(&json!({ "data": { "message": 7 } })), "7");
        assert_eq!(extractor.extract(&json!("plain text body")), "fallback");
    }

    #[test]
    fn test_extraction_paths_are_configurable() {
        let extractor = ReplyExtractor::new(["message", "data.message"], "fallback");

        assert_eq!(
            extractor.extract(&json!({ "response": { "message": "ignored" } })),
            "fallback"
        );
    }
}
