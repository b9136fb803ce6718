pub mod telegram;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// A text message received from the chat platform
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub text: String,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Events published by a gateway to its subscribers
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Message(InboundMessage),
    /// The long-poll transport reported an error while polling
    TransportError(String),
}

/// Long-poll session parameters
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Pause between consecutive update requests
    pub interval: Duration,
    /// Server-side timeout for a single update request
    pub timeout: Duration,
}

/// Connectivity to a chat platform.
///
/// The lifecycle controller, health monitor and router only talk to the
/// platform through this trait, so tests can swap in a fake.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Open a long-poll session. Fails if the session could not be started.
    async fn start_session(&self, options: SessionOptions) -> Result<()>;

    /// Stop the current session. Stopping an idle gateway is a no-op.
    async fn stop_session(&self) -> Result<()>;

    /// Lightweight liveness check against the platform API
    async fn check_health(&self) -> Result<()>;

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()>;

    /// Receive inbound messages and transport errors
    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent>;
}
