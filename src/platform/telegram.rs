use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, UpdateKind};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::platform::{ChatGateway, GatewayEvent, InboundMessage, SessionOptions};

const EVENT_BUFFER: usize = 256;

/// A running getUpdates loop
struct Session {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Telegram implementation of [`ChatGateway`] on top of teloxide
pub struct TelegramGateway {
    bot: Bot,
    events: broadcast::Sender<GatewayEvent>,
    /// Next update id to request; survives session restarts so updates
    /// are not delivered twice.
    offset: Arc<AtomicI32>,
    session: Mutex<Option<Session>>,
}

impl TelegramGateway {
    pub fn new(bot: Bot) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            bot,
            events,
            offset: Arc::new(AtomicI32::new(0)),
            session: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ChatGateway for TelegramGateway {
    async fn start_session(&self, options: SessionOptions) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(running) = session.as_ref() {
            if !running.handle.is_finished() {
                return Ok(());
            }
        }

        let me = self
            .bot
            .get_me()
            .await
            .context("Failed to verify bot token")?;
        info!(
            "Bot authenticated: @{} (ID: {})",
            me.username.as_deref().unwrap_or("unknown"),
            me.id
        );

        // Long polling is rejected while a webhook is registered
        self.bot
            .delete_webhook()
            .await
            .context("Failed to clear webhook registration")?;

        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(poll_updates(
            self.bot.clone(),
            options,
            Arc::clone(&self.offset),
            self.events.clone(),
            stop_rx,
        ));

        *session = Some(Session { stop, handle });
        Ok(())
    }

    async fn stop_session(&self) -> Result<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        // The loop may already have exited on a transport error
        let _ = session.stop.send(());
        session
            .handle
            .await
            .context("Polling task terminated abnormally")?;
        debug!("Polling session stopped");
        Ok(())
    }

    async fn check_health(&self) -> Result<()> {
        if let Some(session) = self.session.lock().await.as_ref() {
            if session.handle.is_finished() {
                anyhow::bail!("Polling loop has exited");
            }
        }
        self.bot.get_me().await.context("getMe health check failed")?;
        Ok(())
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .await
            .with_context(|| format!("Failed to send message to chat {}", chat_id))?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }
}

/// Long-poll getUpdates until stopped or until the transport fails.
/// A failure is published as [`GatewayEvent::TransportError`] and ends the loop.
async fn poll_updates(
    bot: Bot,
    options: SessionOptions,
    offset: Arc<AtomicI32>,
    events: broadcast::Sender<GatewayEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let timeout_secs = options.timeout.as_secs() as u32;

    loop {
        let request = bot
            .get_updates()
            .offset(offset.load(Ordering::SeqCst))
            .timeout(timeout_secs)
            .allowed_updates(vec![AllowedUpdate::Message]);

        let updates = tokio::select! {
            _ = &mut stop => break,
            result = request.send() => result,
        };

        match updates {
            Ok(updates) => {
                for update in updates {
                    offset.store(update.id.0 as i32 + 1, Ordering::SeqCst);
                    if let UpdateKind::Message(msg) = update.kind {
                        if let Some(inbound) = to_inbound(&msg) {
                            // No subscribers only happens during shutdown
                            let _ = events.send(GatewayEvent::Message(inbound));
                        }
                    }
                }
            }
            Err(e) => {
                error!("Polling error: {}", e);
                let _ = events.send(GatewayEvent::TransportError(e.to_string()));
                break;
            }
        }

        tokio::select! {
            _ = &mut stop => break,
            _ = tokio::time::sleep(options.interval) => {}
        }
    }
}

fn to_inbound(msg: &Message) -> Option<InboundMessage> {
    let text = match msg.text() {
        Some(t) => t.to_string(),
        None => {
            debug!("Ignoring non-text message in chat {}", msg.chat.id);
            return None;
        }
    };

    let user = match msg.from.as_ref() {
        Some(user) => user,
        None => {
            warn!("Ignoring message without sender in chat {}", msg.chat.id);
            return None;
        }
    };

    Some(InboundMessage {
        chat_id: msg.chat.id.0,
        text,
        username: user.username.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        received_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check_fails_when_poll_loop_exited() {
        let gateway = TelegramGateway::new(Bot::new("123456:TEST"));
        let (stop, _stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async {});
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        *gateway.session.lock().await = Some(Session { stop, handle });

        let err = gateway.check_health().await.unwrap_err();

        assert!(err.to_string().contains("Polling loop has exited"));
    }
}
