mod config;
mod lifecycle;
mod lock;
mod monitor;
mod platform;
mod relay;
mod router;
mod scheduler;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use teloxide::Bot;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::lifecycle::{install_fault_hook, wait_for_termination, PollingController};
use crate::lock::{InstanceLock, LockError};
use crate::monitor::HealthMonitor;
use crate::platform::telegram::TelegramGateway;
use crate::platform::{ChatGateway, GatewayEvent};
use crate::relay::{HttpRelayClient, WebhookRelay};
use crate::router::{CommandTable, MessageRouter, ReplyExtractor};
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relaybot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("Fatal error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<u8> {
    // A missing .env file is fine; the variables may come from the environment
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            warn!("Failed to load .env file: {}", e);
        }
    }

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Starting the bot...");
    info!("Webhook URL: {}", config.webhook.url);

    let lock = match InstanceLock::acquire(config.lock_path()?) {
        Ok(lock) => Arc::new(lock),
        Err(e @ LockError::AlreadyRunning { .. }) => {
            error!("{}", e);
            return Ok(1);
        }
        Err(e) => return Err(e.into()),
    };

    let mut faults = install_fault_hook();

    let gateway: Arc<dyn ChatGateway> =
        Arc::new(TelegramGateway::new(Bot::new(&config.telegram.bot_token)));

    let controller = Arc::new(PollingController::new(
        gateway.clone(),
        config.polling.session_options(),
        config.polling.restart_delay(),
        Some(lock),
    ));

    let http = HttpRelayClient::new(
        config.webhook.url.clone(),
        Duration::from_secs(config.webhook.timeout_secs),
    )?;
    let router = Arc::new(MessageRouter::new(
        gateway.clone(),
        WebhookRelay::new(Arc::new(http)),
        CommandTable::default(),
        ReplyExtractor::new(&config.webhook.reply_paths, config.webhook.fallback_reply.clone()),
    ));

    // Subscribe before polling starts so no update is missed
    let events = gateway.subscribe();
    let pump = tokio::spawn(pump_events(events, router, controller.clone()));

    controller.start_polling().await;

    let monitor = Arc::new(HealthMonitor::new(
        gateway.clone(),
        controller.clone(),
        config.health.failure_threshold,
    ));
    let mut scheduler = Scheduler::new().await?;
    scheduler
        .add_repeated_job(config.health.interval(), "health-check", move || {
            let monitor = monitor.clone();
            Box::pin(async move {
                monitor.tick().await;
            })
        })
        .await?;
    scheduler.start().await?;

    let termination = wait_for_termination(&mut faults).await;

    if let Err(e) = scheduler.shutdown().await {
        warn!("{:#}", e);
    }
    controller.shutdown(&termination).await;
    pump.abort();

    Ok(termination.exit_code())
}

/// Fan gateway events out: each message is routed on its own task so slow
/// webhook calls do not hold up later messages.
async fn pump_events(
    mut events: broadcast::Receiver<GatewayEvent>,
    router: Arc<MessageRouter>,
    controller: Arc<PollingController>,
) {
    loop {
        match events.recv().await {
            Ok(GatewayEvent::Message(msg)) => {
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) = router.route(&msg).await {
                        error!("Error handling message from chat {}: {:#}", msg.chat_id, e);
                    }
                });
            }
            Ok(GatewayEvent::TransportError(cause)) => {
                let controller = controller.clone();
                tokio::spawn(async move {
                    controller.handle_transport_error(&cause).await;
                });
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event subscriber lagged, {} events dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
