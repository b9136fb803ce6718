use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::lock::InstanceLock;
use crate::platform::{ChatGateway, SessionOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingState {
    Stopped,
    Starting,
    Polling,
    Restarting,
}

/// Why the process is shutting down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Signal(&'static str),
    Fault(String),
}

impl Termination {
    pub fn exit_code(&self) -> u8 {
        match self {
            Termination::Signal(_) => 0,
            Termination::Fault(_) => 1,
        }
    }
}

/// Owns the polling session state and the process teardown.
///
/// State changes happen in short critical sections; the gateway is never
/// called while the state lock is held.
pub struct PollingController {
    gateway: Arc<dyn ChatGateway>,
    options: SessionOptions,
    restart_delay: Duration,
    state: Mutex<PollingState>,
    /// Set when the transport fails before the start has finished
    failed_while_starting: AtomicBool,
    closed: AtomicBool,
    lock: Option<Arc<InstanceLock>>,
}

impl PollingController {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        options: SessionOptions,
        restart_delay: Duration,
        lock: Option<Arc<InstanceLock>>,
    ) -> Self {
        Self {
            gateway,
            options,
            restart_delay,
            state: Mutex::new(PollingState::Stopped),
            failed_while_starting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lock,
        }
    }

    pub fn state(&self) -> PollingState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: PollingState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Open a poll session unless one is already active or starting.
    /// Returns whether the controller is polling afterwards.
    ///
    /// A transport failure reported before the start completes makes the
    /// freshly opened session get stopped and reopened after the backoff.
    pub async fn start_polling(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != PollingState::Stopped {
                return *state == PollingState::Polling;
            }
            *state = PollingState::Starting;
            self.failed_while_starting.store(false, Ordering::SeqCst);
        }

        loop {
            match self.gateway.start_session(self.options).await {
                Ok(()) if self.closed.load(Ordering::SeqCst) => {
                    // Shutdown raced with the start; do not leave a session behind
                    if let Err(e) = self.gateway.stop_session().await {
                        warn!("Failed to stop session opened during shutdown: {:#}", e);
                    }
                    self.set_state(PollingState::Stopped);
                    return false;
                }
                Ok(()) => {
                    let failed = {
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        let failed = self.failed_while_starting.swap(false, Ordering::SeqCst);
                        if !failed {
                            *state = PollingState::Polling;
                        }
                        failed
                    };
                    if !failed {
                        info!("Polling started");
                        return true;
                    }

                    warn!("Polling transport failed while starting; restarting the bot");
                    if let Err(e) = self.gateway.stop_session().await {
                        warn!("Failed to stop polling session: {:#}", e);
                    }
                    tokio::time::sleep(self.restart_delay).await;
                    if self.closed.load(Ordering::SeqCst) {
                        self.set_state(PollingState::Stopped);
                        return false;
                    }
                }
                Err(e) => {
                    self.set_state(PollingState::Stopped);
                    error!("Error starting polling: {:#}", e);
                    return false;
                }
            }
        }
    }

    /// React to a transport failure reported while polling: stop the
    /// session, wait out the backoff, then try exactly one restart.
    /// Errors are logged, never returned.
    pub async fn handle_transport_error(&self, cause: &str) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                PollingState::Polling => *state = PollingState::Restarting,
                PollingState::Starting => {
                    // Picked up by start_polling once the start returns
                    self.failed_while_starting.store(true, Ordering::SeqCst);
                    warn!("Polling transport error while starting: {}", cause);
                    return;
                }
                PollingState::Stopped | PollingState::Restarting => return,
            }
        }
        warn!("Polling transport error: {}; restarting the bot", cause);

        if let Err(e) = self.gateway.stop_session().await {
            warn!("Failed to stop polling session: {:#}", e);
        }
        self.set_state(PollingState::Stopped);

        tokio::time::sleep(self.restart_delay).await;
        self.start_polling().await;
    }

    /// Stop and immediately reopen the session, whatever its current state
    pub async fn force_restart(&self) -> bool {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, PollingState::Starting | PollingState::Restarting) {
                // Another start/restart is in flight
                return false;
            }
            std::mem::replace(&mut *state, PollingState::Restarting)
        };
        info!("Forcing polling restart (was {:?})", previous);

        if let Err(e) = self.gateway.stop_session().await {
            warn!("Failed to stop polling session: {:#}", e);
        }
        self.set_state(PollingState::Stopped);
        self.start_polling().await
    }

    /// Stop polling and release the instance lock. Only the first call
    /// does anything; later calls return immediately.
    pub async fn shutdown(&self, reason: &Termination) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping the bot ({:?})", reason);

        if self.state() != PollingState::Stopped {
            if let Err(e) = self.gateway.stop_session().await {
                warn!("Failed to stop polling session: {:#}", e);
            }
            self.set_state(PollingState::Stopped);
        }

        if let Some(lock) = &self.lock {
            lock.release();
        }
        info!("Bot stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Route panics from any task into the shutdown path. The returned receiver
/// yields the panic message; the previous hook still runs afterwards.
pub fn install_fault_hook() -> mpsc::UnboundedReceiver<String> {
    let (faults, receiver) = mpsc::unbounded_channel();
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("Uncaught fault: {}", info);
        let _ = faults.send(info.to_string());
        previous(info);
    }));
    receiver
}

/// Resolve on SIGINT, SIGTERM or the first reported fault
pub async fn wait_for_termination(faults: &mut mpsc::UnboundedReceiver<String>) -> Termination {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => Termination::Signal("SIGINT"),
        _ = terminate => Termination::Signal("SIGTERM"),
        Some(fault) = faults.recv() => Termination::Fault(fault),
    }
}
