use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::lifecycle::{PollingController, PollingState};
use crate::platform::ChatGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    /// Check failed; carries the consecutive failure count
    Unhealthy(u32),
    /// Threshold reached and a restart cycle was forced
    Restarted,
    Skipped,
}

/// Periodic liveness check that forces a reconnect after repeated failures.
///
/// Catches stalls the long-poll transport does not report on its own.
pub struct HealthMonitor {
    gateway: Arc<dyn ChatGateway>,
    controller: Arc<PollingController>,
    failure_threshold: u32,
    failures: AtomicU32,
}

impl HealthMonitor {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        controller: Arc<PollingController>,
        failure_threshold: u32,
    ) -> Self {
        Self {
            gateway,
            controller,
            failure_threshold: failure_threshold.max(1),
            failures: AtomicU32::new(0),
        }
    }

    /// Run one health check
    pub async fn tick(&self) -> HealthOutcome {
        if self.controller.is_closed() {
            return HealthOutcome::Skipped;
        }

        match self.gateway.check_health().await {
            Ok(()) => {
                self.failures.store(0, Ordering::SeqCst);
                if self.controller.state() == PollingState::Stopped {
                    info!("Health check passed while stopped, starting polling");
                    self.controller.start_polling().await;
                } else {
                    debug!("Health check passed");
                }
                HealthOutcome::Healthy
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "Health check failed ({}/{}): {:#}",
                    failures, self.failure_threshold, e
                );

                if failures < self.failure_threshold {
                    return HealthOutcome::Unhealthy(failures);
                }

                warn!("Health check threshold reached, restarting polling");
                self.failures.store(0, Ordering::SeqCst);
                self.controller.force_restart().await;
                HealthOutcome::Restarted
            }
        }
    }
}
