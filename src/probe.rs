//! Readiness probing for sandboxed services.

use std::time::{Duration, Instant};

use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::sandbox::{SandboxSession, SessionState};

/// Placeholder log excerpt when the container printed nothing.
const NO_OUTPUT: &str = "(no container output captured)";

/// Polls a sandbox until its health endpoint answers.
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    client: reqwest::Client,
    config: ProbeConfig,
}

impl ReadinessProber {
    pub fn new(config: ProbeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Waits until `GET {base_url}{health_path}` returns a status below 500.
    ///
    /// Gives up once `budget` has elapsed and reports the tail of the
    /// container's console. Returns within `budget` plus one polling interval.
    pub async fn wait_until_ready(
        &self,
        session: &mut SandboxSession,
        health_path: &str,
        budget: Duration,
    ) -> Result<()> {
        let url = format!("{}{}", session.base_url(), health_path);
        let interval = self.config.poll_interval();
        let started = Instant::now();
        let mut attempts = 0u32;

        tracing::info!(
            session_id = %session.id(),
            url = %url,
            budget_secs = budget.as_secs(),
            "waiting for sandbox readiness"
        );

        loop {
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }

            attempts += 1;
            let attempt_timeout = self.config.request_timeout().min(remaining);
            match self.client.get(&url).timeout(attempt_timeout).send().await {
                Ok(response) if response.status().as_u16() < 500 => {
                    session.mark_ready();
                    tracing::info!(
                        session_id = %session.id(),
                        status = response.status().as_u16(),
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "sandbox is ready"
                    );
                    return Ok(());
                }
                Ok(response) => {
                    tracing::debug!(
                        session_id = %session.id(),
                        status = response.status().as_u16(),
                        attempts,
                        "health check not ready"
                    );
                }
                Err(e) => {
                    tracing::debug!(session_id = %session.id(), error = %e, attempts, "health check failed");
                }
            }

            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(interval.min(remaining)).await;
        }

        session.transition(SessionState::Failed);

        let mut log_tail = session.log_tail();
        if log_tail.trim().is_empty() {
            log_tail = NO_OUTPUT.to_string();
        }

        tracing::error!(
            session_id = %session.id(),
            attempts,
            waited_secs = started.elapsed().as_secs(),
            "sandbox never became healthy"
        );

        Err(Error::HealthTimeout {
            waited: started.elapsed(),
            log_tail,
        })
    }
}
