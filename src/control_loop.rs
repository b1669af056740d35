//! C-Loop: the daemon's state machine driving periodic check-and-renew passes

use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;

use crate::config::Config;
use crate::enroll::{Adapter, Enrollment};
use crate::error::Result;
use crate::eval::{self, CertStatus};
use crate::crl::CrlManager;

/// Sub-sleep granularity while waiting for the next check; keeps shutdown
/// latency bounded regardless of `check_interval_minutes`.
const WAKE_GRANULARITY: Duration = Duration::from_secs(60);

/// Long-running certificate monitoring and renewal loop.
pub struct ControlLoop {
    config: Config,
    adapter: Adapter,
    crl: CrlManager,
}

impl ControlLoop {
    pub fn new(config: Config) -> Result<Self> {
        let adapter = Adapter::from_config(&config)?;
        let crl = CrlManager::new(&config.step_ca)?;
        Ok(ControlLoop { config, adapter, crl })
    }

    /// Create storage directories and verify CA connectivity. Fatal on
    /// failure: the daemon should not start serving a CA it cannot reach.
    pub async fn initialize(&self) -> Result<()> {
        tracing::info!("initializing certificate lifecycle agent");

        std::fs::create_dir_all(&self.config.cert_storage_path)?;
        std::fs::create_dir_all(&self.config.step_ca.crl_cache_dir)?;

        for cert in &self.config.certificates {
            if let Some(parent) = cert.cert_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if let Some(parent) = cert.key_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        self.adapter.bootstrap().await?;
        self.adapter.probe().await?;

        if self.config.certificates.is_empty() {
            tracing::warn!("no certificates configured for monitoring");
        }

        tracing::info!("initialization complete");
        Ok(())
    }

    /// Evaluate every managed certificate without renewing anything; used by
    /// the `status` and `crl` CLI surfaces.
    pub async fn evaluate_all(&self) -> Vec<CertStatus> {
        let now = Utc::now();
        let mut statuses = Vec::with_capacity(self.config.certificates.len());
        for cert in &self.config.certificates {
            statuses.push(eval::evaluate(cert, now, &self.config, &self.crl).await);
        }
        statuses
    }

    /// Evaluate every managed certificate, renewing and re-verifying those
    /// that need it. A single certificate's failure is isolated and does not
    /// abort the rest of the pass.
    pub async fn check_and_renew(&self) -> Vec<CertStatus> {
        tracing::info!("starting certificate check and renewal pass");
        let now = Utc::now();
        let mut statuses = Vec::with_capacity(self.config.certificates.len());

        for cert in &self.config.certificates {
            let mut status = eval::evaluate(cert, now, &self.config, &self.crl).await;

            if status.needs_renewal && status.error_message.is_none() {
                tracing::info!(name = %cert.name, reason = ?status.renewal_reason, "renewing certificate");
                match self.adapter.renew(cert).await {
                    Ok(()) => match self.adapter.verify(cert).await {
                        Ok(true) => {
                            tracing::info!(name = %cert.name, "renewal verified");
                            status = eval::evaluate(cert, Utc::now(), &self.config, &self.crl).await;
                        }
                        Ok(false) => {
                            tracing::error!(name = %cert.name, "renewed certificate failed verification");
                            status.error_message =
                                Some("certificate verification failed after renewal".to_string());
                        }
                        Err(e) => {
                            tracing::error!(name = %cert.name, error = %e, "verification error after renewal");
                            status.error_message = Some(format!("verification error: {e}"));
                        }
                    },
                    Err(e) => {
                        tracing::error!(name = %cert.name, error = %e, "renewal failed");
                        status.error_message = Some(format!("renewal failed: {e}"));
                    }
                }
            }

            statuses.push(status);
        }

        let renewed = statuses.iter().filter(|s| !s.needs_renewal).count();
        let errored = statuses.iter().filter(|s| s.error_message.is_some()).count();
        tracing::info!(
            renewed,
            errored,
            total = statuses.len(),
            "certificate check and renewal pass completed"
        );

        statuses
    }

    /// Run the daemon loop until `shutdown` resolves. Wakes in one-minute
    /// increments between passes so shutdown latency is bounded.
    pub async fn run<F>(&self, mut shutdown: F)
    where
        F: FnMut() -> bool,
    {
        tracing::info!(
            interval_minutes = self.config.check_interval_minutes,
            "starting certificate renewal daemon"
        );

        while !shutdown() {
            self.check_and_renew().await;

            let total_sleep = Duration::from_secs(self.config.check_interval_minutes * 60);
            let mut elapsed = Duration::ZERO;
            while elapsed < total_sleep && !shutdown() {
                let remaining = total_sleep - elapsed;
                let nap = remaining.min(WAKE_GRANULARITY);
                sleep(nap).await;
                elapsed += nap;
            }
        }

        tracing::info!("certificate renewal daemon stopped");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    pub fn crl(&self) -> &CrlManager {
        &self.crl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, StepCaConfig};
    use std::path::PathBuf;

    fn sample_config() -> Config {
        Config {
            check_interval_minutes: 30,
            renewal_threshold_percent: 33.0,
            emergency_renewal_threshold_days: 7,
            warning_threshold_days: 14,
            cert_storage_path: PathBuf::from("/tmp/cert-agent-test/certs"),
            step_ca: StepCaConfig {
                ca_url: "https://ca.example.com:9000".to_string(),
                ca_fingerprint: "abc".to_string(),
                root_cert_path: PathBuf::from("/tmp/cert-agent-test/root.crt"),
                protocol: Protocol::Jwk,
                provisioner_name: "admin".to_string(),
                provisioner_password: None,
                provisioner_key_path: None,
                est_username: None,
                est_password: None,
                est_client_cert: None,
                est_client_key: None,
                est_ca_bundle: None,
                crl_enabled: false,
                crl_urls: vec![],
                crl_cache_dir: PathBuf::from("/tmp/cert-agent-test/crl"),
                crl_refresh_hours: 24,
                crl_timeout_seconds: 5,
            },
            certificates: vec![],
        }
    }

    #[tokio::test]
    async fn test_check_and_renew_empty_config_returns_no_statuses() {
        let control = ControlLoop::new(sample_config()).unwrap();
        let statuses = control.check_and_renew().await;
        assert!(statuses.is_empty());
    }

    #[tokio::test]
    async fn test_run_exits_immediately_when_shutdown_is_already_set() {
        let control = ControlLoop::new(sample_config()).unwrap();
        control.run(|| true).await;
    }
}
