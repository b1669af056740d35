//! C-EnrollToken: token-provisioner adapter over an external CLI sub-process

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use super::Enrollment;
use crate::config::StepCaConfig;
use crate::error::{AgentError, Result};
use crate::eval::ManagedCert;
use crate::store;

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(60);

/// A provisioner password written to a file with 0600 permissions just
/// before the sub-process is spawned, and unlinked unconditionally when this
/// guard is dropped. Never appears in the child's argv.
struct PasswordFileGuard {
    path: PathBuf,
}

impl PasswordFileGuard {
    fn write(password: &str) -> Result<Self> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".provisioner-")
            .suffix(".pwd")
            .tempfile()
            .map_err(AgentError::Io)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(AgentError::Io)?;
        }

        tmp.write_all(password.as_bytes()).map_err(AgentError::Io)?;
        let (_, path) = tmp.keep().map_err(|e| AgentError::Io(e.error))?;
        Ok(PasswordFileGuard { path })
    }
}

impl Drop for PasswordFileGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "failed to remove provisioner password file");
        }
    }
}

struct StepResult {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Adapter for a PKI that exposes a CLI sub-process (e.g. `step`) for
/// bootstrap, token minting, certificate requests, and renewal.
pub struct TokenAdapter {
    step_cli: String,
    config: StepCaConfig,
}

impl TokenAdapter {
    pub fn new(config: &StepCaConfig) -> Result<Self> {
        Ok(TokenAdapter {
            step_cli: "step".to_string(),
            config: config.clone(),
        })
    }

    async fn run(&self, args: &[&str]) -> Result<StepResult> {
        self.run_with_stdin(args, None).await
    }

    async fn run_with_stdin(&self, args: &[&str], stdin_data: Option<&str>) -> Result<StepResult> {
        tracing::debug!(cmd = ?args, "running step command");

        let mut command = Command::new(&self.step_cli);
        command.args(args);
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        if stdin_data.is_some() {
            command.stdin(std::process::Stdio::piped());
        }

        let mut child = command
            .spawn()
            .map_err(|e| AgentError::Process(format!("failed to spawn {}: {e}", self.step_cli)))?;

        if let Some(data) = stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                stdin
                    .write_all(data.as_bytes())
                    .await
                    .map_err(AgentError::Io)?;
            }
        }

        let output = timeout(SUBPROCESS_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| AgentError::Process("step command timed out".to_string()))?
            .map_err(AgentError::Io)?;

        Ok(StepResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn get_provisioner_token(&self, subject: &str, sans: &[String]) -> Result<String> {
        let mut args: Vec<String> = vec![
            "ca".to_string(),
            "token".to_string(),
            subject.to_string(),
            "--provisioner".to_string(),
            self.config.provisioner_name.clone(),
        ];
        for san in sans {
            args.push("--san".to_string());
            args.push(san.clone());
        }

        let _guard;
        if let Some(password) = &self.config.provisioner_password {
            _guard = Some(PasswordFileGuard::write(password)?);
            args.push("--password-file".to_string());
            args.push(_guard.as_ref().unwrap().path.display().to_string());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self.run(&arg_refs).await?;

        if result.success {
            Ok(result.stdout)
        } else {
            Err(AgentError::Auth(format!(
                "failed to obtain provisioner token: {}",
                result.stderr
            )))
        }
    }
}

#[async_trait]
impl Enrollment for TokenAdapter {
    async fn bootstrap(&self) -> Result<()> {
        let result = self
            .run(&[
                "ca",
                "bootstrap",
                "--ca-url",
                &self.config.ca_url,
                "--fingerprint",
                &self.config.ca_fingerprint,
                "--force",
            ])
            .await?;

        if result.success {
            Ok(())
        } else {
            Err(AgentError::Config(format!(
                "failed to bootstrap CA: {}",
                result.stderr
            )))
        }
    }

    async fn enroll(&self, cert: &ManagedCert) -> Result<()> {
        let token = self.get_provisioner_token(&cert.subject, &cert.sans).await?;

        let cert_path = cert.cert_path.display().to_string();
        let key_path = cert.key_path.display().to_string();
        let result = self
            .run(&[
                "ca",
                "certificate",
                &cert.subject,
                &cert_path,
                &key_path,
                "--token",
                &token,
                "--force",
            ])
            .await?;

        if result.success {
            Ok(())
        } else {
            Err(AgentError::RenewalFailed(format!(
                "failed to request certificate: {}",
                result.stderr
            )))
        }
    }

    async fn renew(&self, cert: &ManagedCert) -> Result<()> {
        if !cert.cert_path.exists() || !cert.key_path.exists() {
            return self.enroll(cert).await;
        }

        store::backup(&cert.cert_path)?;
        store::backup(&cert.key_path)?;

        let cert_path = cert.cert_path.display().to_string();
        let key_path = cert.key_path.display().to_string();
        let result = self.run(&["ca", "renew", &cert_path, &key_path, "--force"]).await?;

        if result.success {
            store::discard_backup(&cert.cert_path)?;
            store::discard_backup(&cert.key_path)?;
            Ok(())
        } else {
            tracing::warn!(name = %cert.name, stderr = %result.stderr, "renew failed, restoring backup and requesting fresh certificate");
            store::restore(&cert.cert_path)?;
            store::restore(&cert.key_path)?;
            self.enroll(cert).await
        }
    }

    async fn probe(&self) -> Result<()> {
        let result = self.run(&["ca", "health"]).await?;
        if result.success {
            Ok(())
        } else {
            Err(AgentError::Network(format!(
                "CA health check failed: {}",
                result.stderr
            )))
        }
    }

    async fn verify(&self, cert: &ManagedCert) -> Result<bool> {
        let cert_path = cert.cert_path.display().to_string();
        let result = self
            .run(&["certificate", "verify", &cert_path, "--roots", &self.config.root_cert_path.display().to_string()])
            .await?;
        Ok(result.success)
    }
}
