//! C-Eval: certificate state evaluator

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{CertificateEntry, Config, RenewalThreshold};
use crate::crl::{CrlManager, RevocationStatus};
use crate::store;

/// A certificate the agent is responsible for monitoring and renewing.
/// Configuration-declared, long-lived for the process lifetime.
pub type ManagedCert = CertificateEntry;

/// `renewal_reason` ladder outcome (first match wins)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenewalReason {
    Valid,
    Approaching,
    Warning,
    Normal,
    Emergency,
    Expired,
    Revoked,
    Error,
}

/// Per-pass evaluation output for one managed certificate
#[derive(Debug, Clone, Serialize)]
pub struct CertStatus {
    pub name: String,
    pub path: std::path::PathBuf,
    pub is_valid: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_until_expiry: Option<i64>,
    pub needs_renewal: bool,
    pub renewal_reason: RenewalReason,
    pub is_revoked: bool,
    pub revocation_info: Option<RevocationStatus>,
    pub error_message: Option<String>,
    pub remaining_lifetime_percent: Option<f64>,
}

impl CertStatus {
    fn error(cert: &ManagedCert, message: String) -> Self {
        CertStatus {
            name: cert.name.clone(),
            path: cert.cert_path.clone(),
            is_valid: false,
            expires_at: None,
            days_until_expiry: None,
            needs_renewal: true,
            renewal_reason: RenewalReason::Error,
            is_revoked: false,
            revocation_info: None,
            error_message: Some(message),
            remaining_lifetime_percent: None,
        }
    }
}

/// Resolve the effective renewal threshold, in days, for `cert` against
/// `not_before`/`not_after`: per-certificate value wins over the service
/// default; a percent value is converted against total lifetime.
fn effective_threshold_days(
    cert: &ManagedCert,
    config: &Config,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> i64 {
    let lifetime_days = (not_after - not_before).num_seconds() as f64 / 86_400.0;

    match cert.renewal_threshold {
        Some(RenewalThreshold::Days(days)) => days,
        Some(RenewalThreshold::Percent(pct)) => (pct / 100.0 * lifetime_days).round() as i64,
        None => (config.renewal_threshold_percent / 100.0 * lifetime_days).round() as i64,
    }
}

/// Evaluate one managed certificate against the current time and configured
/// policy, consulting the CRL manager for revocation if enabled.
pub async fn evaluate(
    cert: &ManagedCert,
    now: DateTime<Utc>,
    config: &Config,
    crl: &CrlManager,
) -> CertStatus {
    let bytes = match store::read(&cert.cert_path) {
        Ok(b) => b,
        Err(e) => return CertStatus::error(cert, format!("failed to read certificate: {e}")),
    };

    let parsed = match crate::parse::parse_certificate(&bytes) {
        Ok(p) => p,
        Err(e) => return CertStatus::error(cert, format!("failed to parse certificate: {e}")),
    };

    let days_until_expiry = (parsed.not_after - now).num_seconds().div_euclid(86_400);
    let threshold_days = effective_threshold_days(cert, config, parsed.not_before, parsed.not_after);
    let needs_renewal_by_time = days_until_expiry <= threshold_days;

    let is_time_valid = now >= parsed.not_before && now <= parsed.not_after;

    let mut is_revoked = false;
    let mut revocation_info = None;
    if config.step_ca.crl_enabled && is_time_valid {
        let status = crl.check(&parsed).await;
        is_revoked = status.is_revoked;
        revocation_info = Some(status);
    }

    let needs_renewal = is_revoked || needs_renewal_by_time;
    let is_valid = is_time_valid && !is_revoked;

    let emergency = config.emergency_renewal_threshold_days;
    let warning = config.warning_threshold_days;

    let renewal_reason = if is_revoked {
        RenewalReason::Revoked
    } else if days_until_expiry < 0 {
        RenewalReason::Expired
    } else if days_until_expiry <= emergency {
        RenewalReason::Emergency
    } else if days_until_expiry <= warning {
        if needs_renewal {
            RenewalReason::Warning
        } else {
            RenewalReason::Approaching
        }
    } else if needs_renewal {
        RenewalReason::Normal
    } else {
        RenewalReason::Valid
    };

    let lifetime_days = (parsed.not_after - parsed.not_before).num_seconds() as f64 / 86_400.0;
    let remaining_lifetime_percent = if lifetime_days > 0.0 {
        Some((100.0 * days_until_expiry as f64 / lifetime_days).clamp(f64::MIN, 100.0))
    } else {
        None
    };

    CertStatus {
        name: cert.name.clone(),
        path: cert.cert_path.clone(),
        is_valid,
        expires_at: Some(parsed.not_after),
        days_until_expiry: Some(days_until_expiry),
        needs_renewal,
        renewal_reason,
        is_revoked,
        revocation_info,
        error_message: None,
        remaining_lifetime_percent,
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
            cert_storage_path: PathBuf::from("certs"),
            step_ca: StepCaConfig {
                ca_url: "https://ca.example.com:9000".to_string(),
                ca_fingerprint: String::new(),
                root_cert_path: PathBuf::from("root.crt"),
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
                crl_cache_dir: PathBuf::from("crl"),
                crl_refresh_hours: 24,
                crl_timeout_seconds: 30,
            },
            certificates: vec![],
        }
    }

    fn sample_cert() -> ManagedCert {
        ManagedCert {
            name: "test".to_string(),
            cert_path: PathBuf::from("test.pem"),
            key_path: PathBuf::from("test.key"),
            subject: "test.example.com".to_string(),
            sans: vec![],
            renewal_threshold: None,
        }
    }

    #[test]
    fn test_effective_threshold_prefers_per_cert_days() {
        let config = sample_config();
        let mut cert = sample_cert();
        cert.renewal_threshold = Some(RenewalThreshold::Days(10));
        let now = Utc::now();
        let not_after = now + chrono::Duration::days(60);
        assert_eq!(effective_threshold_days(&cert, &config, now, not_after), 10);
    }

    #[test]
    fn test_effective_threshold_percent_of_lifetime() {
        let config = sample_config();
        let mut cert = sample_cert();
        cert.renewal_threshold = Some(RenewalThreshold::Percent(50.0));
        let not_before = Utc::now();
        let not_after = not_before + chrono::Duration::days(100);
        assert_eq!(
            effective_threshold_days(&cert, &config, not_before, not_after),
            50
        );
    }

    #[test]
    fn test_effective_threshold_falls_back_to_service_default() {
        let config = sample_config();
        let cert = sample_cert();
        let not_before = Utc::now();
        let not_after = not_before + chrono::Duration::days(90);
        // 33% of 90 days = ~30 days
        assert_eq!(
            effective_threshold_days(&cert, &config, not_before, not_after),
            30
        );
    }
}
