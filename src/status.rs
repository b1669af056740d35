//! C-Status: immutable status report assembled from one evaluation pass

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::eval::CertStatus;

/// Per-certificate summary embedded in a `StatusReport`.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateSummary {
    pub name: String,
    pub cert_path: std::path::PathBuf,
    pub is_valid: bool,
    pub needs_renewal: bool,
    pub days_until_expiry: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining_lifetime_percent: Option<f64>,
    pub renewal_reason: String,
    pub is_revoked: bool,
    pub revocation_date: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    pub crl_source_url: Option<String>,
    pub error_message: Option<String>,
}

impl From<&CertStatus> for CertificateSummary {
    fn from(status: &CertStatus) -> Self {
        let (revocation_date, revocation_reason, crl_source_url) = match &status.revocation_info {
            Some(info) if status.is_revoked => (
                info.revocation_date,
                info.revocation_reason.clone(),
                info.crl_source_url.clone(),
            ),
            _ => (None, None, None),
        };

        CertificateSummary {
            name: status.name.clone(),
            cert_path: status.path.clone(),
            is_valid: status.is_valid,
            needs_renewal: status.needs_renewal,
            days_until_expiry: status.days_until_expiry,
            expires_at: status.expires_at,
            remaining_lifetime_percent: status.remaining_lifetime_percent,
            renewal_reason: format!("{:?}", status.renewal_reason).to_lowercase(),
            is_revoked: status.is_revoked,
            revocation_date,
            revocation_reason,
            crl_source_url,
            error_message: status.error_message.clone(),
        }
    }
}

/// Aggregate counts across one evaluation pass.
#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct StatusSummary {
    pub valid_certificates: usize,
    pub certificates_needing_renewal: usize,
    pub certificates_with_errors: usize,
    pub revoked_certificates: usize,
}

/// A complete, point-in-time report over every managed certificate.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    pub total_certificates: usize,
    pub certificates: Vec<CertificateSummary>,
    pub summary: StatusSummary,
}

impl StatusReport {
    /// Build a report from one pass's statuses. Does not itself evaluate
    /// certificates; callers assemble the statuses via `eval::evaluate` or
    /// `ControlLoop::check_and_renew` first.
    pub fn from_statuses(statuses: &[CertStatus]) -> Self {
        let summary = StatusSummary {
            valid_certificates: statuses.iter().filter(|s| s.is_valid).count(),
            certificates_needing_renewal: statuses.iter().filter(|s| s.needs_renewal).count(),
            certificates_with_errors: statuses.iter().filter(|s| s.error_message.is_some()).count(),
            revoked_certificates: statuses.iter().filter(|s| s.is_revoked).count(),
        };

        StatusReport {
            timestamp: Utc::now(),
            total_certificates: statuses.len(),
            certificates: statuses.iter().map(CertificateSummary::from).collect(),
            summary,
        }
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        serde_json::to_string_pretty(self).map_err(crate::error::AgentError::from)
    }

    /// Render a plain-text table, one row per certificate, suited for
    /// terminal output.
    pub fn to_table(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{:<20} {:<10} {:<14} {:<10} {:<10}\n",
            "NAME", "VALID", "DAYS LEFT", "RENEW?", "REVOKED"
        ));
        for cert in &self.certificates {
            out.push_str(&format!(
                "{:<20} {:<10} {:<14} {:<10} {:<10}\n",
                cert.name,
                cert.is_valid,
                cert.days_until_expiry.map(|d| d.to_string()).unwrap_or_else(|| "?".to_string()),
                cert.needs_renewal,
                cert.is_revoked,
            ));
        }
        out.push_str(&format!(
            "\n{} total, {} valid, {} need renewal, {} revoked, {} errored\n",
            self.total_certificates,
            self.summary.valid_certificates,
            self.summary.certificates_needing_renewal,
            self.summary.revoked_certificates,
            self.summary.certificates_with_errors,
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::RenewalReason;
    use std::path::PathBuf;

    fn sample_status(needs_renewal: bool, is_revoked: bool) -> CertStatus {
        CertStatus {
            name: "web".to_string(),
            path: PathBuf::from("web.pem"),
            is_valid: !is_revoked,
            expires_at: Some(Utc::now()),
            days_until_expiry: Some(10),
            needs_renewal,
            renewal_reason: if is_revoked { RenewalReason::Revoked } else { RenewalReason::Valid },
            is_revoked,
            revocation_info: None,
            error_message: None,
            remaining_lifetime_percent: Some(50.0),
        }
    }

    #[test]
    fn test_summary_counts() {
        let statuses = vec![sample_status(false, false), sample_status(true, true)];
        let report = StatusReport::from_statuses(&statuses);
        assert_eq!(report.total_certificates, 2);
        assert_eq!(report.summary.valid_certificates, 1);
        assert_eq!(report.summary.certificates_needing_renewal, 1);
        assert_eq!(report.summary.revoked_certificates, 1);
    }

    #[test]
    fn test_to_json_roundtrips_through_serde() {
        let report = StatusReport::from_statuses(&[sample_status(false, false)]);
        let json = report.to_json().unwrap();
        assert!(json.contains("\"name\": \"web\""));
    }

    #[test]
    fn test_to_table_contains_header_and_row() {
        let report = StatusReport::from_statuses(&[sample_status(false, false)]);
        let table = report.to_table();
        assert!(table.contains("NAME"));
        assert!(table.contains("web"));
    }
}
