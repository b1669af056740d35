//! Configuration for the certificate lifecycle agent
//!
//! Supports both TOML (this crate's native format) and YAML (the format
//! carried over from the original proof-of-concept) since either can be
//! loaded from the same typed shape.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Minutes between certificate checks
    #[serde(default = "default_check_interval")]
    pub check_interval_minutes: u64,

    /// Service default: renew when remaining lifetime is at or below this
    /// percentage (0-100) of total lifetime
    #[serde(default = "default_renewal_threshold_percent")]
    pub renewal_threshold_percent: f64,

    /// `renewal_reason` ladder bound: days until expiry at or below this is
    /// "emergency"
    #[serde(default = "default_emergency_threshold_days")]
    pub emergency_renewal_threshold_days: i64,

    /// `renewal_reason` ladder bound: days until expiry at or below this is
    /// "warning"/"approaching"
    #[serde(default = "default_warning_threshold_days")]
    pub warning_threshold_days: i64,

    /// Root directory for certificate/key artifacts
    #[serde(default = "default_cert_storage_path")]
    pub cert_storage_path: PathBuf,

    /// CA connection and protocol configuration
    pub step_ca: StepCaConfig,

    /// Certificates to monitor and renew
    #[serde(default)]
    pub certificates: Vec<CertificateEntry>,
}

fn default_check_interval() -> u64 {
    30
}
fn default_renewal_threshold_percent() -> f64 {
    33.0
}
fn default_emergency_threshold_days() -> i64 {
    7
}
fn default_warning_threshold_days() -> i64 {
    14
}
fn default_cert_storage_path() -> PathBuf {
    PathBuf::from("certs")
}

/// Either the legacy absolute-day threshold or the preferred
/// percent-of-lifetime threshold for a single certificate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RenewalThreshold {
    /// Percentage of total certificate lifetime remaining
    Percent(f64),
    /// Absolute day count before expiry
    Days(i64),
}

/// A single certificate to monitor and renew
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateEntry {
    /// Unique name for this certificate
    pub name: String,
    /// Path to the certificate (chain) file
    pub cert_path: PathBuf,
    /// Path to the private key file
    pub key_path: PathBuf,
    /// Common name to request
    pub subject: String,
    /// Subject alternative names (DNS labels or IP literals)
    #[serde(default)]
    pub sans: Vec<String>,
    /// Per-certificate renewal threshold overriding the service default
    #[serde(default)]
    pub renewal_threshold: Option<RenewalThreshold>,
}

/// CA connection, protocol, and CRL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCaConfig {
    /// CA server URL
    pub ca_url: String,
    /// CA root certificate fingerprint, used for token-protocol bootstrap
    #[serde(default)]
    pub ca_fingerprint: String,
    /// Path to the pinned CA root certificate
    pub root_cert_path: PathBuf,

    /// Selects the enrollment adapter
    #[serde(default)]
    pub protocol: Protocol,

    /// Provisioner name (token protocol)
    #[serde(default)]
    pub provisioner_name: String,
    /// Provisioner password (token protocol)
    #[serde(default)]
    pub provisioner_password: Option<String>,
    /// Provisioner private key path (token protocol)
    #[serde(default)]
    pub provisioner_key_path: Option<PathBuf>,

    /// EST HTTP Basic username
    #[serde(default)]
    pub est_username: Option<String>,
    /// EST HTTP Basic password
    #[serde(default)]
    pub est_password: Option<String>,
    /// EST client certificate (mTLS)
    #[serde(default)]
    pub est_client_cert: Option<PathBuf>,
    /// EST client key (mTLS)
    #[serde(default)]
    pub est_client_key: Option<PathBuf>,
    /// EST CA bundle for TLS trust
    #[serde(default)]
    pub est_ca_bundle: Option<PathBuf>,

    /// Master switch for CRL checking
    #[serde(default = "default_true")]
    pub crl_enabled: bool,
    /// Additional CRL sources unioned with the certificate's own CDPs
    #[serde(default)]
    pub crl_urls: Vec<String>,
    /// Directory used to cache downloaded CRLs
    #[serde(default = "default_crl_cache_dir")]
    pub crl_cache_dir: PathBuf,
    /// Hours between forced CRL refresh
    #[serde(default = "default_crl_refresh_hours")]
    pub crl_refresh_hours: i64,
    /// Timeout, in seconds, for CRL downloads
    #[serde(default = "default_crl_timeout_seconds")]
    pub crl_timeout_seconds: u64,
}

fn default_true() -> bool {
    true
}
fn default_crl_cache_dir() -> PathBuf {
    PathBuf::from("certs/crl")
}
fn default_crl_refresh_hours() -> i64 {
    24
}
fn default_crl_timeout_seconds() -> u64 {
    30
}

/// Enrollment protocol selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Token-provisioner protocol via an external CLI sub-process
    #[default]
    Jwk,
    /// RFC 7030 EST over HTTPS
    Est,
}

impl Config {
    /// Load configuration from a file, dispatching on extension
    /// (`.yaml`/`.yml` -> YAML, everything else -> TOML).
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        let config: Config = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Serialize and write this configuration as TOML
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    /// Basic shape/consistency validation; full schema validation is out of
    /// scope for this crate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.renewal_threshold_percent) {
            return Err(ConfigError::InvalidConfig(
                "renewal_threshold_percent must be between 0 and 100".to_string(),
            ));
        }

        if self.step_ca.ca_url.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "step_ca.ca_url must not be empty".to_string(),
            ));
        }

        match self.step_ca.protocol {
            Protocol::Jwk => {
                if self.step_ca.provisioner_name.is_empty() {
                    return Err(ConfigError::InvalidConfig(
                        "step_ca.provisioner_name is required for the JWK protocol".to_string(),
                    ));
                }
            }
            Protocol::Est => {
                let has_basic =
                    self.step_ca.est_username.is_some() && self.step_ca.est_password.is_some();
                let has_mtls =
                    self.step_ca.est_client_cert.is_some() && self.step_ca.est_client_key.is_some();
                if !has_basic && !has_mtls {
                    return Err(ConfigError::InvalidConfig(
                        "step_ca protocol EST requires either est_username/est_password or \
                         est_client_cert/est_client_key"
                            .to_string(),
                    ));
                }
            }
        }

        for cert in &self.certificates {
            if cert.name.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "certificate entries must have a non-empty name".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Write an annotated example configuration file to `path`
    pub fn create_example(path: &Path) -> Result<(), ConfigError> {
        let example = Config {
            check_interval_minutes: default_check_interval(),
            renewal_threshold_percent: default_renewal_threshold_percent(),
            emergency_renewal_threshold_days: default_emergency_threshold_days(),
            warning_threshold_days: default_warning_threshold_days(),
            cert_storage_path: default_cert_storage_path(),
            step_ca: StepCaConfig {
                ca_url: "https://ca.example.com:9000".to_string(),
                ca_fingerprint: "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcd"
                    .to_string(),
                root_cert_path: PathBuf::from("certs/root_ca.crt"),
                protocol: Protocol::Jwk,
                provisioner_name: "admin".to_string(),
                provisioner_password: None,
                provisioner_key_path: None,
                est_username: None,
                est_password: None,
                est_client_cert: None,
                est_client_key: None,
                est_ca_bundle: None,
                crl_enabled: true,
                crl_urls: vec![],
                crl_cache_dir: default_crl_cache_dir(),
                crl_refresh_hours: default_crl_refresh_hours(),
                crl_timeout_seconds: default_crl_timeout_seconds(),
            },
            certificates: vec![CertificateEntry {
                name: "web-server".to_string(),
                cert_path: PathBuf::from("certs/web-server/cert.pem"),
                key_path: PathBuf::from("certs/web-server/key.pem"),
                subject: "web-server.example.com".to_string(),
                sans: vec!["web-server.example.com".to_string()],
                renewal_threshold: None,
            }],
        };

        example.save(path)?;
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            check_interval_minutes: 30,
            renewal_threshold_percent: 33.0,
            emergency_renewal_threshold_days: 7,
            warning_threshold_days: 14,
            cert_storage_path: PathBuf::from("certs"),
            step_ca: StepCaConfig {
                ca_url: "https://ca.example.com:9000".to_string(),
                ca_fingerprint: "abc".to_string(),
                root_cert_path: PathBuf::from("certs/root.crt"),
                protocol: Protocol::Jwk,
                provisioner_name: "admin".to_string(),
                provisioner_password: None,
                provisioner_key_path: None,
                est_username: None,
                est_password: None,
                est_client_cert: None,
                est_client_key: None,
                est_ca_bundle: None,
                crl_enabled: true,
                crl_urls: vec![],
                crl_cache_dir: PathBuf::from("certs/crl"),
                crl_refresh_hours: 24,
                crl_timeout_seconds: 30,
            },
            certificates: vec![],
        }
    }

    #[test]
    fn test_validate_requires_provisioner_for_jwk() {
        let mut config = sample();
        config.step_ca.provisioner_name = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_est_credentials() {
        let mut config = sample();
        config.step_ca.protocol = Protocol::Est;
        assert!(config.validate().is_err());

        config.step_ca.est_username = Some("user".to_string());
        config.step_ca.est_password = Some("pass".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_percent() {
        let mut config = sample();
        config.renewal_threshold_percent = 150.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = sample();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.step_ca.ca_url, config.step_ca.ca_url);
    }
}
