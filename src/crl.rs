//! C-CRL: CRL acquisition, cache, freshness policy, and revocation lookup

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::StepCaConfig;
use crate::parse::{parse_crl, ParsedCert, ParsedCrl};
use crate::store;

/// Result of a revocation check against the union of configured and
/// certificate-embedded CRL sources.
#[derive(Debug, Clone, Serialize)]
pub struct RevocationStatus {
    pub is_revoked: bool,
    pub revocation_date: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    pub crl_source_url: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl RevocationStatus {
    fn not_revoked() -> Self {
        RevocationStatus {
            is_revoked: false,
            revocation_date: None,
            revocation_reason: None,
            crl_source_url: None,
            checked_at: Utc::now(),
        }
    }
}

/// An in-memory cache slot: the last successfully parsed CRL for a URL, plus
/// the instant it was downloaded (drives the 60-second coalescing window).
struct CacheEntry {
    parsed: ParsedCrl,
    downloaded_at: Instant,
}

/// Owns the CRL cache and serves revocation queries under the freshness
/// policy. Confined state: nothing outside this module touches the cache or
/// the download-time bookkeeping (per the "CRL cache as shared state" design
/// note).
pub struct CrlManager {
    client: reqwest::Client,
    cache_dir: PathBuf,
    refresh_interval: Duration,
    timeout: Duration,
    configured_urls: Vec<String>,
    enabled: bool,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

const COALESCE_WINDOW: Duration = Duration::from_secs(60);

impl CrlManager {
    pub fn new(config: &StepCaConfig) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.crl_timeout_seconds))
            .build()?;

        Ok(CrlManager {
            client,
            cache_dir: config.crl_cache_dir.clone(),
            refresh_interval: Duration::from_secs(config.crl_refresh_hours.max(0) as u64 * 3600),
            timeout: Duration::from_secs(config.crl_timeout_seconds),
            configured_urls: config.crl_urls.clone(),
            enabled: config.crl_enabled,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn cache_file_path(&self, url: &str) -> PathBuf {
        let hash = hex::encode(Sha256::digest(url.as_bytes()));
        let hostname = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        self.cache_dir.join(format!("{hostname}_{}.crl", &hash[..16]))
    }

    /// Check a parsed certificate for revocation against the union of
    /// configured CRL URLs and the certificate's own CRL distribution points.
    pub async fn check(&self, cert: &ParsedCert) -> RevocationStatus {
        if !self.enabled {
            return RevocationStatus::not_revoked();
        }

        let mut urls = self.configured_urls.clone();
        for url in &cert.cdp_urls {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }

        if urls.is_empty() {
            tracing::warn!("no CRL URLs available for revocation checking");
            return RevocationStatus::not_revoked();
        }

        for url in &urls {
            let crl = match self.refresh(url).await {
                Some(crl) => crl,
                None => {
                    tracing::warn!(url, "could not obtain CRL, skipping source");
                    continue;
                }
            };

            for revoked in &crl.revoked {
                if revoked.serial == cert.serial {
                    tracing::warn!(
                        url,
                        serial = %revoked.serial,
                        reason = %revoked.reason,
                        "certificate is revoked"
                    );
                    return RevocationStatus {
                        is_revoked: true,
                        revocation_date: Some(revoked.revocation_date),
                        revocation_reason: Some(revoked.reason.clone()),
                        crl_source_url: Some(url.clone()),
                        checked_at: Utc::now(),
                    };
                }
            }
        }

        RevocationStatus::not_revoked()
    }

    /// Obtain a fresh-enough CRL for `url`, honoring the 60-second in-memory
    /// coalescing window, the on-disk cache, and the refresh policy.
    async fn refresh(&self, url: &str) -> Option<ParsedCrl> {
        if let Some(entry) = self.cache.lock().unwrap().get(url) {
            if entry.downloaded_at.elapsed() < COALESCE_WINDOW {
                tracing::debug!(url, "reusing recently downloaded CRL (coalescing window)");
                return Some(entry.parsed.clone());
            }
        }

        let file_path = self.cache_file_path(url);
        if !self.must_fetch_by_age(&file_path) {
            if let Some(parsed) = self.load_from_cache_or_disk(url, &file_path) {
                if !Self::past_next_update(&parsed) {
                    return Some(parsed);
                }
                tracing::debug!(url, "cached CRL is past its own nextUpdate, forcing refresh");
            }
        }

        tracing::debug!(url, "downloading CRL");
        match self.download(url).await {
            Ok(bytes) => match parse_crl(&bytes) {
                Ok(parsed) => {
                    if let Err(e) = store::write_cert(&file_path, &bytes) {
                        tracing::warn!(url, error = %e, "failed to cache CRL to disk");
                    }
                    self.cache.lock().unwrap().insert(
                        url.to_string(),
                        CacheEntry {
                            parsed: parsed.clone(),
                            downloaded_at: Instant::now(),
                        },
                    );
                    Some(parsed)
                }
                Err(e) => {
                    tracing::error!(url, error = %e, "failed to parse downloaded CRL, falling back to cache");
                    self.load_from_cache_or_disk(url, &file_path)
                }
            },
            Err(e) => {
                tracing::warn!(url, error = %e, "CRL download failed, falling back to cache");
                self.load_from_cache_or_disk(url, &file_path)
            }
        }
    }

    fn load_from_cache_or_disk(&self, url: &str, file_path: &Path) -> Option<ParsedCrl> {
        if let Some(entry) = self.cache.lock().unwrap().get(url) {
            return Some(entry.parsed.clone());
        }

        let bytes = store::read(file_path).ok()?;
        let parsed = parse_crl(&bytes).ok()?;
        self.cache.lock().unwrap().insert(
            url.to_string(),
            CacheEntry {
                parsed: parsed.clone(),
                downloaded_at: Instant::now() - COALESCE_WINDOW,
            },
        );
        Some(parsed)
    }

    /// First two of the three "must fetch" triggers in the refresh policy:
    /// missing cache file, or `mtime` age beyond `refresh_interval`. The
    /// third trigger (`next_update` has passed) is checked separately in
    /// `refresh`, once the cached CRL's contents are available.
    fn must_fetch_by_age(&self, file_path: &Path) -> bool {
        let Ok(meta) = std::fs::metadata(file_path) else {
            return true;
        };
        let Ok(modified) = meta.modified() else {
            return true;
        };
        modified.elapsed().map(|age| age > self.refresh_interval).unwrap_or(true)
    }

    /// True if the CRL's declared `next_update` has already passed, meaning
    /// the issuer considers it stale regardless of the local refresh policy.
    fn past_next_update(crl: &ParsedCrl) -> bool {
        match crl.next_update {
            Some(next_update) => Utc::now() >= next_update,
            None => false,
        }
    }

    async fn download(&self, url: &str) -> crate::error::Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/pkix-crl")
            .timeout(self.timeout)
            .send()
            .await?;
        let bytes = response.error_for_status()?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn manager() -> CrlManager {
        let config = StepCaConfig {
            ca_url: "https://ca.example.com:9000".to_string(),
            ca_fingerprint: String::new(),
            root_cert_path: PathBuf::from("root.crt"),
            protocol: crate::config::Protocol::Jwk,
            provisioner_name: String::new(),
            provisioner_password: None,
            provisioner_key_path: None,
            est_username: None,
            est_password: None,
            est_client_cert: None,
            est_client_key: None,
            est_ca_bundle: None,
            crl_enabled: true,
            crl_urls: vec![],
            crl_cache_dir: PathBuf::from("/tmp/crl-cache-test"),
            crl_refresh_hours: 24,
            crl_timeout_seconds: 5,
        };
        CrlManager::new(&config).unwrap()
    }

    #[test]
    fn test_cache_file_path_includes_hostname_and_hash() {
        let mgr = manager();
        let path = mgr.cache_file_path("https://ca.example.com/crl/root.crl");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("ca.example.com_"));
        assert!(name.ends_with(".crl"));
    }

    #[tokio::test]
    async fn test_disabled_crl_short_circuits() {
        let mut config = StepCaConfig {
            ca_url: "https://ca.example.com:9000".to_string(),
            ca_fingerprint: String::new(),
            root_cert_path: PathBuf::from("root.crt"),
            protocol: crate::config::Protocol::Jwk,
            provisioner_name: String::new(),
            provisioner_password: None,
            provisioner_key_path: None,
            est_username: None,
            est_password: None,
            est_client_cert: None,
            est_client_key: None,
            est_ca_bundle: None,
            crl_enabled: false,
            crl_urls: vec![],
            crl_cache_dir: PathBuf::from("/tmp/crl-cache-test-disabled"),
            crl_refresh_hours: 24,
            crl_timeout_seconds: 5,
        };
        config.crl_enabled = false;
        let mgr = CrlManager::new(&config).unwrap();

        let cert = ParsedCert {
            not_before: Utc::now(),
            not_after: Utc::now(),
            subject_cn: "test".to_string(),
            sans: vec![],
            serial: num_bigint::BigUint::from(1u32),
            cdp_urls: vec![],
        };
        let status = mgr.check(&cert).await;
        assert!(!status.is_revoked);
    }
}
