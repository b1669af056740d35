//! C-EnrollEst: RFC 7030 EST adapter

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use pkcs8::EncodePrivateKey;
use rand::rngs::OsRng;
use x509_parser::prelude::*;

use super::Enrollment;
use crate::config::StepCaConfig;
use crate::error::{AgentError, Result};
use crate::eval::ManagedCert;
use crate::store;

const CACERTS_TIMEOUT: Duration = Duration::from_secs(30);
const ENROLL_TIMEOUT: Duration = Duration::from_secs(60);

/// RFC 7030 EST adapter: HTTPS with either HTTP Basic or mTLS client-cert
/// authentication.
pub struct EstAdapter {
    client: reqwest::Client,
    base_url: String,
    config: StepCaConfig,
}

impl EstAdapter {
    pub fn new(config: &StepCaConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();

        if let Some(bundle) = &config.est_ca_bundle {
            let pem = std::fs::read(bundle)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| AgentError::Config(format!("invalid est_ca_bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        } else if std::path::Path::new(&config.root_cert_path).exists() {
            let pem = std::fs::read(&config.root_cert_path)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| AgentError::Config(format!("invalid root_cert_path: {e}")))?;
            builder = builder.add_root_certificate(cert);
        } else {
            tracing::warn!("no CA bundle specified for EST client, using system default trust");
        }

        if let (Some(cert), Some(key)) = (&config.est_client_cert, &config.est_client_key) {
            let mut identity_pem = std::fs::read(cert)?;
            identity_pem.extend_from_slice(&std::fs::read(key)?);
            let identity = reqwest::Identity::from_pem(&identity_pem)
                .map_err(|e| AgentError::Config(format!("invalid EST client identity: {e}")))?;
            builder = builder.identity(identity);
            tracing::info!("EST client configured with client certificate authentication");
        } else if config.est_username.is_some() && config.est_password.is_some() {
            tracing::info!("EST client configured with HTTP Basic authentication");
        } else {
            tracing::warn!("no EST authentication method configured");
        }

        let client = builder.build()?;
        let base_url = est_base_url(&config.ca_url);

        Ok(EstAdapter {
            client,
            base_url,
            config: config.clone(),
        })
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.config.est_username, &self.config.est_password) {
            (Some(user), Some(pass)) => builder.basic_auth(user, Some(pass)),
            _ => builder,
        }
    }

    async fn cacerts(&self) -> Result<Vec<u8>> {
        let url = format!("{}/cacerts", self.base_url);
        let req = self
            .client
            .get(&url)
            .header("Accept", "application/pkcs7-mime")
            .timeout(CACERTS_TIMEOUT);
        let response = self.apply_auth(req).send().await?;
        let bytes = response.error_for_status()?.bytes().await?;
        Ok(bytes.to_vec())
    }

    fn generate_csr_and_key(&self, cert: &ManagedCert) -> Result<(Vec<u8>, String)> {
        let rsa_key = rsa::RsaPrivateKey::new(&mut OsRng, 2048)
            .map_err(|e| AgentError::Other(format!("RSA key generation failed: {e}")))?;
        let pkcs8_der = rsa_key
            .to_pkcs8_der()
            .map_err(|e| AgentError::Other(format!("PKCS#8 encoding failed: {e}")))?;

        let key_pair =
            rcgen::KeyPair::from_pkcs8_der_and_sign_algo(pkcs8_der.as_bytes(), &rcgen::PKCS_RSA_SHA256)?;
        let key_pem = key_pair.serialize_pem();

        let mut params = rcgen::CertificateParams::new(sans_for(cert))?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cert.subject.clone());

        let csr = params.serialize_request(&key_pair)?;
        Ok((csr.der().to_vec(), key_pem))
    }

    async fn post_csr(&self, operation: &str, csr_der: &[u8]) -> Result<Vec<u8>> {
        let url = format!("{}/{operation}", self.base_url);
        let csr_b64 = base64::engine::general_purpose::STANDARD.encode(csr_der);

        let req = self
            .client
            .post(&url)
            .header("Content-Type", "application/pkcs10")
            .header("Content-Transfer-Encoding", "base64")
            .body(csr_b64)
            .timeout(ENROLL_TIMEOUT);

        let response = self.apply_auth(req).send().await?;
        let response = response.error_for_status()?;
        let bytes = response.bytes().await?;
        pkcs7_extract_leaf_cert_pem(&bytes)
    }

    /// The fallible body of a renewal: CSR generation, the EST round-trip,
    /// and writing the new cert/key. Callers own backup/restore around this.
    async fn renew_inner(&self, cert: &ManagedCert) -> Result<()> {
        let (csr_der, key_pem) = self.generate_csr_and_key(cert)?;
        let cert_pem = self.post_csr("simplereenroll", &csr_der).await?;
        store::write_cert(&cert.cert_path, &cert_pem)?;
        store::write_key(&cert.key_path, key_pem.as_bytes())?;
        Ok(())
    }

    /// Load the pinned trust anchor (the EST-specific bundle if configured,
    /// else the shared root) and parse it to DER.
    fn load_trust_anchor(&self) -> Result<Vec<u8>> {
        let path = self
            .config
            .est_ca_bundle
            .as_ref()
            .unwrap_or(&self.config.root_cert_path);
        let bytes = std::fs::read(path)?;
        crate::parse::to_der(&bytes)
    }
}

/// Derive the EST base URL from the configured CA URL: the native token-CA
/// port (`:9000`) rewrites to the EST HTTPS port; otherwise append
/// `/.well-known/est` if not already present.
fn est_base_url(ca_url: &str) -> String {
    let base = ca_url.trim_end_matches('/');
    if base.contains(":9000") {
        base.replace(":9000", ":8443/.well-known/est")
    } else if base.contains(".well-known/est") {
        base.to_string()
    } else {
        format!("{base}/.well-known/est")
    }
}

fn sans_for(cert: &ManagedCert) -> Vec<String> {
    if cert.sans.is_empty() {
        vec![cert.subject.clone()]
    } else {
        cert.sans.clone()
    }
}

/// Extract the end-entity certificate (PEM) from an EST `application/pkcs7-mime`
/// response. RFC 7030 mandates a PKCS#7 (CMS `SignedData`, degenerate
/// certs-only) wrapper; this parses that structure rather than assuming the
/// HTTP body is a bare certificate.
fn pkcs7_extract_leaf_cert_pem(body: &[u8]) -> Result<Vec<u8>> {
    use cms::content_info::ContentInfo;
    use cms::signed_data::SignedData;
    use der::{Decode, Encode};
    use x509_cert::Certificate;

    // EST responses are base64 text, not raw DER, per RFC 7030 section 4.1.3.
    let der_bytes = base64::engine::general_purpose::STANDARD
        .decode(strip_ascii_whitespace(body))
        .map_err(|e| AgentError::Parse(format!("invalid base64 in EST response: {e}")))?;

    let content_info = ContentInfo::from_der(&der_bytes)
        .map_err(|e| AgentError::Parse(format!("invalid PKCS#7 ContentInfo: {e}")))?;

    let signed_data: SignedData = content_info
        .content
        .decode_as()
        .map_err(|e| AgentError::Parse(format!("invalid PKCS#7 SignedData: {e}")))?;

    let certs = signed_data
        .certificates
        .ok_or_else(|| AgentError::Parse("PKCS#7 SignedData carried no certificates".to_string()))?;

    let leaf: Certificate = certs
        .0
        .iter()
        .find_map(|choice| match choice {
            cms::cert::CertificateChoices::Certificate(c) => Some(c.clone()),
            _ => None,
        })
        .ok_or_else(|| AgentError::Parse("no end-entity certificate in PKCS#7 response".to_string()))?;

    let der = leaf
        .to_der()
        .map_err(|e| AgentError::Parse(format!("failed to re-encode leaf certificate: {e}")))?;

    Ok(pem::encode(&pem::Pem::new("CERTIFICATE", der)).into_bytes())
}

fn strip_ascii_whitespace(body: &[u8]) -> Vec<u8> {
    body.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect()
}

#[async_trait]
impl Enrollment for EstAdapter {
    async fn bootstrap(&self) -> Result<()> {
        self.probe().await
    }

    async fn enroll(&self, cert: &ManagedCert) -> Result<()> {
        tracing::info!(subject = %cert.subject, "enrolling certificate via EST");
        let (csr_der, key_pem) = self.generate_csr_and_key(cert)?;
        let cert_pem = self.post_csr("simpleenroll", &csr_der).await?;

        store::write_cert(&cert.cert_path, &cert_pem)?;
        store::write_key(&cert.key_path, key_pem.as_bytes())?;
        Ok(())
    }

    async fn renew(&self, cert: &ManagedCert) -> Result<()> {
        if !cert.cert_path.exists() || !cert.key_path.exists() {
            tracing::warn!(name = %cert.name, "no existing certificate, enrolling instead of renewing");
            return self.enroll(cert).await;
        }

        tracing::info!(subject = %cert.subject, "renewing certificate via EST");
        store::backup(&cert.cert_path)?;
        store::backup(&cert.key_path)?;

        let result = self.renew_inner(cert).await;
        match result {
            Ok(()) => {
                store::discard_backup(&cert.cert_path)?;
                store::discard_backup(&cert.key_path)?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(name = %cert.name, error = %e, "renewal failed, restoring backup");
                store::restore(&cert.cert_path)?;
                store::restore(&cert.key_path)?;
                Err(e)
            }
        }
    }

    async fn probe(&self) -> Result<()> {
        self.cacerts().await?;
        Ok(())
    }

    async fn verify(&self, cert: &ManagedCert) -> Result<bool> {
        let bytes = store::read(&cert.cert_path)?;
        let leaf_der = crate::parse::to_der(&bytes)?;
        let (_, leaf) = X509Certificate::from_der(&leaf_der)
            .map_err(|e| AgentError::Parse(format!("invalid certificate: {e}")))?;

        let anchor_der = self.load_trust_anchor()?;
        let (_, anchor) = X509Certificate::from_der(&anchor_der)
            .map_err(|e| AgentError::Parse(format!("invalid trust anchor: {e}")))?;

        match leaf.verify_signature(Some(anchor.public_key())) {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(name = %cert.name, error = %e, "certificate signature does not verify against pinned trust anchor");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_est_url_rewrites_native_port() {
        assert_eq!(
            est_base_url("https://ca.example.com:9000"),
            "https://ca.example.com:8443/.well-known/est"
        );
    }

    #[test]
    fn test_est_url_appends_well_known_if_missing() {
        assert_eq!(
            est_base_url("https://est.example.com"),
            "https://est.example.com/.well-known/est"
        );
    }

    #[test]
    fn test_est_url_leaves_well_known_untouched() {
        let url = "https://est.example.com/.well-known/est";
        assert_eq!(est_base_url(url), url);
    }

    #[test]
    fn test_sans_for_falls_back_to_subject() {
        let cert = ManagedCert {
            name: "n".to_string(),
            cert_path: "c".into(),
            key_path: "k".into(),
            subject: "host.example.com".to_string(),
            sans: vec![],
            renewal_threshold: None,
        };
        assert_eq!(sans_for(&cert), vec!["host.example.com".to_string()]);
    }
}
