//! C-Parse: X.509 and CRL parsing
//!
//! Accepts bytes in either PEM or DER, trying PEM first and falling back to
//! DER; fails only if neither parses.

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use x509_parser::prelude::*;

use crate::error::{AgentError, Result};

/// A certificate's extracted fields for one evaluation pass
#[derive(Debug, Clone)]
pub struct ParsedCert {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subject_cn: String,
    pub sans: Vec<String>,
    pub serial: BigUint,
    pub cdp_urls: Vec<String>,
}

/// One revoked-certificate entry extracted from a CRL
#[derive(Debug, Clone)]
pub struct RevokedEntry {
    pub serial: BigUint,
    pub revocation_date: DateTime<Utc>,
    pub reason: String,
}

/// A parsed CRL's extracted fields
#[derive(Debug, Clone)]
pub struct ParsedCrl {
    pub issuer_dn: String,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    pub revoked: Vec<RevokedEntry>,
}

/// Normalize an ASN.1 time to a UTC `DateTime`. x509-parser's `ASN1Time`
/// carries no zone ambiguity to resolve (Certificate/CRL times are
/// UTCTime/GeneralizedTime which are always zone-qualified), so the
/// "naive time is UTC" rule is automatically satisfied by the ASN.1 grammar.
fn asn1_time_to_utc(t: x509_parser::time::ASN1Time) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or_else(|| DateTime::<Utc>::MIN_UTC)
}

/// Detect PEM vs. DER and hand back the DER bytes either way.
pub(crate) fn to_der(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.starts_with(b"-----BEGIN") {
        let (_, pem) = parse_x509_pem(bytes)
            .map_err(|e| AgentError::Parse(format!("invalid PEM: {e}")))?;
        Ok(pem.contents)
    } else {
        Ok(bytes.to_vec())
    }
}

/// Parse a certificate's bytes (PEM or DER) into a `ParsedCert`.
pub fn parse_certificate(bytes: &[u8]) -> Result<ParsedCert> {
    let der = to_der(bytes)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| AgentError::Parse(format!("invalid certificate: {e}")))?;

    let validity = cert.validity();
    let not_before = asn1_time_to_utc(validity.not_before);
    let not_after = asn1_time_to_utc(validity.not_after);

    let subject_cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("Unknown")
        .to_string();

    let mut sans = Vec::new();
    if let Ok(Some(ext)) = cert.subject_alternative_name() {
        for name in &ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => sans.push(dns.to_string()),
                GeneralName::IPAddress(ip) => sans.push(format_ip(ip)),
                _ => {}
            }
        }
    }

    let mut cdp_urls = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() {
            for point in points.points.iter() {
                if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                    for name in names {
                        if let GeneralName::URI(uri) = name {
                            cdp_urls.push(uri.to_string());
                        }
                    }
                }
            }
        }
    }

    Ok(ParsedCert {
        not_before,
        not_after,
        subject_cn,
        sans,
        serial: cert.tbs_certificate.serial.clone(),
        cdp_urls,
    })
}

fn format_ip(bytes: &[u8]) -> String {
    match bytes.len() {
        4 => std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string(),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            std::net::Ipv6Addr::from(octets).to_string()
        }
        _ => hex::encode(bytes),
    }
}

/// Parse a CRL's bytes (PEM or DER) into a `ParsedCrl`.
pub fn parse_crl(bytes: &[u8]) -> Result<ParsedCrl> {
    let der = to_der(bytes)?;
    let (_, crl) = parse_x509_crl(&der)
        .map_err(|e| AgentError::Parse(format!("invalid CRL: {e}")))?;

    let issuer_dn = crl.issuer().to_string();
    let this_update = asn1_time_to_utc(crl.last_update());
    let next_update = crl.next_update().map(asn1_time_to_utc);

    let mut revoked = Vec::new();
    for entry in crl.iter_revoked_certificates() {
        let reason = entry
            .extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::ReasonCode(code) => Some(code.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| "Unspecified".to_string());

        revoked.push(RevokedEntry {
            serial: entry.user_certificate.clone(),
            revocation_date: asn1_time_to_utc(entry.revocation_date),
            reason,
        });
    }

    Ok(ParsedCrl {
        issuer_dn,
        this_update,
        next_update,
        revoked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pem_detection() {
        assert!(to_der(b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n").is_err());
        // non-PEM bytes pass through untouched as candidate DER
        assert_eq!(to_der(&[0x30, 0x00]).unwrap(), vec![0x30, 0x00]);
    }

    #[test]
    fn test_format_ipv4() {
        assert_eq!(format_ip(&[127, 0, 0, 1]), "127.0.0.1");
    }

    #[test]
    fn test_parse_certificate_rejects_garbage() {
        assert!(parse_certificate(b"not a certificate").is_err());
    }

    #[test]
    fn test_parse_crl_rejects_garbage() {
        assert!(parse_crl(b"not a crl").is_err());
    }
}
