//! Error types for the certificate lifecycle agent

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, AgentError>;

/// Main error type for the agent
#[derive(Error, Debug)]
pub enum AgentError {
    /// Invalid or inconsistent configuration; fatal at startup only
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed certificate, key, or CRL
    #[error("parse error: {0}")]
    Parse(String),

    /// Transient network/connectivity failure (CA health probe, unreachable
    /// endpoint) not already carried as an `Http` error
    #[error("network error: {0}")]
    Network(String),

    /// HTTP client failure talking to a CRL distribution point or CA
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Credential rejected by the PKI
    #[error("authentication error: {0}")]
    Auth(String),

    /// Adapter-specific renewal failure
    #[error("renewal failed: {0}")]
    RenewalFailed(String),

    /// Certificate generation failure
    #[error("certificate generation error: {0}")]
    CertGen(#[from] rcgen::Error),

    /// X.509/CRL parsing library failure
    #[error("x509 error: {0}")]
    X509(String),

    /// TOML (de)serialization failure
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// YAML (de)serialization failure
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Sub-process invocation failure (timeout, non-zero exit, spawn failure)
    #[error("sub-process error: {0}")]
    Process(String),

    /// Catch-all for conditions that don't fit the above
    #[error("error: {0}")]
    Other(String),
}

impl From<x509_parser::error::X509Error> for AgentError {
    fn from(e: x509_parser::error::X509Error) -> Self {
        AgentError::X509(e.to_string())
    }
}

impl From<x509_parser::nom::Err<x509_parser::error::X509Error>> for AgentError {
    fn from(e: x509_parser::nom::Err<x509_parser::error::X509Error>) -> Self {
        AgentError::X509(e.to_string())
    }
}
