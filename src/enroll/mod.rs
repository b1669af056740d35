//! Enrollment adapters: a common capability set over two interchangeable
//! backends (token-provisioner CLI, RFC 7030 EST), selected once at
//! initialization and dispatched through a tagged variant rather than a
//! trait object, since there are exactly two implementations and they are
//! fixed for the process lifetime.

pub mod est;
pub mod token;

use async_trait::async_trait;

use crate::config::{Config, Protocol};
use crate::eval::ManagedCert;
use crate::error::Result;

/// Common capability set both enrollment backends provide.
#[async_trait]
pub trait Enrollment: Send + Sync {
    /// One-shot call at startup pinning the CA trust anchor. Must be
    /// idempotent against repeated startups.
    async fn bootstrap(&self) -> Result<()>;

    /// Enroll for a new certificate, writing the certificate and private key
    /// via C-Store.
    async fn enroll(&self, cert: &ManagedCert) -> Result<()>;

    /// Renew an existing certificate; back up before mutation, restore on
    /// failure.
    async fn renew(&self, cert: &ManagedCert) -> Result<()>;

    /// Probe CA connectivity; used both at startup and for the `crl`/status
    /// surfaces.
    async fn probe(&self) -> Result<()>;

    /// Verify a certificate on disk against the pinned trust anchor.
    async fn verify(&self, cert: &ManagedCert) -> Result<bool>;
}

/// Tagged dispatch over the two enrollment backends.
pub enum Adapter {
    Token(token::TokenAdapter),
    Est(est::EstAdapter),
}

impl Adapter {
    /// Build the adapter selected by `config.step_ca.protocol`.
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.step_ca.protocol {
            Protocol::Jwk => Ok(Adapter::Token(token::TokenAdapter::new(&config.step_ca)?)),
            Protocol::Est => Ok(Adapter::Est(est::EstAdapter::new(&config.step_ca)?)),
        }
    }
}

#[async_trait]
impl Enrollment for Adapter {
    async fn bootstrap(&self) -> Result<()> {
        match self {
            Adapter::Token(a) => a.bootstrap().await,
            Adapter::Est(a) => a.bootstrap().await,
        }
    }

    async fn enroll(&self, cert: &ManagedCert) -> Result<()> {
        match self {
            Adapter::Token(a) => a.enroll(cert).await,
            Adapter::Est(a) => a.enroll(cert).await,
        }
    }

    async fn renew(&self, cert: &ManagedCert) -> Result<()> {
        match self {
            Adapter::Token(a) => a.renew(cert).await,
            Adapter::Est(a) => a.renew(cert).await,
        }
    }

    async fn probe(&self) -> Result<()> {
        match self {
            Adapter::Token(a) => a.probe().await,
            Adapter::Est(a) => a.probe().await,
        }
    }

    async fn verify(&self, cert: &ManagedCert) -> Result<bool> {
        match self {
            Adapter::Token(a) => a.verify(cert).await,
            Adapter::Est(a) => a.verify(cert).await,
        }
    }
}
