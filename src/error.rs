//! Typed error taxonomy for the data plane.
//!
//! Each kind carries the behavior the engine must apply on encountering it
//! (close vs. 502 vs. truncate-and-continue); none of them short-circuit
//! traffic except `ClientError` (no request to serve) and `ConfigError`
//! (fatal, startup-only).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("client error: {0}")]
    ClientError(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream tls error: {0}")]
    UpstreamTlsError(String),

    #[error("cap exceeded: {0}")]
    CapExceeded(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("permanent store error: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Invalid(String),
}
