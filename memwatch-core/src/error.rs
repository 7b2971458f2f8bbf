//! Error taxonomy. Only contract and resource errors are returned to
//! callers; transient runtime conditions are absorbed by the worker and
//! surfaced only through [`crate::stats::Stats`].

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("core is already initialized")]
    AlreadyInitialized,
    #[error("failed to install fault handler")]
    HandlerInstallFailed,
    #[error("OS page protection is unavailable on this platform")]
    OsProtectionUnavailable,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("region size must be greater than zero")]
    InvalidArgument,
    #[error("region registry has reached its capacity")]
    TooManyRegions,
    #[error("failed to allocate native bookkeeping for region")]
    OutOfMemory,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolverError {
    #[error("adapter_id {0} has no registered resolver slot")]
    AdapterOutOfRange(u16),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error("core has not been initialized")]
    NotInitialized,
}
