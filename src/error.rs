// Copyright 2020 Joyent, Inc.

use thiserror::Error;

/// The error type for connection provider and registry operations.
///
/// Transport-level failures during `open` are handled internally by the
/// providers (the endpoint is quarantined and another is tried) and only
/// surface as [`AllServersFailed`](Error::AllServersFailed) once no live
/// endpoint remains.
#[derive(Debug, Error)]
pub enum Error {
    /// The cluster configuration is invalid. Raised synchronously at provider
    /// construction and fatal only to that construction call.
    #[error("configuration error: {0}")]
    Config(String),

    /// Every configured endpoint has been tried and failed.
    #[error("no connection could be made because all servers have failed")]
    AllServersFailed,

    /// Waited the full ceiling for a pool slot without one becoming free.
    #[error("timed out trying to acquire a connection from the connection pool")]
    PoolTimeout,

    /// Operation attempted on a provider that has already been disposed.
    #[error("connection provider is already disposed")]
    ProviderDisposed,

    /// A transport-level I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
