// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// The default host used when none is specified.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// The default RPC port used when none is specified.
pub const DEFAULT_PORT: u16 = 9160;

/// A single server address.
///
/// An `Endpoint` is an immutable value identifying one server: a host, a
/// port, and the per-socket connect timeout to use when dialing it. Identity
/// for health tracking is `(host, port)` only; the timeout participates in
/// configuration hashing (see [`Cluster::key`](crate::cluster::Cluster::key))
/// but not in endpoint equality.
#[derive(Clone, Debug)]
pub struct Endpoint {
    /// The host name or address of the server.
    pub host: String,
    /// The RPC port of the server.
    pub port: u16,
    /// The per-socket connect timeout. Zero means no timeout.
    pub timeout: Duration,
}

impl Endpoint {
    /// Return a new `Endpoint` with the default timeout of zero.
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
            timeout: Duration::from_secs(0),
        }
    }

    /// Return a new `Endpoint` carrying a connect timeout.
    pub fn with_timeout<S: Into<String>>(
        host: S,
        port: u16,
        timeout: Duration,
    ) -> Self {
        Endpoint {
            host: host.into(),
            port,
            timeout,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Endpoint) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port)
    }
}
