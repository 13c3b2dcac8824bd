// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use derive_more::{Display, From, Into};
use sha1::Sha1;

use crate::endpoint::Endpoint;

/// The default maximum pool size.
pub const DEFAULT_MAX_POOL_SIZE: u32 = 100;
/// The default server polling interval in seconds. This drives both health
/// recovery probing and the pooled provider's eviction sweep.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);
/// The default transport buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// The framing mode of the underlying transport.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TransportKind {
    /// Length-prefix framed transport.
    Framed,
    /// Unframed, buffered transport.
    Simple,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportKind::Framed => "Framed".fmt(fmt),
            TransportKind::Simple => "Simple".fmt(fmt),
        }
    }
}

impl FromStr for TransportKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "framed" => Ok(TransportKind::Framed),
            "simple" => Ok(TransportKind::Simple),
            _ => Err(()),
        }
    }
}

/// A structural identity for a [`Cluster`].
///
/// The key is a pure function of every cluster field, so two independently
/// built but identical configurations produce equal keys. The provider
/// registry uses it as the sharing key.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct ClusterKey(String);

/// An immutable, order-preserving set of [`Endpoint`]s plus the policy values
/// shared by every connection made to them.
#[derive(Clone, Debug)]
pub struct Cluster {
    /// The candidate server endpoints, unique by `(host, port)` identity.
    pub endpoints: Vec<Endpoint>,
    /// Whether connections are pooled and reused or opened fresh per request.
    pub pooling: bool,
    /// The pool's lower bound. Idle connections are only reused once the pool
    /// has grown to this size.
    pub min_pool_size: u32,
    /// The pool's upper bound on concurrently live connections.
    pub max_pool_size: u32,
    /// The period of health-recovery probing and of the pooled provider's
    /// eviction sweep.
    pub polling_interval: Duration,
    /// The maximum age of a pooled idle connection. Zero means unbounded.
    pub connection_lifetime: Duration,
    /// The transport framing mode.
    pub transport_kind: TransportKind,
    /// The transport buffer size in bytes.
    pub buffer_size: usize,
}

impl Cluster {
    /// Return a new `Cluster` over `endpoints` with default policy values:
    /// no pooling, pool bounds 0/100, 30 second polling interval, unbounded
    /// connection lifetime, framed transport, 1024 byte buffers.
    ///
    /// Endpoints are deduplicated by identity, first occurrence wins.
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        let mut unique: Vec<Endpoint> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if !unique.contains(&endpoint) {
                unique.push(endpoint);
            }
        }
        Cluster {
            endpoints: unique,
            pooling: false,
            min_pool_size: 0,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            connection_lifetime: Duration::from_secs(0),
            transport_kind: TransportKind::Framed,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Return the structural identity of this cluster.
    ///
    /// The endpoint list is order-normalized so that the same servers listed
    /// in a different order share a provider.
    pub fn key(&self) -> ClusterKey {
        let mut endpoint_strs: Vec<String> = self
            .endpoints
            .iter()
            .map(|e| format!("{}|{}", e, e.timeout.as_secs()))
            .collect();
        endpoint_strs.sort();

        let mut sha1 = Sha1::new();
        for s in endpoint_strs {
            sha1.update(s.as_bytes());
            sha1.update(b"||");
        }
        sha1.update(self.pooling.to_string().as_bytes());
        sha1.update(b"||");
        sha1.update(self.min_pool_size.to_string().as_bytes());
        sha1.update(b"||");
        sha1.update(self.max_pool_size.to_string().as_bytes());
        sha1.update(b"||");
        sha1.update(self.polling_interval.as_millis().to_string().as_bytes());
        sha1.update(b"||");
        sha1.update(
            self.connection_lifetime.as_millis().to_string().as_bytes(),
        );
        sha1.update(b"||");
        sha1.update(self.transport_kind.to_string().as_bytes());
        sha1.update(b"||");
        sha1.update(self.buffer_size.to_string().as_bytes());

        base64::encode(&sha1.digest().bytes()).into()
    }
}

impl PartialEq for Cluster {
    fn eq(&self, other: &Cluster) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Cluster {}
