// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::cluster::{
    Cluster, TransportKind, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_POOL_SIZE,
};
use crate::endpoint::{Endpoint, DEFAULT_HOST, DEFAULT_PORT};

const DEFAULT_POLLING_INTERVAL_SECS: u64 = 30;

/// A parsed connection configuration.
///
/// Built from a semicolon-delimited `Key=Value` connection string. Keys are
/// case-insensitive and values are trimmed of surrounding whitespace.
/// Recognized keys:
///
/// | Key | Default |
/// |---|---|
/// | `Keyspace` | empty |
/// | `Server` (comma-separated `host[:port]` list) | `127.0.0.1:9160` |
/// | `Pooling` | `false` |
/// | `Min Pool Size` | `0` |
/// | `Max Pool Size` | `100` |
/// | `Max Retries` | `0` |
/// | `Connection Timeout` (seconds) | `0` |
/// | `Server Polling Interval` (seconds) | `30` |
/// | `Connection Lifetime` (seconds) | `0` (unbounded) |
/// | `Connection Type` (`Framed` or `Simple`) | `Framed` |
/// | `Buffer Size` | `1024` |
///
/// Malformed numeric, boolean, or enum values fall back silently to the
/// key's default. Unrecognized keys are ignored. Parsing never fails.
#[derive(Clone, Debug)]
pub struct ConnectionBuilder {
    keyspace: String,
    max_retries: u32,
    cluster: Cluster,
}

impl ConnectionBuilder {
    /// Parse a connection string.
    pub fn from_connection_string(connection_string: &str) -> Self {
        let pairs = split_pairs(connection_string);

        let keyspace =
            pairs.get("keyspace").cloned().unwrap_or_else(String::new);
        let max_retries = parse_or_default(&pairs, "max retries", 0u32);

        let connection_timeout = Duration::from_secs(parse_or_default(
            &pairs,
            "connection timeout",
            0u64,
        ));
        let pooling = parse_bool_or_default(&pairs, "pooling", false);
        let min_pool_size = parse_or_default(&pairs, "min pool size", 0u32);
        let max_pool_size =
            parse_or_default(&pairs, "max pool size", DEFAULT_MAX_POOL_SIZE);
        let polling_interval = Duration::from_secs(parse_or_default(
            &pairs,
            "server polling interval",
            DEFAULT_POLLING_INTERVAL_SECS,
        ));
        let connection_lifetime = Duration::from_secs(parse_or_default(
            &pairs,
            "connection lifetime",
            0u64,
        ));
        let transport_kind = pairs
            .get("connection type")
            .and_then(|v| v.parse::<TransportKind>().ok())
            .unwrap_or(TransportKind::Framed);
        let buffer_size =
            parse_or_default(&pairs, "buffer size", DEFAULT_BUFFER_SIZE);

        let endpoints = match pairs.get("server") {
            Some(server_list) => parse_servers(server_list, connection_timeout),
            None => vec![Endpoint::with_timeout(
                DEFAULT_HOST,
                DEFAULT_PORT,
                connection_timeout,
            )],
        };

        let mut cluster = Cluster::new(endpoints);
        cluster.pooling = pooling;
        cluster.min_pool_size = min_pool_size;
        cluster.max_pool_size = max_pool_size;
        cluster.polling_interval = polling_interval;
        cluster.connection_lifetime = connection_lifetime;
        cluster.transport_kind = transport_kind;
        cluster.buffer_size = buffer_size;

        ConnectionBuilder {
            keyspace,
            max_retries,
            cluster,
        }
    }

    /// The target keyspace name.
    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    /// The retry budget for higher-level operation retry. Not consumed by
    /// the providers themselves.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The parsed endpoint set and policy values.
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Render the configuration back to canonical `Key=Value;` form.
    /// Re-parsing the result yields a structurally equal cluster.
    pub fn connection_string(&self) -> String {
        let cluster = &self.cluster;
        let servers = cluster
            .endpoints
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<String>>()
            .join(",");
        let timeout = cluster
            .endpoints
            .first()
            .map(|e| e.timeout.as_secs())
            .unwrap_or(0);

        format!(
            "Keyspace={};Server={};Pooling={};Min Pool Size={};\
             Max Pool Size={};Max Retries={};Connection Timeout={};\
             Connection Lifetime={};Server Polling Interval={};\
             Connection Type={};Buffer Size={};",
            self.keyspace,
            servers,
            cluster.pooling,
            cluster.min_pool_size,
            cluster.max_pool_size,
            self.max_retries,
            timeout,
            cluster.connection_lifetime.as_secs(),
            cluster.polling_interval.as_secs(),
            cluster.transport_kind,
            cluster.buffer_size,
        )
    }
}

// Split "A=1;B=2" into lowercased-key/trimmed-value pairs. Entries without
// an '=' are skipped.
fn split_pairs(connection_string: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    for part in connection_string.split(';') {
        let mut name_value = part.splitn(2, '=');
        let name = match name_value.next() {
            Some(n) => n.trim(),
            None => continue,
        };
        let value = match name_value.next() {
            Some(v) => v.trim(),
            None => continue,
        };
        if name.is_empty() {
            continue;
        }
        pairs.insert(name.to_ascii_lowercase(), value.to_string());
    }
    pairs
}

// Parse-or-default: a missing, malformed, or out-of-range value yields the
// key's default rather than an error.
fn parse_or_default<T: FromStr>(
    pairs: &HashMap<String, String>,
    key: &str,
    default: T,
) -> T {
    pairs
        .get(key)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_bool_or_default(
    pairs: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> bool {
    pairs
        .get(key)
        .and_then(|v| v.to_ascii_lowercase().parse::<bool>().ok())
        .unwrap_or(default)
}

// Parse a comma-separated "host[:port]" list. Whitespace around entries and
// around the colon is tolerated; an unparseable port falls back to the
// default port.
fn parse_servers(server_list: &str, timeout: Duration) -> Vec<Endpoint> {
    let mut endpoints = Vec::new();
    for entry in server_list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let mut host_port = entry.splitn(2, ':');
        let host = host_port.next().unwrap_or("").trim();
        if host.is_empty() {
            continue;
        }
        let port = host_port
            .next()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        endpoints.push(Endpoint::with_timeout(host, port, timeout));
    }
    endpoints
}
