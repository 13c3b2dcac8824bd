// Copyright 2020 Joyent, Inc.

//! Connection management for a socket-RPC column-store client
//!
//! Carom hands out healthy, ready-to-use connections to a set of candidate
//! database servers, detects and quarantines failing servers without
//! stopping the whole client, periodically probes quarantined servers for
//! recovery, and reclaims and reuses connections to bound socket consumption
//! under concurrent load. It is the connection/failover layer of a client
//! whose data-mapping and RPC-marshaling layers live elsewhere; the two meet
//! at the [`Connection`](connection/trait.Connection.html) trait.
//!
//! ## Endpoints and clusters
//!
//! An [`Endpoint`](endpoint/struct.Endpoint.html) identifies one server:
//! host, port, and connect timeout. A
//! [`Cluster`](cluster/struct.Cluster.html) is an immutable set of endpoints
//! plus the policy shared by every connection made to them: pooling on or
//! off, pool bounds, polling interval, connection lifetime, transport kind,
//! and buffer size. Clusters have structural identity -- see
//! [`Cluster::key`](cluster/struct.Cluster.html#method.key) -- so two
//! sessions configured alike can share infrastructure. Clusters are usually
//! produced by parsing a connection string with a
//! [`ConnectionBuilder`](builder/struct.ConnectionBuilder.html).
//!
//! ## Connections
//!
//! A *connection* is not necessarily just a TCP socket. It is anything
//! bound to a single endpoint that can be opened, closed, and asked whether
//! it is still open -- for example a session that performs an RPC handshake
//! and selects a keyspace before it is considered connected. Implement the
//! [`Connection`](connection/trait.Connection.html) trait to participate;
//! [`TcpSocketConnection`](transport/struct.TcpSocketConnection.html) is the
//! plain-socket implementation. Providers and probes create connections
//! through a
//! [`ConnectionFactory`](connection/type.ConnectionFactory.html) closure,
//! which is where application-level configuration such as the keyspace is
//! captured.
//!
//! ## Server managers
//!
//! A [`ServerManager`](server_manager/enum.ServerManager.html) tracks which
//! endpoints are live and which are blacklisted after a failure. A
//! single-endpoint configuration gets a boolean failed/available tracker
//! whose recovery probe is armed once per failure; a multi-endpoint
//! configuration gets a round-robin rotation with a periodic recovery pass
//! over the blacklist. Recovery probes open a throwaway trial connection
//! and close it again.
//!
//! ## Connection providers
//!
//! A [`ConnectionProvider`](connection_provider/enum.ConnectionProvider.html)
//! is what callers use. The non-pooling variant opens a fresh connection
//! per request, failing over across endpoints until one succeeds or all are
//! quarantined. The pooled variant keeps bounded free and used partitions,
//! reuses idle connections in FIFO order, blocks callers for up to 30
//! seconds when the pool is saturated, and sweeps dead or expired idle
//! connections on a timer. Both hand out a
//! [`ProviderConnection`](connection_provider/struct.ProviderConnection.html)
//! guard that releases itself back to the provider when it falls out of
//! scope.
//!
//! ## The provider registry
//!
//! A [`ProviderRegistry`](registry/struct.ProviderRegistry.html) maps
//! cluster identity to a shared, reference-counted provider and
//! server-manager pair, so multiple logical sessions targeting the same
//! servers share one pool. Handles decrement the count on drop; a periodic
//! sweep disposes entries once their count reaches zero.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use carom::builder::ConnectionBuilder;
//! use carom::registry::ProviderRegistry;
//! use carom::transport::TcpSocketConnection;
//!
//! let builder = ConnectionBuilder::from_connection_string(
//!     "Keyspace=media;Server=10.0.0.1,10.0.0.2,10.0.0.3;\
//!      Pooling=True;Connection Timeout=5",
//! );
//!
//! let keyspace = builder.keyspace().to_string();
//! let registry = ProviderRegistry::new(
//!     Arc::new(move |endpoint, kind, buffer_size| {
//!         let mut conn =
//!             TcpSocketConnection::new(endpoint, kind, buffer_size);
//!         conn.set_keyspace(keyspace.clone());
//!         conn
//!     }),
//!     None,
//! );
//!
//! let provider = registry.get(builder.cluster())?;
//! let conn = provider.open()?;
//! // Use the connection; it returns to the pool when dropped.
//! ```

#![allow(missing_docs)]

pub mod builder;
pub mod cluster;
pub mod connection;
pub mod connection_provider;
pub mod endpoint;
pub mod error;
pub mod registry;
pub mod server_manager;
pub mod transport;
