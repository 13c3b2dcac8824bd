// Copyright 2020 Joyent, Inc.

use std::error;
use std::sync::Arc;

use crate::cluster::TransportKind;
use crate::endpoint::Endpoint;

/// The seam between the connection-management layer and the RPC/transport
/// layer.
///
/// A *connection* is a single socket-backed session bound to one endpoint
/// for its lifetime. It is created closed; `open` establishes the socket and
/// any handshake, `close` releases it. A connection that has been closed is
/// never reopened -- a fresh instance is created instead.
pub trait Connection: Send + Sized + 'static {
    /// The error type returned by `open` and `close`. Each implementation
    /// chooses the concrete error type appropriate to its transport; the
    /// only constraint is that it implement the standard
    /// [`Error`](std::error::Error) trait.
    type Error: error::Error;

    /// Establish the socket and perform any session handshake. Fails with a
    /// transport error on socket failure.
    fn open(&mut self) -> Result<(), Self::Error>;

    /// Release the socket.
    fn close(&mut self) -> Result<(), Self::Error>;

    /// Whether the connection is currently open. The pooled provider
    /// consults this before reusing an idle connection and during its
    /// eviction sweep.
    fn is_open(&self) -> bool;
}

/// A shared factory for connections of type `C`.
///
/// The factory captures whatever application-level configuration a session
/// needs (keyspace, credentials) and returns a *closed* connection bound to
/// the given endpoint; the provider opens it. The same factory also backs
/// the server managers' recovery probes, which call it with
/// [`TransportKind::Simple`] and a minimal buffer.
pub type ConnectionFactory<C> =
    Arc<dyn Fn(&Endpoint, TransportKind, usize) -> C + Send + Sync>;
