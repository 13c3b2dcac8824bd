// Copyright 2020 Joyent, Inc.

use std::io::{Error as IoError, ErrorKind};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::cluster::TransportKind;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::Error;

/// A socket-backed [`Connection`] over a `TcpStream`.
///
/// The RPC layer wraps the stream in the framing indicated by
/// [`kind`](TcpSocketConnection::kind) with
/// [`buffer_size`](TcpSocketConnection::buffer_size) byte buffers; this type
/// only owns the socket lifecycle. A non-zero endpoint timeout bounds the
/// connect call and is applied as the stream's read/write timeout.
#[derive(Debug)]
pub struct TcpSocketConnection {
    pub stream: Option<TcpStream>,
    endpoint: Endpoint,
    kind: TransportKind,
    buffer_size: usize,
    keyspace: Option<String>,
}

impl TcpSocketConnection {
    pub fn new(
        endpoint: &Endpoint,
        kind: TransportKind,
        buffer_size: usize,
    ) -> Self {
        TcpSocketConnection {
            stream: None,
            endpoint: endpoint.clone(),
            kind,
            buffer_size,
            keyspace: None,
        }
    }

    /// The endpoint this connection is bound to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The framing mode the RPC layer should apply.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// The buffer size the RPC layer should apply.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Record the keyspace this session should select after its handshake.
    pub fn set_keyspace<S: Into<String>>(&mut self, keyspace: S) {
        self.keyspace = Some(keyspace.into());
    }

    /// The keyspace recorded for this session, if any.
    pub fn keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }

    fn resolve(&self) -> Result<SocketAddr, Error> {
        (self.endpoint.host.as_str(), self.endpoint.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                Error::Io(IoError::new(
                    ErrorKind::AddrNotAvailable,
                    format!("no address found for {}", self.endpoint),
                ))
            })
    }
}

impl Connection for TcpSocketConnection {
    type Error = Error;

    fn open(&mut self) -> Result<(), Self::Error> {
        let addr = self.resolve()?;
        let timeout = self.endpoint.timeout;
        let stream = if timeout > Duration::from_secs(0) {
            let stream = TcpStream::connect_timeout(&addr, timeout)?;
            stream.set_read_timeout(Some(timeout))?;
            stream.set_write_timeout(Some(timeout))?;
            stream
        } else {
            TcpStream::connect(&addr)?
        };
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.stream = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl Deref for TcpSocketConnection {
    type Target = TcpStream;

    fn deref(&self) -> &TcpStream {
        self.stream.as_ref().unwrap()
    }
}

impl DerefMut for TcpSocketConnection {
    fn deref_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().unwrap()
    }
}
