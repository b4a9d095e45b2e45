//! Framed connections over which channels exchange packets.
//!
//! A [`Connection`] is a bidirectional pipe of whole frames, split into a [`FrameSource`] and a
//! [`FrameSink`] so that reading and writing can run on separate tasks. Three transports are
//! provided:
//!
//! - [`tcp`]: frames are length prefixed on a TCP stream.
//! - [`udp`]: one frame per datagram, with peers demultiplexed by address.
//! - [`memory`]: an in-process pair, useful for tests and embedding.

pub mod memory;
pub mod tcp;
pub mod udp;

use std::{fmt, io, net::SocketAddr};

use bytes::Bytes;
use futures::future::BoxFuture;

/// The kind of transport a gateway listens on or a connection runs over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Length-prefixed frames on a TCP stream.
    #[default]
    Tcp,
    /// One frame per UDP datagram.
    Udp,
    /// In-process frames.
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::Memory => write!(f, "memory"),
        }
    }
}

/// The receiving half of a connection.
pub trait FrameSource: Send + 'static {
    /// Receives the next frame, or `None` once the peer has closed the connection.
    fn recv_frame(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>>;
}

/// The sending half of a connection.
pub trait FrameSink: Send + 'static {
    /// Sends a single frame.
    fn send_frame(&mut self, frame: Bytes) -> BoxFuture<'_, io::Result<()>>;

    /// Flushes pending frames and tells the peer the connection is closing.
    fn shutdown(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

/// A framed, bidirectional connection.
pub struct Connection {
    kind: TransportKind,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
}

impl Connection {
    /// Creates a connection from its halves.
    pub fn new(
        kind: TransportKind,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        Connection {
            kind,
            local_addr,
            remote_addr,
            source,
            sink,
        }
    }

    /// The transport the connection runs over.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// The local address of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address of the peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Receives the next frame.
    pub async fn recv_frame(&mut self) -> io::Result<Option<Bytes>> {
        self.source.recv_frame().await
    }

    /// Sends a single frame.
    pub async fn send_frame(&mut self, frame: Bytes) -> io::Result<()> {
        self.sink.send_frame(frame).await
    }

    /// Closes the sending side of the connection.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.sink.shutdown().await
    }

    /// Splits the connection into its receiving and sending halves.
    pub fn split(self) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        (self.source, self.sink)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}
