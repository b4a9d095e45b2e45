//! In-process connections.

use std::{io, net::SocketAddr};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use tokio::sync::mpsc;

use super::{Connection, FrameSink, FrameSource, TransportKind};

/// Creates two connected ends of an in-process connection.
///
/// The addresses are only used for reporting. Frames sent on one end are received on the other
/// in order, and shutting down one end ends the other's stream.
pub fn pair(a_addr: SocketAddr, b_addr: SocketAddr) -> (Connection, Connection) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let a = Connection::new(
        TransportKind::Memory,
        a_addr,
        b_addr,
        Box::new(MemoryFrameSource { rx: b_rx }),
        Box::new(MemoryFrameSink { tx: Some(a_tx) }),
    );
    let b = Connection::new(
        TransportKind::Memory,
        b_addr,
        a_addr,
        Box::new(MemoryFrameSource { rx: a_rx }),
        Box::new(MemoryFrameSink { tx: Some(b_tx) }),
    );

    (a, b)
}

struct MemoryFrameSource {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl FrameSource for MemoryFrameSource {
    fn recv_frame(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        async move { Ok(self.rx.recv().await) }.boxed()
    }
}

struct MemoryFrameSink {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl FrameSink for MemoryFrameSink {
    fn send_frame(&mut self, frame: Bytes) -> BoxFuture<'_, io::Result<()>> {
        let res = match &self.tx {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe)),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        };
        async move { res }.boxed()
    }

    fn shutdown(&mut self) -> BoxFuture<'_, io::Result<()>> {
        self.tx = None;
        async { Ok(()) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn frames_cross_in_order() {
        let (mut a, mut b) = pair(addr(1), addr(2));
        assert_eq!(a.remote_addr(), addr(2));
        a.send_frame(Bytes::from_static(b"1")).await.unwrap();
        a.send_frame(Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(b.recv_frame().await.unwrap(), Some(Bytes::from_static(b"2")));
    }

    #[tokio::test]
    async fn shutdown_ends_the_peer_stream() {
        let (mut a, mut b) = pair(addr(1), addr(2));
        a.shutdown().await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap(), None);
        assert!(a.send_frame(Bytes::from_static(b"late")).await.is_err());
    }
}
