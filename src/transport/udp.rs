//! One frame per UDP datagram.
//!
//! A [`UdpListener`] owns a single socket and demultiplexes datagrams by peer address. The first
//! datagram from an unknown peer opens a new [`Connection`]; later datagrams from that peer are
//! queued to it. An empty datagram tells the other side that the sender is closing.
//!
//! Delivery is whatever UDP provides: datagrams may be lost or reordered, and a datagram that
//! arrives while its peer's queue is full is dropped.

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::{
    net::{ToSocketAddrs, UdpSocket},
    sync::mpsc::{self, error::TrySendError},
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{trace, warn};

use super::{Connection, FrameSink, FrameSource, TransportKind};

/// Largest payload of a UDP datagram over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

const PEER_QUEUE_CAPACITY: usize = 256;
const ACCEPT_QUEUE_CAPACITY: usize = 64;

type Peers = Arc<Mutex<HashMap<SocketAddr, (u64, mpsc::Sender<Bytes>)>>>;

/// Accepts datagram connections on a single UDP socket.
#[derive(Debug)]
pub struct UdpListener {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Connection>,
    _shutdown: DropGuard,
}

impl UdpListener {
    /// Binds a listener to the address.
    pub async fn bind(addr: impl ToSocketAddrs, max_frame_size: usize) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(socket, max_frame_size)
    }

    /// Starts demultiplexing datagrams received on an already bound socket.
    pub fn from_socket(socket: UdpSocket, max_frame_size: usize) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;
        let (incoming_tx, incoming) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();

        tokio::spawn(demux_datagrams(
            Arc::new(socket),
            local_addr,
            Peers::default(),
            incoming_tx,
            shutdown.clone(),
            max_frame_size.min(MAX_DATAGRAM_SIZE),
        ));

        Ok(UdpListener {
            local_addr,
            incoming,
            _shutdown: shutdown.drop_guard(),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for a datagram from a new peer.
    pub async fn accept(&mut self) -> io::Result<Connection> {
        self.incoming.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "udp listener stopped")
        })
    }
}

async fn demux_datagrams(
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    peers: Peers,
    incoming: mpsc::Sender<Connection>,
    shutdown: CancellationToken,
    max_frame_size: usize,
) {
    static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(received) => received,
                Err(err) => {
                    // icmp errors from earlier sends surface here and concern a single peer
                    trace!(%err, "udp receive failed");
                    continue;
                }
            },
        };
        if len > max_frame_size {
            warn!(%peer, len, "dropping oversized datagram");
            continue;
        }
        let frame = Bytes::copy_from_slice(&buf[..len]);

        let existing = peers.lock().get(&peer).map(|(_, tx)| tx.clone());
        match existing {
            Some(tx) => match tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!(%peer, "peer queue full, dropping datagram"),
                Err(TrySendError::Closed(_)) => {
                    peers.lock().remove(&peer);
                }
            },
            None if frame.is_empty() => {}
            None => {
                let id = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
                let _ = tx.try_send(frame);
                peers.lock().insert(peer, (id, tx));

                let connection = Connection::new(
                    TransportKind::Udp,
                    local_addr,
                    peer,
                    Box::new(UdpPeerSource {
                        rx,
                        _guard: PeerGuard {
                            peers: peers.clone(),
                            peer,
                            id,
                        },
                    }),
                    Box::new(UdpFrameSink {
                        socket: socket.clone(),
                        peer: Some(peer),
                    }),
                );
                trace!(%peer, "new udp peer");
                if incoming.send(connection).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Removes a peer from the demultiplexer once its connection is dropped.
struct PeerGuard {
    peers: Peers,
    peer: SocketAddr,
    id: u64,
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        let mut peers = self.peers.lock();
        if peers.get(&self.peer).is_some_and(|(id, _)| *id == self.id) {
            peers.remove(&self.peer);
        }
    }
}

struct UdpPeerSource {
    rx: mpsc::Receiver<Bytes>,
    _guard: PeerGuard,
}

impl FrameSource for UdpPeerSource {
    fn recv_frame(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        async move {
            match self.rx.recv().await {
                Some(frame) if !frame.is_empty() => Ok(Some(frame)),
                _ => Ok(None),
            }
        }
        .boxed()
    }
}

struct UdpClientSource {
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
}

impl FrameSource for UdpClientSource {
    fn recv_frame(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        async move {
            let len = self.socket.recv(&mut self.buf).await?;
            if len == 0 {
                return Ok(None);
            }
            Ok(Some(Bytes::copy_from_slice(&self.buf[..len])))
        }
        .boxed()
    }
}

/// Sends frames as datagrams, either to a fixed peer or on a connected socket.
struct UdpFrameSink {
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
}

impl UdpFrameSink {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        match self.peer {
            Some(peer) => self.socket.send_to(datagram, peer).await?,
            None => self.socket.send(datagram).await?,
        };
        Ok(())
    }
}

impl FrameSink for UdpFrameSink {
    fn send_frame(&mut self, frame: Bytes) -> BoxFuture<'_, io::Result<()>> {
        async move {
            if frame.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "empty frames are reserved for closing",
                ));
            }
            self.send(&frame).await
        }
        .boxed()
    }

    fn shutdown(&mut self) -> BoxFuture<'_, io::Result<()>> {
        async move { self.send(&[]).await }.boxed()
    }
}

/// Opens a datagram connection to a listener.
pub async fn connect(addr: SocketAddr) -> io::Result<Connection> {
    let bind_ip = match addr.ip() {
        ip if ip.is_loopback() => ip,
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
    socket.connect(addr).await?;
    let local_addr = socket.local_addr()?;
    let socket = Arc::new(socket);

    Ok(Connection::new(
        TransportKind::Udp,
        local_addr,
        addr,
        Box::new(UdpClientSource {
            socket: socket.clone(),
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
        }),
        Box::new(UdpFrameSink { socket, peer: None }),
    ))
}
