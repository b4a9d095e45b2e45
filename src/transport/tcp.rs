//! Length-prefixed frames over TCP.

use std::io;

use bytes::{Bytes, BytesMut};
use futures::{future::BoxFuture, FutureExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream, ToSocketAddrs,
    },
};

use crate::framing::write_length_prefix;

use super::{Connection, FrameSink, FrameSource, TransportKind};

const TCP_BUFFER_SIZE: usize = 64 * 1024;

/// Reads length-prefixed frames from a TCP stream.
#[derive(Debug)]
pub struct TcpFrameSource {
    reader: BufReader<OwnedReadHalf>,
    max_frame_size: usize,
}

impl FrameSource for TcpFrameSource {
    fn recv_frame(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        async move {
            let len = match self.reader.read_u32().await {
                Ok(len) => len as usize,
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(err) => return Err(err),
            };
            if len > self.max_frame_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "frame of {len} bytes exceeds the maximum of {}",
                        self.max_frame_size
                    ),
                ));
            }

            let mut frame = BytesMut::zeroed(len);
            self.reader.read_exact(&mut frame).await?;
            Ok(Some(frame.freeze()))
        }
        .boxed()
    }
}

/// Writes length-prefixed frames to a TCP stream.
#[derive(Debug)]
pub struct TcpFrameSink {
    writer: BufWriter<OwnedWriteHalf>,
}

impl FrameSink for TcpFrameSink {
    fn send_frame(&mut self, frame: Bytes) -> BoxFuture<'_, io::Result<()>> {
        async move {
            self.writer
                .write_all(&write_length_prefix(frame.len()))
                .await?;
            self.writer.write_all(&frame).await?;
            self.writer.flush().await
        }
        .boxed()
    }

    fn shutdown(&mut self) -> BoxFuture<'_, io::Result<()>> {
        async move { self.writer.shutdown().await }.boxed()
    }
}

/// Wraps an established TCP stream in a framed connection.
pub fn connection(stream: TcpStream, max_frame_size: usize) -> io::Result<Connection> {
    stream.set_nodelay(true)?;
    let local_addr = stream.local_addr()?;
    let remote_addr = stream.peer_addr()?;
    let (reader, writer) = stream.into_split();

    Ok(Connection::new(
        TransportKind::Tcp,
        local_addr,
        remote_addr,
        Box::new(TcpFrameSource {
            reader: BufReader::with_capacity(TCP_BUFFER_SIZE, reader),
            max_frame_size,
        }),
        Box::new(TcpFrameSink {
            writer: BufWriter::with_capacity(TCP_BUFFER_SIZE, writer),
        }),
    ))
}

/// Connects to a TCP endpoint.
pub async fn connect(addr: impl ToSocketAddrs, max_frame_size: usize) -> io::Result<Connection> {
    let stream = TcpStream::connect(addr).await?;
    connection(stream, max_frame_size)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn pair(max_frame_size: usize) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(connect(addr, max_frame_size), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn frames_are_length_prefixed() {
        let (mut client, mut server) = pair(1024).await;
        client
            .send_frame(Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let len = server.read_u32().await.unwrap();
        assert_eq!(len, 5);
        let mut body = [0u8; 5];
        server.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"hello");
    }

    #[tokio::test]
    async fn eof_at_frame_boundary_is_a_clean_close() {
        let (mut client, mut server) = pair(1024).await;
        server.write_all(&[0, 0, 0, 2, b'h', b'i']).await.unwrap();
        server.shutdown().await.unwrap();

        assert_eq!(
            client.recv_frame().await.unwrap(),
            Some(Bytes::from_static(b"hi"))
        );
        assert_eq!(client.recv_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut client, mut server) = pair(4).await;
        server.write_all(&[0, 0, 0, 5]).await.unwrap();

        let err = client.recv_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
