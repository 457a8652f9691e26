//! Transport abstraction and tokio socket implementations.
//!
//! High-level connection logic depends on [`AsyncTransport`] only; UDP and
//! TCP implementations (and the test mock) vary independently underneath.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::error::{KnxError, Result};
use crate::protocol::constants::MAX_FRAME_SIZE;
use crate::protocol::frame::KnxnetIpHeader;

/// Asynchronous datagram transport.
///
/// Implementations deliver whole KNXnet/IP frames per `recv_from` call; the
/// TCP transport reassembles them from the stream.
#[allow(async_fn_in_trait)]
pub trait AsyncTransport {
    /// Send a frame to the given endpoint.
    async fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<()>;

    /// Receive the next frame.
    ///
    /// Returns the number of bytes received and the source endpoint.
    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Whether the transport is ready for traffic.
    fn is_ready(&self) -> bool {
        true
    }

    /// Close the transport and release resources.
    fn close(&mut self) {}
}

/// UDP transport over a tokio socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    open: bool,
}

impl UdpTransport {
    /// Bind to a local port (0 = ephemeral).
    ///
    /// # Errors
    ///
    /// Transport errors when binding fails.
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await.map_err(|e| {
            log::warn!("udp bind failed: {e}");
            KnxError::not_bound()
        })?;
        Ok(Self { socket, open: true })
    }

    /// Bind for routing: join the KNXnet/IP multicast group on `port`.
    ///
    /// # Errors
    ///
    /// Transport errors when binding or joining fails.
    pub async fn bind_multicast(group: Ipv4Addr, port: u16) -> Result<Self> {
        let transport = Self::bind(port).await?;
        transport
            .socket
            .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
            .map_err(|e| {
                log::warn!("multicast join failed: {e}");
                KnxError::socket_error()
            })?;
        Ok(transport)
    }
}

impl AsyncTransport for UdpTransport {
    async fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<()> {
        if !self.open {
            return Err(KnxError::not_bound());
        }
        self.socket
            .send_to(data, addr)
            .await
            .map_err(|_| KnxError::send_failed())?;
        Ok(())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        if !self.open {
            return Err(KnxError::not_bound());
        }
        self.socket
            .recv_from(buf)
            .await
            .map_err(|_| KnxError::receive_failed())
    }

    fn is_ready(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// TCP transport with frame reassembly.
///
/// KNXnet/IP over TCP is a byte stream; frames are delimited by the total
/// length field of the common header.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    pending: Vec<u8>,
    open: bool,
}

impl TcpTransport {
    /// Connect to a KNXnet/IP server over TCP.
    ///
    /// # Errors
    ///
    /// Transport errors when the connection fails.
    pub async fn connect(server: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(server).await.map_err(|e| {
            log::warn!("tcp connect to {server} failed: {e}");
            KnxError::socket_error()
        })?;
        Ok(Self {
            stream,
            peer: server,
            pending: Vec::new(),
            open: true,
        })
    }

    /// Extract one complete frame from the pending buffer, if present.
    fn take_frame(&mut self) -> Option<Vec<u8>> {
        if self.pending.len() < KnxnetIpHeader::SIZE {
            return None;
        }
        let total = u16::from_be_bytes([self.pending[4], self.pending[5]]) as usize;
        if total < KnxnetIpHeader::SIZE || total > MAX_FRAME_SIZE {
            // stream is out of sync, drop the buffer
            log::warn!("tcp stream desynchronized, dropping {} bytes", self.pending.len());
            self.pending.clear();
            return None;
        }
        if self.pending.len() < total {
            return None;
        }
        let frame = self.pending[..total].to_vec();
        self.pending.drain(..total);
        Some(frame)
    }
}

impl AsyncTransport for TcpTransport {
    async fn send_to(&mut self, data: &[u8], _addr: SocketAddr) -> Result<()> {
        if !self.open {
            return Err(KnxError::not_bound());
        }
        self.stream
            .write_all(data)
            .await
            .map_err(|_| KnxError::send_failed())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        loop {
            if let Some(frame) = self.take_frame() {
                if frame.len() > buf.len() {
                    return Err(KnxError::buffer_too_small());
                }
                buf[..frame.len()].copy_from_slice(&frame);
                return Ok((frame.len(), self.peer));
            }

            if !self.open {
                return Err(KnxError::link_closed());
            }
            let mut chunk = [0u8; MAX_FRAME_SIZE];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|_| KnxError::receive_failed())?;
            if n == 0 {
                self.open = false;
                return Err(KnxError::link_closed());
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    fn is_ready(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_loopback_roundtrip() {
        let mut a = UdpTransport::bind(0).await.unwrap();
        let b = UdpTransport::bind(0).await.unwrap();
        let b_addr: SocketAddr =
            format!("127.0.0.1:{}", b.socket.local_addr().unwrap().port())
                .parse()
                .unwrap();

        a.send_to(&[0x06, 0x10, 0x05, 0x30, 0x00, 0x06], b_addr)
            .await
            .unwrap();

        let mut transport = b;
        let mut buf = [0u8; 64];
        let (n, _) = transport.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x06, 0x10, 0x05, 0x30, 0x00, 0x06]);
    }

    #[tokio::test]
    async fn udp_closed_rejects_io() {
        let mut transport = UdpTransport::bind(0).await.unwrap();
        transport.close();
        assert!(!transport.is_ready());
        let addr: SocketAddr = "127.0.0.1:3671".parse().unwrap();
        assert!(transport.send_to(&[0], addr).await.is_err());
    }

    #[tokio::test]
    async fn tcp_reassembles_frames() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // two frames split across three writes
            stream.write_all(&[0x06, 0x10, 0x05, 0x30]).await.unwrap();
            stream.write_all(&[0x00, 0x08, 0xAA, 0xBB]).await.unwrap();
            stream
                .write_all(&[0x06, 0x10, 0x05, 0x30, 0x00, 0x07, 0xCC])
                .await
                .unwrap();
        });

        let mut transport = TcpTransport::connect(addr).await.unwrap();
        let mut buf = [0u8; 64];

        let (n, _) = transport.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x06, 0x10, 0x05, 0x30, 0x00, 0x08, 0xAA, 0xBB]);

        let (n, _) = transport.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x06, 0x10, 0x05, 0x30, 0x00, 0x07, 0xCC]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_peer_close_is_link_closed() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut transport = TcpTransport::connect(addr).await.unwrap();
        let mut buf = [0u8; 64];
        let err = transport.recv_from(&mut buf).await.unwrap_err();
        match err {
            KnxError::Connection(e) => assert!(e.is_closed()),
            other => panic!("unexpected {other}"),
        }
        server.await.unwrap();
    }
}
