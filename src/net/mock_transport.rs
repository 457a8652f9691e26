//! Mock transport for testing.
//!
//! Pre-programmed responses come back from `recv_from` in FIFO order; every
//! packet passed to `send_to` is recorded for inspection. An empty response
//! queue reports a timeout, which the connection state machines treat as
//! "nothing arrived".

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::error::{KnxError, Result};
use crate::net::transport::AsyncTransport;

/// Scripted transport for protocol tests.
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: VecDeque<(Vec<u8>, SocketAddr)>,
    sent_packets: Vec<(Vec<u8>, SocketAddr)>,
    ready: bool,
}

impl MockTransport {
    /// Create a ready mock transport.
    pub fn new() -> Self {
        Self {
            responses: VecDeque::new(),
            sent_packets: Vec::new(),
            ready: true,
        }
    }

    /// Queue a response, reported as coming from the default gateway
    /// endpoint.
    pub fn add_response(&mut self, data: Vec<u8>) {
        self.add_response_from(data, "192.168.1.10:3671".parse().unwrap());
    }

    /// Queue a response with an explicit source endpoint.
    pub fn add_response_from(&mut self, data: Vec<u8>, from: SocketAddr) {
        self.responses.push_back((data, from));
    }

    /// All packets sent so far, with their destinations.
    pub fn sent_packets(&self) -> &[(Vec<u8>, SocketAddr)] {
        &self.sent_packets
    }

    /// The most recently sent packet.
    pub fn last_sent(&self) -> Option<&(Vec<u8>, SocketAddr)> {
        self.sent_packets.last()
    }

    /// Forget the send history.
    pub fn clear_sent(&mut self) {
        self.sent_packets.clear();
    }

    /// Number of responses not yet consumed.
    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }
}

impl AsyncTransport for MockTransport {
    async fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<()> {
        self.sent_packets.push((data.to_vec(), addr));
        Ok(())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        if let Some((data, from)) = self.responses.pop_front() {
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            Ok((len, from))
        } else {
            // queue exhausted: behave like a quiet network
            Err(KnxError::Timeout)
        }
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn close(&mut self) {
        self.ready = false;
        self.responses.clear();
    }
}
