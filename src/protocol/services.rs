//! KNXnet/IP service codecs.
//!
//! Connection management (CONNECT / CONNECTIONSTATE / DISCONNECT),
//! tunneling (TUNNELING_REQUEST / TUNNELING_ACK) and routing
//! (ROUTING_INDICATION / ROUTING_BUSY / ROUTING_LOST_MESSAGE) bodies.
//! Builders return complete frames including the common header.
//!
//! ## Protocol Flow
//!
//! ```text
//! Client                          Gateway
//!   |------- CONNECT_REQUEST ------->|
//!   |<------ CONNECT_RESPONSE -------|
//!   |------ TUNNELING_REQUEST ------>|
//!   |<------ TUNNELING_ACK ----------|
//!   |--- CONNECTIONSTATE_REQUEST --->|  (heartbeat)
//!   |<-- CONNECTIONSTATE_RESPONSE ---|
//!   |------ DISCONNECT_REQUEST ----->|
//!   |<----- DISCONNECT_RESPONSE -----|
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{KnxError, Result};
use crate::protocol::constants::{
    ServiceType, E_NO_ERROR, IPV4_UDP, TUNNEL_CONNECTION, TUNNEL_LINKLAYER,
};
use crate::protocol::frame::build_frame;

/// Host protocol address information (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hpai {
    /// Host protocol code (UDP or TCP)
    pub protocol: u8,
    /// Endpoint address; 0.0.0.0:0 requests NAT-aware replies
    pub endpoint: SocketAddrV4,
}

impl Hpai {
    /// Size on the wire.
    pub const SIZE: usize = 8;

    /// Create a UDP HPAI.
    pub const fn udp(endpoint: SocketAddrV4) -> Self {
        Self {
            protocol: IPV4_UDP,
            endpoint,
        }
    }

    /// The NAT-traversal wildcard endpoint.
    pub const fn nat() -> Self {
        Self::udp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
    }

    /// Encode into a buffer.
    ///
    /// # Errors
    ///
    /// Returns a frame error if the buffer is too small.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(KnxError::buffer_too_small());
        }
        buf[0] = Self::SIZE as u8;
        buf[1] = self.protocol;
        buf[2..6].copy_from_slice(&self.endpoint.ip().octets());
        buf[6..8].copy_from_slice(&self.endpoint.port().to_be_bytes());
        Ok(Self::SIZE)
    }

    /// Decode from a buffer.
    ///
    /// # Errors
    ///
    /// Returns a frame error on truncated or wrong-length structures.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(KnxError::buffer_too_small());
        }
        if data[0] as usize != Self::SIZE {
            return Err(KnxError::invalid_frame());
        }
        let ip = Ipv4Addr::new(data[2], data[3], data[4], data[5]);
        let port = u16::from_be_bytes([data[6], data[7]]);
        Ok(Self {
            protocol: data[1],
            endpoint: SocketAddrV4::new(ip, port),
        })
    }
}

/// `CONNECT_REQUEST` (0x0205) for a link layer tunnel.
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest {
    /// Control endpoint (connection management)
    pub control_endpoint: Hpai,
    /// Data endpoint (tunneling data)
    pub data_endpoint: Hpai,
}

impl ConnectRequest {
    /// Create a tunnel connect request.
    pub const fn new(control_endpoint: Hpai, data_endpoint: Hpai) -> Self {
        Self {
            control_endpoint,
            data_endpoint,
        }
    }

    /// Build the complete frame.
    pub fn build(&self) -> Vec<u8> {
        let mut body = [0u8; 2 * Hpai::SIZE + 4];
        // endpoints are fixed-size, encode cannot fail into this buffer
        let _ = self.control_endpoint.encode(&mut body[..Hpai::SIZE]);
        let _ = self.data_endpoint.encode(&mut body[Hpai::SIZE..2 * Hpai::SIZE]);
        body[16] = 4; // CRI length
        body[17] = TUNNEL_CONNECTION;
        body[18] = TUNNEL_LINKLAYER;
        body[19] = 0x00; // reserved
        build_frame(ServiceType::ConnectRequest, &body)
    }
}

/// `CONNECT_RESPONSE` (0x0206).
#[derive(Debug, Clone, Copy)]
pub struct ConnectResponse {
    /// Communication channel id
    pub channel_id: u8,
    /// Status code (0 = OK)
    pub status: u8,
    /// Data endpoint assigned by the server
    pub data_endpoint: Option<Hpai>,
}

impl ConnectResponse {
    /// Parse from a frame body.
    ///
    /// # Errors
    ///
    /// Returns a frame error on truncated bodies.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 2 {
            return Err(KnxError::buffer_too_small());
        }
        let channel_id = body[0];
        let status = body[1];
        // error responses stop after the status octet
        let data_endpoint = if status == E_NO_ERROR && body.len() >= 2 + Hpai::SIZE {
            Some(Hpai::decode(&body[2..])?)
        } else {
            None
        };
        Ok(Self {
            channel_id,
            status,
            data_endpoint,
        })
    }

    /// Whether the connection was accepted.
    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }
}

/// `CONNECTIONSTATE_REQUEST` (0x0207), the heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStateRequest {
    /// Communication channel id
    pub channel_id: u8,
    /// Control endpoint
    pub control_endpoint: Hpai,
}

impl ConnectionStateRequest {
    /// Build the complete frame.
    pub fn build(&self) -> Vec<u8> {
        let mut body = [0u8; 2 + Hpai::SIZE];
        body[0] = self.channel_id;
        body[1] = 0x00; // reserved
        let _ = self.control_endpoint.encode(&mut body[2..]);
        build_frame(ServiceType::ConnectionstateRequest, &body)
    }
}

/// `CONNECTIONSTATE_RESPONSE` (0x0208) and `DISCONNECT_RESPONSE` (0x020A)
/// share this body.
#[derive(Debug, Clone, Copy)]
pub struct ChannelStatus {
    /// Communication channel id
    pub channel_id: u8,
    /// Status code (0 = OK)
    pub status: u8,
}

impl ChannelStatus {
    /// Parse from a frame body.
    ///
    /// # Errors
    ///
    /// Returns a frame error on truncated bodies.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 2 {
            return Err(KnxError::buffer_too_small());
        }
        Ok(Self {
            channel_id: body[0],
            status: body[1],
        })
    }

    /// Build the two-byte body into a frame of the given service type.
    pub fn build(&self, service_type: ServiceType) -> Vec<u8> {
        build_frame(service_type, &[self.channel_id, self.status])
    }

    /// Whether the peer reported success.
    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }
}

/// `DISCONNECT_REQUEST` (0x0209).
#[derive(Debug, Clone, Copy)]
pub struct DisconnectRequest {
    /// Communication channel id
    pub channel_id: u8,
    /// Control endpoint
    pub control_endpoint: Hpai,
}

impl DisconnectRequest {
    /// Build the complete frame.
    pub fn build(&self) -> Vec<u8> {
        let mut body = [0u8; 2 + Hpai::SIZE];
        body[0] = self.channel_id;
        body[1] = 0x00;
        let _ = self.control_endpoint.encode(&mut body[2..]);
        build_frame(ServiceType::DisconnectRequest, &body)
    }

    /// Parse from a frame body (server-initiated disconnect).
    ///
    /// # Errors
    ///
    /// Returns a frame error on truncated bodies.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 2 + Hpai::SIZE {
            return Err(KnxError::buffer_too_small());
        }
        Ok(Self {
            channel_id: body[0],
            control_endpoint: Hpai::decode(&body[2..])?,
        })
    }
}

/// Connection header preceding tunneling bodies (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    /// Communication channel id
    pub channel_id: u8,
    /// Per-channel 8-bit sequence counter
    pub sequence: u8,
}

impl ConnectionHeader {
    /// Size on the wire.
    pub const SIZE: usize = 4;

    /// Create a connection header.
    pub const fn new(channel_id: u8, sequence: u8) -> Self {
        Self {
            channel_id,
            sequence,
        }
    }

    /// Decode from a buffer.
    ///
    /// # Errors
    ///
    /// Returns a frame error on truncated buffers.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(KnxError::buffer_too_small());
        }
        Ok(Self {
            channel_id: data[1],
            sequence: data[2],
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(Self::SIZE as u8);
        out.push(self.channel_id);
        out.push(self.sequence);
        out.push(0x00); // reserved / status
    }
}

/// `TUNNELING_REQUEST` (0x0420) carrying a cEMI frame.
#[derive(Debug)]
pub struct TunnelingRequest<'a> {
    /// Connection header
    pub header: ConnectionHeader,
    /// cEMI frame bytes
    pub cemi: &'a [u8],
}

impl<'a> TunnelingRequest<'a> {
    /// Create a tunneling request.
    pub const fn new(header: ConnectionHeader, cemi: &'a [u8]) -> Self {
        Self { header, cemi }
    }

    /// Build the complete frame.
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(ConnectionHeader::SIZE + self.cemi.len());
        self.header.write(&mut body);
        body.extend_from_slice(self.cemi);
        build_frame(ServiceType::TunnellingRequest, &body)
    }

    /// Parse from a frame body.
    ///
    /// # Errors
    ///
    /// Returns a frame error on truncated bodies.
    pub fn parse(body: &'a [u8]) -> Result<Self> {
        let header = ConnectionHeader::decode(body)?;
        Ok(Self {
            header,
            cemi: &body[ConnectionHeader::SIZE..],
        })
    }
}

/// `TUNNELING_ACK` (0x0421).
#[derive(Debug, Clone, Copy)]
pub struct TunnelingAck {
    /// Connection header
    pub header: ConnectionHeader,
    /// Status code (0 = OK)
    pub status: u8,
}

impl TunnelingAck {
    /// Acknowledge the given sequence on a channel.
    pub const fn ok(channel_id: u8, sequence: u8) -> Self {
        Self {
            header: ConnectionHeader::new(channel_id, sequence),
            status: E_NO_ERROR,
        }
    }

    /// Build the complete frame.
    pub fn build(&self) -> Vec<u8> {
        let body = [
            ConnectionHeader::SIZE as u8,
            self.header.channel_id,
            self.header.sequence,
            self.status,
        ];
        build_frame(ServiceType::TunnellingAck, &body)
    }

    /// Parse from a frame body.
    ///
    /// # Errors
    ///
    /// Returns a frame error on truncated bodies.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < ConnectionHeader::SIZE {
            return Err(KnxError::buffer_too_small());
        }
        Ok(Self {
            header: ConnectionHeader::decode(body)?,
            status: body[3],
        })
    }

    /// Whether the request was acknowledged.
    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }
}

/// `ROUTING_INDICATION` (0x0530): a cEMI frame on the multicast group.
pub fn build_routing_indication(cemi: &[u8]) -> Vec<u8> {
    build_frame(ServiceType::RoutingIndication, cemi)
}

/// `ROUTING_BUSY` (0x0532).
#[derive(Debug, Clone, Copy)]
pub struct RoutingBusy {
    /// Device state bits
    pub device_state: u8,
    /// Requested pause in milliseconds
    pub wait_time_ms: u16,
    /// Selector for targeted flow control
    pub control: u16,
}

impl RoutingBusy {
    /// Parse from a frame body.
    ///
    /// # Errors
    ///
    /// Returns a frame error on truncated bodies.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 6 {
            return Err(KnxError::buffer_too_small());
        }
        if body[0] as usize != 6 {
            return Err(KnxError::invalid_frame());
        }
        Ok(Self {
            device_state: body[1],
            wait_time_ms: u16::from_be_bytes([body[2], body[3]]),
            control: u16::from_be_bytes([body[4], body[5]]),
        })
    }

    /// Build the complete frame.
    pub fn build(&self) -> Vec<u8> {
        let mut body = [0u8; 6];
        body[0] = 6;
        body[1] = self.device_state;
        body[2..4].copy_from_slice(&self.wait_time_ms.to_be_bytes());
        body[4..6].copy_from_slice(&self.control.to_be_bytes());
        build_frame(ServiceType::RoutingBusy, &body)
    }
}

/// `ROUTING_LOST_MESSAGE` (0x0531).
#[derive(Debug, Clone, Copy)]
pub struct RoutingLostMessage {
    /// Device state bits
    pub device_state: u8,
    /// Number of frames the router dropped
    pub lost_messages: u16,
}

impl RoutingLostMessage {
    /// Parse from a frame body.
    ///
    /// # Errors
    ///
    /// Returns a frame error on truncated bodies.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(KnxError::buffer_too_small());
        }
        Ok(Self {
            device_state: body[1],
            lost_messages: u16::from_be_bytes([body[2], body[3]]),
        })
    }
}
