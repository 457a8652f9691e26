//! KNXnet/IP frame parsing and encoding.
//!
//! Zero-copy view over a received datagram: the 6-byte header is validated
//! once, the body stays a borrowed slice.

use crate::error::{KnxError, Result};
use crate::protocol::constants::{ServiceType, HEADER_SIZE_10, KNXNETIP_VERSION_10};

/// KNXnet/IP frame header (6 bytes)
///
/// ```text
/// +--------------+--------------+---------------------+
/// | Header Len   | Protocol Ver |  Service Type ID    |
/// |   (1 byte)   |   (1 byte)   |     (2 bytes)       |
/// +--------------+--------------+---------------------+
/// |           Total Length (2 bytes)                  |
/// +---------------------------------------------------+
/// ```
#[derive(Debug, Clone, Copy)]
pub struct KnxnetIpHeader {
    /// Service type identifier
    pub service_type: ServiceType,
    /// Total length of frame (header + body)
    pub total_length: u16,
}

impl KnxnetIpHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 6;

    /// Create a new header
    pub const fn new(service_type: ServiceType, body_length: u16) -> Self {
        Self {
            service_type,
            total_length: Self::SIZE as u16 + body_length,
        }
    }

    /// Parse a header from a byte slice
    ///
    /// # Errors
    ///
    /// Returns frame errors if the buffer is too small, the header length
    /// or protocol version do not match v1.0, or the service type is
    /// unknown.
    #[inline]
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(KnxError::buffer_too_small());
        }
        if data[0] != HEADER_SIZE_10 {
            return Err(KnxError::invalid_frame());
        }
        if data[1] != KNXNETIP_VERSION_10 {
            return Err(KnxError::unsupported_version());
        }

        let service_type_raw = u16::from_be_bytes([data[2], data[3]]);
        let total_length = u16::from_be_bytes([data[4], data[5]]);

        let service_type = ServiceType::from_u16(service_type_raw)
            .ok_or_else(|| KnxError::unsupported_service_type(service_type_raw))?;

        Ok(Self {
            service_type,
            total_length,
        })
    }

    /// Encode the header into a byte buffer
    ///
    /// # Errors
    ///
    /// Returns a frame error if the buffer is too small.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(KnxError::buffer_too_small());
        }

        buf[0] = HEADER_SIZE_10;
        buf[1] = KNXNETIP_VERSION_10;
        buf[2..4].copy_from_slice(&self.service_type.to_u16().to_be_bytes());
        buf[4..6].copy_from_slice(&self.total_length.to_be_bytes());

        Ok(Self::SIZE)
    }

    /// The expected body length from the header
    pub const fn body_length(&self) -> u16 {
        self.total_length.saturating_sub(Self::SIZE as u16)
    }
}

/// Zero-copy view of a KNXnet/IP frame
#[derive(Debug)]
pub struct KnxnetIpFrame<'a> {
    header: KnxnetIpHeader,
    body: &'a [u8],
}

impl<'a> KnxnetIpFrame<'a> {
    /// Parse a complete frame from a received datagram.
    ///
    /// Bytes beyond the declared total length are ignored.
    ///
    /// # Errors
    ///
    /// Header errors as in [`KnxnetIpHeader::parse`], plus a frame error if
    /// the datagram is shorter than the declared total length.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = KnxnetIpHeader::parse(data)?;
        let total = header.total_length as usize;
        if data.len() < total || total < KnxnetIpHeader::SIZE {
            return Err(KnxError::frame_length(data.len()));
        }
        Ok(Self {
            header,
            body: &data[KnxnetIpHeader::SIZE..total],
        })
    }

    /// The service type of this frame.
    #[inline(always)]
    pub const fn service_type(&self) -> ServiceType {
        self.header.service_type
    }

    /// The frame body (everything after the header).
    #[inline(always)]
    pub const fn body(&self) -> &'a [u8] {
        self.body
    }
}

/// Assemble a complete frame for a service type and body.
pub fn build_frame(service_type: ServiceType, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(KnxnetIpHeader::SIZE + body.len());
    let header = KnxnetIpHeader::new(service_type, body.len() as u16);
    let mut head = [0u8; KnxnetIpHeader::SIZE];
    // buffer is exactly header sized
    let _ = header.encode(&mut head);
    out.extend_from_slice(&head);
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = KnxnetIpHeader::new(ServiceType::TunnellingRequest, 10);
        let mut buf = [0u8; 6];
        header.encode(&mut buf).unwrap();
        assert_eq!(&buf[..4], &[0x06, 0x10, 0x04, 0x20]);
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 16);

        let parsed = KnxnetIpHeader::parse(&buf).unwrap();
        assert_eq!(parsed.service_type, ServiceType::TunnellingRequest);
        assert_eq!(parsed.body_length(), 10);
    }

    #[test]
    fn rejects_bad_header() {
        assert!(KnxnetIpHeader::parse(&[0x06, 0x10]).is_err());
        assert!(KnxnetIpHeader::parse(&[0x05, 0x10, 0x02, 0x05, 0x00, 0x06]).is_err());
        assert!(KnxnetIpHeader::parse(&[0x06, 0x20, 0x02, 0x05, 0x00, 0x06]).is_err());
        // unknown service type
        let err = KnxnetIpHeader::parse(&[0x06, 0x10, 0x0F, 0x0F, 0x00, 0x06]).unwrap_err();
        match err {
            KnxError::Frame(e) => assert_eq!(e.value(), Some(0x0F0F)),
            _ => panic!("wrong category"),
        }
    }

    #[test]
    fn frame_body_and_trailing_bytes() {
        let frame = build_frame(ServiceType::RoutingIndication, &[0xAA, 0xBB]);
        let mut with_noise = frame.clone();
        with_noise.extend_from_slice(&[0xFF; 4]);

        let parsed = KnxnetIpFrame::parse(&with_noise).unwrap();
        assert_eq!(parsed.service_type(), ServiceType::RoutingIndication);
        assert_eq!(parsed.body(), &[0xAA, 0xBB]);
    }

    #[test]
    fn truncated_frame() {
        let mut frame = build_frame(ServiceType::RoutingIndication, &[0xAA, 0xBB]);
        frame.pop();
        assert!(KnxnetIpFrame::parse(&frame).is_err());
    }
}
