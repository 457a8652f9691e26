//! cEMI additional information blocks.
//!
//! Extended L-Data frames may carry a sequence of `{type, length, payload}`
//! tuples between the message code and the service information. Known types
//! have a fixed payload length; unknown types are kept verbatim. On emission
//! blocks are sorted by ascending type id.

use crate::addressing::SerialNumber;
use crate::error::{KnxError, Result};
use core::fmt;

/// cEMI Additional Information Type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddInfoType {
    /// PL medium information
    PlMedium = 0x01,
    /// RF medium information
    RfMedium = 0x02,
    /// Busmonitor status info
    BusmonitorStatus = 0x03,
    /// Relative timestamp
    RelativeTimestamp = 0x04,
    /// Time delay until sending
    TimeDelay = 0x05,
    /// Extended relative timestamp
    ExtendedTimestamp = 0x06,
    /// `BiBat` information
    BiBat = 0x07,
}

impl AddInfoType {
    /// The fixed payload length of a known type, if any.
    pub const fn fixed_length(type_id: u8) -> Option<usize> {
        match type_id {
            0x01 => Some(2),
            0x02 => Some(8),
            0x03 => Some(1),
            0x04 => Some(2),
            0x05 => Some(4),
            0x06 => Some(4),
            0x07 => Some(2),
            _ => None,
        }
    }
}

/// Maximum combined length of all additional info blocks in one frame.
pub const MAX_ADDINFO_LENGTH: usize = 253;

/// A single additional information block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalInfo {
    type_id: u8,
    data: heapless::Vec<u8, 254>,
}

impl AdditionalInfo {
    /// Create a block, validating the payload length against the known-type
    /// table.
    ///
    /// # Errors
    ///
    /// Returns an argument error for type ids >= 0xFF, empty payloads, or a
    /// payload length that contradicts the fixed length of a known type.
    pub fn new(type_id: u8, data: &[u8]) -> Result<Self> {
        if type_id == 0xFF {
            return Err(KnxError::value_out_of_range());
        }
        if data.is_empty() || data.len() > 254 {
            return Err(KnxError::length_out_of_range());
        }
        if let Some(fixed) = AddInfoType::fixed_length(type_id) {
            if data.len() != fixed {
                return Err(KnxError::length_out_of_range());
            }
        }
        let mut vec = heapless::Vec::new();
        // length checked above
        let _ = vec.extend_from_slice(data);
        Ok(Self { type_id, data: vec })
    }

    /// Create an RF medium info block.
    pub fn rf_medium(info: &RfMediumInfo) -> Self {
        let bytes = info.to_bytes();
        let mut vec = heapless::Vec::new();
        let _ = vec.extend_from_slice(&bytes);
        Self {
            type_id: AddInfoType::RfMedium as u8,
            data: vec,
        }
    }

    /// The type id of this block.
    #[inline(always)]
    pub const fn type_id(&self) -> u8 {
        self.type_id
    }

    /// The payload bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size on the wire: type + length + payload.
    #[inline]
    pub fn wire_size(&self) -> usize {
        2 + self.data.len()
    }

    /// Whether this block is RF medium info.
    #[inline]
    pub const fn is_rf_medium(&self) -> bool {
        self.type_id == AddInfoType::RfMedium as u8
    }
}

/// Parse the additional info area of a cEMI frame.
///
/// `data` is exactly the area declared by the frame's additional-info length
/// field.
///
/// # Errors
///
/// Returns a frame error if a block is truncated or a known type carries the
/// wrong payload length.
pub fn parse_blocks(data: &[u8]) -> Result<Vec<AdditionalInfo>> {
    if data.len() > MAX_ADDINFO_LENGTH {
        return Err(KnxError::invalid_additional_info());
    }
    let mut blocks = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        if data.len() - offset < 2 {
            return Err(KnxError::invalid_additional_info());
        }
        let type_id = data[offset];
        let len = data[offset + 1] as usize;
        offset += 2;
        if data.len() - offset < len {
            return Err(KnxError::invalid_additional_info());
        }
        let block = AdditionalInfo::new(type_id, &data[offset..offset + len])
            .map_err(|_| KnxError::invalid_additional_info())?;
        blocks.push(block);
        offset += len;
    }
    Ok(blocks)
}

/// Emit additional info blocks, sorted by ascending type id.
pub fn emit_blocks(blocks: &[AdditionalInfo], out: &mut Vec<u8>) {
    let mut sorted: Vec<&AdditionalInfo> = blocks.iter().collect();
    sorted.sort_by_key(|b| b.type_id);
    for block in sorted {
        out.push(block.type_id);
        out.push(block.data.len() as u8);
        out.extend_from_slice(&block.data);
    }
}

/// Combined wire size of a block list.
pub fn blocks_wire_size(blocks: &[AdditionalInfo]) -> usize {
    blocks.iter().map(AdditionalInfo::wire_size).sum()
}

// =============================================================================
// RF medium information
// =============================================================================

/// Received signal strength, 2-bit scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Rss {
    /// No measurement
    #[default]
    Void = 0,
    /// Weak signal
    Weak = 1,
    /// Medium signal
    Medium = 2,
    /// Strong signal
    Strong = 3,
}

impl Rss {
    const fn from_u8(value: u8) -> Self {
        match value & 0b11 {
            0 => Self::Void,
            1 => Self::Weak,
            2 => Self::Medium,
            _ => Self::Strong,
        }
    }
}

impl fmt::Display for Rss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Void => "void",
            Self::Weak => "weak",
            Self::Medium => "medium",
            Self::Strong => "strong",
        };
        f.write_str(s)
    }
}

/// Link-layer frame number value that asks the cEMI server to fill in the
/// actual LFN.
pub const LFN_SERVER_ASSIGNED: u8 = 0xFF;

/// RF medium information (additional info type 0x02, 8 bytes).
///
/// The 6-byte field after the info bits holds the domain address on domain
/// broadcasts and the device serial number on system broadcasts; which one it
/// is follows from the carrying frame's system-broadcast flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfMediumInfo {
    rss: Rss,
    retransmitter_rss: Rss,
    battery_ok: bool,
    transmit_only: bool,
    doa_or_serial: SerialNumber,
    frame_number: u8,
}

impl RfMediumInfo {
    /// Create RF medium info.
    ///
    /// # Errors
    ///
    /// Returns an argument error if `frame_number` is neither 0..=7 nor
    /// [`LFN_SERVER_ASSIGNED`].
    pub fn new(
        rss: Rss,
        retransmitter_rss: Rss,
        battery_ok: bool,
        transmit_only: bool,
        doa_or_serial: SerialNumber,
        frame_number: u8,
    ) -> Result<Self> {
        if frame_number > 7 && frame_number != LFN_SERVER_ASSIGNED {
            return Err(KnxError::value_out_of_range());
        }
        Ok(Self {
            rss,
            retransmitter_rss,
            battery_ok,
            transmit_only,
            doa_or_serial,
            frame_number,
        })
    }

    /// Parse from the 8-byte payload of an RF medium info block.
    ///
    /// # Errors
    ///
    /// Returns a frame error on wrong payload length or a reserved LFN value.
    pub fn from_info(block: &AdditionalInfo) -> Result<Self> {
        if !block.is_rf_medium() || block.data().len() != 8 {
            return Err(KnxError::invalid_additional_info());
        }
        let data = block.data();
        let info = data[0];
        let frame_number = data[7];
        if frame_number > 7 && frame_number != LFN_SERVER_ASSIGNED {
            return Err(KnxError::invalid_additional_info());
        }
        Ok(Self {
            rss: Rss::from_u8(info >> 4),
            retransmitter_rss: Rss::from_u8(info >> 2),
            battery_ok: info & 0x02 != 0,
            transmit_only: info & 0x01 != 0,
            doa_or_serial: SerialNumber::decode(&data[1..7])?,
            frame_number,
        })
    }

    /// The 8-byte block payload.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = ((self.rss as u8) << 4)
            | ((self.retransmitter_rss as u8) << 2)
            | u8::from(self.battery_ok) << 1
            | u8::from(self.transmit_only);
        out[1..7].copy_from_slice(&self.doa_or_serial.bytes());
        out[7] = self.frame_number;
        out
    }

    /// Received signal strength.
    pub const fn rss(&self) -> Rss {
        self.rss
    }

    /// Signal strength seen by the retransmitter.
    pub const fn retransmitter_rss(&self) -> Rss {
        self.retransmitter_rss
    }

    /// Battery state of the sending device.
    pub const fn battery_ok(&self) -> bool {
        self.battery_ok
    }

    /// Whether the sender is a transmit-only device.
    pub const fn transmit_only(&self) -> bool {
        self.transmit_only
    }

    /// Domain address (domain broadcast) or serial number (system broadcast).
    pub const fn doa_or_serial(&self) -> SerialNumber {
        self.doa_or_serial
    }

    /// Link-layer frame number, 0..=7 or [`LFN_SERVER_ASSIGNED`].
    pub const fn frame_number(&self) -> u8 {
        self.frame_number
    }
}
