//! cEMI bus monitor indications (`L_Busmon.ind`).
//!
//! Busmonitor frames carry the raw bus frame together with a status octet
//! and a timestamp. The timestamp is transferred in the additional info
//! area: type 0x04 (2 bytes, relative) or type 0x06 (4 bytes, extended).

use crate::cemi::addinfo::{self, AddInfoType};
use crate::error::{KnxError, Result};
use crate::protocol::constants::CemiMessageCode;

/// Maximum length of the raw frame carried in a busmonitor indication.
pub const MAX_RAW_FRAME: usize = 23;

/// Status octet of a busmonitor indication.
///
/// ```text
/// Bit 7: Frame error
/// Bit 6: Bit error
/// Bit 5: Parity error
/// Bit 4: Lost (overflow in the monitor)
/// Bit 2-0: Sequence number (0-7)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusmonStatus {
    raw: u8,
}

impl From<u8> for BusmonStatus {
    #[inline(always)]
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl BusmonStatus {
    /// Assemble a status octet.
    ///
    /// # Errors
    ///
    /// Returns an argument error if `sequence` exceeds 7.
    pub fn new(
        frame_error: bool,
        bit_error: bool,
        parity_error: bool,
        lost: bool,
        sequence: u8,
    ) -> Result<Self> {
        if sequence > 7 {
            return Err(KnxError::value_out_of_range());
        }
        let mut raw = sequence;
        if frame_error {
            raw |= 0x80;
        }
        if bit_error {
            raw |= 0x40;
        }
        if parity_error {
            raw |= 0x20;
        }
        if lost {
            raw |= 0x10;
        }
        Ok(Self { raw })
    }

    /// Raw status byte.
    #[inline(always)]
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Frame error detected.
    #[inline(always)]
    pub const fn frame_error(self) -> bool {
        (self.raw & 0x80) != 0
    }

    /// Bit error detected.
    #[inline(always)]
    pub const fn bit_error(self) -> bool {
        (self.raw & 0x40) != 0
    }

    /// Parity error detected.
    #[inline(always)]
    pub const fn parity_error(self) -> bool {
        (self.raw & 0x20) != 0
    }

    /// At least one frame was lost before this one.
    #[inline(always)]
    pub const fn lost(self) -> bool {
        (self.raw & 0x10) != 0
    }

    /// Monitor sequence number (0-7).
    #[inline(always)]
    pub const fn sequence(self) -> u8 {
        self.raw & 0x07
    }
}

/// A cEMI `L_Busmon.ind` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusmonInd {
    status: BusmonStatus,
    timestamp: u32,
    extended_timestamp: bool,
    raw_frame: heapless::Vec<u8, MAX_RAW_FRAME>,
}

impl BusmonInd {
    /// Create a busmonitor indication.
    ///
    /// # Errors
    ///
    /// Returns an argument error if the raw frame is empty or longer than
    /// 23 bytes, or a 2-byte timestamp overflows.
    pub fn new(
        status: BusmonStatus,
        timestamp: u32,
        extended_timestamp: bool,
        raw_frame: &[u8],
    ) -> Result<Self> {
        if raw_frame.is_empty() || raw_frame.len() > MAX_RAW_FRAME {
            return Err(KnxError::length_out_of_range());
        }
        if !extended_timestamp && timestamp > u32::from(u16::MAX) {
            return Err(KnxError::value_out_of_range());
        }
        let mut vec = heapless::Vec::new();
        let _ = vec.extend_from_slice(raw_frame);
        Ok(Self {
            status,
            timestamp,
            extended_timestamp,
            raw_frame: vec,
        })
    }

    /// The status octet.
    #[inline(always)]
    pub const fn status(&self) -> BusmonStatus {
        self.status
    }

    /// The timestamp value (2 or 4 bytes on the wire).
    #[inline(always)]
    pub const fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Whether the timestamp uses the extended 4-byte encoding.
    #[inline(always)]
    pub const fn has_extended_timestamp(&self) -> bool {
        self.extended_timestamp
    }

    /// The monitored raw frame.
    #[inline]
    pub fn raw_frame(&self) -> &[u8] {
        &self.raw_frame
    }

    /// Parse the frame content following the message code octet.
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(KnxError::frame_length(data.len()));
        }
        let ail = data[0] as usize;
        if data.len() < 1 + ail + 2 {
            return Err(KnxError::frame_length(data.len()));
        }
        let blocks = addinfo::parse_blocks(&data[1..1 + ail])?;

        let mut status = None;
        let mut timestamp = 0u32;
        let mut extended = false;
        for block in &blocks {
            match block.type_id() {
                t if t == AddInfoType::BusmonitorStatus as u8 => {
                    status = Some(BusmonStatus::from(block.data()[0]));
                }
                t if t == AddInfoType::RelativeTimestamp as u8 => {
                    timestamp = u32::from(u16::from_be_bytes([block.data()[0], block.data()[1]]));
                }
                t if t == AddInfoType::ExtendedTimestamp as u8 => {
                    let d = block.data();
                    timestamp = u32::from_be_bytes([d[0], d[1], d[2], d[3]]);
                    extended = true;
                }
                _ => {}
            }
        }
        let status = status.ok_or_else(KnxError::invalid_additional_info)?;

        let raw = &data[1 + ail..];
        if raw.is_empty() || raw.len() > MAX_RAW_FRAME {
            return Err(KnxError::frame_length(raw.len()));
        }
        let mut raw_frame = heapless::Vec::new();
        let _ = raw_frame.extend_from_slice(raw);

        Ok(Self {
            status,
            timestamp,
            extended_timestamp: extended,
            raw_frame,
        })
    }

    /// Emit the complete frame, message code included. Status and timestamp
    /// go out as additional info blocks in ascending type order.
    pub fn emit(&self) -> Vec<u8> {
        let ail = if self.extended_timestamp { 3 + 6 } else { 3 + 4 };
        let mut out = Vec::with_capacity(2 + ail + self.raw_frame.len());
        out.push(CemiMessageCode::LBusmonInd.to_u8());
        out.push(ail as u8);
        out.push(AddInfoType::BusmonitorStatus as u8);
        out.push(1);
        out.push(self.status.raw());
        if self.extended_timestamp {
            out.push(AddInfoType::ExtendedTimestamp as u8);
            out.push(4);
            out.extend_from_slice(&self.timestamp.to_be_bytes());
        } else {
            out.push(AddInfoType::RelativeTimestamp as u8);
            out.push(2);
            out.extend_from_slice(&(self.timestamp as u16).to_be_bytes());
        }
        out.extend_from_slice(&self.raw_frame);
        out
    }
}
