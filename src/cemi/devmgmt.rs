//! cEMI device management frames.
//!
//! Property read/write requests and confirmations, property info
//! indications, and reset request/indication. The service information is a
//! 7-byte header followed by the property data:
//!
//! ```text
//! [mc][iot(2)][object instance][property id][elems(4b) | start(12b)][data...]
//! ```
//!
//! A confirmation with element count zero is a negative response; its data
//! is a single error code byte.

use crate::error::{KnxError, Result};
use crate::protocol::constants::CemiMessageCode;

/// Error codes of negative device management confirmations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MgmtError {
    /// Unknown error
    Unspecified = 0x00,
    /// Value out of range
    OutOfRange = 0x01,
    /// Value exceeds maximum
    OutOfMaxRange = 0x02,
    /// Value below minimum
    OutOfMinRange = 0x03,
    /// Memory cannot be accessed
    Memory = 0x04,
    /// Property is read only
    ReadOnly = 0x05,
    /// Command is illegal
    IllegalCommand = 0x06,
    /// Property is void
    VoidDp = 0x07,
    /// Type conflict on write
    TypeConflict = 0x08,
    /// Property index out of range
    PropIndexRange = 0x09,
    /// Value temporarily not writeable
    ValueNotWriteableNow = 0x0A,
}

impl MgmtError {
    /// Convert u8 to `MgmtError`
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Unspecified),
            0x01 => Some(Self::OutOfRange),
            0x02 => Some(Self::OutOfMaxRange),
            0x03 => Some(Self::OutOfMinRange),
            0x04 => Some(Self::Memory),
            0x05 => Some(Self::ReadOnly),
            0x06 => Some(Self::IllegalCommand),
            0x07 => Some(Self::VoidDp),
            0x08 => Some(Self::TypeConflict),
            0x09 => Some(Self::PropIndexRange),
            0x0A => Some(Self::ValueNotWriteableNow),
            _ => None,
        }
    }
}

/// A cEMI device management frame (property access).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevMgmt {
    code: CemiMessageCode,
    object_type: u16,
    object_instance: u8,
    property_id: u8,
    elements: u8,
    start_index: u16,
    data: Vec<u8>,
}

impl DevMgmt {
    const HEADER_SIZE: usize = 7;

    /// Allowed message codes for property access frames.
    const fn is_mgmt_code(code: CemiMessageCode) -> bool {
        matches!(
            code,
            CemiMessageCode::PropReadReq
                | CemiMessageCode::PropReadCon
                | CemiMessageCode::PropWriteReq
                | CemiMessageCode::PropWriteCon
                | CemiMessageCode::PropInfoInd
        )
    }

    /// Create a device management frame.
    ///
    /// # Errors
    ///
    /// Returns argument errors for non-management message codes, object
    /// instance zero, element count > 15 or start index > 0xFFF.
    pub fn new(
        code: CemiMessageCode,
        object_type: u16,
        object_instance: u8,
        property_id: u8,
        elements: u8,
        start_index: u16,
        data: &[u8],
    ) -> Result<Self> {
        if !Self::is_mgmt_code(code) {
            return Err(KnxError::value_out_of_range());
        }
        if object_instance == 0 {
            return Err(KnxError::value_out_of_range());
        }
        if elements > 15 || start_index > 0x0FFF {
            return Err(KnxError::value_out_of_range());
        }
        Ok(Self {
            code,
            object_type,
            object_instance,
            property_id,
            elements,
            start_index,
            data: data.to_vec(),
        })
    }

    /// Create a negative confirmation carrying an error code.
    ///
    /// # Errors
    ///
    /// Returns an argument error if `code` is not a confirmation.
    pub fn negative_response(
        code: CemiMessageCode,
        object_type: u16,
        object_instance: u8,
        property_id: u8,
        start_index: u16,
        error: MgmtError,
    ) -> Result<Self> {
        if !matches!(
            code,
            CemiMessageCode::PropReadCon | CemiMessageCode::PropWriteCon
        ) {
            return Err(KnxError::value_out_of_range());
        }
        Self::new(
            code,
            object_type,
            object_instance,
            property_id,
            0,
            start_index,
            &[error as u8],
        )
    }

    /// The message code.
    #[inline(always)]
    pub const fn code(&self) -> CemiMessageCode {
        self.code
    }

    /// Interface object type.
    #[inline(always)]
    pub const fn object_type(&self) -> u16 {
        self.object_type
    }

    /// Object instance (1-255).
    #[inline(always)]
    pub const fn object_instance(&self) -> u8 {
        self.object_instance
    }

    /// Property id.
    #[inline(always)]
    pub const fn property_id(&self) -> u8 {
        self.property_id
    }

    /// Number of elements (0 marks a negative confirmation).
    #[inline(always)]
    pub const fn elements(&self) -> u8 {
        self.elements
    }

    /// Start index into the property array.
    #[inline(always)]
    pub const fn start_index(&self) -> u16 {
        self.start_index
    }

    /// Property data (or the error code of a negative confirmation).
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether this is a negative confirmation.
    pub fn is_negative_response(&self) -> bool {
        self.elements == 0
            && matches!(
                self.code,
                CemiMessageCode::PropReadCon | CemiMessageCode::PropWriteCon
            )
    }

    /// The error code of a negative confirmation.
    pub fn error(&self) -> Option<MgmtError> {
        if self.is_negative_response() {
            self.data.first().copied().and_then(MgmtError::from_u8)
        } else {
            None
        }
    }

    /// Parse the frame content following the message code octet.
    pub(crate) fn parse(code: CemiMessageCode, data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE - 1 {
            return Err(KnxError::frame_length(data.len()));
        }
        let object_type = u16::from_be_bytes([data[0], data[1]]);
        let object_instance = data[2];
        if object_instance == 0 {
            return Err(KnxError::invalid_frame());
        }
        let property_id = data[3];
        let elements = data[4] >> 4;
        let start_index = (u16::from(data[4] & 0x0F) << 8) | u16::from(data[5]);

        Ok(Self {
            code,
            object_type,
            object_instance,
            property_id,
            elements,
            start_index,
            data: data[6..].to_vec(),
        })
    }

    /// Emit the complete frame, message code included.
    pub fn emit(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_SIZE + self.data.len());
        out.push(self.code.to_u8());
        out.extend_from_slice(&self.object_type.to_be_bytes());
        out.push(self.object_instance);
        out.push(self.property_id);
        out.push((self.elements << 4) | ((self.start_index >> 8) as u8 & 0x0F));
        out.push((self.start_index & 0xFF) as u8);
        out.extend_from_slice(&self.data);
        out
    }
}

/// A cEMI reset frame (`M_Reset.req` / `M_Reset.ind`), message code only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reset {
    indication: bool,
}

impl Reset {
    /// A reset request.
    pub const fn request() -> Self {
        Self { indication: false }
    }

    /// A reset indication.
    pub const fn indication() -> Self {
        Self { indication: true }
    }

    /// Whether this is an indication.
    pub const fn is_indication(&self) -> bool {
        self.indication
    }

    /// The message code.
    pub const fn code(&self) -> CemiMessageCode {
        if self.indication {
            CemiMessageCode::ResetInd
        } else {
            CemiMessageCode::ResetReq
        }
    }

    /// Emit the single-byte frame.
    pub fn emit(&self) -> Vec<u8> {
        vec![self.code().to_u8()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let frame = DevMgmt::new(CemiMessageCode::PropReadReq, 0x0008, 1, 52, 1, 0x123, &[])
            .unwrap();
        let bytes = frame.emit();
        assert_eq!(bytes.len(), 7);
        assert_eq!(bytes[0], 0xFC);
        assert_eq!(&bytes[1..3], &[0x00, 0x08]);
        assert_eq!(bytes[5], 0x11); // elements 1, start index high nibble 1
        assert_eq!(bytes[6], 0x23);

        let parsed = DevMgmt::parse(CemiMessageCode::PropReadReq, &bytes[1..]).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn data_roundtrip() {
        let frame = DevMgmt::new(
            CemiMessageCode::PropWriteReq,
            0x0001,
            2,
            14,
            2,
            1,
            &[0xAA, 0xBB, 0xCC, 0xDD],
        )
        .unwrap();
        let parsed = DevMgmt::parse(CemiMessageCode::PropWriteReq, &frame.emit()[1..]).unwrap();
        assert_eq!(parsed.data(), &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(parsed, frame);
    }

    #[test]
    fn negative_response() {
        let frame = DevMgmt::negative_response(
            CemiMessageCode::PropReadCon,
            0x0008,
            1,
            52,
            1,
            MgmtError::ReadOnly,
        )
        .unwrap();
        assert!(frame.is_negative_response());
        assert_eq!(frame.error(), Some(MgmtError::ReadOnly));

        let parsed = DevMgmt::parse(CemiMessageCode::PropReadCon, &frame.emit()[1..]).unwrap();
        assert_eq!(parsed.error(), Some(MgmtError::ReadOnly));
    }

    #[test]
    fn negative_response_requires_confirmation_code() {
        assert!(DevMgmt::negative_response(
            CemiMessageCode::PropReadReq,
            0x0008,
            1,
            52,
            1,
            MgmtError::Unspecified,
        )
        .is_err());
    }

    #[test]
    fn validation() {
        assert!(DevMgmt::new(CemiMessageCode::LDataReq, 0, 1, 0, 1, 0, &[]).is_err());
        assert!(DevMgmt::new(CemiMessageCode::PropReadReq, 0, 0, 0, 1, 0, &[]).is_err());
        assert!(DevMgmt::new(CemiMessageCode::PropReadReq, 0, 1, 0, 16, 0, &[]).is_err());
        assert!(DevMgmt::new(CemiMessageCode::PropReadReq, 0, 1, 0, 1, 0x1000, &[]).is_err());
    }

    #[test]
    fn error_code_taxonomy() {
        for raw in 0x00u8..=0x0A {
            assert!(MgmtError::from_u8(raw).is_some());
        }
        assert!(MgmtError::from_u8(0x0B).is_none());
    }

    #[test]
    fn reset_frames() {
        assert_eq!(Reset::request().emit(), vec![0xF1]);
        assert_eq!(Reset::indication().emit(), vec![0xF0]);
        assert!(Reset::indication().is_indication());
    }
}
