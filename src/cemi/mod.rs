//! Common External Message Interface (cEMI) codec.
//!
//! cEMI is the in-band frame format used by KNX to describe bus events
//! independently of the physical medium. This module provides typed frames
//! for L-Data (standard and extended), bus monitor indications, device
//! management and reset, with byte-exact parse and emit, plus translation to
//! the older EMI1/EMI2 message-code dialects.
//!
//! ## Frame Structure
//!
//! ```text
//! +------------------------------------------+
//! | Message Code (1 byte)                    |
//! +------------------------------------------+
//! | Additional Info Length (1 byte)          |
//! +------------------------------------------+
//! | Additional Info (variable)               |
//! +------------------------------------------+
//! | Service Information (variable)           |
//! +------------------------------------------+
//! ```

pub mod addinfo;
pub mod busmon;
pub mod devmgmt;
pub mod emi;
pub mod ldata;

pub use addinfo::{AddInfoType, AdditionalInfo, RfMediumInfo, Rss};
pub use busmon::{BusmonInd, BusmonStatus};
pub use devmgmt::{DevMgmt, MgmtError, Reset};
pub use ldata::{LData, LDataBuilder};

use crate::error::{KnxError, Result};
use crate::protocol::constants::CemiMessageCode;

/// A parsed cEMI frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CemiFrame {
    /// `L_Data.req` / `.con` / `.ind`
    LData(LData),
    /// `L_Busmon.ind`
    Busmon(BusmonInd),
    /// Device management property access
    DevMgmt(DevMgmt),
    /// `M_Reset.req` / `M_Reset.ind`
    Reset(Reset),
}

impl CemiFrame {
    /// Parse a cEMI frame, dispatching on the message code.
    ///
    /// Trailing bytes beyond the frame's declared content are ignored.
    ///
    /// # Errors
    ///
    /// Returns a frame error for unknown message codes or malformed
    /// content; the error carries the offending code or length.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(KnxError::buffer_too_small());
        }
        let code = CemiMessageCode::from_u8(data[0])
            .ok_or_else(|| KnxError::invalid_message_code(data[0]))?;
        let rest = &data[1..];
        match code {
            CemiMessageCode::LDataReq | CemiMessageCode::LDataInd | CemiMessageCode::LDataCon => {
                Ok(Self::LData(LData::parse(code, rest)?))
            }
            CemiMessageCode::LBusmonInd => Ok(Self::Busmon(BusmonInd::parse(rest)?)),
            CemiMessageCode::PropReadReq
            | CemiMessageCode::PropReadCon
            | CemiMessageCode::PropWriteReq
            | CemiMessageCode::PropWriteCon
            | CemiMessageCode::PropInfoInd => Ok(Self::DevMgmt(DevMgmt::parse(code, rest)?)),
            CemiMessageCode::ResetReq => Ok(Self::Reset(Reset::request())),
            CemiMessageCode::ResetInd => Ok(Self::Reset(Reset::indication())),
        }
    }

    /// The message code of this frame.
    pub fn code(&self) -> CemiMessageCode {
        match self {
            Self::LData(f) => f.code(),
            Self::Busmon(_) => CemiMessageCode::LBusmonInd,
            Self::DevMgmt(f) => f.code(),
            Self::Reset(f) => f.code(),
        }
    }

    /// Emit the frame; `parse(emit(f)) == f` for every valid frame.
    pub fn emit(&self) -> Vec<u8> {
        match self {
            Self::LData(f) => f.emit(),
            Self::Busmon(f) => f.emit(),
            Self::DevMgmt(f) => f.emit(),
            Self::Reset(f) => f.emit(),
        }
    }

    /// Return an owned deep clone of the frame.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    /// The contained L-Data frame, if this is one.
    pub fn as_ldata(&self) -> Option<&LData> {
        match self {
            Self::LData(f) => Some(f),
            _ => None,
        }
    }
}

impl From<LData> for CemiFrame {
    fn from(frame: LData) -> Self {
        Self::LData(frame)
    }
}

impl From<BusmonInd> for CemiFrame {
    fn from(frame: BusmonInd) -> Self {
        Self::Busmon(frame)
    }
}

impl From<DevMgmt> for CemiFrame {
    fn from(frame: DevMgmt) -> Self {
        Self::DevMgmt(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::{GroupAddress, IndividualAddress};

    #[test]
    fn dispatch_ldata() {
        let data = [
            0x29, 0x00, 0xBC, 0xE0, 0x11, 0x01, 0x0A, 0x03, 0x01, 0x00, 0x80,
        ];
        let frame = CemiFrame::parse(&data).unwrap();
        assert_eq!(frame.code(), CemiMessageCode::LDataInd);
        assert!(frame.as_ldata().is_some());
        assert_eq!(frame.emit(), data.to_vec());
    }

    #[test]
    fn dispatch_reset() {
        let frame = CemiFrame::parse(&[0xF1]).unwrap();
        assert_eq!(frame, CemiFrame::Reset(Reset::request()));
        assert_eq!(frame.emit(), vec![0xF1]);
    }

    #[test]
    fn unknown_message_code() {
        let err = CemiFrame::parse(&[0xAB, 0x00]).unwrap_err();
        match err {
            KnxError::Frame(e) => {
                assert!(e.is_invalid_message_code());
                assert_eq!(e.value(), Some(0xAB));
            }
            _ => panic!("wrong category"),
        }
    }

    #[test]
    fn empty_input() {
        assert!(CemiFrame::parse(&[]).is_err());
    }

    #[test]
    fn roundtrip_all_shapes() {
        let ldata = LData::builder(
            CemiMessageCode::LDataReq,
            IndividualAddress::new(1, 1, 1).unwrap(),
            GroupAddress::new(2, 2, 10).unwrap(),
        )
        .tpdu(&[0x00, 0x81])
        .build()
        .unwrap();
        let mgmt = DevMgmt::new(CemiMessageCode::PropInfoInd, 0, 1, 14, 1, 1, &[0x01]).unwrap();
        let frames = [
            CemiFrame::from(ldata),
            CemiFrame::from(mgmt),
            CemiFrame::Reset(Reset::indication()),
        ];
        for frame in frames {
            assert_eq!(CemiFrame::parse(&frame.emit()).unwrap(), frame);
            assert_eq!(frame.deep_copy(), frame);
        }
    }
}
