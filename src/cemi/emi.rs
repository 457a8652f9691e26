//! EMI1/EMI2 frame translation.
//!
//! The older external message interfaces predate cEMI and are still spoken
//! by some USB interfaces. An EMI L-Data frame has no additional info area
//! and packs address type, hop count and length into one octet:
//!
//! ```text
//! [mc][ctrl][src(2)][dst(2)][AT(1b)|hops(3b)|len(4b)][TPDU(len+1)]
//! ```
//!
//! System broadcast on open media is not a control bit in EMI; it moves into
//! dedicated `L_SysBcast` message codes. EMI1 reuses the `L_Data.ind` code
//! 0x49 for `L_Busmon.ind`; the generic [`from_emi`] parser resolves the
//! collision in favour of L-Data, busmonitor frames go through
//! [`from_emi_busmon`].

use crate::addressing::{Address, GroupAddress, IndividualAddress};
use crate::cemi::busmon::{BusmonInd, BusmonStatus};
use crate::cemi::ldata::{LData, MAX_TPDU_STANDARD};
use crate::error::{KnxError, Result};
use crate::protocol::constants::{
    CemiMessageCode, Priority, APCI_DOMAIN_ADDRESS_READ, EMI_LDATA_CON, EMI_LDATA_IND,
    EMI_LDATA_REQ, EMI_SYSBCAST_CON, EMI_SYSBCAST_IND, EMI_SYSBCAST_REQ,
};

/// Translate a standard-frame L-Data to EMI1/EMI2 bytes.
///
/// # Errors
///
/// Returns an argument error for extended frames or TPDUs longer than 16
/// bytes; EMI cannot express either.
pub fn to_emi(frame: &LData) -> Result<Vec<u8>> {
    if frame.is_extended_frame() || frame.tpdu().len() > MAX_TPDU_STANDARD {
        return Err(KnxError::length_out_of_range());
    }

    let system = frame.is_system_broadcast();
    let mc = match frame.code() {
        CemiMessageCode::LDataReq if system => EMI_SYSBCAST_REQ,
        CemiMessageCode::LDataReq => EMI_LDATA_REQ,
        CemiMessageCode::LDataCon if system => EMI_SYSBCAST_CON,
        CemiMessageCode::LDataCon => EMI_LDATA_CON,
        CemiMessageCode::LDataInd if system => EMI_SYSBCAST_IND,
        CemiMessageCode::LDataInd => EMI_LDATA_IND,
        _ => return Err(KnxError::value_out_of_range()),
    };

    let mut out = Vec::with_capacity(7 + frame.tpdu().len());
    out.push(mc);
    // the broadcast distinction lives in the message code; the EMI control
    // octet always reads as domain broadcast
    out.push(frame.ctrl1().raw() | 0x10);
    out.extend_from_slice(&frame.source().raw().to_be_bytes());
    out.extend_from_slice(&frame.destination().raw().to_be_bytes());
    let at = u8::from(frame.destination().is_group()) << 7;
    out.push(at | (frame.hop_count() << 4) | ((frame.tpdu().len() - 1) as u8));
    out.extend_from_slice(frame.tpdu());
    Ok(out)
}

/// Translate EMI1/EMI2 bytes to a cEMI L-Data frame.
///
/// On the colliding code 0x49 this prefers `L_Data.ind`; use
/// [`from_emi_busmon`] when the interface is in busmonitor mode. The
/// domain-address-read APCI is always forced to system broadcast.
///
/// # Errors
///
/// Returns a frame error for unknown message codes or truncated frames.
pub fn from_emi(data: &[u8]) -> Result<LData> {
    if data.len() < 8 {
        return Err(KnxError::frame_length(data.len()));
    }

    let (code, mut system) = match data[0] {
        EMI_LDATA_REQ => (CemiMessageCode::LDataReq, false),
        EMI_SYSBCAST_REQ => (CemiMessageCode::LDataReq, true),
        EMI_LDATA_CON => (CemiMessageCode::LDataCon, false),
        EMI_SYSBCAST_CON => (CemiMessageCode::LDataCon, true),
        EMI_LDATA_IND => (CemiMessageCode::LDataInd, false),
        EMI_SYSBCAST_IND => (CemiMessageCode::LDataInd, true),
        other => return Err(KnxError::invalid_message_code(other)),
    };

    let ctrl = data[1];
    let source = IndividualAddress::from(u16::from_be_bytes([data[2], data[3]]));
    let dst_raw = u16::from_be_bytes([data[4], data[5]]);
    let is_group = data[6] & 0x80 != 0;
    let hop_count = (data[6] >> 4) & 0x07;
    let tpdu_len = (data[6] & 0x0F) as usize + 1;
    if data.len() < 7 + tpdu_len {
        return Err(KnxError::frame_length(data.len()));
    }
    let tpdu = &data[7..7 + tpdu_len];

    // A_DomainAddress_Read travels as system broadcast regardless of the
    // message code used by the interface
    if tpdu.len() >= 2 {
        let apci = (u16::from(tpdu[0] & 0x03) << 8) | u16::from(tpdu[1]);
        if apci == APCI_DOMAIN_ADDRESS_READ {
            system = true;
        }
    }

    let destination: Address = if is_group {
        GroupAddress::from(dst_raw).into()
    } else {
        IndividualAddress::from(dst_raw).into()
    };

    LData::builder(code, source, destination)
        .priority(Priority::from_u8(ctrl >> 2))
        .hop_count(hop_count)
        .repetition(ctrl & 0x20 == 0)
        .system_broadcast(system)
        .ack_request(ctrl & 0x02 != 0)
        .confirm_error(ctrl & 0x01 != 0)
        .tpdu(tpdu)
        .build()
}

/// Translate an EMI1 busmonitor indication (code 0x49) to a cEMI busmon
/// frame.
///
/// EMI1 busmonitor layout: `[mc][status][timestamp(2)][raw frame...]`.
///
/// # Errors
///
/// Returns a frame error for a wrong message code or truncated frame.
pub fn from_emi_busmon(data: &[u8]) -> Result<BusmonInd> {
    if data.len() < 5 {
        return Err(KnxError::frame_length(data.len()));
    }
    if data[0] != EMI_LDATA_IND {
        return Err(KnxError::invalid_message_code(data[0]));
    }
    let status = BusmonStatus::from(data[1]);
    let timestamp = u32::from(u16::from_be_bytes([data[2], data[3]]));
    BusmonInd::new(status, timestamp, false, &data[4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ldata(code: CemiMessageCode, system: bool) -> LData {
        LData::builder(
            code,
            IndividualAddress::new(1, 1, 1).unwrap(),
            GroupAddress::new(1, 2, 3).unwrap(),
        )
        .system_broadcast(system)
        .tpdu(&[0x00, 0x81])
        .build()
        .unwrap()
    }

    #[test]
    fn message_code_mapping() {
        assert_eq!(to_emi(&ldata(CemiMessageCode::LDataReq, false)).unwrap()[0], 0x11);
        assert_eq!(to_emi(&ldata(CemiMessageCode::LDataReq, true)).unwrap()[0], 0x15);
        assert_eq!(to_emi(&ldata(CemiMessageCode::LDataCon, false)).unwrap()[0], 0x4E);
        assert_eq!(to_emi(&ldata(CemiMessageCode::LDataCon, true)).unwrap()[0], 0x4C);
        assert_eq!(to_emi(&ldata(CemiMessageCode::LDataInd, false)).unwrap()[0], 0x49);
        assert_eq!(to_emi(&ldata(CemiMessageCode::LDataInd, true)).unwrap()[0], 0x4D);
    }

    #[test]
    fn roundtrip_standard_frames() {
        for code in [
            CemiMessageCode::LDataReq,
            CemiMessageCode::LDataCon,
            CemiMessageCode::LDataInd,
        ] {
            for system in [false, true] {
                let frame = ldata(code, system);
                let emi = to_emi(&frame).unwrap();
                let back = from_emi(&emi).unwrap();
                assert_eq!(back, frame, "code {code:?} system {system}");
            }
        }
    }

    #[test]
    fn rejects_extended_frames() {
        let frame = LData::builder(
            CemiMessageCode::LDataReq,
            IndividualAddress::new(1, 1, 1).unwrap(),
            GroupAddress::new(1, 2, 3).unwrap(),
        )
        .tpdu(&vec![0u8; 20])
        .build()
        .unwrap();
        assert!(to_emi(&frame).is_err());
    }

    #[test]
    fn domain_address_read_forced_to_system_broadcast() {
        // APCI 0x3E1: tpdu [0x03, 0xE1], sent with the plain L_Data.req code
        let mut emi = to_emi(&ldata(CemiMessageCode::LDataReq, false)).unwrap();
        emi[7] = 0x03;
        emi[8] = 0xE1;
        let frame = from_emi(&emi).unwrap();
        assert!(frame.is_system_broadcast());
    }

    #[test]
    fn individual_destination_roundtrip() {
        let frame = LData::builder(
            CemiMessageCode::LDataReq,
            IndividualAddress::new(1, 1, 1).unwrap(),
            IndividualAddress::new(2, 3, 4).unwrap(),
        )
        .tpdu(&[0x42])
        .build()
        .unwrap();
        let back = from_emi(&to_emi(&frame).unwrap()).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn busmon_collision_resolution() {
        // 0x49 parses as L_Data.ind through the generic parser
        let emi = to_emi(&ldata(CemiMessageCode::LDataInd, false)).unwrap();
        assert!(from_emi(&emi).is_ok());

        // and as busmonitor through the explicit entry point
        let busmon_bytes = [0x49, 0x03, 0x12, 0x34, 0xBC, 0x11, 0x01];
        let mon = from_emi_busmon(&busmon_bytes).unwrap();
        assert_eq!(mon.status().sequence(), 3);
        assert_eq!(mon.timestamp(), 0x1234);
        assert_eq!(mon.raw_frame(), &[0xBC, 0x11, 0x01]);
    }

    #[test]
    fn truncated_frames() {
        assert!(from_emi(&[0x11, 0xBC, 0x11]).is_err());
        assert!(from_emi_busmon(&[0x49, 0x00]).is_err());
        assert!(from_emi(&[0xAA, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }
}
