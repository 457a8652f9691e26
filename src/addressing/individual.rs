//! KNX Individual Address implementation.
//!
//! Individual addresses identify physical devices on the KNX bus and are
//! the source of every L-Data frame. Format: Area.Line.Device, packed into
//! 16 bits as area(4).line(4).device(8).

use crate::error::{KnxError, Result};
use core::fmt;

/// KNX Individual Address (Area.Line.Device)
///
/// # Examples
///
/// ```
/// use knx_secure::addressing::IndividualAddress;
///
/// let addr = IndividualAddress::new(1, 1, 5).unwrap();
/// assert_eq!(addr.to_string(), "1.1.5");
///
/// let addr = IndividualAddress::from(0x1105u16);
/// assert_eq!(addr.area(), 1);
/// assert_eq!(addr.line(), 1);
/// assert_eq!(addr.device(), 5);
///
/// let addr: IndividualAddress = "1.1.5".parse().unwrap();
/// assert_eq!(u16::from(addr), 0x1105);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndividualAddress {
    raw: u16,
}

impl IndividualAddress {
    /// Maximum area value (4 bits)
    pub const MAX_AREA: u8 = 15;
    /// Maximum line value (4 bits)
    pub const MAX_LINE: u8 = 15;

    /// Create a new Individual Address from components.
    ///
    /// The high byte packs area and line, the low byte is the device.
    ///
    /// # Errors
    ///
    /// Returns an addressing error if area or line exceed 4 bits.
    pub fn new(area: u8, line: u8, device: u8) -> Result<Self> {
        if area > Self::MAX_AREA || line > Self::MAX_LINE {
            return Err(KnxError::address_out_of_range());
        }
        Ok(Self {
            raw: u16::from_be_bytes([(area << 4) | line, device]),
        })
    }

    /// Get the raw u16 representation of the address.
    #[inline(always)]
    pub const fn raw(self) -> u16 {
        self.raw
    }

    /// Get the area component (0-15).
    #[inline(always)]
    pub const fn area(self) -> u8 {
        (self.raw >> 12) as u8
    }

    /// Get the line component (0-15).
    #[inline(always)]
    pub const fn line(self) -> u8 {
        (self.raw >> 8) as u8 & 0x0F
    }

    /// Get the device component (0-255).
    #[inline(always)]
    pub const fn device(self) -> u8 {
        self.raw as u8
    }

    /// Encode the address into a byte buffer (big-endian).
    ///
    /// # Errors
    ///
    /// Returns `KnxError::Frame` if buffer is shorter than 2 bytes.
    #[inline]
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < 2 {
            return Err(KnxError::buffer_too_small());
        }
        let [hi, lo] = self.raw.to_be_bytes();
        buf[0] = hi;
        buf[1] = lo;
        Ok(2)
    }

    /// Decode an address from a byte buffer (big-endian).
    ///
    /// # Errors
    ///
    /// Returns `KnxError::Frame` if buffer is shorter than 2 bytes.
    #[inline]
    pub fn decode(buf: &[u8]) -> Result<Self> {
        match buf {
            [hi, lo, ..] => Ok(Self {
                raw: u16::from_be_bytes([*hi, *lo]),
            }),
            _ => Err(KnxError::buffer_too_small()),
        }
    }
}

impl From<u16> for IndividualAddress {
    #[inline(always)]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<IndividualAddress> for u16 {
    #[inline(always)]
    fn from(addr: IndividualAddress) -> u16 {
        addr.raw
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl core::str::FromStr for IndividualAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(4, '.');
        let (Some(area), Some(line), Some(device), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(KnxError::invalid_individual_address());
        };

        let area = area
            .parse()
            .map_err(|_| KnxError::invalid_individual_address())?;
        let line = line
            .parse()
            .map_err(|_| KnxError::invalid_individual_address())?;
        let device = device
            .parse()
            .map_err(|_| KnxError::invalid_individual_address())?;
        Self::new(area, line, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_valid() {
        let addr = IndividualAddress::new(1, 1, 5).unwrap();
        assert_eq!(addr.area(), 1);
        assert_eq!(addr.line(), 1);
        assert_eq!(addr.device(), 5);
        assert_eq!(addr.raw(), 0x1105);
    }

    #[test]
    fn new_out_of_range() {
        assert!(IndividualAddress::new(16, 0, 0).is_err());
        assert!(IndividualAddress::new(0, 16, 0).is_err());
    }

    #[test]
    fn encode_decode() {
        let addr = IndividualAddress::new(15, 15, 255).unwrap();
        let mut buf = [0u8; 2];
        addr.encode(&mut buf).unwrap();
        assert_eq!(buf, [0xFF, 0xFF]);
        assert_eq!(IndividualAddress::decode(&buf).unwrap(), addr);
        assert!(IndividualAddress::decode(&buf[..1]).is_err());
    }

    #[test]
    fn display() {
        let addr = IndividualAddress::new(1, 2, 3).unwrap();
        assert_eq!(addr.to_string(), "1.2.3");
    }

    #[test]
    fn from_str_valid() {
        let addr: IndividualAddress = "2.3.20".parse().unwrap();
        assert_eq!(addr.raw(), 0x2314);
    }

    #[test]
    fn from_str_invalid() {
        assert!("1.1".parse::<IndividualAddress>().is_err());
        assert!("1.1.1.1".parse::<IndividualAddress>().is_err());
        assert!("16.0.0".parse::<IndividualAddress>().is_err());
        assert!("a.b.c".parse::<IndividualAddress>().is_err());
        assert!("".parse::<IndividualAddress>().is_err());
    }
}
