//! KNX Group Address implementation.
//!
//! Group addresses represent logical groupings of devices for functional
//! control. Two presentations are supported:
//! - 3-level: Main/Middle/Sub (5/3/8 bits) - most common
//! - 2-level: Main/Sub (5/11 bits)
//!
//! The `Display` impl honours the process-wide presentation selected with
//! [`crate::addressing::set_group_address_style`].

use crate::addressing::{group_address_style, GroupAddressStyle};
use crate::error::{KnxError, Result};
use core::fmt;

/// KNX Group Address
///
/// # Examples
///
/// ```
/// use knx_secure::addressing::GroupAddress;
///
/// let addr = GroupAddress::new(2, 2, 10).unwrap();
/// assert_eq!(addr.raw(), 0x120A);
///
/// // Parse from string (presentation auto-detected)
/// let addr: GroupAddress = "2/2/10".parse().unwrap();
/// assert_eq!(u16::from(addr), 0x120A);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupAddress {
    raw: u16,
}

impl GroupAddress {
    /// Maximum main group value (5 bits)
    pub const MAX_MAIN: u8 = 31;
    /// Maximum middle group value (3 bits)
    pub const MAX_MIDDLE: u8 = 7;
    /// Maximum sub value for 2-level presentation (11 bits)
    pub const MAX_SUB_2LEVEL: u16 = 2047;

    /// Create a new 3-level Group Address (Main/Middle/Sub).
    ///
    /// # Errors
    ///
    /// Returns an addressing error if any component is out of range.
    pub fn new(main: u8, middle: u8, sub: u8) -> Result<Self> {
        if main > Self::MAX_MAIN || middle > Self::MAX_MIDDLE {
            return Err(KnxError::address_out_of_range());
        }

        let raw = (u16::from(main) << 11) | (u16::from(middle) << 8) | u16::from(sub);
        Ok(Self { raw })
    }

    /// Create a new 2-level Group Address (Main/Sub).
    ///
    /// # Errors
    ///
    /// Returns an addressing error if any component is out of range.
    pub fn new_2level(main: u8, sub: u16) -> Result<Self> {
        if main > Self::MAX_MAIN || sub > Self::MAX_SUB_2LEVEL {
            return Err(KnxError::address_out_of_range());
        }

        let raw = (u16::from(main) << 11) | sub;
        Ok(Self { raw })
    }

    /// Get the raw u16 representation of the address.
    #[inline(always)]
    pub const fn raw(self) -> u16 {
        self.raw
    }

    /// Get the main group component (0-31).
    #[inline(always)]
    pub const fn main(self) -> u8 {
        ((self.raw >> 11) & 0x1F) as u8
    }

    /// Get the middle group component for 3-level presentation (0-7).
    #[inline(always)]
    pub const fn middle(self) -> u8 {
        ((self.raw >> 8) & 0x07) as u8
    }

    /// Get the sub group component for 3-level presentation (0-255).
    #[inline(always)]
    pub const fn sub(self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// Get the sub group component for 2-level presentation (0-2047).
    #[inline(always)]
    pub const fn sub_2level(self) -> u16 {
        self.raw & 0x07FF
    }

    /// The broadcast address `0/0/0`.
    #[inline(always)]
    pub const fn broadcast() -> Self {
        Self { raw: 0 }
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
        buf[0..2].copy_from_slice(&self.raw.to_be_bytes());
        Ok(2)
    }

    /// Decode an address from a byte buffer (big-endian).
    ///
    /// # Errors
    ///
    /// Returns `KnxError::Frame` if buffer is shorter than 2 bytes.
    #[inline]
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(KnxError::buffer_too_small());
        }
        Ok(Self {
            raw: u16::from_be_bytes([buf[0], buf[1]]),
        })
    }

    /// Format using the 3-level presentation regardless of the process style.
    pub fn to_string_3level(&self) -> heapless::String<16> {
        use core::fmt::Write;
        let mut s = heapless::String::new();
        let _ = write!(s, "{}/{}/{}", self.main(), self.middle(), self.sub());
        s
    }

    /// Format using the 2-level presentation regardless of the process style.
    pub fn to_string_2level(&self) -> heapless::String<16> {
        use core::fmt::Write;
        let mut s = heapless::String::new();
        let _ = write!(s, "{}/{}", self.main(), self.sub_2level());
        s
    }
}

impl From<u16> for GroupAddress {
    #[inline(always)]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<GroupAddress> for u16 {
    #[inline(always)]
    fn from(addr: GroupAddress) -> u16 {
        addr.raw
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match group_address_style() {
            GroupAddressStyle::ThreeLevel => {
                write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
            }
            GroupAddressStyle::TwoLevel => write!(f, "{}/{}", self.main(), self.sub_2level()),
        }
    }
}

impl core::str::FromStr for GroupAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');

        let main = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(KnxError::invalid_group_address)?;

        let second = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(KnxError::invalid_group_address)?;

        if let Some(sub_str) = parts.next() {
            // 3-level: main/middle/sub
            let sub = sub_str
                .parse::<u8>()
                .map_err(|_| KnxError::invalid_group_address())?;

            if parts.next().is_some() || second > u16::from(u8::MAX) {
                return Err(KnxError::invalid_group_address());
            }

            Self::new(main, second as u8, sub)
        } else {
            // 2-level: main/sub
            Self::new_2level(main, second)
        }
    }
}
