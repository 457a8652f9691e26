//! KNX addressing: individual and group addresses, serial numbers.
//!
//! Both address kinds are 16-bit packed values. Equality always includes the
//! address kind, so an individual address and a group address with the same
//! raw value never compare equal (the `Address` union keeps the
//! discriminator).
//!
//! Group addresses print in either 2-level (`main/sub`) or 3-level
//! (`main/middle/sub`) presentation. The presentation is selected once per
//! process with [`set_group_address_style`] before any decode output is
//! formatted.

pub mod group;
pub mod individual;
pub mod serial;

pub use group::GroupAddress;
pub use individual::IndividualAddress;
pub use serial::SerialNumber;

use core::fmt;
use std::sync::OnceLock;

/// Presentation style for group addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupAddressStyle {
    /// `main/middle/sub` (5/3/8 bits), the ETS default
    #[default]
    ThreeLevel,
    /// `main/sub` (5/11 bits)
    TwoLevel,
}

static GROUP_ADDRESS_STYLE: OnceLock<GroupAddressStyle> = OnceLock::new();

/// Select the process-wide group address presentation.
///
/// Returns `false` if the style was already fixed (either by an earlier call
/// or by the first formatted group address).
pub fn set_group_address_style(style: GroupAddressStyle) -> bool {
    GROUP_ADDRESS_STYLE.set(style).is_ok()
}

/// The active group address presentation (3-level unless configured).
pub fn group_address_style() -> GroupAddressStyle {
    *GROUP_ADDRESS_STYLE.get_or_init(GroupAddressStyle::default)
}

/// A KNX address: individual (device) or group (logical).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// Physical device address `area.line.device`
    Individual(IndividualAddress),
    /// Logical group address
    Group(GroupAddress),
}

impl Address {
    /// The packed 16-bit value, without the discriminator.
    #[inline]
    pub const fn raw(self) -> u16 {
        match self {
            Self::Individual(a) => a.raw(),
            Self::Group(a) => a.raw(),
        }
    }

    /// Whether this is a group address.
    #[inline]
    pub const fn is_group(self) -> bool {
        matches!(self, Self::Group(_))
    }

    /// Encode the address into a byte buffer (big-endian).
    #[inline]
    pub fn encode(&self, buf: &mut [u8]) -> crate::error::Result<usize> {
        if buf.len() < 2 {
            return Err(crate::error::KnxError::buffer_too_small());
        }
        buf[0..2].copy_from_slice(&self.raw().to_be_bytes());
        Ok(2)
    }
}

impl From<IndividualAddress> for Address {
    fn from(addr: IndividualAddress) -> Self {
        Self::Individual(addr)
    }
}

impl From<GroupAddress> for Address {
    fn from(addr: GroupAddress) -> Self {
        Self::Group(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Individual(a) => a.fmt(f),
            Self::Group(a) => a.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_includes_discriminator() {
        let ind = Address::from(IndividualAddress::from(0x1101u16));
        let grp = Address::from(GroupAddress::from(0x1101u16));
        assert_eq!(ind.raw(), grp.raw());
        assert_ne!(ind, grp);
    }

    #[test]
    fn union_dispatch() {
        let a = Address::from(GroupAddress::from(0x0A03u16));
        assert!(a.is_group());
        let mut buf = [0u8; 2];
        a.encode(&mut buf).unwrap();
        assert_eq!(buf, [0x0A, 0x03]);
    }
}
