#![doc = include_str!("../README.md")]

//! # knx-secure
//!
//! KNX access over KNXnet/IP with KNX Data Secure and KNXnet/IP Secure.
//!
//! The crate covers the cEMI frame codec (L-Data standard/extended, bus
//! monitor, device management, EMI1/EMI2 translation), ETS keyring
//! resources, the AES-128-CCM secure application layer with sequence
//! synchronisation, and the tunneling/routing connection state machines,
//! optionally wrapped in a secure session.
//!
//! ## Example
//!
//! ```rust,no_run
//! use knx_secure::addressing::{GroupAddress, IndividualAddress};
//! use knx_secure::cemi::LData;
//! use knx_secure::net::UdpTransport;
//! use knx_secure::protocol::constants::CemiMessageCode;
//! use knx_secure::protocol::tunnel::TunnelConnection;
//!
//! # async fn run() -> knx_secure::Result<()> {
//! let transport = UdpTransport::bind(0).await?;
//! let mut tunnel = TunnelConnection::new(transport, "192.168.1.10:3671".parse().unwrap());
//! tunnel.connect().await?;
//!
//! let frame = LData::builder(
//!     CemiMessageCode::LDataReq,
//!     IndividualAddress::new(1, 1, 255)?,
//!     GroupAddress::new(1, 2, 3)?,
//! )
//! .tpdu(&[0x00, 0x81])
//! .build()?;
//! tunnel.send_cemi(&frame.emit()).await?;
//! # Ok(())
//! # }
//! ```

pub mod addressing;
pub mod cemi;
pub mod error;
pub mod keyring;
pub mod net;
pub mod protocol;
pub mod secure;
pub mod utility;

// Re-export commonly used types
pub use addressing::{Address, GroupAddress, IndividualAddress, SerialNumber};
pub use cemi::CemiFrame;
pub use error::{KnxError, Result};
pub use keyring::Keyring;
pub use secure::{SecureApplicationLayer, SecurityContext};
