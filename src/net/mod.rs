//! Network transports for KNXnet/IP communication.
//!
//! The [`transport::AsyncTransport`] trait abstracts the datagram layer so
//! the tunneling and routing state machines can be driven by real sockets
//! in production and by [`mock_transport::MockTransport`] in tests.

pub mod mock_transport;
pub mod transport;

pub use transport::{AsyncTransport, TcpTransport, UdpTransport};
