//! Error types for KNX operations.
//!
//! This module provides structured error types with backtraces and helper
//! methods for error information. Parse errors carry the offending value or
//! length so the frame can be logged and dropped at the parser boundary.

use core::fmt;

use std::backtrace::Backtrace;

/// Result type alias for KNX operations.
pub type Result<T> = core::result::Result<T, KnxError>;

// =============================================================================
// Error Kind Enums (Internal)
// =============================================================================

/// Frame format error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameErrorKind {
    InvalidFrame,
    BufferTooSmall,
    UnsupportedVersion,
    UnsupportedServiceType,
    InvalidMessageCode,
    InvalidAdditionalInfo,
    PayloadTooLarge,
}

/// Caller-misuse error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArgumentErrorKind {
    ValueOutOfRange,
    LengthOutOfRange,
    DestinationMismatch,
}

/// Connection error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionErrorKind {
    Refused,
    Failed,
    Lost,
    NotConnected,
    AlreadyConnected,
    Closed,
}

/// Tunneling error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TunnelingErrorKind {
    SequenceMismatch,
    AckFailed,
}

/// Transport error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportErrorKind {
    SendFailed,
    ReceiveFailed,
    NotBound,
    SocketError,
}

/// Addressing error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddressingErrorKind {
    InvalidIndividualAddress,
    InvalidGroupAddress,
    InvalidSerialNumber,
    OutOfRange,
}

/// KNX security error variants (internal).
///
/// The first four map one-to-one onto the secure application layer's
/// saturating failure counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SecureErrorKind {
    InvalidScf,
    SequenceError,
    CryptoError,
    AccessAndRoleError,
    SyncFailed,
    SessionStatus,
}

/// Keyring error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyringErrorKind {
    InvalidResource,
    SignatureMismatch,
    DecryptionFailed,
}

// =============================================================================
// Main Error Type
// =============================================================================

/// KNX protocol error type.
///
/// This is the main error type returned by all KNX operations. Frame errors
/// are recoverable at the parser boundary; argument errors are fatal for the
/// call; secure errors additionally bump the layer's failure counters.
#[derive(Debug)]
pub enum KnxError {
    /// Wire bytes do not conform to the cEMI/KNXnet/IP grammar
    Frame(FrameError),
    /// Caller misuse (out-of-range value, TPDU too long, ...)
    Argument(ArgumentError),
    /// Connection lifecycle errors (connect, disconnect, link closed)
    Connection(ConnectionError),
    /// Tunneling errors (sequence, ACK)
    Tunneling(TunnelingError),
    /// Transport errors (socket, send, receive)
    Transport(TransportError),
    /// Addressing errors (invalid address format)
    Addressing(AddressingError),
    /// Cryptographic or sequence-counter violation
    Secure(SecureError),
    /// Keyring resource errors (parse, signature, decrypt)
    Keyring(KeyringError),
    /// A bounded wait elapsed
    Timeout,
}

// =============================================================================
// Structured Error Types
// =============================================================================

/// Frame format error, optionally carrying the offending value or length
#[derive(Debug)]
pub struct FrameError {
    kind: FrameErrorKind,
    /// Offending value (message code, service type, length, ...)
    value: Option<u32>,
}

impl FrameError {
    pub(crate) const fn new(kind: FrameErrorKind) -> Self {
        Self { kind, value: None }
    }

    pub(crate) const fn with_value(kind: FrameErrorKind, value: u32) -> Self {
        Self {
            kind,
            value: Some(value),
        }
    }

    /// Check if this is an invalid frame error
    pub fn is_invalid_frame(&self) -> bool {
        matches!(self.kind, FrameErrorKind::InvalidFrame)
    }

    /// Check if this is an unknown message code error
    pub fn is_invalid_message_code(&self) -> bool {
        matches!(self.kind, FrameErrorKind::InvalidMessageCode)
    }

    /// The offending value, if one was recorded
    pub fn value(&self) -> Option<u32> {
        self.value
    }
}

/// Caller misuse error
#[derive(Debug)]
pub struct ArgumentError {
    kind: ArgumentErrorKind,
    backtrace: Backtrace,
}

impl ArgumentError {
    pub(crate) fn new(kind: ArgumentErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if a value was out of range
    pub fn is_out_of_range(&self) -> bool {
        matches!(self.kind, ArgumentErrorKind::ValueOutOfRange)
    }
}

/// Connection error
#[derive(Debug)]
pub struct ConnectionError {
    kind: ConnectionErrorKind,
    backtrace: Backtrace,
}

impl ConnectionError {
    pub(crate) fn new(kind: ConnectionErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if connection was refused
    pub fn is_refused(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::Refused)
    }

    /// Check if connection was lost
    pub fn is_lost(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::Lost)
    }

    /// Check if the link was closed
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::Closed)
    }
}

/// Tunneling error
#[derive(Debug)]
pub struct TunnelingError {
    kind: TunnelingErrorKind,
    backtrace: Backtrace,
}

impl TunnelingError {
    pub(crate) fn new(kind: TunnelingErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if this is a sequence mismatch error
    pub fn is_sequence_mismatch(&self) -> bool {
        matches!(self.kind, TunnelingErrorKind::SequenceMismatch)
    }

    /// Check if an acknowledgment finally failed
    pub fn is_ack_failed(&self) -> bool {
        matches!(self.kind, TunnelingErrorKind::AckFailed)
    }
}

/// Transport error
#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    backtrace: Backtrace,
}

impl TransportError {
    pub(crate) fn new(kind: TransportErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if this is a socket error
    pub fn is_socket_error(&self) -> bool {
        matches!(self.kind, TransportErrorKind::SocketError)
    }
}

/// Addressing error
#[derive(Debug)]
pub struct AddressingError {
    kind: AddressingErrorKind,
    backtrace: Backtrace,
}

impl AddressingError {
    pub(crate) fn new(kind: AddressingErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if address is out of range
    pub fn is_out_of_range(&self) -> bool {
        matches!(self.kind, AddressingErrorKind::OutOfRange)
    }
}

/// KNX security error
#[derive(Debug)]
pub struct SecureError {
    kind: SecureErrorKind,
    backtrace: Backtrace,
}

impl SecureError {
    pub(crate) fn new(kind: SecureErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if the security control field was malformed
    pub fn is_invalid_scf(&self) -> bool {
        matches!(self.kind, SecureErrorKind::InvalidScf)
    }

    /// Check if a sequence number was behind the expected one
    pub fn is_sequence_error(&self) -> bool {
        matches!(self.kind, SecureErrorKind::SequenceError)
    }

    /// Check if MAC verification or decryption failed
    pub fn is_crypto_error(&self) -> bool {
        matches!(self.kind, SecureErrorKind::CryptoError)
    }

    /// Check if a key was used outside its role
    pub fn is_access_error(&self) -> bool {
        matches!(self.kind, SecureErrorKind::AccessAndRoleError)
    }
}

/// Keyring error
#[derive(Debug)]
pub struct KeyringError {
    kind: KeyringErrorKind,
    backtrace: Backtrace,
}

impl KeyringError {
    pub(crate) fn new(kind: KeyringErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if the keyring signature did not verify
    pub fn is_signature_mismatch(&self) -> bool {
        matches!(self.kind, KeyringErrorKind::SignatureMismatch)
    }
}

// =============================================================================
// Convenience Constructors for KnxError
// =============================================================================

impl KnxError {
    // Frame errors
    #[inline]
    pub(crate) const fn invalid_frame() -> Self {
        Self::Frame(FrameError::new(FrameErrorKind::InvalidFrame))
    }

    #[inline]
    pub(crate) const fn frame_length(len: usize) -> Self {
        Self::Frame(FrameError::with_value(
            FrameErrorKind::InvalidFrame,
            len as u32,
        ))
    }

    #[inline]
    pub(crate) const fn buffer_too_small() -> Self {
        Self::Frame(FrameError::new(FrameErrorKind::BufferTooSmall))
    }

    #[inline]
    pub(crate) const fn unsupported_version() -> Self {
        Self::Frame(FrameError::new(FrameErrorKind::UnsupportedVersion))
    }

    #[inline]
    pub(crate) const fn unsupported_service_type(svc: u16) -> Self {
        Self::Frame(FrameError::with_value(
            FrameErrorKind::UnsupportedServiceType,
            svc as u32,
        ))
    }

    #[inline]
    pub(crate) const fn invalid_message_code(mc: u8) -> Self {
        Self::Frame(FrameError::with_value(
            FrameErrorKind::InvalidMessageCode,
            mc as u32,
        ))
    }

    #[inline]
    pub(crate) const fn invalid_additional_info() -> Self {
        Self::Frame(FrameError::new(FrameErrorKind::InvalidAdditionalInfo))
    }

    #[inline]
    pub(crate) const fn payload_too_large() -> Self {
        Self::Frame(FrameError::new(FrameErrorKind::PayloadTooLarge))
    }

    // Argument errors
    pub(crate) fn value_out_of_range() -> Self {
        Self::Argument(ArgumentError::new(ArgumentErrorKind::ValueOutOfRange))
    }

    pub(crate) fn length_out_of_range() -> Self {
        Self::Argument(ArgumentError::new(ArgumentErrorKind::LengthOutOfRange))
    }

    pub(crate) fn destination_mismatch() -> Self {
        Self::Argument(ArgumentError::new(ArgumentErrorKind::DestinationMismatch))
    }

    // Connection errors
    pub(crate) fn connection_refused() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::Refused))
    }

    pub(crate) fn connection_failed() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::Failed))
    }

    pub(crate) fn connection_lost() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::Lost))
    }

    pub(crate) fn not_connected() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::NotConnected))
    }

    pub(crate) fn already_connected() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::AlreadyConnected))
    }

    pub(crate) fn link_closed() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::Closed))
    }

    // Tunneling errors
    pub(crate) fn sequence_mismatch() -> Self {
        Self::Tunneling(TunnelingError::new(TunnelingErrorKind::SequenceMismatch))
    }

    pub(crate) fn tunneling_ack_failed() -> Self {
        Self::Tunneling(TunnelingError::new(TunnelingErrorKind::AckFailed))
    }

    // Transport errors
    pub(crate) fn socket_error() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::SocketError))
    }

    pub(crate) fn send_failed() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::SendFailed))
    }

    pub(crate) fn receive_failed() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::ReceiveFailed))
    }

    pub(crate) fn not_bound() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::NotBound))
    }

    // Addressing errors
    pub(crate) fn invalid_group_address() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::InvalidGroupAddress))
    }

    pub(crate) fn invalid_individual_address() -> Self {
        Self::Addressing(AddressingError::new(
            AddressingErrorKind::InvalidIndividualAddress,
        ))
    }

    pub(crate) fn invalid_serial_number() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::InvalidSerialNumber))
    }

    pub(crate) fn address_out_of_range() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::OutOfRange))
    }

    // Secure errors
    pub(crate) fn invalid_scf() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::InvalidScf))
    }

    pub(crate) fn secure_sequence_error() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::SequenceError))
    }

    pub(crate) fn crypto_error() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::CryptoError))
    }

    pub(crate) fn access_and_role_error() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::AccessAndRoleError))
    }

    pub(crate) fn sync_failed() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::SyncFailed))
    }

    pub(crate) fn session_status() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::SessionStatus))
    }

    // Keyring errors
    pub(crate) fn invalid_keyring() -> Self {
        Self::Keyring(KeyringError::new(KeyringErrorKind::InvalidResource))
    }

    pub(crate) fn keyring_signature_mismatch() -> Self {
        Self::Keyring(KeyringError::new(KeyringErrorKind::SignatureMismatch))
    }

    pub(crate) fn keyring_decryption_failed() -> Self {
        Self::Keyring(KeyringError::new(KeyringErrorKind::DecryptionFailed))
    }
}

// =============================================================================
// Display Implementation
// =============================================================================

impl fmt::Display for KnxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnxError::Frame(e) => match e.value {
                Some(v) => write!(f, "Frame error: {:?} (0x{:X})", e.kind, v),
                None => write!(f, "Frame error: {:?}", e.kind),
            },
            KnxError::Argument(e) => write!(f, "Argument error: {:?}", e.kind),
            KnxError::Connection(e) => write!(f, "Connection error: {:?}", e.kind),
            KnxError::Tunneling(e) => write!(f, "Tunneling error: {:?}", e.kind),
            KnxError::Transport(e) => write!(f, "Transport error: {:?}", e.kind),
            KnxError::Addressing(e) => write!(f, "Addressing error: {:?}", e.kind),
            KnxError::Secure(e) => write!(f, "Security error: {:?}", e.kind),
            KnxError::Keyring(e) => write!(f, "Keyring error: {:?}", e.kind),
            KnxError::Timeout => write!(f, "Operation timeout"),
        }
    }
}

impl std::error::Error for KnxError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_error_carries_value() {
        let err = KnxError::invalid_message_code(0xFF);
        match err {
            KnxError::Frame(e) => {
                assert!(e.is_invalid_message_code());
                assert_eq!(e.value(), Some(0xFF));
            }
            _ => panic!("wrong category"),
        }
    }

    #[test]
    fn secure_error_predicates() {
        match KnxError::secure_sequence_error() {
            KnxError::Secure(e) => assert!(e.is_sequence_error()),
            _ => panic!("wrong category"),
        }
        match KnxError::crypto_error() {
            KnxError::Secure(e) => assert!(e.is_crypto_error()),
            _ => panic!("wrong category"),
        }
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(KnxError::Timeout.to_string(), "Operation timeout");
        let s = KnxError::keyring_signature_mismatch().to_string();
        assert!(s.contains("SignatureMismatch"));
    }
}
