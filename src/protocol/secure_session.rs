//! KNXnet/IP Secure session: the SECURE_WRAPPER codec and the
//! SESSION_REQUEST / RESPONSE / AUTHENTICATE / STATUS frames.
//!
//! A secure session proves mutual knowledge of a shared secret during setup
//! and then carries every KNXnet/IP service inside an encrypted wrapper:
//!
//! ```text
//! [session-id(2)][send-seq(6)][serial(6)][msg-tag(2)][encrypted frame(*)][MAC(16)]
//! ```
//!
//! The wrapper is AES-128-CCM with a 16-byte MAC over a 14-byte nonce
//! (sequence, serial, tag); the wrapper's own KNXnet/IP header and the
//! session id are authenticated as associated data. The Diffie-Hellman
//! derivation of the session key happens outside this module; the session
//! takes its 128-bit key through the constructor and exposes the
//! monotonically incrementing send sequence.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use zeroize::Zeroize;

use crate::addressing::SerialNumber;
use crate::error::{KnxError, Result};
use crate::net::transport::AsyncTransport;
use crate::protocol::constants::{ServiceType, MAX_FRAME_SIZE};
use crate::protocol::frame::{build_frame, KnxnetIpFrame, KnxnetIpHeader};
use crate::protocol::services::Hpai;
use crate::secure::crypto::{
    ccm_mac, ctr_decrypt_mac_and_payload, ctr_encrypt_mac_and_payload, Key,
};
use crate::utility::{six_bytes, unsigned_be};

/// Fixed part of a secure wrapper body (everything but the payload).
const WRAPPER_OVERHEAD: usize = 2 + 6 + 6 + 2 + 16;

/// Bound on the whole session setup exchange.
const SESSION_SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// `SESSION_STATUS` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    /// Authentication succeeded
    AuthSuccess = 0x00,
    /// Authentication failed
    AuthFailed = 0x01,
    /// Session is not (yet) authenticated
    Unauthenticated = 0x02,
    /// Session timed out
    Timeout = 0x03,
    /// Keep-alive
    KeepAlive = 0x04,
    /// Session closes
    Close = 0x05,
}

impl SessionStatus {
    /// Convert u8 to `SessionStatus`
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::AuthSuccess),
            0x01 => Some(Self::AuthFailed),
            0x02 => Some(Self::Unauthenticated),
            0x03 => Some(Self::Timeout),
            0x04 => Some(Self::KeepAlive),
            0x05 => Some(Self::Close),
            _ => None,
        }
    }

    /// Build the complete status frame.
    pub fn build(self) -> Vec<u8> {
        build_frame(ServiceType::SessionStatus, &[self as u8, 0x00])
    }

    /// Parse from a frame body.
    ///
    /// # Errors
    ///
    /// Returns a frame error for empty bodies or unknown codes.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let code = *body.first().ok_or_else(KnxError::buffer_too_small)?;
        Self::from_u8(code).ok_or_else(KnxError::invalid_frame)
    }
}

/// `SESSION_REQUEST` (0x0951): control endpoint plus the client's public
/// value of the key exchange.
#[derive(Debug, Clone, Copy)]
pub struct SessionRequest {
    /// Control endpoint of the client
    pub control_endpoint: Hpai,
    /// Client public value (Curve25519)
    pub public_key: [u8; 32],
}

impl SessionRequest {
    /// Build the complete frame.
    pub fn build(&self) -> Vec<u8> {
        let mut body = [0u8; Hpai::SIZE + 32];
        let _ = self.control_endpoint.encode(&mut body[..Hpai::SIZE]);
        body[Hpai::SIZE..].copy_from_slice(&self.public_key);
        build_frame(ServiceType::SessionRequest, &body)
    }

    /// Parse from a frame body.
    ///
    /// # Errors
    ///
    /// Returns a frame error on truncated bodies.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < Hpai::SIZE + 32 {
            return Err(KnxError::buffer_too_small());
        }
        let control_endpoint = Hpai::decode(body)?;
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&body[Hpai::SIZE..Hpai::SIZE + 32]);
        Ok(Self {
            control_endpoint,
            public_key,
        })
    }
}

/// `SESSION_RESPONSE` (0x0952).
#[derive(Debug, Clone, Copy)]
pub struct SessionResponse {
    /// Session id assigned by the server
    pub session_id: u16,
    /// Server public value (Curve25519)
    pub public_key: [u8; 32],
    /// MAC proving knowledge of the device authentication code
    pub mac: [u8; 16],
}

impl SessionResponse {
    /// Build the complete frame.
    pub fn build(&self) -> Vec<u8> {
        let mut body = [0u8; 2 + 32 + 16];
        body[..2].copy_from_slice(&self.session_id.to_be_bytes());
        body[2..34].copy_from_slice(&self.public_key);
        body[34..].copy_from_slice(&self.mac);
        build_frame(ServiceType::SessionResponse, &body)
    }

    /// Parse from a frame body.
    ///
    /// # Errors
    ///
    /// Returns a frame error on truncated bodies.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 2 + 32 + 16 {
            return Err(KnxError::buffer_too_small());
        }
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&body[2..34]);
        let mut mac = [0u8; 16];
        mac.copy_from_slice(&body[34..50]);
        Ok(Self {
            session_id: u16::from_be_bytes([body[0], body[1]]),
            public_key,
            mac,
        })
    }
}

/// `SESSION_AUTHENTICATE` (0x0953).
#[derive(Debug, Clone, Copy)]
pub struct SessionAuthenticate {
    /// Secure session user id (0..=127)
    pub user_id: u8,
    /// MAC proving knowledge of the user password
    pub mac: [u8; 16],
}

impl SessionAuthenticate {
    /// Build the complete frame.
    ///
    /// # Errors
    ///
    /// Returns an argument error for user ids above 127.
    pub fn build(&self) -> Result<Vec<u8>> {
        if self.user_id > 127 {
            return Err(KnxError::value_out_of_range());
        }
        let mut body = [0u8; 2 + 16];
        body[0] = 0x00; // reserved
        body[1] = self.user_id;
        body[2..].copy_from_slice(&self.mac);
        Ok(build_frame(ServiceType::SessionAuthenticate, &body))
    }

    /// Parse from a frame body.
    ///
    /// # Errors
    ///
    /// Returns a frame error on truncated bodies.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 2 + 16 {
            return Err(KnxError::buffer_too_small());
        }
        let mut mac = [0u8; 16];
        mac.copy_from_slice(&body[2..18]);
        Ok(Self {
            user_id: body[1],
            mac,
        })
    }
}

/// An established secure session wrapping KNXnet/IP services.
///
/// The session key is zeroed on close (and on drop).
pub struct SecureSession {
    session_id: u16,
    key: Key,
    serial: SerialNumber,
    send_seq: u64,
    last_recv_seq: Option<u64>,
    closed: bool,
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("session_id", &self.session_id)
            .field("serial", &self.serial)
            .field("send_seq", &self.send_seq)
            .field("closed", &self.closed)
            .finish()
    }
}

impl SecureSession {
    /// Run the session setup exchange against a server.
    ///
    /// Sends SESSION_REQUEST with the client public value, waits for
    /// SESSION_RESPONSE, derives the session key and the authentication MAC
    /// through `derive` (the Diffie-Hellman secret stays with the caller),
    /// then authenticates inside the wrapper and waits for the
    /// SESSION_STATUS verdict. The whole exchange is bounded at 10 s.
    ///
    /// # Errors
    ///
    /// `Timeout` on the bound; `Secure` session status errors when the
    /// server rejects the authentication.
    pub async fn establish<T, F>(
        transport: &mut T,
        server: SocketAddr,
        serial: SerialNumber,
        public_key: [u8; 32],
        user_id: u8,
        derive: F,
    ) -> Result<Self>
    where
        T: AsyncTransport,
        F: FnOnce(&SessionResponse) -> Result<(Key, [u8; 16])>,
    {
        let request = SessionRequest {
            control_endpoint: Hpai::nat(),
            public_key,
        };
        transport.send_to(&request.build(), server).await?;

        let deadline = Instant::now() + SESSION_SETUP_TIMEOUT;
        let mut buf = [0u8; MAX_FRAME_SIZE];

        let response = loop {
            let (len, _) = match timeout_at(deadline, transport.recv_from(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => return Err(KnxError::Timeout),
            };
            let Ok(frame) = KnxnetIpFrame::parse(&buf[..len]) else {
                continue;
            };
            match frame.service_type() {
                ServiceType::SessionResponse => break SessionResponse::parse(frame.body())?,
                ServiceType::SessionStatus => {
                    log::warn!("session setup rejected: {:?}", SessionStatus::parse(frame.body()));
                    return Err(KnxError::session_status());
                }
                _ => {}
            }
        };

        let (key, auth_mac) = derive(&response)?;
        let mut session = Self::new(response.session_id, key, serial);

        let authenticate = SessionAuthenticate {
            user_id,
            mac: auth_mac,
        }
        .build()?;
        let wrapped = session.wrap(&authenticate, 0)?;
        transport.send_to(&wrapped, server).await?;

        loop {
            let (len, _) = match timeout_at(deadline, transport.recv_from(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => return Err(KnxError::Timeout),
            };
            let Ok(frame) = KnxnetIpFrame::parse(&buf[..len]) else {
                continue;
            };
            let status = match frame.service_type() {
                ServiceType::SecureWrapper => {
                    let inner = session.unwrap(frame.body())?;
                    let inner = KnxnetIpFrame::parse(&inner)?;
                    if inner.service_type() != ServiceType::SessionStatus {
                        continue;
                    }
                    SessionStatus::parse(inner.body())?
                }
                ServiceType::SessionStatus => SessionStatus::parse(frame.body())?,
                _ => continue,
            };
            return match status {
                SessionStatus::AuthSuccess => {
                    log::info!("secure session {} established", session.session_id());
                    Ok(session)
                }
                other => {
                    log::warn!("session authentication failed: {other:?}");
                    Err(KnxError::session_status())
                }
            };
        }
    }

    /// Create a session from the negotiated id and derived key.
    pub fn new(session_id: u16, key: Key, serial: SerialNumber) -> Self {
        Self {
            session_id,
            key,
            serial,
            send_seq: 0,
            last_recv_seq: None,
            closed: false,
        }
    }

    /// The session id assigned by the server.
    pub const fn session_id(&self) -> u16 {
        self.session_id
    }

    /// Whether the session was closed.
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Hand out the next 48-bit send sequence.
    ///
    /// # Errors
    ///
    /// Returns a connection error once the session is closed.
    pub fn next_send_seq(&mut self) -> Result<u64> {
        if self.closed {
            return Err(KnxError::link_closed());
        }
        let seq = self.send_seq;
        self.send_seq += 1;
        Ok(seq)
    }

    /// Wrap a complete KNXnet/IP frame into a SECURE_WRAPPER frame.
    ///
    /// # Errors
    ///
    /// Connection error when closed; argument error when the sequence space
    /// is exhausted.
    pub fn wrap(&mut self, frame: &[u8], tag: u16) -> Result<Vec<u8>> {
        let seq = self.next_send_seq()?;
        let seq_bytes = six_bytes(seq)?;

        let total = KnxnetIpHeader::SIZE + WRAPPER_OVERHEAD + frame.len();
        let header = wrapper_header(total as u16);

        let nonce = wrapper_nonce(&seq_bytes, &self.serial, tag);
        let b0 = wrapper_b0(&nonce, frame.len() as u16);
        let ctr = wrapper_ctr(&nonce);

        let mut ad = [0u8; 8];
        ad[..6].copy_from_slice(&header);
        ad[6..].copy_from_slice(&self.session_id.to_be_bytes());

        let mac = ccm_mac(&self.key, &b0, &ad, frame);
        let (enc_frame, enc_mac) = ctr_encrypt_mac_and_payload(&self.key, &ctr, &mac, frame);

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.session_id.to_be_bytes());
        out.extend_from_slice(&seq_bytes);
        out.extend_from_slice(&self.serial.bytes());
        out.extend_from_slice(&tag.to_be_bytes());
        out.extend_from_slice(&enc_frame);
        out.extend_from_slice(&enc_mac);
        Ok(out)
    }

    /// Unwrap a SECURE_WRAPPER body into the inner KNXnet/IP frame.
    ///
    /// The receive sequence must strictly increase.
    ///
    /// # Errors
    ///
    /// `Secure` errors for wrong session ids, stale sequences and MAC
    /// mismatches; connection error when closed.
    pub fn unwrap(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        if self.closed {
            return Err(KnxError::link_closed());
        }
        if body.len() < WRAPPER_OVERHEAD {
            return Err(KnxError::frame_length(body.len()));
        }
        let session_id = u16::from_be_bytes([body[0], body[1]]);
        if session_id != self.session_id {
            return Err(KnxError::session_status());
        }

        let mut seq_bytes = [0u8; 6];
        seq_bytes.copy_from_slice(&body[2..8]);
        let seq = unsigned_be(&seq_bytes)?;
        if self.last_recv_seq.is_some_and(|last| seq <= last) {
            log::warn!("secure wrapper replay: seq {seq}");
            return Err(KnxError::secure_sequence_error());
        }

        let serial = SerialNumber::decode(&body[8..14])?;
        let tag = u16::from_be_bytes([body[14], body[15]]);
        let enc_frame = &body[16..body.len() - 16];
        let enc_mac = &body[body.len() - 16..];

        let total = KnxnetIpHeader::SIZE + body.len();
        let header = wrapper_header(total as u16);

        let nonce = wrapper_nonce(&seq_bytes, &serial, tag);
        let ctr = wrapper_ctr(&nonce);
        let (frame, mac) = ctr_decrypt_mac_and_payload(&self.key, &ctr, enc_mac, enc_frame);

        let b0 = wrapper_b0(&nonce, frame.len() as u16);
        let mut ad = [0u8; 8];
        ad[..6].copy_from_slice(&header);
        ad[6..].copy_from_slice(&session_id.to_be_bytes());
        let expected = ccm_mac(&self.key, &b0, &ad, &frame);
        if expected[..] != mac[..] {
            return Err(KnxError::crypto_error());
        }

        self.last_recv_seq = Some(seq);
        Ok(frame)
    }

    /// Close the session, zeroing the key. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.key.zeroize();
            log::debug!("secure session {} closed", self.session_id);
        }
    }
}

impl Drop for SecureSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// The KNXnet/IP header bytes of a secure wrapper frame.
fn wrapper_header(total_length: u16) -> [u8; 6] {
    let mut header = [0u8; 6];
    let _ = KnxnetIpHeader::new(
        ServiceType::SecureWrapper,
        total_length - KnxnetIpHeader::SIZE as u16,
    )
    .encode(&mut header);
    header
}

/// 14-byte wrapper nonce: sequence, serial, message tag.
fn wrapper_nonce(seq: &[u8; 6], serial: &SerialNumber, tag: u16) -> [u8; 14] {
    let mut nonce = [0u8; 14];
    nonce[..6].copy_from_slice(seq);
    nonce[6..12].copy_from_slice(&serial.bytes());
    nonce[12..].copy_from_slice(&tag.to_be_bytes());
    nonce
}

fn wrapper_b0(nonce: &[u8; 14], payload_len: u16) -> [u8; 16] {
    let mut b0 = [0u8; 16];
    b0[..14].copy_from_slice(nonce);
    b0[14..].copy_from_slice(&payload_len.to_be_bytes());
    b0
}

fn wrapper_ctr(nonce: &[u8; 14]) -> [u8; 16] {
    let mut ctr = [0u8; 16];
    ctr[..14].copy_from_slice(nonce);
    ctr[14] = 0xFF;
    ctr
}
