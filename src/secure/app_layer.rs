//! The KNX Data Secure application layer (S-AL).
//!
//! Secures and extracts APDUs with AES-128-CCM, keeps the per-peer 48-bit
//! sequence discipline, and runs the sync.req/sync.res challenge protocol
//! that aligns sequence counters with a peer.
//!
//! ## Secured APDU layout
//!
//! ```text
//! [TPCI|APCI_hi][APCI_lo=0xF1][SCF][seq(6)][SN(6), sync.req only][APDU*][MAC(4)]
//! ```
//!
//! SCF: bit 7 tool access, bits 6..4 algorithm id (0 auth-only,
//! 1 auth+conf), bit 3 system broadcast, bits 2..0 service
//! (0 `S-A_Data`, 2 `S-A_Sync.req`, 3 `S-A_Sync.res`).

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::addressing::{Address, GroupAddress, IndividualAddress, SerialNumber};
use crate::error::{KnxError, Result};
use crate::protocol::constants::{
    APCI_FUNCTION_PROPERTY_EXT_COMMAND, APCI_SECURE_SERVICE,
};
use crate::secure::crypto::{
    aes_block, block0, cbc_mac, ccm_mac, ctr0, ctr_decrypt_mac_and_payload,
    ctr_encrypt_mac_and_payload, Key,
};
use crate::secure::SecurityContext;
use crate::utility::{six_bytes, unsigned_be};

/// SCF service id of a secured data PDU.
const SERVICE_DATA: u8 = 0;
/// SCF service id of a sync request.
const SERVICE_SYNC_REQ: u8 = 2;
/// SCF service id of a sync response.
const SERVICE_SYNC_RES: u8 = 3;

/// How long a pending sync request waits for its response.
const SYNC_TIMEOUT: Duration = Duration::from_secs(6);

/// Upper bound on a group object diagnostics round trip.
const DIAGNOSTICS_TIMEOUT: Duration = Duration::from_secs(3);

/// Window in which a fresh sync.res suppresses further sync requests.
const SYNC_RES_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Interface object type of the group object table.
const GROUP_OBJECT_TABLE: u16 = 9;
/// Property id of the group object diagnostics function.
const PID_GO_DIAGNOSTICS: u8 = 66;

/// Outbound transport hook of the secure application layer.
///
/// The tunneling session implements this to put a (secured) TPDU on the
/// bus; tests use scripted implementations.
#[allow(async_fn_in_trait)]
pub trait SecureSender {
    /// Send a TPDU to the given destination.
    async fn send(&mut self, dst: Address, tpdu: &[u8]) -> Result<()>;
}

/// What a received secured APDU turned into.
#[derive(Debug, PartialEq, Eq)]
pub enum SecureOutcome {
    /// Plain APDU recovered from a secured data PDU
    Data(Vec<u8>),
    /// A sync request was served; send this sync.res TPDU back to the peer
    SyncResponse(Vec<u8>),
    /// A sync response was consumed; counters are aligned
    Synced,
    /// Frame silently ignored (foreign serial number, debounce, stale)
    Ignored,
}

/// Saturating failure counters of the secure application layer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FailureCounters {
    /// Malformed or unsupported security control fields
    pub invalid_scf: u16,
    /// Sequence numbers behind the expected value
    pub seq_errors: u16,
    /// MAC verification failures
    pub crypto_errors: u16,
    /// Keys used outside their role
    pub access_role_errors: u16,
}

fn bump(counter: &mut u16) {
    *counter = counter.saturating_add(1);
}

#[derive(Debug)]
struct PendingSync {
    challenge: [u8; 6],
    tool: bool,
    notify: oneshot::Sender<()>,
}

/// Pending result of a group object diagnostics command.
///
/// Complete-once: resolves when the surrogate answers, fails with a timeout
/// after 3 s, and fails with a closed-link error when the layer shuts down.
#[derive(Debug)]
pub struct DiagnosticsReply {
    rx: oneshot::Receiver<u8>,
}

impl DiagnosticsReply {
    /// Wait for the surrogate's return code, bounded at 3 s.
    ///
    /// # Errors
    ///
    /// `Timeout` when the bound elapses, a connection error when the layer
    /// was closed.
    pub async fn wait(self) -> Result<u8> {
        match timeout(DIAGNOSTICS_TIMEOUT, self.rx).await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(_)) => Err(KnxError::link_closed()),
            Err(_) => Err(KnxError::Timeout),
        }
    }
}

/// The secure application layer of one local device.
#[derive(Debug)]
pub struct SecureApplicationLayer {
    ctx: SecurityContext,
    serial: SerialNumber,

    next_tool: u64,
    next_p2p: u64,
    last_valid_tool: HashMap<IndividualAddress, u64>,
    last_valid_p2p: HashMap<IndividualAddress, u64>,
    synced_peers: HashSet<IndividualAddress>,

    counters: FailureCounters,
    pending_syncs: HashMap<IndividualAddress, PendingSync>,
    pending_diagnostics: HashMap<IndividualAddress, oneshot::Sender<u8>>,
    last_sync_res_sent: Option<Instant>,
    sync_timeout: Duration,
    closed: bool,
}

impl SecureApplicationLayer {
    /// Create a layer over a snapshot of the given key tables.
    pub fn new(ctx: SecurityContext, serial: SerialNumber) -> Self {
        Self {
            ctx,
            serial,
            next_tool: 1,
            next_p2p: 1,
            last_valid_tool: HashMap::new(),
            last_valid_p2p: HashMap::new(),
            synced_peers: HashSet::new(),
            counters: FailureCounters::default(),
            pending_syncs: HashMap::new(),
            pending_diagnostics: HashMap::new(),
            last_sync_res_sent: None,
            sync_timeout: SYNC_TIMEOUT,
            closed: false,
        }
    }

    /// Whether a TPDU carries the secure service APCI.
    pub fn is_secured(tpdu: &[u8]) -> bool {
        tpdu.len() >= 2
            && (u16::from(tpdu[0] & 0x03) << 8) | u16::from(tpdu[1]) == APCI_SECURE_SERVICE
    }

    /// Current failure counters.
    pub fn failure_counters(&self) -> FailureCounters {
        self.counters
    }

    /// Next outgoing sequence number of the given key domain.
    pub fn next_sequence(&self, tool: bool) -> u64 {
        if tool {
            self.next_tool
        } else {
            self.next_p2p
        }
    }

    /// Last accepted sequence number of a peer in the given domain.
    pub fn last_valid_sequence(&self, peer: IndividualAddress, tool: bool) -> u64 {
        let map = if tool {
            &self.last_valid_tool
        } else {
            &self.last_valid_p2p
        };
        map.get(&peer).copied().unwrap_or(0)
    }

    /// Override the sync handshake timeout (testing and diagnostics).
    pub fn set_sync_timeout(&mut self, timeout: Duration) {
        self.sync_timeout = timeout;
    }

    // =========================================================================
    // Securing
    // =========================================================================

    /// Secure an APDU for `dst`, or `None` when no key is configured for the
    /// destination (the caller sends plain).
    ///
    /// Assigns and consumes the next outgoing sequence number of the
    /// selected domain.
    ///
    /// # Errors
    ///
    /// `Secure` errors for role violations; `Argument` errors for exhausted
    /// counters.
    pub fn secure_data(
        &mut self,
        src: IndividualAddress,
        dst: Address,
        tpci: u8,
        apdu: &[u8],
        tool: bool,
        conf: bool,
    ) -> Result<Option<Vec<u8>>> {
        let key = match self.key_for(dst, tool)? {
            Some(key) => key,
            None => return Ok(None),
        };

        let seq = self.next_sequence(tool);
        if seq == 0 {
            return Err(KnxError::value_out_of_range());
        }
        let seq_bytes = six_bytes(seq)?;

        let scf = scf(tool, conf, false, SERVICE_DATA);
        let frame = build_secured(
            &key, scf, &seq_bytes, &seq_bytes, src, dst, None, tpci, apdu,
        );

        if tool {
            self.next_tool = seq + 1;
        } else {
            self.next_p2p = seq + 1;
        }
        Ok(Some(frame))
    }

    /// Secure and send an APDU, running the sync handshake first when this
    /// domain has never exchanged sequence numbers with the peer.
    ///
    /// # Errors
    ///
    /// `Secure` sync failure if the handshake times out (6 s); otherwise as
    /// [`SecureApplicationLayer::secure_data`].
    pub async fn send_secured<S: SecureSender>(
        &mut self,
        sender: &mut S,
        src: IndividualAddress,
        dst: Address,
        peer_serial: SerialNumber,
        tpci: u8,
        apdu: &[u8],
        tool: bool,
        conf: bool,
    ) -> Result<()> {
        if self.closed {
            return Err(KnxError::link_closed());
        }

        if self.next_sequence(tool) <= 1 {
            match dst {
                Address::Individual(peer) if !self.synced_peers.contains(&peer) => {
                    let (frame, rx) = self.sync_request(src, peer, peer_serial, tool)?;
                    sender.send(dst, &frame).await?;
                    let deadline = self.sync_timeout;
                    match timeout(deadline, rx).await {
                        Ok(Ok(())) => {}
                        _ => {
                            self.pending_syncs.remove(&peer);
                            log::warn!("sync.req to {peer} timed out after {deadline:?}");
                            return Err(KnxError::sync_failed());
                        }
                    }
                }
                Address::Group(_) if self.ctx.has_group_key(GroupAddress::broadcast()) => {
                    let frame = self.broadcast_sync(src, tool)?;
                    sender.send(Address::Group(GroupAddress::broadcast()), &frame).await?;
                }
                Address::Group(_) | Address::Individual(_) => {}
            }
        }

        match self.secure_data(src, dst, tpci, apdu, tool, conf)? {
            Some(frame) => sender.send(dst, &frame).await,
            None => sender.send(dst, apdu).await,
        }
    }

    // =========================================================================
    // Sync handshake
    // =========================================================================

    /// Build a sync request for `peer` and register the pending entry.
    ///
    /// The returned receiver completes when the matching sync.res arrives;
    /// callers bound the wait with the sync timeout.
    ///
    /// # Errors
    ///
    /// `Secure` access error when no key is known for the peer.
    pub fn sync_request(
        &mut self,
        src: IndividualAddress,
        peer: IndividualAddress,
        peer_serial: SerialNumber,
        tool: bool,
    ) -> Result<(Vec<u8>, oneshot::Receiver<()>)> {
        let key = self
            .ctx
            .tool_key(peer)
            .copied()
            .ok_or_else(KnxError::access_and_role_error)?;

        let mut challenge = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut challenge);

        let scf = scf(tool, true, false, SERVICE_SYNC_REQ);
        // the challenge rides in the sequence slot and doubles as nonce seq
        let frame = build_secured(
            &key,
            scf,
            &challenge,
            &challenge,
            src,
            Address::Individual(peer),
            Some(&peer_serial),
            0,
            &challenge,
        );

        let (tx, rx) = oneshot::channel();
        self.pending_syncs.insert(
            peer,
            PendingSync {
                challenge,
                tool,
                notify: tx,
            },
        );
        log::debug!("sync.req to {peer} (tool={tool})");
        Ok((frame, rx))
    }

    /// Build a system-broadcast sync request with the all-zero wildcard
    /// serial number.
    ///
    /// The target serial of a system-broadcast sync.req would have to be
    /// looked up per device; it is sent with the zero serial, so only the
    /// we-are-target check applies on the receiving side. Known limitation.
    ///
    /// # Errors
    ///
    /// `Secure` access error when no broadcast key is available.
    pub fn broadcast_sync(&mut self, src: IndividualAddress, tool: bool) -> Result<Vec<u8>> {
        let dst = Address::Group(GroupAddress::broadcast());
        let key = match self.key_for(dst, false)? {
            Some(key) => key,
            None => return Err(KnxError::access_and_role_error()),
        };

        let mut challenge = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut challenge);

        let scf = scf(tool, true, true, SERVICE_SYNC_REQ);
        Ok(build_secured(
            &key,
            scf,
            &challenge,
            &challenge,
            src,
            dst,
            Some(&SerialNumber::ZERO),
            0,
            &challenge,
        ))
    }

    // =========================================================================
    // Extraction
    // =========================================================================

    /// Process a received secured TPDU.
    ///
    /// This is the only point enforcing ordering between secured payloads:
    /// the per-peer last-valid sequence must strictly increase.
    ///
    /// # Errors
    ///
    /// `Secure` errors per the failure taxonomy; each bumps its saturating
    /// counter.
    pub fn extract(
        &mut self,
        src: IndividualAddress,
        dst: Address,
        tpdu: &[u8],
    ) -> Result<SecureOutcome> {
        if !Self::is_secured(tpdu) || tpdu.len() < 13 {
            return Err(KnxError::invalid_frame());
        }
        let tpci = tpdu[0] & 0xFC;
        let scf = tpdu[2];
        let tool = scf & 0x80 != 0;
        let algorithm = (scf >> 4) & 0x07;
        let service = scf & 0x07;

        if algorithm > 1 {
            bump(&mut self.counters.invalid_scf);
            return Err(KnxError::invalid_scf());
        }
        let conf = algorithm == 1;

        match service {
            SERVICE_DATA => self.extract_data(src, dst, tpci, tool, conf, tpdu),
            SERVICE_SYNC_REQ => self.received_sync_request(src, dst, tpci, tool, tpdu),
            SERVICE_SYNC_RES => self.received_sync_response(src, dst, tpci, tool, tpdu),
            _ => {
                bump(&mut self.counters.invalid_scf);
                Err(KnxError::invalid_scf())
            }
        }
    }

    fn extract_data(
        &mut self,
        src: IndividualAddress,
        dst: Address,
        tpci: u8,
        tool: bool,
        conf: bool,
        tpdu: &[u8],
    ) -> Result<SecureOutcome> {
        let key = match self.receive_key_for(src, dst, tool) {
            Ok(Some(key)) => key,
            Ok(None) | Err(_) => {
                bump(&mut self.counters.access_role_errors);
                return Err(KnxError::access_and_role_error());
            }
        };

        let mut seq_bytes = [0u8; 6];
        seq_bytes.copy_from_slice(&tpdu[3..9]);
        let received = unsigned_be(&seq_bytes)?;
        let expected = self.last_valid_sequence(src, tool) + 1;
        if received < expected {
            bump(&mut self.counters.seq_errors);
            log::warn!("seq error from {src}: got {received}, expected >= {expected}");
            return Err(KnxError::secure_sequence_error());
        }

        let scf = tpdu[2];
        let body = &tpdu[9..];
        let apdu = self.verify_and_decrypt(
            &key, scf, &seq_bytes, src, dst, None, tpci, conf, body,
        )?;

        let map = if tool {
            &mut self.last_valid_tool
        } else {
            &mut self.last_valid_p2p
        };
        map.insert(src, received);
        Ok(SecureOutcome::Data(apdu))
    }

    fn received_sync_request(
        &mut self,
        src: IndividualAddress,
        dst: Address,
        tpci: u8,
        tool: bool,
        tpdu: &[u8],
    ) -> Result<SecureOutcome> {
        // [..9] header+seq, [9..15] SN, challenge payload, MAC
        if tpdu.len() < 25 {
            return Err(KnxError::invalid_frame());
        }
        let target = SerialNumber::decode(&tpdu[9..15])?;
        if !target.is_zero() && target != self.serial {
            log::trace!("sync.req for serial {target}, not us");
            return Ok(SecureOutcome::Ignored);
        }
        if let Some(sent) = self.last_sync_res_sent {
            if sent.elapsed() < SYNC_RES_DEBOUNCE {
                log::trace!("sync.req from {src} debounced");
                return Ok(SecureOutcome::Ignored);
            }
        }

        let key = self
            .ctx
            .tool_key(src)
            .copied()
            .ok_or_else(|| {
                bump(&mut self.counters.access_role_errors);
                KnxError::access_and_role_error()
            })?;

        let mut nonce_seq = [0u8; 6];
        nonce_seq.copy_from_slice(&tpdu[3..9]);
        let scf_in = tpdu[2];
        let challenge = self.verify_and_decrypt(
            &key,
            scf_in,
            &nonce_seq,
            src,
            dst,
            Some(&target),
            tpci,
            true,
            &tpdu[15..],
        )?;
        if challenge.len() != 6 {
            bump(&mut self.counters.crypto_errors);
            return Err(KnxError::crypto_error());
        }

        // respond with our view of both counters; the response nonce is a
        // fresh random, recoverable by the peer through XOR with its
        // challenge
        let mut random = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut random);
        let mut wire_seq = [0u8; 6];
        for i in 0..6 {
            wire_seq[i] = random[i] ^ challenge[i];
        }

        let mut payload = [0u8; 12];
        payload[..6].copy_from_slice(&six_bytes(self.next_sequence(tool))?);
        payload[6..].copy_from_slice(&six_bytes(self.last_valid_sequence(src, tool) + 1)?);

        let local = match dst {
            Address::Individual(addr) => addr,
            // system-broadcast sync: respond from our own address
            Address::Group(_) => src,
        };
        let scf_out = scf(tool, true, false, SERVICE_SYNC_RES);
        let frame = build_secured(
            &key,
            scf_out,
            &wire_seq,
            &random,
            local,
            Address::Individual(src),
            None,
            0,
            &payload,
        );
        self.last_sync_res_sent = Some(Instant::now());
        log::debug!("sync.res to {src}");
        Ok(SecureOutcome::SyncResponse(frame))
    }

    fn received_sync_response(
        &mut self,
        src: IndividualAddress,
        dst: Address,
        tpci: u8,
        tool: bool,
        tpdu: &[u8],
    ) -> Result<SecureOutcome> {
        let Some(pending) = self.pending_syncs.remove(&src) else {
            log::trace!("unsolicited sync.res from {src}");
            return Ok(SecureOutcome::Ignored);
        };

        let key = self
            .ctx
            .tool_key(src)
            .copied()
            .ok_or_else(KnxError::access_and_role_error)?;

        let mut nonce_seq = [0u8; 6];
        for i in 0..6 {
            nonce_seq[i] = tpdu[3 + i] ^ pending.challenge[i];
        }

        let scf_in = tpdu[2];
        let payload = match self.verify_and_decrypt(
            &key, scf_in, &nonce_seq, src, dst, None, tpci, true, &tpdu[9..],
        ) {
            Ok(payload) => payload,
            Err(e) => {
                // keep the handshake pending for a retransmitted response
                self.pending_syncs.insert(src, pending);
                return Err(e);
            }
        };
        if payload.len() != 12 {
            bump(&mut self.counters.crypto_errors);
            return Err(KnxError::crypto_error());
        }

        let their_next = unsigned_be(&payload[..6])?;
        let our_next_seen = unsigned_be(&payload[6..])?;

        let tool = pending.tool || tool;
        if tool {
            self.next_tool = self.next_tool.max(our_next_seen);
        } else {
            self.next_p2p = self.next_p2p.max(our_next_seen);
        }
        let map = if tool {
            &mut self.last_valid_tool
        } else {
            &mut self.last_valid_p2p
        };
        let entry = map.entry(src).or_insert(0);
        *entry = (*entry).max(their_next.saturating_sub(1));

        self.synced_peers.insert(src);
        let _ = pending.notify.send(());
        log::debug!(
            "synced with {src}: next={}, their last valid={}",
            our_next_seen,
            their_next.saturating_sub(1)
        );
        Ok(SecureOutcome::Synced)
    }

    // =========================================================================
    // Group object diagnostics
    // =========================================================================

    /// Send a secured group object diagnostics command through a surrogate
    /// device sitting on the group.
    ///
    /// Returns a [`DiagnosticsReply`] resolving to the device's return
    /// code, bounded at 3 s. The reply handle does not borrow the layer, so
    /// the receive path stays free to complete it.
    ///
    /// # Errors
    ///
    /// `Secure` errors as for sending.
    pub async fn group_object_diagnostics<S: SecureSender>(
        &mut self,
        sender: &mut S,
        src: IndividualAddress,
        surrogate: IndividualAddress,
        surrogate_serial: SerialNumber,
        group: GroupAddress,
        service: u8,
        data: &[u8],
    ) -> Result<DiagnosticsReply> {
        let mut apdu = Vec::with_capacity(9 + data.len());
        apdu.push((APCI_FUNCTION_PROPERTY_EXT_COMMAND >> 8) as u8);
        apdu.push((APCI_FUNCTION_PROPERTY_EXT_COMMAND & 0xFF) as u8);
        apdu.extend_from_slice(&GROUP_OBJECT_TABLE.to_be_bytes());
        apdu.push(1); // object instance
        apdu.push(PID_GO_DIAGNOSTICS);
        apdu.push(service);
        apdu.extend_from_slice(&group.raw().to_be_bytes());
        apdu.extend_from_slice(data);

        let (tx, rx) = oneshot::channel();
        self.pending_diagnostics.insert(surrogate, tx);

        let result = self
            .send_secured(
                sender,
                src,
                Address::Individual(surrogate),
                surrogate_serial,
                0,
                &apdu,
                true,
                true,
            )
            .await;
        if let Err(e) = result {
            self.pending_diagnostics.remove(&surrogate);
            return Err(e);
        }
        Ok(DiagnosticsReply { rx })
    }

    /// Complete a pending diagnostics future with the surrogate's return
    /// code. Invoked by the receive path on a function property response.
    pub fn complete_diagnostic(&mut self, from: IndividualAddress, return_code: u8) {
        if let Some(tx) = self.pending_diagnostics.remove(&from) {
            let _ = tx.send(return_code);
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Cancel all pending sync and diagnostics futures. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // dropping the senders fails the receivers with a closed-link error
        self.pending_syncs.clear();
        self.pending_diagnostics.clear();
        log::debug!("secure application layer closed");
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Key for securing toward `dst`; `None` means send plain.
    fn key_for(&mut self, dst: Address, tool: bool) -> Result<Option<Key>> {
        match dst {
            Address::Group(group) => {
                if tool && self.ctx.has_group_key(group) {
                    bump(&mut self.counters.access_role_errors);
                    return Err(KnxError::access_and_role_error());
                }
                Ok(self.ctx.group_key(group).copied())
            }
            Address::Individual(device) => Ok(self.ctx.tool_key(device).copied()),
        }
    }

    /// Key for verifying a frame received from `src`; `None` marks a role
    /// violation already counted by the caller.
    fn receive_key_for(
        &mut self,
        src: IndividualAddress,
        dst: Address,
        tool: bool,
    ) -> Result<Option<Key>> {
        match dst {
            Address::Group(group) => {
                if tool && self.ctx.has_group_key(group) {
                    return Ok(None);
                }
                self.ctx
                    .group_key(group)
                    .copied()
                    .map(Some)
                    .ok_or_else(KnxError::access_and_role_error)
            }
            Address::Individual(_) => self
                .ctx
                .tool_key(src)
                .copied()
                .map(Some)
                .ok_or_else(KnxError::access_and_role_error),
        }
    }

    /// Verify the MAC of a secured body (payload + MAC suffix) and return
    /// the plain payload.
    #[allow(clippy::too_many_arguments)]
    fn verify_and_decrypt(
        &mut self,
        key: &Key,
        scf: u8,
        nonce_seq: &[u8; 6],
        src: IndividualAddress,
        dst: Address,
        sn: Option<&SerialNumber>,
        tpci: u8,
        conf: bool,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        if body.len() < 4 {
            bump(&mut self.counters.crypto_errors);
            return Err(KnxError::crypto_error());
        }
        let (payload_part, mac_part) = body.split_at(body.len() - 4);

        let at = u8::from(dst.is_group()) << 7;
        let src_raw = src.raw();
        let dst_raw = dst.raw();
        let apci_hi = tpci | (APCI_SECURE_SERVICE >> 8) as u8;
        let apci_lo = (APCI_SECURE_SERVICE & 0xFF) as u8;

        let mut ad = Vec::with_capacity(7);
        ad.push(scf);
        if let Some(sn) = sn {
            ad.extend_from_slice(&sn.bytes());
        }

        let ctr = ctr0(nonce_seq, src_raw, dst_raw);
        if conf {
            let (payload, mac) = ctr_decrypt_mac_and_payload(key, &ctr, mac_part, payload_part);
            let b0 = block0(
                nonce_seq,
                src_raw,
                dst_raw,
                at,
                apci_hi,
                apci_lo,
                payload.len() as u8,
            );
            let expected = ccm_mac(key, &b0, &ad, &payload);
            if expected[..4] != mac[..] {
                bump(&mut self.counters.crypto_errors);
                return Err(KnxError::crypto_error());
            }
            Ok(payload)
        } else {
            let len = (payload_part.len() as u16).to_be_bytes();
            let full = cbc_mac(key, &[&len, payload_part]);
            let ks = aes_block(key, &ctr);
            let mut expected = [0u8; 4];
            for i in 0..4 {
                expected[i] = full[i] ^ ks[i];
            }
            if expected != mac_part {
                bump(&mut self.counters.crypto_errors);
                return Err(KnxError::crypto_error());
            }
            Ok(payload_part.to_vec())
        }
    }
}

/// Assemble a security control field.
const fn scf(tool: bool, conf: bool, system_broadcast: bool, service: u8) -> u8 {
    let mut value = service & 0x07;
    if tool {
        value |= 0x80;
    }
    if conf {
        value |= 0x10;
    }
    if system_broadcast {
        value |= 0x08;
    }
    value
}

/// Build a complete secured TPDU.
#[allow(clippy::too_many_arguments)]
fn build_secured(
    key: &Key,
    scf: u8,
    wire_seq: &[u8; 6],
    nonce_seq: &[u8; 6],
    src: IndividualAddress,
    dst: Address,
    sn: Option<&SerialNumber>,
    tpci: u8,
    payload: &[u8],
) -> Vec<u8> {
    let conf = (scf >> 4) & 0x07 == 1;
    let at = u8::from(dst.is_group()) << 7;
    let src_raw = src.raw();
    let dst_raw = dst.raw();
    let apci_hi = tpci | (APCI_SECURE_SERVICE >> 8) as u8;
    let apci_lo = (APCI_SECURE_SERVICE & 0xFF) as u8;

    let mut ad = Vec::with_capacity(7);
    ad.push(scf);
    if let Some(sn) = sn {
        ad.extend_from_slice(&sn.bytes());
    }

    let mut out = Vec::with_capacity(15 + payload.len() + 4);
    out.push(apci_hi);
    out.push(apci_lo);
    out.push(scf);
    out.extend_from_slice(wire_seq);
    if let Some(sn) = sn {
        out.extend_from_slice(&sn.bytes());
    }

    let ctr = ctr0(nonce_seq, src_raw, dst_raw);
    if conf {
        let b0 = block0(
            nonce_seq,
            src_raw,
            dst_raw,
            at,
            apci_hi,
            apci_lo,
            payload.len() as u8,
        );
        let mac = ccm_mac(key, &b0, &ad, payload);
        let (enc_payload, enc_mac) = ctr_encrypt_mac_and_payload(key, &ctr, &mac[..4], payload);
        out.extend_from_slice(&enc_payload);
        out.extend_from_slice(&enc_mac);
    } else {
        let len = (payload.len() as u16).to_be_bytes();
        let full = cbc_mac(key, &[&len, payload]);
        let ks = aes_block(key, &ctr);
        out.extend_from_slice(payload);
        for i in 0..4 {
            out.push(full[i] ^ ks[i]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: Key = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
        0x0E, 0x0F,
    ];

    fn addr(s: &str) -> IndividualAddress {
        s.parse().unwrap()
    }

    fn group(s: &str) -> GroupAddress {
        s.parse().unwrap()
    }

    fn layer_with_group_key() -> SecureApplicationLayer {
        let mut ctx = SecurityContext::new();
        ctx.add_group_key(group("1/0/1"), KEY);
        SecureApplicationLayer::new(ctx, SerialNumber::new([0, 0, 0, 0, 0, 1]))
    }

    fn peers() -> (SecureApplicationLayer, SecureApplicationLayer) {
        let a_addr = addr("1.1.1");
        let b_addr = addr("1.1.2");
        let mut ctx_a = SecurityContext::new();
        ctx_a.add_tool_key(b_addr, KEY);
        let mut ctx_b = SecurityContext::new();
        ctx_b.add_tool_key(a_addr, KEY);
        (
            SecureApplicationLayer::new(ctx_a, SerialNumber::new([0, 0, 0, 0, 0, 0xA])),
            SecureApplicationLayer::new(ctx_b, SerialNumber::new([0, 0, 0, 0, 0, 0xB])),
        )
    }

    struct NullSender;
    impl SecureSender for NullSender {
        async fn send(&mut self, _dst: Address, _tpdu: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn secure_then_extract_roundtrip() {
        let mut a = layer_with_group_key();
        let mut b = layer_with_group_key();
        let src = addr("1.1.1");
        let dst = Address::Group(group("1/0/1"));

        let secured = a
            .secure_data(src, dst, 0x00, &[0x00, 0x81], false, true)
            .unwrap()
            .expect("group key configured");
        assert!(SecureApplicationLayer::is_secured(&secured));

        let outcome = b.extract(src, dst, &secured).unwrap();
        assert_eq!(outcome, SecureOutcome::Data(vec![0x00, 0x81]));
        // the receiver's last valid sequence is the seq used (1)
        assert_eq!(b.last_valid_sequence(src, false), 1);
        // the sender's next sequence advanced
        assert_eq!(a.next_sequence(false), 2);
    }

    #[test]
    fn no_key_means_plain() {
        let mut a = layer_with_group_key();
        let out = a
            .secure_data(
                addr("1.1.1"),
                Address::Group(group("7/7/7")),
                0,
                &[0x00, 0x81],
                false,
                true,
            )
            .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn replay_is_rejected_with_seq_error() {
        let mut a = layer_with_group_key();
        let mut b = layer_with_group_key();
        let src = addr("1.1.1");
        let dst = Address::Group(group("1/0/1"));

        let secured = a
            .secure_data(src, dst, 0, &[0x00, 0x81], false, true)
            .unwrap()
            .unwrap();

        assert!(b.extract(src, dst, &secured).is_ok());
        let err = b.extract(src, dst, &secured).unwrap_err();
        match err {
            KnxError::Secure(e) => assert!(e.is_sequence_error()),
            _ => panic!("wrong category"),
        }
        assert_eq!(b.failure_counters().seq_errors, 1);
    }

    #[test]
    fn tampered_mac_fails_with_crypto_error() {
        let mut a = layer_with_group_key();
        let mut b = layer_with_group_key();
        let src = addr("1.1.1");
        let dst = Address::Group(group("1/0/1"));

        let mut secured = a
            .secure_data(src, dst, 0, &[0x00, 0x81], false, true)
            .unwrap()
            .unwrap();
        let last = secured.len() - 1;
        secured[last] ^= 0x01;

        let err = b.extract(src, dst, &secured).unwrap_err();
        match err {
            KnxError::Secure(e) => assert!(e.is_crypto_error()),
            _ => panic!("wrong category"),
        }
        assert_eq!(b.failure_counters().crypto_errors, 1);
    }

    #[test]
    fn auth_only_roundtrip_and_tamper() {
        let mut a = layer_with_group_key();
        let mut b = layer_with_group_key();
        let src = addr("1.1.1");
        let dst = Address::Group(group("1/0/1"));

        let secured = a
            .secure_data(src, dst, 0, &[0x00, 0x81, 0x42], false, false)
            .unwrap()
            .unwrap();
        // auth-only leaves the payload readable on the wire
        assert_eq!(&secured[9..12], &[0x00, 0x81, 0x42]);

        let outcome = b.extract(src, dst, &secured).unwrap();
        assert_eq!(outcome, SecureOutcome::Data(vec![0x00, 0x81, 0x42]));

        let mut tampered = a
            .secure_data(src, dst, 0, &[0x00, 0x81, 0x42], false, false)
            .unwrap()
            .unwrap();
        tampered[10] ^= 0xFF;
        assert!(b.extract(src, dst, &tampered).is_err());
    }

    #[test]
    fn unsupported_algorithm_is_invalid_scf() {
        let mut a = layer_with_group_key();
        let mut b = layer_with_group_key();
        let src = addr("1.1.1");
        let dst = Address::Group(group("1/0/1"));

        let mut secured = a
            .secure_data(src, dst, 0, &[0x00, 0x81], false, true)
            .unwrap()
            .unwrap();
        secured[2] = (secured[2] & !0x70) | 0x20; // algorithm id 2

        let err = b.extract(src, dst, &secured).unwrap_err();
        match err {
            KnxError::Secure(e) => assert!(e.is_invalid_scf()),
            _ => panic!("wrong category"),
        }
        assert_eq!(b.failure_counters().invalid_scf, 1);
    }

    #[test]
    fn tool_access_on_keyed_group_is_an_attack() {
        let mut a = layer_with_group_key();
        let err = a
            .secure_data(
                addr("1.1.1"),
                Address::Group(group("1/0/1")),
                0,
                &[0x00],
                true,
                true,
            )
            .unwrap_err();
        match err {
            KnxError::Secure(e) => assert!(e.is_access_error()),
            _ => panic!("wrong category"),
        }
        assert_eq!(a.failure_counters().access_role_errors, 1);
    }

    #[test]
    fn sync_handshake_aligns_counters() {
        let (mut a, mut b) = peers();
        let a_addr = addr("1.1.1");
        let b_addr = addr("1.1.2");

        // give B some history so the counters are distinctive
        b.next_tool = 41;
        b.last_valid_tool.insert(a_addr, 6);

        let (req, mut rx) = a
            .sync_request(a_addr, b_addr, SerialNumber::new([0, 0, 0, 0, 0, 0xB]), true)
            .unwrap();

        let outcome = b
            .extract(a_addr, Address::Individual(b_addr), &req)
            .unwrap();
        let SecureOutcome::SyncResponse(res) = outcome else {
            panic!("expected sync.res");
        };

        let outcome = a
            .extract(b_addr, Address::Individual(a_addr), &res)
            .unwrap();
        assert_eq!(outcome, SecureOutcome::Synced);
        assert!(rx.try_recv().is_ok());

        // A's next is at least what B expects, and B's last valid as seen
        // by A is B.next - 1
        assert_eq!(a.next_sequence(true), 7);
        assert_eq!(a.last_valid_sequence(b_addr, true), 40);

        // A's first secured frame to B is accepted by B
        let secured = a
            .secure_data(a_addr, Address::Individual(b_addr), 0, &[0x00, 0x81], true, true)
            .unwrap()
            .unwrap();
        let outcome = b
            .extract(a_addr, Address::Individual(b_addr), &secured)
            .unwrap();
        assert_eq!(outcome, SecureOutcome::Data(vec![0x00, 0x81]));
        assert_eq!(b.last_valid_sequence(a_addr, true), 7);
    }

    #[test]
    fn sync_request_for_foreign_serial_is_ignored() {
        let (mut a, mut b) = peers();
        let a_addr = addr("1.1.1");
        let b_addr = addr("1.1.2");

        let (req, _rx) = a
            .sync_request(a_addr, b_addr, SerialNumber::new([9, 9, 9, 9, 9, 9]), true)
            .unwrap();
        let outcome = b
            .extract(a_addr, Address::Individual(b_addr), &req)
            .unwrap();
        assert_eq!(outcome, SecureOutcome::Ignored);
    }

    #[test]
    fn sync_request_with_zero_serial_is_served() {
        let (mut a, mut b) = peers();
        let a_addr = addr("1.1.1");
        let b_addr = addr("1.1.2");

        let (req, _rx) = a
            .sync_request(a_addr, b_addr, SerialNumber::ZERO, true)
            .unwrap();
        let outcome = b
            .extract(a_addr, Address::Individual(b_addr), &req)
            .unwrap();
        assert!(matches!(outcome, SecureOutcome::SyncResponse(_)));
    }

    #[test]
    fn sync_requests_are_debounced_after_a_response() {
        let (mut a, mut b) = peers();
        let a_addr = addr("1.1.1");
        let b_addr = addr("1.1.2");
        let serial_b = SerialNumber::new([0, 0, 0, 0, 0, 0xB]);

        let (req, _rx) = a.sync_request(a_addr, b_addr, serial_b, true).unwrap();
        assert!(matches!(
            b.extract(a_addr, Address::Individual(b_addr), &req).unwrap(),
            SecureOutcome::SyncResponse(_)
        ));

        let (req2, _rx2) = a.sync_request(a_addr, b_addr, serial_b, true).unwrap();
        assert_eq!(
            b.extract(a_addr, Address::Individual(b_addr), &req2).unwrap(),
            SecureOutcome::Ignored
        );
    }

    #[test]
    fn unsolicited_sync_response_is_ignored() {
        let (mut a, mut b) = peers();
        let a_addr = addr("1.1.1");
        let b_addr = addr("1.1.2");

        let (req, _rx) = a
            .sync_request(a_addr, b_addr, SerialNumber::new([0, 0, 0, 0, 0, 0xB]), true)
            .unwrap();
        let SecureOutcome::SyncResponse(res) = b
            .extract(a_addr, Address::Individual(b_addr), &req)
            .unwrap()
        else {
            panic!()
        };

        // B never asked anything; feeding it its own response is stale
        assert_eq!(
            a.extract(b_addr, Address::Individual(a_addr), &res).unwrap(),
            SecureOutcome::Synced
        );
        assert_eq!(
            a.extract(b_addr, Address::Individual(a_addr), &res).unwrap(),
            SecureOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn send_secured_times_out_without_sync_response() {
        let (mut a, _b) = peers();
        a.set_sync_timeout(Duration::from_millis(20));
        let err = a
            .send_secured(
                &mut NullSender,
                addr("1.1.1"),
                Address::Individual(addr("1.1.2")),
                SerialNumber::new([0, 0, 0, 0, 0, 0xB]),
                0,
                &[0x00, 0x81],
                true,
                true,
            )
            .await
            .unwrap_err();
        match err {
            KnxError::Secure(_) => {}
            other => panic!("expected secure error, got {other}"),
        }
        assert!(a.pending_syncs.is_empty());
    }

    #[tokio::test]
    async fn send_secured_skips_sync_when_counters_advanced() {
        let (mut a, _b) = peers();
        a.next_tool = 10;
        a.send_secured(
            &mut NullSender,
            addr("1.1.1"),
            Address::Individual(addr("1.1.2")),
            SerialNumber::ZERO,
            0,
            &[0x00, 0x81],
            true,
            true,
        )
        .await
        .unwrap();
        assert_eq!(a.next_sequence(true), 11);
    }

    #[tokio::test]
    async fn diagnostics_resolves_with_return_code() {
        let (mut a, _b) = peers();
        a.next_tool = 5; // already synced
        let surrogate = addr("1.1.2");

        let reply = a
            .group_object_diagnostics(
                &mut NullSender,
                addr("1.1.1"),
                surrogate,
                SerialNumber::ZERO,
                group("1/0/1"),
                0,
                &[0x01],
            )
            .await
            .unwrap();

        a.complete_diagnostic(surrogate, 0x2A);
        assert_eq!(reply.wait().await.unwrap(), 0x2A);
    }

    #[tokio::test]
    async fn diagnostics_fails_on_close() {
        let (mut a, _b) = peers();
        a.next_tool = 5;

        let reply = a
            .group_object_diagnostics(
                &mut NullSender,
                addr("1.1.1"),
                addr("1.1.2"),
                SerialNumber::ZERO,
                group("1/0/1"),
                0,
                &[],
            )
            .await
            .unwrap();
        a.close();
        assert!(reply.wait().await.is_err());
    }

    #[test]
    fn counters_saturate() {
        let mut counter = u16::MAX - 1;
        bump(&mut counter);
        assert_eq!(counter, u16::MAX);
        bump(&mut counter);
        assert_eq!(counter, u16::MAX);
    }

    #[test]
    fn close_is_idempotent_and_cancels() {
        let (mut a, _b) = peers();
        let (_req, mut rx) = a
            .sync_request(
                addr("1.1.1"),
                addr("1.1.2"),
                SerialNumber::ZERO,
                true,
            )
            .unwrap();
        a.close();
        a.close();
        assert!(rx.try_recv().is_err());
        assert!(a.pending_syncs.is_empty());
    }

}
