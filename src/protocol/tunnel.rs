//! KNXnet/IP tunneling and routing connections.
//!
//! The tunnel drives the connect state machine over any
//! [`AsyncTransport`], forwards L-Data with acknowledged delivery
//! (window of one, 1 s retransmit, three attempts), answers heartbeats,
//! and optionally runs every service through a [`SecureSession`].
//!
//! ## State Machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Closing -> Closed
//!                  | (error)     | (heartbeat failure, ack failure)
//!                  Disconnected  Closed
//! ```
//!
//! The routing variant is connectionless multicast with busy back-off.

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::time::{timeout_at, Instant};

use crate::cemi::CemiFrame;
use crate::error::{KnxError, Result};
use crate::net::transport::AsyncTransport;
use crate::protocol::constants::{ServiceType, MAX_FRAME_SIZE};
use crate::protocol::frame::KnxnetIpFrame;
use crate::protocol::secure_session::{SecureSession, SessionStatus};
use crate::protocol::services::{
    ChannelStatus, ConnectRequest, ConnectionHeader, ConnectionStateRequest, DisconnectRequest,
    Hpai, RoutingBusy, RoutingLostMessage, TunnelingAck, TunnelingRequest,
    build_routing_indication,
};

/// Connect-response wait.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunneling acknowledge wait per attempt.
const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Send attempts before the channel closes.
const MAX_SEND_ATTEMPTS: u32 = 3;

/// Heartbeat response wait.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Recommended heartbeat cadence for connected tunnels.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Window in which repeated routing-busy indications scale the back-off.
const BUSY_WINDOW: Duration = Duration::from_secs(5);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel established
    Disconnected,
    /// Connect request sent, waiting for the response
    Connecting,
    /// Channel established
    Connected,
    /// Disconnect request sent
    Closing,
    /// Channel gone; terminal
    Closed,
}

/// Event delivered to link listeners.
#[derive(Debug)]
pub enum LinkEvent {
    /// A cEMI indication arrived
    Indication(CemiFrame),
    /// The connection closed
    Closed,
}

/// Listener callback.
pub type Listener = Box<dyn FnMut(&LinkEvent) + Send>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

impl Listeners {
    fn add(&mut self, listener: Listener) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        before != self.entries.len()
    }

    fn notify(&mut self, event: &LinkEvent) {
        for (_, listener) in &mut self.entries {
            listener(event);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}

/// A received service, decoupled from the receive buffer.
#[derive(Debug)]
struct OwnedService {
    service_type: ServiceType,
    body: Vec<u8>,
}

/// A KNXnet/IP tunneling connection.
#[derive(Debug)]
pub struct TunnelConnection<T: AsyncTransport> {
    transport: T,
    server: SocketAddr,
    state: ConnectionState,
    channel_id: u8,
    send_seq: u8,
    recv_seq: u8,
    session: Option<SecureSession>,
    listeners: Listeners,
    pending_indications: Vec<CemiFrame>,
    pending_ack: Option<u8>,
    heartbeat_ok: Option<bool>,
    heartbeat_failures: u8,
    parse_errors: u64,
}

impl<T: AsyncTransport> TunnelConnection<T> {
    /// Create a plain tunnel toward `server`.
    pub fn new(transport: T, server: SocketAddr) -> Self {
        Self {
            transport,
            server,
            state: ConnectionState::Disconnected,
            channel_id: 0,
            send_seq: 0,
            recv_seq: 0,
            session: None,
            listeners: Listeners::default(),
            pending_indications: Vec::new(),
            pending_ack: None,
            heartbeat_ok: None,
            heartbeat_failures: 0,
            parse_errors: 0,
        }
    }

    /// Create a tunnel whose services travel inside a secure session.
    pub fn with_session(transport: T, server: SocketAddr, session: SecureSession) -> Self {
        let mut conn = Self::new(transport, server);
        conn.session = Some(session);
        conn
    }

    /// Current connection state.
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the channel is established.
    pub const fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected)
    }

    /// Channel id assigned by the server.
    pub const fn channel_id(&self) -> u8 {
        self.channel_id
    }

    /// Number of frames dropped due to parse errors.
    pub const fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    /// Access the underlying transport (socket options, test scripting).
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Register a link listener; returns its id.
    pub fn add_listener(&mut self, listener: Listener) -> u64 {
        self.listeners.add(listener)
    }

    /// Remove a listener by id.
    pub fn remove_listener(&mut self, id: u64) -> bool {
        self.listeners.remove(id)
    }

    /// Establish the tunnel: send CONNECT_REQUEST, await CONNECT_RESPONSE.
    ///
    /// # Errors
    ///
    /// Connection errors for refusals and invalid states, `Timeout` after
    /// 10 s without a response.
    pub async fn connect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Connected | ConnectionState::Connecting => {
                return Err(KnxError::already_connected())
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(KnxError::link_closed())
            }
        }

        self.state = ConnectionState::Connecting;
        let frame = ConnectRequest::new(Hpai::nat(), Hpai::nat()).build();
        if let Err(e) = self.send_service(&frame).await {
            self.state = ConnectionState::Disconnected;
            return Err(e);
        }

        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            let service = match self.recv_service(deadline).await {
                Ok(service) => service,
                Err(e) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(e);
                }
            };
            if service.service_type == ServiceType::ConnectResponse {
                let response = ConnectResponseBody::parse(&service.body)?;
                if !response.ok {
                    self.state = ConnectionState::Disconnected;
                    log::warn!("connect refused, status 0x{:02X}", response.status);
                    return Err(KnxError::connection_refused());
                }
                self.channel_id = response.channel_id;
                self.send_seq = 0;
                self.recv_seq = 0;
                self.heartbeat_failures = 0;
                self.state = ConnectionState::Connected;
                log::info!("tunnel connected, channel {}", self.channel_id);
                return Ok(());
            }
            self.process_service(service).await?;
        }
    }

    /// Send a cEMI frame with acknowledged delivery.
    ///
    /// Retransmits after 1 s, up to three attempts; the final failure
    /// closes the channel.
    ///
    /// # Errors
    ///
    /// Connection error when not connected; tunneling ack failure when all
    /// attempts are exhausted.
    pub async fn send_cemi(&mut self, cemi: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(KnxError::not_connected());
        }

        let seq = self.send_seq;
        let frame = TunnelingRequest::new(ConnectionHeader::new(self.channel_id, seq), cemi).build();

        for attempt in 1..=MAX_SEND_ATTEMPTS {
            self.send_service(&frame).await?;

            let deadline = Instant::now() + ACK_TIMEOUT;
            loop {
                match self.recv_service(deadline).await {
                    Ok(service) => {
                        self.process_service(service).await?;
                        if self.pending_ack.take() == Some(seq) {
                            self.send_seq = self.send_seq.wrapping_add(1);
                            return Ok(());
                        }
                        if !self.is_connected() {
                            return Err(KnxError::connection_lost());
                        }
                    }
                    Err(KnxError::Timeout) => break,
                    Err(e) => return Err(e),
                }
            }
            log::debug!("no ack for seq {seq}, attempt {attempt}/{MAX_SEND_ATTEMPTS}");
        }

        log::warn!("tunneling ack failed after {MAX_SEND_ATTEMPTS} attempts, closing channel");
        self.shutdown();
        Err(KnxError::tunneling_ack_failed())
    }

    /// Convenience: send an L-Data frame.
    ///
    /// # Errors
    ///
    /// As [`TunnelConnection::send_cemi`].
    pub async fn send_frame(&mut self, frame: &CemiFrame) -> Result<()> {
        self.send_cemi(&frame.emit()).await
    }

    /// Wait up to `wait` for the next indication. Acks and heartbeat
    /// responses are handled internally; per-frame parse errors are counted
    /// and skipped.
    ///
    /// # Errors
    ///
    /// Connection error when not connected; transport errors pass through.
    pub async fn receive(&mut self, wait: Duration) -> Result<Option<CemiFrame>> {
        if !self.is_connected() {
            return Err(KnxError::not_connected());
        }
        if !self.pending_indications.is_empty() {
            return Ok(Some(self.pending_indications.remove(0)));
        }

        let deadline = Instant::now() + wait;
        loop {
            match self.recv_service(deadline).await {
                Ok(service) => self.process_service(service).await?,
                Err(KnxError::Timeout) => return Ok(None),
                Err(e) => return Err(e),
            }
            if !self.pending_indications.is_empty() {
                return Ok(Some(self.pending_indications.remove(0)));
            }
            if matches!(self.state, ConnectionState::Closed) {
                return Err(KnxError::link_closed());
            }
        }
    }

    /// Probe the channel with a CONNECTIONSTATE_REQUEST. Two consecutive
    /// failures close the channel.
    ///
    /// # Errors
    ///
    /// Connection errors when the channel is gone.
    pub async fn heartbeat(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Err(KnxError::not_connected());
        }
        let frame = ConnectionStateRequest {
            channel_id: self.channel_id,
            control_endpoint: Hpai::nat(),
        }
        .build();
        self.send_service(&frame).await?;

        let deadline = Instant::now() + HEARTBEAT_TIMEOUT;
        self.heartbeat_ok = None;
        loop {
            match self.recv_service(deadline).await {
                Ok(service) => self.process_service(service).await?,
                Err(KnxError::Timeout) => break,
                Err(e) => return Err(e),
            }
            if self.heartbeat_ok.is_some() {
                break;
            }
        }

        match self.heartbeat_ok.take() {
            Some(true) => {
                self.heartbeat_failures = 0;
                Ok(())
            }
            _ => {
                self.heartbeat_failures += 1;
                log::warn!("heartbeat failure {}/2", self.heartbeat_failures);
                if self.heartbeat_failures >= 2 {
                    self.shutdown();
                    return Err(KnxError::connection_lost());
                }
                Err(KnxError::Timeout)
            }
        }
    }

    /// Close the tunnel with a DISCONNECT_REQUEST (best effort), then drop
    /// the channel and notify listeners.
    ///
    /// # Errors
    ///
    /// Transport errors from sending the disconnect.
    pub async fn disconnect(&mut self) -> Result<()> {
        if matches!(self.state, ConnectionState::Closed) {
            return Ok(());
        }
        if self.is_connected() {
            self.state = ConnectionState::Closing;
            let frame = DisconnectRequest {
                channel_id: self.channel_id,
                control_endpoint: Hpai::nat(),
            }
            .build();
            let _ = self.send_service(&frame).await;

            let deadline = Instant::now() + Duration::from_secs(3);
            while let Ok(service) = self.recv_service(deadline).await {
                if service.service_type == ServiceType::DisconnectResponse {
                    break;
                }
                // late indications are still delivered to listeners
                let _ = self.process_service(service).await;
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Drop the channel immediately and notify listeners. Idempotent.
    fn shutdown(&mut self) {
        if matches!(self.state, ConnectionState::Closed) {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Some(session) = &mut self.session {
            session.close();
        }
        self.transport.close();
        self.listeners.notify(&LinkEvent::Closed);
        // close drops the registry
        self.listeners.entries.clear();
        log::info!("tunnel closed, channel {}", self.channel_id);
    }

    /// Send a complete service frame, wrapped when a session is active.
    async fn send_service(&mut self, frame: &[u8]) -> Result<()> {
        let server = self.server;
        match &mut self.session {
            Some(session) => {
                let wrapped = session.wrap(frame, 0)?;
                self.transport.send_to(&wrapped, server).await
            }
            None => self.transport.send_to(frame, server).await,
        }
    }

    /// Receive the next well-formed service before `deadline`, unwrapping
    /// secure wrappers. Malformed frames are counted, logged and skipped.
    async fn recv_service(&mut self, deadline: Instant) -> Result<OwnedService> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        loop {
            let (len, _from) = match timeout_at(deadline, self.transport.recv_from(&mut buf)).await
            {
                Ok(result) => result?,
                Err(_) => return Err(KnxError::Timeout),
            };

            match parse_owned(&buf[..len]) {
                Ok(service) if service.service_type == ServiceType::SecureWrapper => {
                    let Some(session) = &mut self.session else {
                        log::warn!("secure wrapper without a session, dropping");
                        self.parse_errors += 1;
                        continue;
                    };
                    match session.unwrap(&service.body).and_then(|f| parse_owned(&f)) {
                        Ok(inner) => return Ok(inner),
                        Err(e) => {
                            self.parse_errors += 1;
                            log::warn!("secure wrapper dropped: {e}");
                        }
                    }
                }
                Ok(service) => return Ok(service),
                Err(e) => {
                    self.parse_errors += 1;
                    let head = &buf[..len.min(8)];
                    log::warn!("frame dropped ({}): {e}", crate::utility::hex_str(head));
                }
            }
        }
    }

    /// Dispatch one received service.
    async fn process_service(&mut self, service: OwnedService) -> Result<()> {
        match service.service_type {
            ServiceType::TunnellingRequest => {
                let (sequence, cemi) = {
                    let request = TunnelingRequest::parse(&service.body)?;
                    (request.header.sequence, request.cemi.to_vec())
                };
                let expected = self.recv_seq;
                if sequence == expected {
                    self.recv_seq = self.recv_seq.wrapping_add(1);
                    let ack = TunnelingAck::ok(self.channel_id, sequence).build();
                    self.send_service(&ack).await?;
                    match CemiFrame::parse(&cemi) {
                        Ok(frame) => {
                            self.listeners.notify(&LinkEvent::Indication(frame.deep_copy()));
                            self.pending_indications.push(frame);
                        }
                        Err(e) => {
                            self.parse_errors += 1;
                            log::warn!("cEMI dropped: {e}");
                        }
                    }
                } else if sequence == expected.wrapping_sub(1) {
                    // repeated delivery: re-acknowledge, do not forward
                    let ack = TunnelingAck::ok(self.channel_id, sequence).build();
                    self.send_service(&ack).await?;
                    log::debug!("re-acked repeated seq {sequence}");
                } else {
                    log::warn!("out-of-window seq {sequence}, expected {expected}; ignored");
                }
            }
            ServiceType::TunnellingAck => {
                let ack = TunnelingAck::parse(&service.body)?;
                if ack.is_ok() && ack.header.channel_id == self.channel_id {
                    self.pending_ack = Some(ack.header.sequence);
                }
            }
            ServiceType::ConnectionstateResponse => {
                let status = ChannelStatus::parse(&service.body)?;
                self.heartbeat_ok = Some(status.is_ok());
            }
            ServiceType::DisconnectRequest => {
                let request = DisconnectRequest::parse(&service.body)?;
                let response = ChannelStatus {
                    channel_id: request.channel_id,
                    status: 0,
                }
                .build(ServiceType::DisconnectResponse);
                let _ = self.send_service(&response).await;
                log::info!("server closed channel {}", request.channel_id);
                self.shutdown();
            }
            ServiceType::DisconnectResponse => {
                self.shutdown();
            }
            ServiceType::SessionStatus => {
                if let Ok(status) = SessionStatus::parse(&service.body) {
                    match status {
                        SessionStatus::Close | SessionStatus::Timeout
                        | SessionStatus::AuthFailed | SessionStatus::Unauthenticated => {
                            log::warn!("session status {status:?}, closing");
                            self.shutdown();
                        }
                        SessionStatus::KeepAlive | SessionStatus::AuthSuccess => {}
                    }
                }
            }
            other => {
                log::trace!("unhandled service {other:?}");
            }
        }
        Ok(())
    }
}

/// Decoded CONNECT_RESPONSE essentials.
struct ConnectResponseBody {
    channel_id: u8,
    status: u8,
    ok: bool,
}

impl ConnectResponseBody {
    fn parse(body: &[u8]) -> Result<Self> {
        let response = crate::protocol::services::ConnectResponse::parse(body)?;
        Ok(Self {
            channel_id: response.channel_id,
            status: response.status,
            ok: response.is_ok(),
        })
    }
}

fn parse_owned(data: &[u8]) -> Result<OwnedService> {
    let frame = KnxnetIpFrame::parse(data)?;
    Ok(OwnedService {
        service_type: frame.service_type(),
        body: frame.body().to_vec(),
    })
}

// =============================================================================
// Routing
// =============================================================================

/// A connectionless routing connection on the KNXnet/IP multicast group.
#[derive(Debug)]
pub struct RoutingConnection<T: AsyncTransport> {
    transport: T,
    multicast: SocketAddr,
    busy_until: Option<Instant>,
    busy_count: u32,
    last_busy: Option<Instant>,
    lost_messages: u64,
    parse_errors: u64,
}

impl<T: AsyncTransport> RoutingConnection<T> {
    /// Create a routing connection sending to `multicast`.
    pub fn new(transport: T, multicast: SocketAddr) -> Self {
        Self {
            transport,
            multicast,
            busy_until: None,
            busy_count: 0,
            last_busy: None,
            lost_messages: 0,
            parse_errors: 0,
        }
    }

    /// Frames reported lost by routers on the group.
    pub const fn lost_messages(&self) -> u64 {
        self.lost_messages
    }

    /// Send a cEMI frame as ROUTING_INDICATION, honouring a pending busy
    /// back-off first.
    ///
    /// # Errors
    ///
    /// Transport errors pass through.
    pub async fn send_cemi(&mut self, cemi: &[u8]) -> Result<()> {
        if let Some(until) = self.busy_until {
            let now = Instant::now();
            if now < until {
                tokio::time::sleep_until(until).await;
            }
            self.busy_until = None;
        }
        let frame = build_routing_indication(cemi);
        self.transport.send_to(&frame, self.multicast).await
    }

    /// Wait up to `wait` for the next routing indication. Busy and lost
    /// messages are handled internally.
    ///
    /// # Errors
    ///
    /// Transport errors pass through.
    pub async fn receive(&mut self, wait: Duration) -> Result<Option<CemiFrame>> {
        let deadline = Instant::now() + wait;
        let mut buf = [0u8; MAX_FRAME_SIZE];
        loop {
            let (len, _from) = match timeout_at(deadline, self.transport.recv_from(&mut buf)).await
            {
                Ok(result) => result?,
                Err(_) => return Ok(None),
            };

            let service = match parse_owned(&buf[..len]) {
                Ok(service) => service,
                Err(e) => {
                    self.parse_errors += 1;
                    log::warn!("routing frame dropped: {e}");
                    continue;
                }
            };

            match service.service_type {
                ServiceType::RoutingIndication => match CemiFrame::parse(&service.body) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => {
                        self.parse_errors += 1;
                        log::warn!("routing cEMI dropped: {e}");
                    }
                },
                ServiceType::RoutingBusy => {
                    if let Ok(busy) = RoutingBusy::parse(&service.body) {
                        self.note_busy(busy.wait_time_ms);
                    }
                }
                ServiceType::RoutingLostMessage => {
                    if let Ok(lost) = RoutingLostMessage::parse(&service.body) {
                        self.lost_messages += u64::from(lost.lost_messages);
                        log::warn!("router lost {} frames", lost.lost_messages);
                    }
                }
                other => log::trace!("unhandled routing service {other:?}"),
            }
        }
    }

    /// Record a routing-busy indication: pause for the advertised wait time
    /// plus a random back-off scaled by the number of busy indications seen
    /// within the last five seconds.
    fn note_busy(&mut self, wait_time_ms: u16) {
        let now = Instant::now();
        if self
            .last_busy
            .is_some_and(|last| now.duration_since(last) < BUSY_WINDOW)
        {
            self.busy_count += 1;
        } else {
            self.busy_count = 1;
        }
        self.last_busy = Some(now);

        let jitter = rand::thread_rng().gen_range(0..=50 * u64::from(self.busy_count));
        let pause = Duration::from_millis(u64::from(wait_time_ms) + jitter);
        self.busy_until = Some(now + pause);
        log::debug!("routing busy: pausing {pause:?} (count {})", self.busy_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::mock_transport::MockTransport;
    use crate::protocol::frame::build_frame;
    use crate::protocol::services::ConnectResponse;

    fn server() -> SocketAddr {
        "192.168.1.10:3671".parse().unwrap()
    }

    fn connect_response(channel: u8) -> Vec<u8> {
        let mut body = vec![channel, 0x00];
        let mut hpai = [0u8; 8];
        Hpai::nat().encode(&mut hpai).unwrap();
        body.extend_from_slice(&hpai);
        body.extend_from_slice(&[0x04, 0x04, 0x11, 0x0A]);
        build_frame(ServiceType::ConnectResponse, &body)
    }

    fn sample_cemi() -> Vec<u8> {
        vec![0x29, 0x00, 0xBC, 0xE0, 0x11, 0x01, 0x0A, 0x01, 0x01, 0x00, 0x81]
    }

    async fn connected() -> TunnelConnection<MockTransport> {
        let mut mock = MockTransport::new();
        mock.add_response(connect_response(7));
        let mut tunnel = TunnelConnection::new(mock, server());
        tunnel.connect().await.unwrap();
        tunnel
    }

    #[tokio::test]
    async fn connect_establishes_channel() {
        let tunnel = connected().await;
        assert!(tunnel.is_connected());
        assert_eq!(tunnel.channel_id(), 7);
        // the CONNECT_REQUEST went to the server
        let sent = &tunnel.transport.sent_packets()[0];
        assert_eq!(sent.1, server());
        let parsed = ConnectResponse::parse(&connect_response(7)[6..]).unwrap();
        assert!(parsed.is_ok());
    }

    #[tokio::test]
    async fn connect_refused() {
        let mut mock = MockTransport::new();
        mock.add_response(build_frame(ServiceType::ConnectResponse, &[0x00, 0x24]));
        let mut tunnel = TunnelConnection::new(mock, server());
        let err = tunnel.connect().await.unwrap_err();
        match err {
            KnxError::Connection(e) => assert!(e.is_refused()),
            other => panic!("unexpected {other}"),
        }
        assert_eq!(tunnel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn send_cemi_acknowledged() {
        let mut tunnel = connected().await;
        tunnel
            .transport
            .add_response(TunnelingAck::ok(7, 0).build());
        tunnel.send_cemi(&sample_cemi()).await.unwrap();
        // next frame uses sequence 1
        tunnel
            .transport
            .add_response(TunnelingAck::ok(7, 1).build());
        tunnel.send_cemi(&sample_cemi()).await.unwrap();
    }

    #[tokio::test]
    async fn send_retransmits_then_fails_and_closes() {
        tokio::time::pause();
        let mut tunnel = connected().await;
        // no ack scripted: three attempts, then the channel closes
        let err = tunnel.send_cemi(&sample_cemi()).await.unwrap_err();
        match err {
            KnxError::Tunneling(e) => assert!(e.is_ack_failed()),
            other => panic!("unexpected {other}"),
        }
        assert_eq!(tunnel.state(), ConnectionState::Closed);
        // connect request + 3 tunneling requests
        assert_eq!(tunnel.transport.sent_packets().len(), 4);
    }

    #[tokio::test]
    async fn receive_indication_sends_ack() {
        let mut tunnel = connected().await;
        let request =
            TunnelingRequest::new(ConnectionHeader::new(7, 0), &sample_cemi()).build();
        tunnel.transport.add_response(request);

        let frame = tunnel
            .receive(Duration::from_millis(50))
            .await
            .unwrap()
            .expect("indication");
        assert!(frame.as_ldata().is_some());

        // an ack for sequence 0 went out
        let acked = tunnel
            .transport
            .sent_packets()
            .iter()
            .any(|(data, _)| data[2..4] == [0x04, 0x21] && data[8] == 0);
        assert!(acked);
    }

    #[tokio::test]
    async fn repeated_indication_is_reacked_not_forwarded() {
        let mut tunnel = connected().await;
        let request =
            TunnelingRequest::new(ConnectionHeader::new(7, 0), &sample_cemi()).build();
        tunnel.transport.add_response(request.clone());
        assert!(tunnel
            .receive(Duration::from_millis(50))
            .await
            .unwrap()
            .is_some());

        tunnel.transport.add_response(request);
        assert!(tunnel
            .receive(Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn server_disconnect_closes_and_notifies() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let mut tunnel = connected().await;
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        tunnel.add_listener(Box::new(move |event| {
            if matches!(event, LinkEvent::Closed) {
                flag.store(true, Ordering::SeqCst);
            }
        }));

        let request = DisconnectRequest {
            channel_id: 7,
            control_endpoint: Hpai::nat(),
        }
        .build();
        tunnel.transport.add_response(request);

        let err = tunnel.receive(Duration::from_millis(50)).await.unwrap_err();
        match err {
            KnxError::Connection(e) => assert!(e.is_closed()),
            other => panic!("unexpected {other}"),
        }
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(tunnel.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn heartbeat_roundtrip() {
        let mut tunnel = connected().await;
        tunnel.transport.add_response(
            ChannelStatus {
                channel_id: 7,
                status: 0,
            }
            .build(ServiceType::ConnectionstateResponse),
        );
        tunnel.heartbeat().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_frames_are_counted_and_skipped() {
        let mut tunnel = connected().await;
        tunnel.transport.add_response(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let request =
            TunnelingRequest::new(ConnectionHeader::new(7, 0), &sample_cemi()).build();
        tunnel.transport.add_response(request);

        let frame = tunnel.receive(Duration::from_millis(50)).await.unwrap();
        assert!(frame.is_some());
        assert_eq!(tunnel.parse_errors(), 1);
    }

    #[tokio::test]
    async fn routing_send_and_receive() {
        let mut mock = MockTransport::new();
        mock.add_response(build_routing_indication(&sample_cemi()));
        let multicast: SocketAddr = "224.0.23.12:3671".parse().unwrap();
        let mut routing = RoutingConnection::new(mock, multicast);

        routing.send_cemi(&sample_cemi()).await.unwrap();
        assert_eq!(routing.transport.sent_packets()[0].1, multicast);

        let frame = routing.receive(Duration::from_millis(50)).await.unwrap();
        assert!(frame.is_some());
    }

    #[tokio::test]
    async fn routing_busy_defers_sending() {
        tokio::time::pause();
        let mut mock = MockTransport::new();
        mock.add_response(
            RoutingBusy {
                device_state: 0,
                wait_time_ms: 100,
                control: 0,
            }
            .build(),
        );
        let multicast: SocketAddr = "224.0.23.12:3671".parse().unwrap();
        let mut routing = RoutingConnection::new(mock, multicast);

        // consume the busy indication
        assert!(routing
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
        assert!(routing.busy_until.is_some());

        // sending afterwards sleeps through the pause and then transmits
        routing.send_cemi(&sample_cemi()).await.unwrap();
        assert!(routing.busy_until.is_none());
        assert_eq!(routing.transport.sent_packets().len(), 1);
    }

    #[tokio::test]
    async fn routing_lost_messages_are_counted() {
        let mut mock = MockTransport::new();
        mock.add_response(build_frame(
            ServiceType::RoutingLostMessage,
            &[0x04, 0x00, 0x00, 0x05],
        ));
        let multicast: SocketAddr = "224.0.23.12:3671".parse().unwrap();
        let mut routing = RoutingConnection::new(mock, multicast);
        assert!(routing
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
        assert_eq!(routing.lost_messages(), 5);
    }

    #[tokio::test]
    async fn disconnect_is_clean_and_idempotent() {
        let mut tunnel = connected().await;
        tunnel.transport.add_response(
            ChannelStatus {
                channel_id: 7,
                status: 0,
            }
            .build(ServiceType::DisconnectResponse),
        );
        tunnel.disconnect().await.unwrap();
        assert_eq!(tunnel.state(), ConnectionState::Closed);
        tunnel.disconnect().await.unwrap();

        let err = tunnel.send_cemi(&sample_cemi()).await.unwrap_err();
        match err {
            KnxError::Connection(_) => {}
            other => panic!("unexpected {other}"),
        }
    }
}
