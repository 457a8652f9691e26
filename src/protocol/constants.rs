//! KNXnet/IP protocol constants, service types and cEMI message codes.

/// KNXnet/IP protocol version 1.0
pub const KNXNETIP_VERSION_10: u8 = 0x10;

/// Standard KNXnet/IP header length (6 bytes)
pub const HEADER_SIZE_10: u8 = 0x06;

/// Standard UDP/TCP port for KNXnet/IP communication
pub const KNXNETIP_DEFAULT_PORT: u16 = 3671;

/// Maximum size of a KNXnet/IP frame carried by this crate
pub const MAX_FRAME_SIZE: usize = 512;

/// KNXnet/IP multicast address for routing
pub const KNXNETIP_MULTICAST_ADDR: [u8; 4] = [224, 0, 23, 12];

// =============================================================================
// Service Type Identifiers
// =============================================================================

/// KNXnet/IP Service Type Identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServiceType {
    // Core services (0x02xx)
    /// `CONNECT_REQUEST` - Connection request
    ConnectRequest = 0x0205,
    /// `CONNECT_RESPONSE` - Connection response
    ConnectResponse = 0x0206,
    /// `CONNECTIONSTATE_REQUEST` - Connection state request (heartbeat)
    ConnectionstateRequest = 0x0207,
    /// `CONNECTIONSTATE_RESPONSE` - Connection state response
    ConnectionstateResponse = 0x0208,
    /// `DISCONNECT_REQUEST` - Disconnect request
    DisconnectRequest = 0x0209,
    /// `DISCONNECT_RESPONSE` - Disconnect response
    DisconnectResponse = 0x020A,

    // Device Management (0x03xx)
    /// `DEVICE_CONFIGURATION_REQUEST`
    DeviceConfigurationRequest = 0x0310,
    /// `DEVICE_CONFIGURATION_ACK`
    DeviceConfigurationAck = 0x0311,

    // Tunnelling (0x04xx)
    /// `TUNNELLING_REQUEST` - Tunnelling data request
    TunnellingRequest = 0x0420,
    /// `TUNNELLING_ACK` - Tunnelling acknowledgement
    TunnellingAck = 0x0421,

    // Routing (0x05xx)
    /// `ROUTING_INDICATION` - Routing indication (multicast)
    RoutingIndication = 0x0530,
    /// `ROUTING_LOST_MESSAGE` - Routing lost message indication
    RoutingLostMessage = 0x0531,
    /// `ROUTING_BUSY` - Routing busy indication
    RoutingBusy = 0x0532,

    // Secure services (0x09xx)
    /// `SECURE_WRAPPER` - Secure session wrapper
    SecureWrapper = 0x0950,
    /// `SESSION_REQUEST` - Secure session request
    SessionRequest = 0x0951,
    /// `SESSION_RESPONSE` - Secure session response
    SessionResponse = 0x0952,
    /// `SESSION_AUTHENTICATE` - Secure session authentication
    SessionAuthenticate = 0x0953,
    /// `SESSION_STATUS` - Secure session status
    SessionStatus = 0x0954,
}

impl ServiceType {
    /// Convert a u16 to `ServiceType`
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0205 => Some(Self::ConnectRequest),
            0x0206 => Some(Self::ConnectResponse),
            0x0207 => Some(Self::ConnectionstateRequest),
            0x0208 => Some(Self::ConnectionstateResponse),
            0x0209 => Some(Self::DisconnectRequest),
            0x020A => Some(Self::DisconnectResponse),
            0x0310 => Some(Self::DeviceConfigurationRequest),
            0x0311 => Some(Self::DeviceConfigurationAck),
            0x0420 => Some(Self::TunnellingRequest),
            0x0421 => Some(Self::TunnellingAck),
            0x0530 => Some(Self::RoutingIndication),
            0x0531 => Some(Self::RoutingLostMessage),
            0x0532 => Some(Self::RoutingBusy),
            0x0950 => Some(Self::SecureWrapper),
            0x0951 => Some(Self::SessionRequest),
            0x0952 => Some(Self::SessionResponse),
            0x0953 => Some(Self::SessionAuthenticate),
            0x0954 => Some(Self::SessionStatus),
            _ => None,
        }
    }

    /// Convert `ServiceType` to u16
    pub const fn to_u16(self) -> u16 {
        self as u16
    }
}

// =============================================================================
// Connection Type Codes
// =============================================================================

/// Connection type for `TUNNEL_CONNECTION`
pub const TUNNEL_CONNECTION: u8 = 0x04;

/// KNX tunneling on link layer
pub const TUNNEL_LINKLAYER: u8 = 0x02;

/// KNX tunneling on busmonitor layer
pub const TUNNEL_BUSMONITOR: u8 = 0x80;

// =============================================================================
// Host Protocol Codes
// =============================================================================

/// IPv4 UDP protocol
pub const IPV4_UDP: u8 = 0x01;

/// IPv4 TCP protocol
pub const IPV4_TCP: u8 = 0x02;

// =============================================================================
// KNXnet/IP Error Codes
// =============================================================================

/// Error code for successful operation
pub const E_NO_ERROR: u8 = 0x00;

/// Error code for connection type not supported
pub const E_CONNECTION_TYPE: u8 = 0x22;

/// Error code for connection option not supported
pub const E_CONNECTION_OPTION: u8 = 0x23;

/// Error code for no more connections available
pub const E_NO_MORE_CONNECTIONS: u8 = 0x24;

/// Error code for data connection error
pub const E_DATA_CONNECTION: u8 = 0x26;

/// Error code for KNX connection error
pub const E_KNX_CONNECTION: u8 = 0x27;

/// Error code for tunnelling layer not supported
pub const E_TUNNELLING_LAYER: u8 = 0x29;

// =============================================================================
// cEMI Message Codes
// =============================================================================

/// cEMI Message Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CemiMessageCode {
    /// `L_Data.req` - Data request
    LDataReq = 0x11,
    /// `L_Data.ind` - Data indication
    LDataInd = 0x29,
    /// `L_Busmon.ind` - Bus monitor indication
    LBusmonInd = 0x2B,
    /// `L_Data.con` - Data confirmation
    LDataCon = 0x2E,
    /// `M_PropRead.req` - Property read request
    PropReadReq = 0xFC,
    /// `M_PropRead.con` - Property read confirmation
    PropReadCon = 0xFB,
    /// `M_PropWrite.req` - Property write request
    PropWriteReq = 0xF6,
    /// `M_PropWrite.con` - Property write confirmation
    PropWriteCon = 0xF5,
    /// `M_PropInfo.ind` - Property info indication
    PropInfoInd = 0xF7,
    /// `M_Reset.req` - Reset request
    ResetReq = 0xF1,
    /// `M_Reset.ind` - Reset indication
    ResetInd = 0xF0,
}

impl CemiMessageCode {
    /// Convert u8 to `CemiMessageCode`
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x11 => Some(Self::LDataReq),
            0x29 => Some(Self::LDataInd),
            0x2B => Some(Self::LBusmonInd),
            0x2E => Some(Self::LDataCon),
            0xFC => Some(Self::PropReadReq),
            0xFB => Some(Self::PropReadCon),
            0xF6 => Some(Self::PropWriteReq),
            0xF5 => Some(Self::PropWriteCon),
            0xF7 => Some(Self::PropInfoInd),
            0xF1 => Some(Self::ResetReq),
            0xF0 => Some(Self::ResetInd),
            _ => None,
        }
    }

    /// Convert `CemiMessageCode` to u8
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether this is one of the L-Data codes
    pub const fn is_ldata(self) -> bool {
        matches!(self, Self::LDataReq | Self::LDataInd | Self::LDataCon)
    }
}

// =============================================================================
// EMI1 / EMI2 Message Codes
// =============================================================================

/// EMI1/EMI2 `L_Data.req`
pub const EMI_LDATA_REQ: u8 = 0x11;
/// EMI1/EMI2 `L_Data.con`
pub const EMI_LDATA_CON: u8 = 0x4E;
/// EMI1/EMI2 `L_Data.ind` (EMI1 also uses this code for `L_Busmon.ind`)
pub const EMI_LDATA_IND: u8 = 0x49;
/// EMI1 `L_SysBcast.req` - system broadcast on open media
pub const EMI_SYSBCAST_REQ: u8 = 0x15;
/// EMI1 `L_SysBcast.con`
pub const EMI_SYSBCAST_CON: u8 = 0x4C;
/// EMI1 `L_SysBcast.ind`
pub const EMI_SYSBCAST_IND: u8 = 0x4D;

// =============================================================================
// KNX Priority
// =============================================================================

/// KNX message priority levels (the 2-bit tag in control field 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Priority {
    /// System priority
    System = 0b00,
    /// Urgent priority
    Urgent = 0b01,
    /// Normal priority (default)
    #[default]
    Normal = 0b10,
    /// Low priority
    Low = 0b11,
}

impl Priority {
    /// Convert u8 to Priority
    pub const fn from_u8(value: u8) -> Self {
        match value & 0b11 {
            0b00 => Self::System,
            0b01 => Self::Urgent,
            0b10 => Self::Normal,
            _ => Self::Low,
        }
    }

    /// Convert Priority to u8
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

// =============================================================================
// Application layer (APCI)
// =============================================================================

/// APCI of the KNX Data Secure service (`SecureService`, 10 bits)
pub const APCI_SECURE_SERVICE: u16 = 0x3F1;

/// APCI of `A_DomainAddress_Read`; always sent as system broadcast
pub const APCI_DOMAIN_ADDRESS_READ: u16 = 0x3E1;

/// APCI of `A_FunctionPropertyExtCommand`, used for group object diagnostics
pub const APCI_FUNCTION_PROPERTY_EXT_COMMAND: u16 = 0x1D4;
