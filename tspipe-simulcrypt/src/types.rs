//! Message and parameter definitions for the ECMG <-> SCS protocol.

/// Maximum accepted message body size. ECMs are at most a few TS packets;
/// anything larger indicates a corrupted stream.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// ECMG <-> SCS protocol version.
///
/// The version is a constructor-level choice of the client; it is threaded
/// through every encode/decode call rather than held in global state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// ETSI TS 101 197 version 2.
    V2,
    /// ETSI TS 103 197 version 3.
    V3,
}

impl ProtocolVersion {
    /// Wire value of the version byte.
    pub fn wire_value(self) -> u8 {
        match self {
            ProtocolVersion::V2 => 2,
            ProtocolVersion::V3 => 3,
        }
    }

    /// Parse a version from a command-line or config value.
    pub fn from_value(v: u8) -> Option<Self> {
        match v {
            2 => Some(ProtocolVersion::V2),
            3 => Some(ProtocolVersion::V3),
            _ => None,
        }
    }
}

/// Message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// SCS -> ECMG: open an ECM channel.
    ChannelSetup = 0x0001,
    /// SCS -> ECMG: probe an open channel.
    ChannelTest = 0x0002,
    /// ECMG -> SCS: channel parameters (delay_start, section_TSpkt_flag...).
    ChannelStatus = 0x0003,
    /// SCS -> ECMG: close the channel.
    ChannelClose = 0x0004,
    /// ECMG -> SCS: channel-level error.
    ChannelError = 0x0005,
    /// SCS -> ECMG: open an ECM stream inside a channel.
    StreamSetup = 0x0101,
    /// SCS -> ECMG: probe an open stream.
    StreamTest = 0x0102,
    /// ECMG -> SCS: stream acknowledgement.
    StreamStatus = 0x0103,
    /// SCS -> ECMG: request stream close.
    StreamCloseRequest = 0x0104,
    /// ECMG -> SCS: stream close acknowledgement.
    StreamCloseResponse = 0x0105,
    /// ECMG -> SCS: stream-level error.
    StreamError = 0x0106,
    /// SCS -> ECMG: control words for one crypto period.
    CwProvision = 0x0201,
    /// ECMG -> SCS: the ECM for one crypto period.
    EcmResponse = 0x0202,
}

impl TryFrom<u16> for MessageType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        match value {
            0x0001 => Ok(MessageType::ChannelSetup),
            0x0002 => Ok(MessageType::ChannelTest),
            0x0003 => Ok(MessageType::ChannelStatus),
            0x0004 => Ok(MessageType::ChannelClose),
            0x0005 => Ok(MessageType::ChannelError),
            0x0101 => Ok(MessageType::StreamSetup),
            0x0102 => Ok(MessageType::StreamTest),
            0x0103 => Ok(MessageType::StreamStatus),
            0x0104 => Ok(MessageType::StreamCloseRequest),
            0x0105 => Ok(MessageType::StreamCloseResponse),
            0x0106 => Ok(MessageType::StreamError),
            0x0201 => Ok(MessageType::CwProvision),
            0x0202 => Ok(MessageType::EcmResponse),
            other => Err(other),
        }
    }
}

impl From<MessageType> for u16 {
    fn from(value: MessageType) -> u16 {
        value as u16
    }
}

/// Parameter type codes used inside messages.
pub mod param {
    pub const SUPER_CAS_ID: u16 = 0x0001;
    pub const SECTION_TSPKT_FLAG: u16 = 0x0002;
    pub const DELAY_START: u16 = 0x0003;
    pub const DELAY_STOP: u16 = 0x0004;
    pub const ECM_REP_PERIOD: u16 = 0x0007;
    pub const MAX_STREAMS: u16 = 0x0008;
    pub const MIN_CP_DURATION: u16 = 0x0009;
    pub const ACCESS_CRITERIA: u16 = 0x000D;
    pub const ECM_CHANNEL_ID: u16 = 0x000E;
    pub const ECM_STREAM_ID: u16 = 0x000F;
    pub const NOMINAL_CP_DURATION: u16 = 0x0010;
    pub const CP_NUMBER: u16 = 0x0012;
    pub const CP_DURATION: u16 = 0x0013;
    pub const CP_CW_COMBINATION: u16 = 0x0014;
    pub const ECM_DATAGRAM: u16 = 0x0015;
    pub const ECM_ID: u16 = 0x0019;
    pub const ERROR_STATUS: u16 = 0x7000;
}

/// One (crypto-period number, control word) pair from a CW_provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpCwCombination {
    /// Crypto-period the control word belongs to.
    pub cp_number: u16,
    /// Control word bytes (size depends on the scrambling algorithm).
    pub cw: Vec<u8>,
}

/// An ECMG <-> SCS message.
///
/// Channel and stream identifiers are carried in every message so the peer
/// can route them; the SCS side of this crate always uses a single channel
/// and a single stream per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcmgMessage {
    /// Open an ECM channel for one CA system.
    ChannelSetup {
        channel_id: u16,
        super_cas_id: u32,
    },
    /// Probe an open channel.
    ChannelTest { channel_id: u16 },
    /// Channel parameters returned by the ECMG.
    ChannelStatus {
        channel_id: u16,
        /// True when ECMs are returned as TS packets, false for sections.
        section_tspkt_flag: bool,
        /// Signed offset, in milliseconds, between the start of a crypto
        /// period and the start of its ECM broadcast.
        delay_start: i16,
        /// Shortest crypto-period duration the ECMG accepts, in 100 ms units.
        min_cp_duration: u16,
        /// Maximum number of streams on this channel.
        max_streams: u16,
    },
    /// Close the channel.
    ChannelClose { channel_id: u16 },
    /// Channel-level error report.
    ChannelError {
        channel_id: u16,
        error_status: u16,
    },
    /// Open an ECM stream inside the channel.
    StreamSetup {
        channel_id: u16,
        stream_id: u16,
        ecm_id: u16,
        /// Nominal crypto-period duration in 100 ms units.
        nominal_cp_duration: u16,
    },
    /// Probe an open stream.
    StreamTest {
        channel_id: u16,
        stream_id: u16,
    },
    /// Stream acknowledgement.
    StreamStatus {
        channel_id: u16,
        stream_id: u16,
        ecm_id: u16,
    },
    /// Request stream close.
    StreamCloseRequest {
        channel_id: u16,
        stream_id: u16,
    },
    /// Stream close acknowledgement.
    StreamCloseResponse {
        channel_id: u16,
        stream_id: u16,
    },
    /// Stream-level error report.
    StreamError {
        channel_id: u16,
        stream_id: u16,
        error_status: u16,
    },
    /// Control words and access criteria for one crypto period.
    CwProvision {
        channel_id: u16,
        stream_id: u16,
        cp_number: u16,
        /// Current and next control words, one combination each.
        cw_combinations: Vec<CpCwCombination>,
        /// Opaque access criteria forwarded to the CAS.
        access_criteria: Vec<u8>,
        /// Crypto-period duration in 100 ms units.
        cp_duration: u16,
    },
    /// The ECM produced for one crypto period.
    EcmResponse {
        channel_id: u16,
        stream_id: u16,
        cp_number: u16,
        /// ECM bytes: a section, or whole TS packets, per section_TSpkt_flag.
        ecm_datagram: Vec<u8>,
    },
}

impl EcmgMessage {
    /// Wire message type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            EcmgMessage::ChannelSetup { .. } => MessageType::ChannelSetup,
            EcmgMessage::ChannelTest { .. } => MessageType::ChannelTest,
            EcmgMessage::ChannelStatus { .. } => MessageType::ChannelStatus,
            EcmgMessage::ChannelClose { .. } => MessageType::ChannelClose,
            EcmgMessage::ChannelError { .. } => MessageType::ChannelError,
            EcmgMessage::StreamSetup { .. } => MessageType::StreamSetup,
            EcmgMessage::StreamTest { .. } => MessageType::StreamTest,
            EcmgMessage::StreamStatus { .. } => MessageType::StreamStatus,
            EcmgMessage::StreamCloseRequest { .. } => MessageType::StreamCloseRequest,
            EcmgMessage::StreamCloseResponse { .. } => MessageType::StreamCloseResponse,
            EcmgMessage::StreamError { .. } => MessageType::StreamError,
            EcmgMessage::CwProvision { .. } => MessageType::CwProvision,
            EcmgMessage::EcmResponse { .. } => MessageType::EcmResponse,
        }
    }
}
