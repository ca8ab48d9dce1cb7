//! DVB SimulCrypt ECMG <-> SCS protocol (ETSI TS 103 197, subset).
//!
//! This crate defines the TLV messages exchanged between a SimulCrypt
//! Synchronizer (SCS) and an ECM Generator (ECMG), together with their
//! binary codec. Only the message subset a scrambler needs is covered:
//! channel and stream session management, CW_provision and ECM_response.
//!
//! # Message Format
//!
//! ```text
//! +---------+--------+--------+----------------------------+
//! | Version | Type   | Length |   Parameters (TLV loop)    |
//! | u8      | u16 BE | u16 BE |   type u16, length u16, .. |
//! +---------+--------+--------+----------------------------+
//! | 1 byte  | 2 bytes| 2 bytes|   Length bytes             |
//! +---------+--------+--------+----------------------------+
//! ```
//!
//! The protocol version (2 or 3) is carried explicitly by every encode and
//! decode call; there is no process-wide version selector.
//!
//! # Example
//!
//! ```rust
//! use tspipe_simulcrypt::{EcmgMessage, ProtocolVersion, encode_message, decode_message};
//!
//! let msg = EcmgMessage::ChannelSetup { channel_id: 1, super_cas_id: 0x12345678 };
//! let frame = encode_message(ProtocolVersion::V2, &msg).unwrap();
//! let decoded = decode_message(ProtocolVersion::V2, &frame).unwrap();
//! assert_eq!(decoded, msg);
//! ```

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{decode_header, decode_message, encode_message, FrameHeader, HEADER_SIZE};
pub use error::ProtocolError;
pub use types::{
    CpCwCombination, EcmgMessage, MessageType, ProtocolVersion, MAX_MESSAGE_SIZE,
};
