//! Codec for encoding and decoding ECMG <-> SCS messages.
//!
//! Message format (network byte order):
//! ```text
//! +---------+--------+--------+----------------------------+
//! | Version | Type   | Length |   Parameters (TLV loop)    |
//! | u8      | u16 BE | u16 BE |   type u16, length u16, .. |
//! +---------+--------+--------+----------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::*;

/// Message header size: 1 (version) + 2 (type) + 2 (length) = 5 bytes.
pub const HEADER_SIZE: usize = 5;

/// Message header information.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub message_type: MessageType,
    pub body_len: usize,
}

/// Try to decode a message header from the buffer.
/// Returns None if there's not enough data yet.
pub fn decode_header(
    version: ProtocolVersion,
    buf: &[u8],
) -> Result<Option<FrameHeader>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    if buf[0] != version.wire_value() {
        return Err(ProtocolError::VersionMismatch {
            expected: version.wire_value(),
            actual: buf[0],
        });
    }

    let type_val = u16::from_be_bytes([buf[1], buf[2]]);
    let message_type =
        MessageType::try_from(type_val).map_err(ProtocolError::UnknownMessageType)?;

    let body_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if body_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(body_len, MAX_MESSAGE_SIZE));
    }

    Ok(Some(FrameHeader {
        message_type,
        body_len,
    }))
}

/// Encode a message into a complete wire frame.
pub fn encode_message(
    version: ProtocolVersion,
    msg: &EcmgMessage,
) -> Result<Bytes, ProtocolError> {
    let mut body = BytesMut::new();

    match msg {
        EcmgMessage::ChannelSetup {
            channel_id,
            super_cas_id,
        } => {
            put_u16_param(&mut body, param::ECM_CHANNEL_ID, *channel_id);
            put_u32_param(&mut body, param::SUPER_CAS_ID, *super_cas_id);
        }
        EcmgMessage::ChannelTest { channel_id } => {
            put_u16_param(&mut body, param::ECM_CHANNEL_ID, *channel_id);
        }
        EcmgMessage::ChannelStatus {
            channel_id,
            section_tspkt_flag,
            delay_start,
            min_cp_duration,
            max_streams,
        } => {
            put_u16_param(&mut body, param::ECM_CHANNEL_ID, *channel_id);
            put_u8_param(
                &mut body,
                param::SECTION_TSPKT_FLAG,
                u8::from(*section_tspkt_flag),
            );
            put_u16_param(&mut body, param::DELAY_START, *delay_start as u16);
            put_u16_param(&mut body, param::MIN_CP_DURATION, *min_cp_duration);
            put_u16_param(&mut body, param::MAX_STREAMS, *max_streams);
        }
        EcmgMessage::ChannelClose { channel_id } => {
            put_u16_param(&mut body, param::ECM_CHANNEL_ID, *channel_id);
        }
        EcmgMessage::ChannelError {
            channel_id,
            error_status,
        } => {
            put_u16_param(&mut body, param::ECM_CHANNEL_ID, *channel_id);
            put_u16_param(&mut body, param::ERROR_STATUS, *error_status);
        }
        EcmgMessage::StreamSetup {
            channel_id,
            stream_id,
            ecm_id,
            nominal_cp_duration,
        } => {
            put_u16_param(&mut body, param::ECM_CHANNEL_ID, *channel_id);
            put_u16_param(&mut body, param::ECM_STREAM_ID, *stream_id);
            put_u16_param(&mut body, param::ECM_ID, *ecm_id);
            put_u16_param(&mut body, param::NOMINAL_CP_DURATION, *nominal_cp_duration);
        }
        EcmgMessage::StreamTest {
            channel_id,
            stream_id,
        } => {
            put_u16_param(&mut body, param::ECM_CHANNEL_ID, *channel_id);
            put_u16_param(&mut body, param::ECM_STREAM_ID, *stream_id);
        }
        EcmgMessage::StreamStatus {
            channel_id,
            stream_id,
            ecm_id,
        } => {
            put_u16_param(&mut body, param::ECM_CHANNEL_ID, *channel_id);
            put_u16_param(&mut body, param::ECM_STREAM_ID, *stream_id);
            put_u16_param(&mut body, param::ECM_ID, *ecm_id);
        }
        EcmgMessage::StreamCloseRequest {
            channel_id,
            stream_id,
        }
        | EcmgMessage::StreamCloseResponse {
            channel_id,
            stream_id,
        } => {
            put_u16_param(&mut body, param::ECM_CHANNEL_ID, *channel_id);
            put_u16_param(&mut body, param::ECM_STREAM_ID, *stream_id);
        }
        EcmgMessage::StreamError {
            channel_id,
            stream_id,
            error_status,
        } => {
            put_u16_param(&mut body, param::ECM_CHANNEL_ID, *channel_id);
            put_u16_param(&mut body, param::ECM_STREAM_ID, *stream_id);
            put_u16_param(&mut body, param::ERROR_STATUS, *error_status);
        }
        EcmgMessage::CwProvision {
            channel_id,
            stream_id,
            cp_number,
            cw_combinations,
            access_criteria,
            cp_duration,
        } => {
            put_u16_param(&mut body, param::ECM_CHANNEL_ID, *channel_id);
            put_u16_param(&mut body, param::ECM_STREAM_ID, *stream_id);
            put_u16_param(&mut body, param::CP_NUMBER, *cp_number);
            put_u16_param(&mut body, param::CP_DURATION, *cp_duration);
            for combi in cw_combinations {
                body.put_u16(param::CP_CW_COMBINATION);
                body.put_u16((2 + combi.cw.len()) as u16);
                body.put_u16(combi.cp_number);
                body.put_slice(&combi.cw);
            }
            if !access_criteria.is_empty() {
                put_bytes_param(&mut body, param::ACCESS_CRITERIA, access_criteria);
            }
        }
        EcmgMessage::EcmResponse {
            channel_id,
            stream_id,
            cp_number,
            ecm_datagram,
        } => {
            put_u16_param(&mut body, param::ECM_CHANNEL_ID, *channel_id);
            put_u16_param(&mut body, param::ECM_STREAM_ID, *stream_id);
            put_u16_param(&mut body, param::CP_NUMBER, *cp_number);
            put_bytes_param(&mut body, param::ECM_DATAGRAM, ecm_datagram);
        }
    }

    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(body.len(), MAX_MESSAGE_SIZE));
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + body.len());
    frame.put_u8(version.wire_value());
    frame.put_u16(msg.message_type().into());
    frame.put_u16(body.len() as u16);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Decode a complete wire frame (header + body) into a message.
pub fn decode_message(
    version: ProtocolVersion,
    frame: &[u8],
) -> Result<EcmgMessage, ProtocolError> {
    let header = decode_header(version, frame)?.ok_or(ProtocolError::Incomplete {
        expected: HEADER_SIZE,
        actual: frame.len(),
    })?;
    if frame.len() < HEADER_SIZE + header.body_len {
        return Err(ProtocolError::Incomplete {
            expected: HEADER_SIZE + header.body_len,
            actual: frame.len(),
        });
    }
    let body = Bytes::copy_from_slice(&frame[HEADER_SIZE..HEADER_SIZE + header.body_len]);
    decode_body(header.message_type, body)
}

/// Decoded parameter loop of one message body.
#[derive(Default)]
struct Params {
    channel_id: Option<u16>,
    stream_id: Option<u16>,
    ecm_id: Option<u16>,
    super_cas_id: Option<u32>,
    section_tspkt_flag: Option<bool>,
    delay_start: Option<i16>,
    min_cp_duration: Option<u16>,
    max_streams: Option<u16>,
    nominal_cp_duration: Option<u16>,
    cp_number: Option<u16>,
    cp_duration: Option<u16>,
    error_status: Option<u16>,
    cw_combinations: Vec<CpCwCombination>,
    access_criteria: Vec<u8>,
    ecm_datagram: Vec<u8>,
}

fn parse_params(mut body: Bytes) -> Result<Params, ProtocolError> {
    let mut p = Params::default();

    while body.remaining() > 0 {
        if body.remaining() < 4 {
            return Err(ProtocolError::Incomplete {
                expected: 4,
                actual: body.remaining(),
            });
        }
        let ptype = body.get_u16();
        let plen = body.get_u16() as usize;
        if body.remaining() < plen {
            return Err(ProtocolError::Incomplete {
                expected: plen,
                actual: body.remaining(),
            });
        }
        let mut value = body.copy_to_bytes(plen);

        match ptype {
            param::ECM_CHANNEL_ID => p.channel_id = Some(get_u16(ptype, &mut value)?),
            param::ECM_STREAM_ID => p.stream_id = Some(get_u16(ptype, &mut value)?),
            param::ECM_ID => p.ecm_id = Some(get_u16(ptype, &mut value)?),
            param::SUPER_CAS_ID => p.super_cas_id = Some(get_u32(ptype, &mut value)?),
            param::SECTION_TSPKT_FLAG => {
                p.section_tspkt_flag = Some(get_u8(ptype, &mut value)? != 0)
            }
            param::DELAY_START => p.delay_start = Some(get_u16(ptype, &mut value)? as i16),
            param::MIN_CP_DURATION => p.min_cp_duration = Some(get_u16(ptype, &mut value)?),
            param::MAX_STREAMS => p.max_streams = Some(get_u16(ptype, &mut value)?),
            param::NOMINAL_CP_DURATION => {
                p.nominal_cp_duration = Some(get_u16(ptype, &mut value)?)
            }
            param::CP_NUMBER => p.cp_number = Some(get_u16(ptype, &mut value)?),
            param::CP_DURATION => p.cp_duration = Some(get_u16(ptype, &mut value)?),
            param::ERROR_STATUS => p.error_status = Some(get_u16(ptype, &mut value)?),
            param::CP_CW_COMBINATION => {
                if value.remaining() < 2 {
                    return Err(ProtocolError::InvalidParameterLength {
                        param: ptype,
                        got: value.remaining(),
                    });
                }
                let cp_number = value.get_u16();
                p.cw_combinations.push(CpCwCombination {
                    cp_number,
                    cw: value.to_vec(),
                });
            }
            param::ACCESS_CRITERIA => p.access_criteria = value.to_vec(),
            param::ECM_DATAGRAM => p.ecm_datagram = value.to_vec(),
            // Unknown parameters are skipped: later protocol revisions may
            // add parameters the SCS does not consume.
            _ => {}
        }
    }

    Ok(p)
}

fn decode_body(msg_type: MessageType, body: Bytes) -> Result<EcmgMessage, ProtocolError> {
    let p = parse_params(body)?;
    let name = message_name(msg_type);

    let channel_id = p
        .channel_id
        .ok_or(ProtocolError::MissingParameter(param::ECM_CHANNEL_ID, name))?;

    let stream_id = || {
        p.stream_id
            .ok_or(ProtocolError::MissingParameter(param::ECM_STREAM_ID, name))
    };

    match msg_type {
        MessageType::ChannelSetup => Ok(EcmgMessage::ChannelSetup {
            channel_id,
            super_cas_id: p
                .super_cas_id
                .ok_or(ProtocolError::MissingParameter(param::SUPER_CAS_ID, name))?,
        }),
        MessageType::ChannelTest => Ok(EcmgMessage::ChannelTest { channel_id }),
        MessageType::ChannelStatus => Ok(EcmgMessage::ChannelStatus {
            channel_id,
            section_tspkt_flag: p.section_tspkt_flag.ok_or(
                ProtocolError::MissingParameter(param::SECTION_TSPKT_FLAG, name),
            )?,
            delay_start: p
                .delay_start
                .ok_or(ProtocolError::MissingParameter(param::DELAY_START, name))?,
            min_cp_duration: p.min_cp_duration.unwrap_or(0),
            max_streams: p.max_streams.unwrap_or(1),
        }),
        MessageType::ChannelClose => Ok(EcmgMessage::ChannelClose { channel_id }),
        MessageType::ChannelError => Ok(EcmgMessage::ChannelError {
            channel_id,
            error_status: p
                .error_status
                .ok_or(ProtocolError::MissingParameter(param::ERROR_STATUS, name))?,
        }),
        MessageType::StreamSetup => Ok(EcmgMessage::StreamSetup {
            channel_id,
            stream_id: stream_id()?,
            ecm_id: p
                .ecm_id
                .ok_or(ProtocolError::MissingParameter(param::ECM_ID, name))?,
            nominal_cp_duration: p.nominal_cp_duration.ok_or(
                ProtocolError::MissingParameter(param::NOMINAL_CP_DURATION, name),
            )?,
        }),
        MessageType::StreamTest => Ok(EcmgMessage::StreamTest {
            channel_id,
            stream_id: stream_id()?,
        }),
        MessageType::StreamStatus => Ok(EcmgMessage::StreamStatus {
            channel_id,
            stream_id: stream_id()?,
            ecm_id: p
                .ecm_id
                .ok_or(ProtocolError::MissingParameter(param::ECM_ID, name))?,
        }),
        MessageType::StreamCloseRequest => Ok(EcmgMessage::StreamCloseRequest {
            channel_id,
            stream_id: stream_id()?,
        }),
        MessageType::StreamCloseResponse => Ok(EcmgMessage::StreamCloseResponse {
            channel_id,
            stream_id: stream_id()?,
        }),
        MessageType::StreamError => Ok(EcmgMessage::StreamError {
            channel_id,
            stream_id: stream_id()?,
            error_status: p
                .error_status
                .ok_or(ProtocolError::MissingParameter(param::ERROR_STATUS, name))?,
        }),
        MessageType::CwProvision => {
            let stream_id = stream_id()?;
            let cp_number = p
                .cp_number
                .ok_or(ProtocolError::MissingParameter(param::CP_NUMBER, name))?;
            let cp_duration = p
                .cp_duration
                .ok_or(ProtocolError::MissingParameter(param::CP_DURATION, name))?;
            Ok(EcmgMessage::CwProvision {
                channel_id,
                stream_id,
                cp_number,
                cw_combinations: p.cw_combinations,
                access_criteria: p.access_criteria,
                cp_duration,
            })
        }
        MessageType::EcmResponse => {
            let stream_id = stream_id()?;
            let cp_number = p
                .cp_number
                .ok_or(ProtocolError::MissingParameter(param::CP_NUMBER, name))?;
            Ok(EcmgMessage::EcmResponse {
                channel_id,
                stream_id,
                cp_number,
                ecm_datagram: p.ecm_datagram,
            })
        }
    }
}

fn message_name(msg_type: MessageType) -> &'static str {
    match msg_type {
        MessageType::ChannelSetup => "channel_setup",
        MessageType::ChannelTest => "channel_test",
        MessageType::ChannelStatus => "channel_status",
        MessageType::ChannelClose => "channel_close",
        MessageType::ChannelError => "channel_error",
        MessageType::StreamSetup => "stream_setup",
        MessageType::StreamTest => "stream_test",
        MessageType::StreamStatus => "stream_status",
        MessageType::StreamCloseRequest => "stream_close_request",
        MessageType::StreamCloseResponse => "stream_close_response",
        MessageType::StreamError => "stream_error",
        MessageType::CwProvision => "CW_provision",
        MessageType::EcmResponse => "ECM_response",
    }
}

fn put_u8_param(buf: &mut BytesMut, ptype: u16, value: u8) {
    buf.put_u16(ptype);
    buf.put_u16(1);
    buf.put_u8(value);
}

fn put_u16_param(buf: &mut BytesMut, ptype: u16, value: u16) {
    buf.put_u16(ptype);
    buf.put_u16(2);
    buf.put_u16(value);
}

fn put_u32_param(buf: &mut BytesMut, ptype: u16, value: u32) {
    buf.put_u16(ptype);
    buf.put_u16(4);
    buf.put_u32(value);
}

fn put_bytes_param(buf: &mut BytesMut, ptype: u16, value: &[u8]) {
    buf.put_u16(ptype);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

fn get_u8(ptype: u16, value: &mut Bytes) -> Result<u8, ProtocolError> {
    if value.remaining() != 1 {
        return Err(ProtocolError::InvalidParameterLength {
            param: ptype,
            got: value.remaining(),
        });
    }
    Ok(value.get_u8())
}

fn get_u16(ptype: u16, value: &mut Bytes) -> Result<u16, ProtocolError> {
    if value.remaining() != 2 {
        return Err(ProtocolError::InvalidParameterLength {
            param: ptype,
            got: value.remaining(),
        });
    }
    Ok(value.get_u16())
}

fn get_u32(ptype: u16, value: &mut Bytes) -> Result<u32, ProtocolError> {
    if value.remaining() != 4 {
        return Err(ProtocolError::InvalidParameterLength {
            param: ptype,
            got: value.remaining(),
        });
    }
    Ok(value.get_u32())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_channel_setup() {
        let msg = EcmgMessage::ChannelSetup {
            channel_id: 1,
            super_cas_id: 0x1234_5678,
        };
        let frame = encode_message(ProtocolVersion::V2, &msg).unwrap();

        assert_eq!(frame[0], 2); // version byte
        let header = decode_header(ProtocolVersion::V2, &frame).unwrap().unwrap();
        assert_eq!(header.message_type, MessageType::ChannelSetup);

        let decoded = decode_message(ProtocolVersion::V2, &frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_encode_decode_channel_status() {
        let msg = EcmgMessage::ChannelStatus {
            channel_id: 1,
            section_tspkt_flag: true,
            delay_start: -250,
            min_cp_duration: 50,
            max_streams: 4,
        };
        let frame = encode_message(ProtocolVersion::V3, &msg).unwrap();
        let decoded = decode_message(ProtocolVersion::V3, &frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_encode_decode_cw_provision() {
        let msg = EcmgMessage::CwProvision {
            channel_id: 1,
            stream_id: 1,
            cp_number: 7,
            cw_combinations: vec![
                CpCwCombination {
                    cp_number: 7,
                    cw: vec![0x11; 16],
                },
                CpCwCombination {
                    cp_number: 8,
                    cw: vec![0x22; 16],
                },
            ],
            access_criteria: vec![0xAA, 0xBB],
            cp_duration: 100,
        };
        let frame = encode_message(ProtocolVersion::V2, &msg).unwrap();
        let decoded = decode_message(ProtocolVersion::V2, &frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_encode_decode_ecm_response() {
        let msg = EcmgMessage::EcmResponse {
            channel_id: 1,
            stream_id: 1,
            cp_number: 7,
            ecm_datagram: vec![0x47; 188 * 2],
        };
        let frame = encode_message(ProtocolVersion::V2, &msg).unwrap();
        let header = decode_header(ProtocolVersion::V2, &frame).unwrap().unwrap();
        assert!(header.body_len > 188 * 2);
        let decoded = decode_message(ProtocolVersion::V2, &frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_version_mismatch() {
        let msg = EcmgMessage::ChannelTest { channel_id: 1 };
        let frame = encode_message(ProtocolVersion::V2, &msg).unwrap();
        let result = decode_header(ProtocolVersion::V3, &frame);
        assert!(matches!(
            result,
            Err(ProtocolError::VersionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_incomplete_header() {
        let partial = [2u8, 0x00];
        let result = decode_header(ProtocolVersion::V2, &partial).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_missing_parameter() {
        // channel_status with only a channel id: section_TSpkt_flag missing.
        let mut frame = vec![2u8, 0x00, 0x03, 0x00, 0x06];
        frame.extend_from_slice(&[0x00, 0x0E, 0x00, 0x02, 0x00, 0x01]);
        let result = decode_message(ProtocolVersion::V2, &frame);
        assert!(matches!(result, Err(ProtocolError::MissingParameter(..))));
    }

    #[test]
    fn test_unknown_parameter_skipped() {
        // channel_close with a trailing unknown parameter.
        let mut frame = vec![2u8, 0x00, 0x04, 0x00, 0x0B];
        frame.extend_from_slice(&[0x00, 0x0E, 0x00, 0x02, 0x00, 0x05]); // channel_id = 5
        frame.extend_from_slice(&[0x6F, 0xFF, 0x00, 0x01, 0x42]); // unknown TLV
        let decoded = decode_message(ProtocolVersion::V2, &frame).unwrap();
        assert_eq!(decoded, EcmgMessage::ChannelClose { channel_id: 5 });
    }
}
