//! ECMG client: the SCS side of the DVB SimulCrypt ECMG <-> SCS protocol.
//!
//! The client opens one channel and one stream during `connect`, then runs
//! a receiver thread that dispatches `ECM_response` messages to the
//! callbacks registered by `submit_ecm`. The scrambler talks to the trait
//! [`EcmGenerator`], so tests can substitute a mock generator.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::Mutex;
use tspipe_simulcrypt::{
    decode_header, decode_message, encode_message, EcmgMessage, ProtocolVersion, HEADER_SIZE,
};

use crate::error::StageError;

/// Timeout for the synchronous [`EcmGenerator::generate_ecm`] path.
const SYNC_ECM_TIMEOUT: Duration = Duration::from_secs(10);

/// One ECM request: the CW pair and scheduling data for a crypto period.
#[derive(Debug, Clone)]
pub struct EcmRequest {
    /// Crypto-period number.
    pub cp_number: u16,
    /// Control word of this crypto period.
    pub cw_current: Vec<u8>,
    /// Control word of the following crypto period.
    pub cw_next: Vec<u8>,
    /// Opaque access criteria.
    pub access_criteria: Vec<u8>,
    /// Crypto-period duration in 100 ms units.
    pub cp_duration: u16,
}

/// Completion callback for an asynchronous ECM request. Invoked from the
/// client's receiver thread.
pub type EcmCallback = Box<dyn FnOnce(Result<Vec<u8>, String>) + Send>;

/// The ECM source the scrambler talks to.
pub trait EcmGenerator: Send {
    /// `delay_start` from the ECMG's channel_status, in milliseconds.
    fn delay_start(&self) -> i16;

    /// True when ECMs come back as whole TS packets, false for sections.
    fn section_tspkt_flag(&self) -> bool;

    /// Generate one ECM synchronously.
    fn generate_ecm(&mut self, request: EcmRequest) -> Result<Vec<u8>, StageError>;

    /// Submit one ECM request; the callback fires when the ECM arrives.
    fn submit_ecm(&mut self, request: EcmRequest, callback: EcmCallback)
        -> Result<(), StageError>;
}

/// Connection parameters for an [`EcmgClient`].
#[derive(Debug, Clone)]
pub struct EcmgClientConfig {
    /// ECMG address, `host:port`.
    pub addr: String,
    /// DVB SimulCrypt Super_CAS_Id.
    pub super_cas_id: u32,
    /// ECM_channel_id.
    pub channel_id: u16,
    /// ECM_stream_id.
    pub stream_id: u16,
    /// ECM_id.
    pub ecm_id: u16,
    /// Nominal crypto-period duration in 100 ms units.
    pub cp_duration: u16,
    /// Protocol version, threaded explicitly (no global selector).
    pub version: ProtocolVersion,
}

type PendingMap = Arc<Mutex<HashMap<u16, EcmCallback>>>;

/// Network ECM generator.
pub struct EcmgClient {
    config: EcmgClientConfig,
    stream: TcpStream,
    delay_start: i16,
    section_tspkt_flag: bool,
    pending: PendingMap,
    reader: Option<thread::JoinHandle<()>>,
}

impl EcmgClient {
    /// Connect and run the channel_setup / stream_setup handshake.
    pub fn connect(config: EcmgClientConfig) -> Result<Self, StageError> {
        let mut stream = TcpStream::connect(&config.addr)
            .map_err(|e| StageError::Ecmg(format!("cannot connect to {}: {e}", config.addr)))?;

        write_message(
            &mut stream,
            config.version,
            &EcmgMessage::ChannelSetup {
                channel_id: config.channel_id,
                super_cas_id: config.super_cas_id,
            },
        )?;
        let (delay_start, section_tspkt_flag) =
            match read_message(&mut stream, config.version)? {
                EcmgMessage::ChannelStatus {
                    delay_start,
                    section_tspkt_flag,
                    ..
                } => (delay_start, section_tspkt_flag),
                EcmgMessage::ChannelError { error_status, .. } => {
                    return Err(StageError::Ecmg(format!(
                        "channel_setup rejected, error status 0x{error_status:04X}"
                    )));
                }
                other => {
                    return Err(StageError::Ecmg(format!(
                        "unexpected answer to channel_setup: {other:?}"
                    )));
                }
            };

        write_message(
            &mut stream,
            config.version,
            &EcmgMessage::StreamSetup {
                channel_id: config.channel_id,
                stream_id: config.stream_id,
                ecm_id: config.ecm_id,
                nominal_cp_duration: config.cp_duration,
            },
        )?;
        match read_message(&mut stream, config.version)? {
            EcmgMessage::StreamStatus { .. } => {}
            EcmgMessage::StreamError { error_status, .. } => {
                return Err(StageError::Ecmg(format!(
                    "stream_setup rejected, error status 0x{error_status:04X}"
                )));
            }
            other => {
                return Err(StageError::Ecmg(format!(
                    "unexpected answer to stream_setup: {other:?}"
                )));
            }
        }

        debug!(
            "connected to ECMG {} (delay_start: {delay_start} ms, {} format)",
            config.addr,
            if section_tspkt_flag { "packet" } else { "section" },
        );

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_stream = stream
            .try_clone()
            .map_err(|e| StageError::Ecmg(format!("cannot clone ECMG socket: {e}")))?;
        let reader = thread::Builder::new()
            .name("tspipe-ecmg".into())
            .spawn({
                let pending = Arc::clone(&pending);
                let version = config.version;
                move || receiver_loop(reader_stream, version, pending)
            })
            .map_err(StageError::Io)?;

        Ok(EcmgClient {
            config,
            stream,
            delay_start,
            section_tspkt_flag,
            pending,
            reader: Some(reader),
        })
    }

    /// Close the stream and channel, then shut the connection down.
    pub fn disconnect(&mut self) {
        let close = [
            EcmgMessage::StreamCloseRequest {
                channel_id: self.config.channel_id,
                stream_id: self.config.stream_id,
            },
            EcmgMessage::ChannelClose {
                channel_id: self.config.channel_id,
            },
        ];
        for msg in &close {
            if write_message(&mut self.stream, self.config.version, msg).is_err() {
                break;
            }
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for EcmgClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl EcmGenerator for EcmgClient {
    fn delay_start(&self) -> i16 {
        self.delay_start
    }

    fn section_tspkt_flag(&self) -> bool {
        self.section_tspkt_flag
    }

    fn generate_ecm(&mut self, request: EcmRequest) -> Result<Vec<u8>, StageError> {
        let (tx, rx) = mpsc::channel();
        self.submit_ecm(
            request,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        match rx.recv_timeout(SYNC_ECM_TIMEOUT) {
            Ok(Ok(datagram)) => Ok(datagram),
            Ok(Err(msg)) => Err(StageError::Ecmg(msg)),
            Err(_) => Err(StageError::Ecmg("timeout waiting for ECM_response".into())),
        }
    }

    fn submit_ecm(
        &mut self,
        request: EcmRequest,
        callback: EcmCallback,
    ) -> Result<(), StageError> {
        use tspipe_simulcrypt::CpCwCombination;

        let cp_number = request.cp_number;
        self.pending.lock().insert(cp_number, callback);

        let msg = EcmgMessage::CwProvision {
            channel_id: self.config.channel_id,
            stream_id: self.config.stream_id,
            cp_number,
            cw_combinations: vec![
                CpCwCombination {
                    cp_number,
                    cw: request.cw_current,
                },
                CpCwCombination {
                    cp_number: cp_number.wrapping_add(1),
                    cw: request.cw_next,
                },
            ],
            access_criteria: request.access_criteria,
            cp_duration: request.cp_duration,
        };
        if let Err(err) = write_message(&mut self.stream, self.config.version, &msg) {
            self.pending.lock().remove(&cp_number);
            return Err(err);
        }
        Ok(())
    }
}

// Receiver thread: dispatch ECM responses, fail all pending requests on
// connection loss or a protocol error report.
fn receiver_loop(mut stream: TcpStream, version: ProtocolVersion, pending: PendingMap) {
    let reason = loop {
        match read_message(&mut stream, version) {
            Ok(EcmgMessage::EcmResponse {
                cp_number,
                ecm_datagram,
                ..
            }) => match pending.lock().remove(&cp_number) {
                Some(callback) => callback(Ok(ecm_datagram)),
                None => warn!("unexpected ECM_response for crypto period {cp_number}"),
            },
            Ok(EcmgMessage::ChannelError { error_status, .. })
            | Ok(EcmgMessage::StreamError { error_status, .. }) => {
                break format!("ECMG reported error status 0x{error_status:04X}");
            }
            Ok(EcmgMessage::ChannelStatus { .. }) | Ok(EcmgMessage::StreamStatus { .. }) => {
                // Answers to channel_test / stream_test probes.
            }
            Ok(other) => warn!("ignoring unexpected ECMG message: {other:?}"),
            Err(err) => break format!("ECMG connection lost: {err}"),
        }
    };

    let callbacks: Vec<EcmCallback> = pending.lock().drain().map(|(_, cb)| cb).collect();
    if !callbacks.is_empty() {
        error!("{reason} ({} requests failed)", callbacks.len());
    }
    for callback in callbacks {
        callback(Err(reason.clone()));
    }
}

fn write_message(
    stream: &mut TcpStream,
    version: ProtocolVersion,
    msg: &EcmgMessage,
) -> Result<(), StageError> {
    let frame =
        encode_message(version, msg).map_err(|e| StageError::Ecmg(e.to_string()))?;
    stream.write_all(&frame)?;
    Ok(())
}

fn read_message(
    stream: &mut TcpStream,
    version: ProtocolVersion,
) -> Result<EcmgMessage, StageError> {
    let mut frame = vec![0u8; HEADER_SIZE];
    stream.read_exact(&mut frame)?;
    let header = decode_header(version, &frame)
        .map_err(|e| StageError::Ecmg(e.to_string()))?
        .ok_or_else(|| StageError::Ecmg("short ECMG message header".into()))?;
    frame.resize(HEADER_SIZE + header.body_len, 0);
    stream.read_exact(&mut frame[HEADER_SIZE..])?;
    decode_message(version, &frame).map_err(|e| StageError::Ecmg(e.to_string()))
}
