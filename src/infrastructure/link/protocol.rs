//! Aircraft wire protocol.
//!
//! Command and response framing for the vehicle's UART-over-BLE service.
//! The opcodes and response codes are matched to the ble_cmd_t and
//! ble_cmd_response_t enums in the aircraft firmware.

use anyhow::Result;
use thiserror::Error;

/// Nordic UART Service UUID advertised by the aircraft.
pub const SERVICE_UUID: u128 = 0x6e400001_b5a3_f393_e0a9_e50e24dcca9e;
/// Write characteristic: commands flow to the aircraft here.
pub const WRITE_CHAR_UUID: u128 = 0x6e400002_b5a3_f393_e0a9_e50e24dcca9e;
/// Notify characteristic: bind/unbind responses come back here.
pub const NOTIFY_CHAR_UUID: u128 = 0x6e400003_b5a3_f393_e0a9_e50e24dcca9e;
/// Client characteristic configuration descriptor.
pub const CCCD_UUID: u128 = 0x00002902_0000_1000_8000_00805f9b34fb;

/// CCCD payload that turns notifications on.
pub const ENABLE_NOTIFICATIONS: [u8; 2] = [0x01, 0x00];

const OPCODE_BIND: u8 = 0x00;
const OPCODE_CONTROL: u8 = 0x01;
const OPCODE_UNBIND: u8 = 0x02;

const RESPONSE_BOUND: u8 = 0x00;
const RESPONSE_ERROR: u8 = 0x01;
const RESPONSE_UNBOUND: u8 = 0x02;

/// Largest frame on the wire (the control frame).
const MAX_FRAME_LEN: usize = 5;

/// A command for the aircraft.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Arm control-command acceptance on the aircraft.
    Bind,
    /// One continuous control frame. Pitch, roll, and yaw ride as signed
    /// bytes.
    Control {
        throttle: u8,
        pitch: i8,
        roll: i8,
        yaw: i8,
    },
    /// Disarm and let go.
    Unbind,
}

/// An encoded command, detached from whatever produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    bytes: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl CommandFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl Command {
    /// Encode into a fresh fixed-size frame.
    pub fn encode(&self) -> CommandFrame {
        let mut bytes = [0u8; MAX_FRAME_LEN];
        let len = match *self {
            Command::Bind => {
                bytes[0] = OPCODE_BIND;
                1
            }
            Command::Control {
                throttle,
                pitch,
                roll,
                yaw,
            } => {
                bytes[0] = OPCODE_CONTROL;
                bytes[1] = throttle;
                bytes[2] = pitch as u8;
                bytes[3] = roll as u8;
                bytes[4] = yaw as u8;
                5
            }
            Command::Unbind => {
                bytes[0] = OPCODE_UNBIND;
                1
            }
        };

        CommandFrame { bytes, len }
    }
}

/// A response notified by the aircraft.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerResponse {
    Bound,
    Error,
    Unbound,
}

/// A notification payload that is not part of the protocol. Fatal upstream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unexpected response of length: {0}")]
    BadLength(usize),
    #[error("Unexpected response value: {0:#04x}")]
    BadValue(u8),
}

impl PeerResponse {
    /// Decode a notification payload: exactly one byte, value in {0, 1, 2}.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != 1 {
            return Err(ProtocolError::BadLength(payload.len()));
        }

        match payload[0] {
            RESPONSE_BOUND => Ok(PeerResponse::Bound),
            RESPONSE_ERROR => Ok(PeerResponse::Error),
            RESPONSE_UNBOUND => Ok(PeerResponse::Unbound),
            other => Err(ProtocolError::BadValue(other)),
        }
    }
}

/// Parse a textual UUID into its 128-bit value.
pub fn parse_uuid(uuid_str: &str) -> Result<u128> {
    let hex = uuid_str.replace('-', "");

    if hex.len() != 32 {
        anyhow::bail!("Invalid UUID format");
    }

    Ok(u128::from_str_radix(&hex, 16)?)
}
