//! Robot wire protocol - command tokens and status classification
//!
//! Commands are single ASCII bytes written to a characteristic. Status updates
//! are UTF-8 text; `IDLE` and `BUSY` (any case, surrounding whitespace ignored)
//! are canonical states, anything else is a free-text robot message.

pub mod ble;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use ble::{CharacteristicRole, RoleSet, RoleSetError};

// Canonical status tokens
pub const STATUS_IDLE: &str = "IDLE";
pub const STATUS_BUSY: &str = "BUSY";

// Arrival confirmation bytes
pub const ARRIVAL_CONFIRM: u8 = b'1';
pub const ARRIVAL_REJECT: u8 = b'0';

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid destination {0:?} (expected one of a, b, c, d)")]
    Destination(String),
    #[error("invalid arrival confirmation {0:?} (expected 0 or 1)")]
    Arrival(String),
    #[error("{0} does not carry commands")]
    NotACommand(CharacteristicRole),
}

/// Destination the robot can be sent to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    A,
    B,
    C,
    D,
}

impl Destination {
    pub const ALL: [Destination; 4] =
        [Destination::A, Destination::B, Destination::C, Destination::D];

    pub fn as_byte(self) -> u8 {
        match self {
            Destination::A => b'a',
            Destination::B => b'b',
            Destination::C => b'c',
            Destination::D => b'd',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'a' => Some(Destination::A),
            b'b' => Some(Destination::B),
            b'c' => Some(Destination::C),
            b'd' => Some(Destination::D),
            _ => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_byte() as char)
    }
}

impl FromStr for Destination {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.as_bytes() {
            [byte] => Self::from_byte(*byte),
            _ => None,
        };
        parsed.ok_or_else(|| TokenError::Destination(s.to_string()))
    }
}

/// Parsed command payload, validated against the role it is written to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPayload {
    Destination(Destination),
    /// `true` confirms arrival (`1`), `false` declines it (`0`)
    Arrival(bool),
}

impl CommandPayload {
    pub fn parse(role: CharacteristicRole, token: &str) -> Result<Self, TokenError> {
        match role {
            CharacteristicRole::Destination => token.parse().map(CommandPayload::Destination),
            CharacteristicRole::ArrivalAck => match token.as_bytes() {
                [ARRIVAL_CONFIRM] => Ok(CommandPayload::Arrival(true)),
                [ARRIVAL_REJECT] => Ok(CommandPayload::Arrival(false)),
                _ => Err(TokenError::Arrival(token.to_string())),
            },
            other => Err(TokenError::NotACommand(other)),
        }
    }

    pub fn role(&self) -> CharacteristicRole {
        match self {
            CommandPayload::Destination(_) => CharacteristicRole::Destination,
            CommandPayload::Arrival(_) => CharacteristicRole::ArrivalAck,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            CommandPayload::Destination(d) => vec![d.as_byte()],
            CommandPayload::Arrival(true) => vec![ARRIVAL_CONFIRM],
            CommandPayload::Arrival(false) => vec![ARRIVAL_REJECT],
        }
    }
}

impl fmt::Display for CommandPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandPayload::Destination(d) => write!(f, "{d}"),
            CommandPayload::Arrival(true) => write!(f, "{}", ARRIVAL_CONFIRM as char),
            CommandPayload::Arrival(false) => write!(f, "{}", ARRIVAL_REJECT as char),
        }
    }
}

/// Canonical robot state as reported over the status characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RobotStatus {
    Idle,
    Busy,
}

impl fmt::Display for RobotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RobotStatus::Idle => f.write_str(STATUS_IDLE),
            RobotStatus::Busy => f.write_str(STATUS_BUSY),
        }
    }
}

/// One decoded status payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReport {
    State(RobotStatus),
    /// Free-text message from the robot, trimmed
    Message(String),
    /// Blank or non UTF-8 payload
    Unrecognized(Vec<u8>),
}

impl StatusReport {
    pub fn classify(payload: &[u8]) -> Self {
        let Ok(text) = std::str::from_utf8(payload) else {
            return StatusReport::Unrecognized(payload.to_vec());
        };
        let text = text.trim();
        if text.eq_ignore_ascii_case(STATUS_IDLE) {
            StatusReport::State(RobotStatus::Idle)
        } else if text.eq_ignore_ascii_case(STATUS_BUSY) {
            StatusReport::State(RobotStatus::Busy)
        } else if text.is_empty() {
            StatusReport::Unrecognized(payload.to_vec())
        } else {
            StatusReport::Message(text.to_string())
        }
    }
}
