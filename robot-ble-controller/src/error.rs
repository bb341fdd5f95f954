//! Error types for the session controller
//!
//! Adapters report [`AdapterError`]. Everything a caller of the session sees is
//! an [`Error`]; no error escapes as a panic and the session is always back in
//! either `Idle` or `Ready` by the time one is returned.

use std::fmt;

use robot_proto::{CharacteristicRole, TokenError};

use crate::adapter::Permission;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Radio operation an adapter failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Scan,
    Connect,
    DiscoverServices,
    Write,
    Read,
    SetNotification,
    Disconnect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Scan => "scan",
            Operation::Connect => "connect",
            Operation::DiscoverServices => "service discovery",
            Operation::Write => "characteristic write",
            Operation::Read => "characteristic read",
            Operation::SetNotification => "notification descriptor write",
            Operation::Disconnect => "disconnect",
        })
    }
}

/// Failure reported by a platform BLE adapter
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("Bluetooth is turned off")]
    PoweredOff,
    #[error("link to the robot was lost")]
    LinkLost,
    #[error("{op} failed: {message}")]
    Failed { op: Operation, message: String },
}

impl AdapterError {
    pub fn failed(op: Operation, message: impl fmt::Display) -> Self {
        AdapterError::Failed { op, message: message.to_string() }
    }
}

/// The robot does not speak the protocol variant we expected
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    #[error("robot service not found")]
    MissingService,
    #[error("missing characteristics: {}", join_roles(.0))]
    MissingRoles(Vec<CharacteristicRole>),
    #[error("unrecognized status {0:?}")]
    UnrecognizedStatus(String),
    #[error("{0} is not part of the active protocol variant")]
    RoleNotConfigured(CharacteristicRole),
}

fn join_roles(roles: &[CharacteristicRole]) -> String {
    roles.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(", ")
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{0} permission denied")]
    PermissionDenied(Permission),
    #[error("transport failure: {0}")]
    TransportFailure(#[from] AdapterError),
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(#[from] Mismatch),
    #[error("another command is still in flight")]
    Busy,
    #[error("session is not ready")]
    NotReady,
    #[error("cancelled by disconnect")]
    Cancelled,
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] TokenError),
    #[error("session controller has shut down")]
    Closed,
}

impl Error {
    /// Short sentence suitable for transient user-facing feedback
    pub fn hint(&self) -> &'static str {
        match self {
            Error::PermissionDenied(_) => "Bluetooth permissions are required.",
            Error::TransportFailure(AdapterError::PoweredOff) => "Turn on Bluetooth.",
            Error::TransportFailure(AdapterError::NoAdapter) => "No Bluetooth adapter available.",
            Error::TransportFailure(AdapterError::LinkLost) => "Connection to the robot was lost.",
            Error::TransportFailure(AdapterError::Failed { op: Operation::Write, .. }) => {
                "Sending failed."
            }
            Error::TransportFailure(_) => "Could not talk to the robot.",
            Error::ProtocolMismatch(_) => "This robot is not supported.",
            Error::Busy => "Wait for the previous command to finish.",
            Error::NotReady => "No connection or device not ready.",
            Error::Cancelled => "Disconnected.",
            Error::InvalidPayload(_) => "Invalid command.",
            Error::Closed => "Bluetooth session has stopped.",
        }
    }
}
