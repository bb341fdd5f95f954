//! BLE GATT identifiers for the robot service
//!
//! The robot exposes one well-known service. Each protocol revision exposes a
//! different subset of characteristics inside it, so the set of roles a client
//! needs is a [`RoleSet`] chosen at connection time rather than a constant.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Robot service UUID: 6e400001-b5a3-f393-e0a9-e50e24dcca9e
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Destination selection characteristic (write, one byte `a`..`d`)
pub const DESTINATION_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Arrival confirmation characteristic (write, one byte `0` or `1`)
pub const ARRIVAL_ACK_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Status characteristic (notify, UTF-8 text)
pub const STATUS_PUSH_UUID: Uuid = Uuid::from_u128(0x6e400004_b5a3_f393_e0a9_e50e24dcca9e);

/// Status characteristic (read, UTF-8 text)
pub const STATUS_READ_UUID: Uuid = Uuid::from_u128(0x6e400005_b5a3_f393_e0a9_e50e24dcca9e);

/// Semantic purpose of a characteristic inside the robot service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacteristicRole {
    Destination,
    ArrivalAck,
    StatusPush,
    StatusRead,
}

impl CharacteristicRole {
    pub const ALL: [CharacteristicRole; 4] = [
        CharacteristicRole::Destination,
        CharacteristicRole::ArrivalAck,
        CharacteristicRole::StatusPush,
        CharacteristicRole::StatusRead,
    ];

    /// Characteristic UUID this role is addressed by
    pub fn uuid(self) -> Uuid {
        match self {
            CharacteristicRole::Destination => DESTINATION_UUID,
            CharacteristicRole::ArrivalAck => ARRIVAL_ACK_UUID,
            CharacteristicRole::StatusPush => STATUS_PUSH_UUID,
            CharacteristicRole::StatusRead => STATUS_READ_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == uuid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CharacteristicRole::Destination => "destination",
            CharacteristicRole::ArrivalAck => "arrival_ack",
            CharacteristicRole::StatusPush => "status_push",
            CharacteristicRole::StatusRead => "status_read",
        }
    }
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoleSetError {
    #[error("unknown protocol preset {0:?} (expected minimal, standard or full)")]
    UnknownPreset(String),
    #[error("protocol variant must include the {0} role")]
    MissingRole(CharacteristicRole),
}

/// Roles that must resolve after service discovery for a protocol variant
///
/// Deserializes from a preset name (`"minimal"`, `"standard"`, `"full"`) or
/// from an explicit list of roles. `Destination` and `StatusPush` are always
/// required: without them there is nothing to command and nothing to sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RoleSetRepr", into = "RoleSetRepr")]
pub struct RoleSet {
    roles: BTreeSet<CharacteristicRole>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RoleSetRepr {
    Preset(String),
    Roles(Vec<CharacteristicRole>),
}

impl RoleSet {
    /// Destination writes and status pushes only
    pub fn minimal() -> Self {
        Self::from_roles([CharacteristicRole::Destination, CharacteristicRole::StatusPush])
    }

    /// Adds arrival confirmation; status is synced by reading the push characteristic
    pub fn standard() -> Self {
        Self::from_roles([
            CharacteristicRole::Destination,
            CharacteristicRole::ArrivalAck,
            CharacteristicRole::StatusPush,
        ])
    }

    /// All four roles, with a dedicated status read characteristic
    pub fn full() -> Self {
        Self::from_roles(CharacteristicRole::ALL)
    }

    pub fn preset(name: &str) -> Result<Self, RoleSetError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "minimal" => Ok(Self::minimal()),
            "standard" => Ok(Self::standard()),
            "full" => Ok(Self::full()),
            _ => Err(RoleSetError::UnknownPreset(name.to_string())),
        }
    }

    pub fn new(roles: impl IntoIterator<Item = CharacteristicRole>) -> Result<Self, RoleSetError> {
        let set = Self::from_roles(roles);
        for required in [CharacteristicRole::Destination, CharacteristicRole::StatusPush] {
            if !set.contains(required) {
                return Err(RoleSetError::MissingRole(required));
            }
        }
        Ok(set)
    }

    fn from_roles(roles: impl IntoIterator<Item = CharacteristicRole>) -> Self {
        Self { roles: roles.into_iter().collect() }
    }

    pub fn contains(&self, role: CharacteristicRole) -> bool {
        self.roles.contains(&role)
    }

    pub fn iter(&self) -> impl Iterator<Item = CharacteristicRole> + '_ {
        self.roles.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Role whose characteristic answers the initial status read
    pub fn status_source(&self) -> CharacteristicRole {
        if self.contains(CharacteristicRole::StatusRead) {
            CharacteristicRole::StatusRead
        } else {
            CharacteristicRole::StatusPush
        }
    }

    /// Name of the matching preset, if any
    pub fn preset_name(&self) -> Option<&'static str> {
        [("minimal", Self::minimal()), ("standard", Self::standard()), ("full", Self::full())]
            .into_iter()
            .find(|(_, preset)| preset == self)
            .map(|(name, _)| name)
    }
}

impl Default for RoleSet {
    fn default() -> Self {
        Self::full()
    }
}

impl TryFrom<RoleSetRepr> for RoleSet {
    type Error = RoleSetError;

    fn try_from(repr: RoleSetRepr) -> Result<Self, Self::Error> {
        match repr {
            RoleSetRepr::Preset(name) => Self::preset(&name),
            RoleSetRepr::Roles(roles) => Self::new(roles),
        }
    }
}

impl From<RoleSet> for RoleSetRepr {
    fn from(set: RoleSet) -> Self {
        match set.preset_name() {
            Some(name) => RoleSetRepr::Preset(name.to_string()),
            None => RoleSetRepr::Roles(set.iter().collect()),
        }
    }
}
