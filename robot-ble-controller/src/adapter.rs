//! Seams to the platform: the BLE radio and the permission system
//!
//! The controller never touches a radio API directly. Platform crates (or the
//! bundled [`crate::sim::SimAdapter`] and the `btleplug` backend) implement
//! [`BleAdapter`]; every call is a single-shot operation the controller issues
//! once and never retries.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::AdapterError;

/// An advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Something that happened on an established link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A characteristic value pushed by the peer
    Notification { uuid: Uuid, value: Vec<u8> },
    /// The link dropped without us asking
    Disconnected,
}

/// Scan restrictions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only peers whose advertised name starts with this prefix
    pub name_prefix: Option<String>,
}

impl ScanFilter {
    pub fn matches(&self, name: Option<&str>) -> bool {
        match (&self.name_prefix, name) {
            (None, _) => true,
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            (Some(_), None) => false,
        }
    }
}

/// Characteristics found inside the robot service, keyed by UUID
pub type ServiceMap<C> = HashMap<Uuid, C>;

/// Platform BLE central
///
/// `Link` is the handle of one connection, `Characteristic` the handle of one
/// characteristic on it. Both are opaque to the controller.
#[async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    type Link: Clone + Send + Sync + 'static;
    type Characteristic: Clone + Send + Sync + 'static;

    /// Whether the radio is switched on
    async fn is_powered(&self) -> Result<bool, AdapterError>;

    /// Start discovery; the stream yields every advertisement, duplicates included
    async fn scan(
        &self,
        filter: &ScanFilter,
    ) -> Result<BoxStream<'static, PeerEvent>, AdapterError>;

    async fn stop_scan(&self) -> Result<(), AdapterError>;

    async fn connect(&self, address: &str) -> Result<Self::Link, AdapterError>;

    /// Characteristics of `service`, or `None` when the peer does not expose it
    async fn discover_services(
        &self,
        link: &Self::Link,
        service: Uuid,
    ) -> Result<Option<ServiceMap<Self::Characteristic>>, AdapterError>;

    /// Write with response; resolves once the peer acknowledged the write
    async fn write_characteristic(
        &self,
        link: &Self::Link,
        characteristic: &Self::Characteristic,
        value: &[u8],
    ) -> Result<(), AdapterError>;

    async fn read_characteristic(
        &self,
        link: &Self::Link,
        characteristic: &Self::Characteristic,
    ) -> Result<Vec<u8>, AdapterError>;

    /// Write the notification descriptor of `characteristic`
    async fn set_notification(
        &self,
        link: &Self::Link,
        characteristic: &Self::Characteristic,
        enabled: bool,
    ) -> Result<(), AdapterError>;

    /// Notifications and link loss for `link`, in delivery order
    ///
    /// The stream ending is treated the same as [`LinkEvent::Disconnected`].
    async fn link_events(
        &self,
        link: &Self::Link,
    ) -> Result<BoxStream<'static, LinkEvent>, AdapterError>;

    async fn disconnect(&self, link: &Self::Link) -> Result<(), AdapterError>;
}

/// Runtime permission the platform may withhold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Scan,
    Connect,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Scan => f.write_str("Bluetooth scan"),
            Permission::Connect => f.write_str("Bluetooth connect"),
        }
    }
}

/// Checked before every scan, connect and write; denial fails the operation at once
pub trait PermissionGate: Send + Sync + 'static {
    fn is_granted(&self, permission: Permission) -> bool;
}

/// Gate for platforms without runtime permissions
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionGate for AllowAll {
    fn is_granted(&self, _permission: Permission) -> bool {
        true
    }
}
