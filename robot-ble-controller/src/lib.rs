//! Robot BLE Controller
//!
//! BLE session controller for the destination-delivery robot: discovers the
//! robot, walks the connection through service discovery, notification setup
//! and the initial status read, then sends destination and arrival commands
//! one at a time while status pushes keep the local view current.
//!
//! # Example
//!
//! ```ignore
//! use robot_ble_controller::{AllowAll, SessionConfig, SessionController};
//! use robot_ble_controller::ble::BtleplugAdapter;
//! use robot_proto::Destination;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = BtleplugAdapter::new().await?;
//!     let session = SessionController::spawn(adapter, AllowAll, SessionConfig::default());
//!
//!     // Scan, then pick the first robot
//!     session.start_scan().await?;
//!     let mut events = session.subscribe();
//!     let _ = events.recv().await?;
//!     let peer = session.peers().await?.remove(0);
//!
//!     // Resolves once the robot's state is known
//!     session.connect(peer.address).await?;
//!     session.select_destination(Destination::B).await?;
//!
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod scan;
pub mod session;
pub mod sim;
pub mod status;

#[cfg(feature = "btleplug")]
pub mod ble;

pub use adapter::{
    AllowAll, BleAdapter, LinkEvent, PeerEvent, Permission, PermissionGate, ScanFilter,
};
pub use command::Ack;
pub use config::SessionConfig;
pub use controller::{SessionController, SessionHandle};
pub use error::{AdapterError, Error, Mismatch, Operation, Result};
pub use lifecycle::ConnectionState;
pub use registry::DiscoveredPeer;
pub use scan::ScanStopReason;
pub use session::{SessionEvent, SessionState};
pub use status::RobotState;
