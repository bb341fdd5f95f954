//! Session aggregate and what callers observe of it

use robot_proto::{CommandPayload, Destination};
use serde::Serialize;

use crate::command::CommandChannel;
use crate::error::Error;
use crate::lifecycle::{ConnectionState, Lifecycle};
use crate::registry::DiscoveredPeer;
use crate::scan::ScanStopReason;
use crate::status::{RobotState, RobotView};

/// Point-in-time view of the session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub connection: ConnectionState,
    pub robot: RobotState,
    pub selected_destination: Option<Destination>,
    pub command_in_flight: bool,
    pub scanning: bool,
    /// Address of the peer we are connected or connecting to
    pub peer: Option<String>,
    pub destination_selectable: bool,
    pub arrival_confirmable: bool,
    pub last_message: Option<String>,
}

impl SessionState {
    pub fn is_ready(&self) -> bool {
        self.connection == ConnectionState::Ready
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The snapshot changed; one event per handled transition
    StateChanged(SessionState),
    PeerDiscovered(DiscoveredPeer),
    ScanStopped(ScanStopReason),
    /// Free-text message pushed by the robot
    RobotMessage(String),
    CommandCompleted { payload: CommandPayload, result: Result<(), Error> },
    /// The session went back to Idle from a connected or connecting state
    Disconnected { reason: Error },
}

/// Everything the actor mutates on behalf of one connection
pub(crate) struct Session<L, C> {
    pub lifecycle: Lifecycle<L, C>,
    pub robot: RobotView,
    pub commands: CommandChannel,
    /// A recognised push arrived while the initial read was outstanding
    pub synced_by_push: bool,
}

impl<L, C> Default for Session<L, C> {
    fn default() -> Self {
        Self {
            lifecycle: Lifecycle::default(),
            robot: RobotView::default(),
            commands: CommandChannel::default(),
            synced_by_push: false,
        }
    }
}

impl<L, C> Session<L, C> {
    pub fn is_ready(&self) -> bool {
        self.lifecycle.state() == ConnectionState::Ready
    }

    pub fn snapshot(&self, scanning: bool) -> SessionState {
        SessionState {
            connection: self.lifecycle.state(),
            robot: self.robot.state,
            selected_destination: self.robot.selected,
            command_in_flight: self.commands.in_flight(),
            scanning,
            peer: self.lifecycle.peer().map(str::to_string),
            destination_selectable: self.robot.destination_selectable,
            arrival_confirmable: self.robot.arrival_confirmable,
            last_message: self.robot.last_message.clone(),
        }
    }
}
