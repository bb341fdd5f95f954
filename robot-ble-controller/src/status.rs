//! Status ingestion: robot state as seen from this side of the link
//!
//! Two sources report state: the one-shot read after notifications are armed
//! and the push notifications that follow. Pushes are authoritative and always
//! override what we assumed locally after a command was acknowledged.

use std::fmt;

use robot_proto::{Destination, RobotStatus, StatusReport};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RobotState {
    #[default]
    Unknown,
    Idle,
    Busy,
}

impl From<RobotStatus> for RobotState {
    fn from(status: RobotStatus) -> Self {
        match status {
            RobotStatus::Idle => RobotState::Idle,
            RobotStatus::Busy => RobotState::Busy,
        }
    }
}

impl fmt::Display for RobotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RobotState::Unknown => "unknown",
            RobotState::Idle => "idle",
            RobotState::Busy => "busy",
        })
    }
}

/// What one status payload did
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Ingested {
    State { status: RobotStatus, changed: bool },
    Message(String),
    Ignored,
}

/// Robot-facing part of the session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RobotView {
    pub state: RobotState,
    pub selected: Option<Destination>,
    pub destination_selectable: bool,
    pub arrival_confirmable: bool,
    pub last_message: Option<String>,
}

impl RobotView {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Apply a canonical state; returns whether `state` changed
    pub fn apply_status(&mut self, status: RobotStatus) -> bool {
        let previous = self.state;
        self.state = status.into();
        match status {
            RobotStatus::Idle => {
                self.selected = None;
                self.destination_selectable = true;
                self.arrival_confirmable = false;
            }
            RobotStatus::Busy => {
                self.destination_selectable = false;
                if previous != RobotState::Busy {
                    self.arrival_confirmable = false;
                }
            }
        }
        previous != self.state
    }

    /// Free text from the robot; while busy it announces arrival
    pub fn apply_message(&mut self, text: String) {
        if self.state == RobotState::Busy {
            self.arrival_confirmable = true;
        }
        self.last_message = Some(text);
    }

    /// Decode and apply one status payload
    pub fn ingest(&mut self, payload: &[u8]) -> Ingested {
        match StatusReport::classify(payload) {
            StatusReport::State(status) => {
                let changed = self.apply_status(status);
                if changed {
                    info!(robot = %self.state, "robot state changed");
                } else {
                    debug!(robot = %self.state, "robot state confirmed");
                }
                Ingested::State { status, changed }
            }
            StatusReport::Message(text) => {
                info!(message = %text, "robot message");
                self.apply_message(text.clone());
                Ingested::Message(text)
            }
            StatusReport::Unrecognized(raw) => {
                warn!(payload = %String::from_utf8_lossy(&raw), "ignoring unrecognized status");
                Ingested::Ignored
            }
        }
    }

    /// Destination write acknowledged: assume busy until a push says otherwise
    pub fn destination_acknowledged(&mut self, destination: Destination) {
        self.selected = Some(destination);
        self.state = RobotState::Busy;
        self.destination_selectable = false;
        self.arrival_confirmable = false;
    }

    /// Arrival confirmation acknowledged, whichever answer was sent
    pub fn arrival_acknowledged(&mut self) {
        self.apply_status(RobotStatus::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_idle() -> RobotView {
        let mut view = RobotView::default();
        view.apply_status(RobotStatus::Idle);
        view
    }

    #[test]
    fn busy_then_idle_push() {
        let mut view = ready_idle();
        assert!(view.destination_selectable);

        assert_eq!(
            view.ingest(b"BUSY"),
            Ingested::State { status: RobotStatus::Busy, changed: true }
        );
        assert_eq!(view.state, RobotState::Busy);
        assert!(!view.destination_selectable);

        view.selected = Some(Destination::C);
        assert_eq!(
            view.ingest(b"idle\n"),
            Ingested::State { status: RobotStatus::Idle, changed: true }
        );
        assert_eq!(view.state, RobotState::Idle);
        assert!(view.destination_selectable);
        assert_eq!(view.selected, None);
    }

    #[test]
    fn destination_ack_is_provisional() {
        let mut view = ready_idle();
        view.destination_acknowledged(Destination::B);
        assert_eq!(view.state, RobotState::Busy);
        assert_eq!(view.selected, Some(Destination::B));

        // confirming push changes nothing
        let before = view.clone();
        assert_eq!(
            view.ingest(b"BUSY"),
            Ingested::State { status: RobotStatus::Busy, changed: false }
        );
        assert_eq!(view, before);

        // a contradicting push wins
        view.ingest(b"IDLE");
        assert_eq!(view.state, RobotState::Idle);
        assert_eq!(view.selected, None);
    }

    #[test]
    fn arrival_message_enables_confirmation_only_while_busy() {
        let mut view = ready_idle();
        assert_eq!(view.ingest(b"Hello"), Ingested::Message("Hello".to_string()));
        assert!(!view.arrival_confirmable);
        assert_eq!(view.state, RobotState::Idle);

        view.destination_acknowledged(Destination::A);
        view.ingest(b"Arrived at a");
        assert!(view.arrival_confirmable);
        assert_eq!(view.state, RobotState::Busy);
        assert_eq!(view.last_message.as_deref(), Some("Arrived at a"));

        view.arrival_acknowledged();
        assert_eq!(view.state, RobotState::Idle);
        assert!(!view.arrival_confirmable);
        assert!(view.destination_selectable);
    }

    #[test]
    fn unrecognized_payload_changes_nothing() {
        let mut view = ready_idle();
        view.destination_acknowledged(Destination::D);
        let before = view.clone();
        assert_eq!(view.ingest(b"  "), Ingested::Ignored);
        assert_eq!(view.ingest(&[0xc3, 0x28]), Ingested::Ignored);
        assert_eq!(view, before);
    }
}
