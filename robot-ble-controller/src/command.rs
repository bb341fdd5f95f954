//! Command channel: at most one write in flight across the whole session
//!
//! Requests are never queued. A submit either fails right away (`NotReady`,
//! `Busy`) or occupies the single pending slot until exactly one completion
//! with the matching command id frees it.

use std::time::Duration;

use robot_proto::{CharacteristicRole, CommandPayload};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// A write requested by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: u64,
    pub payload: CommandPayload,
    pub issued_at: Instant,
}

impl Command {
    pub fn role(&self) -> CharacteristicRole {
        self.payload.role()
    }
}

/// Successful completion of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub role: CharacteristicRole,
    pub payload: CommandPayload,
    /// Time from issuing the write to the peer's acknowledgement
    pub latency: Duration,
}

pub(crate) struct PendingWrite {
    pub command: Command,
    pub reply: oneshot::Sender<Result<Ack>>,
}

impl PendingWrite {
    pub fn ack(&self) -> Ack {
        Ack {
            role: self.command.role(),
            payload: self.command.payload,
            latency: self.command.issued_at.elapsed(),
        }
    }
}

#[derive(Default)]
pub(crate) struct CommandChannel {
    next_id: u64,
    pending: Option<PendingWrite>,
}

impl CommandChannel {
    pub fn in_flight(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&Command> {
        self.pending.as_ref().map(|p| &p.command)
    }

    /// Preconditions of a submit, in the order they are reported
    pub fn admit(&self, ready: bool) -> Result<()> {
        if !ready {
            return Err(Error::NotReady);
        }
        if self.in_flight() {
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Occupy the pending slot
    pub fn begin(
        &mut self,
        payload: CommandPayload,
        reply: oneshot::Sender<Result<Ack>>,
    ) -> Command {
        debug_assert!(self.pending.is_none());
        self.next_id += 1;
        let command = Command { id: self.next_id, payload, issued_at: Instant::now() };
        self.pending = Some(PendingWrite { command: command.clone(), reply });
        command
    }

    /// Free the slot if `id` is the write we are waiting for; stale ids leave it untouched
    pub fn complete(&mut self, id: u64) -> Option<PendingWrite> {
        match &self.pending {
            Some(pending) if pending.command.id == id => self.pending.take(),
            _ => None,
        }
    }

    /// Free the slot unconditionally (teardown)
    pub fn abandon(&mut self) -> Option<PendingWrite> {
        self.pending.take()
    }
}
