//! Connection lifecycle: the per-peer state machine
//!
//! ```text
//! Idle -> Connecting -> ServicesFound -> NotifyArmed -> Syncing -> Ready
//!   ^         |              |               |            |         |
//!   +---------+--------------+---------------+------------+---------+  teardown
//! ```
//!
//! Each connection attempt has a number. Teardown bumps it, which turns every
//! completion still in flight for the old attempt into a no-op.

use std::collections::HashMap;
use std::fmt;

use robot_proto::{CharacteristicRole, RoleSet};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::adapter::ServiceMap;
use crate::error::{Mismatch, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    ServicesFound,
    NotifyArmed,
    Syncing,
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ServicesFound => "services found",
            ConnectionState::NotifyArmed => "notifications armed",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Ready => "ready",
        })
    }
}

/// Characteristic handles resolved for the active protocol variant
#[derive(Debug, Clone)]
pub struct RoleBindings<C> {
    handles: HashMap<CharacteristicRole, C>,
}

impl<C> Default for RoleBindings<C> {
    fn default() -> Self {
        Self { handles: HashMap::new() }
    }
}

impl<C> RoleBindings<C> {
    /// Bind every role in `required`; any gap fails the whole resolution
    pub fn resolve(required: &RoleSet, services: Option<ServiceMap<C>>) -> Result<Self, Mismatch> {
        let Some(mut services) = services else {
            return Err(Mismatch::MissingService);
        };

        let missing: Vec<_> =
            required.iter().filter(|r| !services.contains_key(&r.uuid())).collect();
        if !missing.is_empty() {
            return Err(Mismatch::MissingRoles(missing));
        }

        let handles = required
            .iter()
            .filter_map(|role| services.remove(&role.uuid()).map(|handle| (role, handle)))
            .collect();
        Ok(Self { handles })
    }

    pub fn get(&self, role: CharacteristicRole) -> Option<&C> {
        self.handles.get(&role)
    }

    /// Role bound to the characteristic with `uuid`
    pub fn role_of(&self, uuid: uuid::Uuid) -> Option<CharacteristicRole> {
        CharacteristicRole::from_uuid(uuid).filter(|role| self.handles.contains_key(role))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// What teardown released
pub(crate) struct Released<L> {
    pub link: Option<L>,
    pub waiter: Option<oneshot::Sender<Result<()>>>,
    pub was_active: bool,
}

pub(crate) struct Lifecycle<L, C> {
    state: ConnectionState,
    attempt: u64,
    peer: Option<String>,
    link: Option<L>,
    bindings: RoleBindings<C>,
    link_task: Option<JoinHandle<()>>,
    waiter: Option<oneshot::Sender<Result<()>>>,
}

impl<L, C> Default for Lifecycle<L, C> {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            peer: None,
            link: None,
            bindings: RoleBindings::default(),
            link_task: None,
            waiter: None,
        }
    }
}

impl<L, C> Lifecycle<L, C> {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn is_current(&self, attempt: u64) -> bool {
        self.state != ConnectionState::Idle && self.attempt == attempt
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn link(&self) -> Option<&L> {
        self.link.as_ref()
    }

    pub fn binding(&self, role: CharacteristicRole) -> Option<&C> {
        self.bindings.get(role)
    }

    pub fn bindings(&self) -> &RoleBindings<C> {
        &self.bindings
    }

    /// Idle -> Connecting. `waiter` is answered when the attempt reaches Ready or dies.
    pub fn begin(&mut self, address: String, waiter: oneshot::Sender<Result<()>>) -> u64 {
        debug_assert_eq!(self.state, ConnectionState::Idle);
        self.attempt += 1;
        self.state = ConnectionState::Connecting;
        self.peer = Some(address);
        self.waiter = Some(waiter);
        self.attempt
    }

    /// Connecting -> ServicesFound
    pub fn connected(&mut self, link: L, link_task: JoinHandle<()>) {
        debug_assert_eq!(self.state, ConnectionState::Connecting);
        self.state = ConnectionState::ServicesFound;
        self.link = Some(link);
        self.link_task = Some(link_task);
    }

    /// ServicesFound -> NotifyArmed
    pub fn resolved(&mut self, bindings: RoleBindings<C>) {
        debug_assert_eq!(self.state, ConnectionState::ServicesFound);
        self.state = ConnectionState::NotifyArmed;
        self.bindings = bindings;
    }

    /// NotifyArmed -> Syncing
    pub fn armed(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::NotifyArmed);
        self.state = ConnectionState::Syncing;
    }

    /// Syncing -> Ready; hands back the caller waiting on this attempt
    pub fn synced(&mut self) -> Option<oneshot::Sender<Result<()>>> {
        debug_assert_eq!(self.state, ConnectionState::Syncing);
        self.state = ConnectionState::Ready;
        self.waiter.take()
    }

    /// Any state -> Idle. Idempotent: tearing down an idle lifecycle releases nothing.
    pub fn teardown(&mut self) -> Released<L> {
        let was_active = self.state != ConnectionState::Idle;
        if was_active {
            self.attempt += 1;
        }
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        self.state = ConnectionState::Idle;
        self.peer = None;
        self.bindings = RoleBindings::default();
        Released { link: self.link.take(), waiter: self.waiter.take(), was_active }
    }
}

impl<L, C> Drop for Lifecycle<L, C> {
    fn drop(&mut self) {
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
    }
}
