//! In-memory robot: a [`BleAdapter`] with no radio behind it
//!
//! Used by the tests and by `robot-ble --sim`. Every knob can be turned while a
//! session is running: fail an operation, hold write completions until
//! released, push status text, drop the link.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use futures::stream::BoxStream;
use robot_proto::ble::{ARRIVAL_ACK_UUID, DESTINATION_UUID, STATUS_PUSH_UUID};
use robot_proto::{CharacteristicRole, Destination, STATUS_BUSY, STATUS_IDLE};
use tokio::sync::{Notify, oneshot};
use uuid::Uuid;

use crate::adapter::{
    BleAdapter, LinkEvent, PeerEvent, Permission, PermissionGate, ScanFilter, ServiceMap,
};
use crate::error::{AdapterError, Operation};

/// Handle of one simulated connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimLink {
    pub address: String,
    session: u64,
}

struct SimState {
    powered: bool,
    peers: Vec<PeerEvent>,
    exposed: Vec<CharacteristicRole>,
    service_present: bool,
    status: Vec<u8>,
    announce_on_subscribe: Option<Vec<u8>>,
    failing: HashSet<Operation>,
    stalled: HashSet<Operation>,
    hold_writes: bool,
    held: VecDeque<oneshot::Sender<Result<(), AdapterError>>>,
    writes: Vec<(Uuid, Vec<u8>)>,
    calls: Vec<Operation>,
    session: u64,
    connected: Option<String>,
    notifying: bool,
    link_tx: Option<mpsc::UnboundedSender<LinkEvent>>,
    link_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    autopilot: Option<Duration>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            powered: true,
            peers: Vec::new(),
            exposed: CharacteristicRole::ALL.to_vec(),
            service_present: true,
            status: STATUS_IDLE.as_bytes().to_vec(),
            announce_on_subscribe: None,
            failing: HashSet::new(),
            stalled: HashSet::new(),
            hold_writes: false,
            held: VecDeque::new(),
            writes: Vec::new(),
            calls: Vec::new(),
            session: 0,
            connected: None,
            notifying: false,
            link_tx: None,
            link_rx: None,
            autopilot: None,
        }
    }
}

impl SimState {
    fn call(&mut self, op: Operation) -> Result<(), AdapterError> {
        self.calls.push(op);
        if self.failing.contains(&op) {
            return Err(AdapterError::failed(op, "simulated failure"));
        }
        Ok(())
    }

    fn check_link(&self, link: &SimLink) -> Result<(), AdapterError> {
        if self.connected.is_some() && self.session == link.session {
            Ok(())
        } else {
            Err(AdapterError::LinkLost)
        }
    }

    fn push(&self, value: &[u8]) -> bool {
        match (&self.link_tx, self.notifying) {
            (Some(tx), true) => {
                let event =
                    LinkEvent::Notification { uuid: STATUS_PUSH_UUID, value: value.to_vec() };
                tx.unbounded_send(event).is_ok()
            }
            _ => false,
        }
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<SimState>,
    writes_changed: Notify,
}

/// Simulated robot; clones share the same robot
#[derive(Clone, Default)]
pub struct SimAdapter {
    inner: Arc<Inner>,
}

impl SimAdapter {
    /// Powered radio, all four roles exposed, robot idle, nothing in range
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_peer(self, address: &str, name: Option<&str>) -> Self {
        self.lock().peers.push(PeerEvent {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi: Some(-55),
        });
        self
    }

    /// Roles the robot's service exposes
    pub fn with_roles(self, roles: &[CharacteristicRole]) -> Self {
        self.lock().exposed = roles.to_vec();
        self
    }

    /// The robot service is absent altogether
    pub fn without_service(self) -> Self {
        self.lock().service_present = false;
        self
    }

    /// Value returned by status reads
    pub fn with_status(self, status: &str) -> Self {
        self.lock().status = status.as_bytes().to_vec();
        self
    }

    /// Push `status` as soon as notifications are enabled
    pub fn with_announcement(self, status: &str) -> Self {
        self.lock().announce_on_subscribe = Some(status.as_bytes().to_vec());
        self
    }

    /// React to commands like a real robot: BUSY on a destination, an arrival
    /// message after `travel`, IDLE once arrival is confirmed
    pub fn with_autopilot(self, travel: Duration) -> Self {
        self.lock().autopilot = Some(travel);
        self
    }

    pub fn set_powered(&self, powered: bool) {
        self.lock().powered = powered;
    }

    /// Make every future `op` fail
    pub fn fail(&self, op: Operation) {
        self.lock().failing.insert(op);
    }

    /// Make every future `op` hang forever
    pub fn stall(&self, op: Operation) {
        self.lock().stalled.insert(op);
    }

    /// Undo [`fail`](Self::fail) and [`stall`](Self::stall) for `op`
    pub fn recover(&self, op: Operation) {
        let mut state = self.lock();
        state.failing.remove(&op);
        state.stalled.remove(&op);
    }

    /// Park write completions until [`release_write`](Self::release_write)
    pub fn hold_writes(&self, hold: bool) {
        self.lock().hold_writes = hold;
    }

    /// Complete the oldest parked write; false when nothing is parked
    pub fn release_write(&self, result: Result<(), AdapterError>) -> bool {
        match self.lock().held.pop_front() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Notify status text; false when nobody is subscribed
    pub fn push_status(&self, text: &str) -> bool {
        self.lock().push(text.as_bytes())
    }

    /// Drop the link from the robot's side
    pub fn drop_link(&self) -> bool {
        let mut state = self.lock();
        state.connected = None;
        state.notifying = false;
        match state.link_tx.take() {
            Some(tx) => tx.unbounded_send(LinkEvent::Disconnected).is_ok(),
            None => false,
        }
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.lock().writes.clone()
    }

    /// Every adapter operation issued so far, in order
    pub fn calls(&self) -> Vec<Operation> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: Operation) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub fn connected(&self) -> Option<String> {
        self.lock().connected.clone()
    }

    /// Record `op`, then fail or hang it if asked to
    async fn enter(&self, op: Operation) -> Result<(), AdapterError> {
        let stalled = {
            let mut state = self.lock();
            state.call(op)?;
            state.stalled.contains(&op)
        };
        if stalled {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    /// Resolves once at least `count` writes have been issued
    pub async fn wait_for_writes(&self, count: usize) {
        loop {
            let changed = self.inner.writes_changed.notified();
            if self.lock().writes.len() >= count {
                return;
            }
            changed.await;
        }
    }

    fn react(&self, uuid: Uuid, value: &[u8]) {
        let Some(travel) = self.lock().autopilot else {
            return;
        };
        if uuid == DESTINATION_UUID {
            let destination = value.first().copied().and_then(Destination::from_byte);
            let robot = self.clone();
            tokio::spawn(async move {
                robot.set_and_push(STATUS_BUSY);
                tokio::time::sleep(travel).await;
                if let Some(destination) = destination {
                    robot.push_status(&format!("Arrived at {destination}"));
                }
            });
        } else if uuid == ARRIVAL_ACK_UUID {
            self.set_and_push(STATUS_IDLE);
        }
    }

    fn set_and_push(&self, status: &str) {
        let mut state = self.lock();
        state.status = status.as_bytes().to_vec();
        state.push(status.as_bytes());
    }
}

#[async_trait]
impl BleAdapter for SimAdapter {
    type Link = SimLink;
    type Characteristic = Uuid;

    async fn is_powered(&self) -> Result<bool, AdapterError> {
        Ok(self.lock().powered)
    }

    async fn scan(
        &self,
        _filter: &ScanFilter,
    ) -> Result<BoxStream<'static, PeerEvent>, AdapterError> {
        self.enter(Operation::Scan).await?;
        let peers = self.lock().peers.clone();
        Ok(futures::stream::iter(peers).chain(futures::stream::pending()).boxed())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<SimLink, AdapterError> {
        self.enter(Operation::Connect).await?;
        let mut state = self.lock();
        if !state.peers.iter().any(|p| p.address == address) {
            let reason = format!("{address} is not in range");
            return Err(AdapterError::failed(Operation::Connect, reason));
        }
        let (tx, rx) = mpsc::unbounded();
        state.session += 1;
        state.connected = Some(address.to_string());
        state.notifying = false;
        state.link_tx = Some(tx);
        state.link_rx = Some(rx);
        Ok(SimLink { address: address.to_string(), session: state.session })
    }

    async fn discover_services(
        &self,
        link: &SimLink,
        service: Uuid,
    ) -> Result<Option<ServiceMap<Uuid>>, AdapterError> {
        self.enter(Operation::DiscoverServices).await?;
        let state = self.lock();
        state.check_link(link)?;
        if !state.service_present || service != robot_proto::ble::SERVICE_UUID {
            return Ok(None);
        }
        Ok(Some(state.exposed.iter().map(|r| (r.uuid(), r.uuid())).collect()))
    }

    async fn write_characteristic(
        &self,
        link: &SimLink,
        characteristic: &Uuid,
        value: &[u8],
    ) -> Result<(), AdapterError> {
        let held = {
            let mut state = self.lock();
            state.writes.push((*characteristic, value.to_vec()));
            self.inner.writes_changed.notify_waiters();
            state.call(Operation::Write)?;
            state.check_link(link)?;
            if state.hold_writes {
                let (tx, rx) = oneshot::channel();
                state.held.push_back(tx);
                Some(rx)
            } else {
                None
            }
        };

        if let Some(rx) = held {
            rx.await.map_err(|_| AdapterError::LinkLost)??;
        }
        self.react(*characteristic, value);
        Ok(())
    }

    async fn read_characteristic(
        &self,
        link: &SimLink,
        _characteristic: &Uuid,
    ) -> Result<Vec<u8>, AdapterError> {
        self.enter(Operation::Read).await?;
        let state = self.lock();
        state.check_link(link)?;
        Ok(state.status.clone())
    }

    async fn set_notification(
        &self,
        link: &SimLink,
        characteristic: &Uuid,
        enabled: bool,
    ) -> Result<(), AdapterError> {
        self.enter(Operation::SetNotification).await?;
        let mut state = self.lock();
        state.check_link(link)?;
        if *characteristic == STATUS_PUSH_UUID {
            state.notifying = enabled;
            if let Some(announcement) = state.announce_on_subscribe.clone().filter(|_| enabled) {
                state.push(&announcement);
            }
        }
        Ok(())
    }

    async fn link_events(
        &self,
        link: &SimLink,
    ) -> Result<BoxStream<'static, LinkEvent>, AdapterError> {
        let mut state = self.lock();
        state.check_link(link)?;
        match state.link_rx.take() {
            Some(rx) => Ok(rx.boxed()),
            None => Err(AdapterError::failed(Operation::Connect, "link events already taken")),
        }
    }

    async fn disconnect(&self, link: &SimLink) -> Result<(), AdapterError> {
        let mut state = self.lock();
        state.calls.push(Operation::Disconnect);
        if state.session == link.session {
            state.connected = None;
            state.notifying = false;
            state.link_tx = None;
        }
        Ok(())
    }
}

/// Permission gate whose answers can be flipped at runtime; clones share state
#[derive(Clone)]
pub struct SimPermissions {
    scan: Arc<AtomicBool>,
    connect: Arc<AtomicBool>,
}

impl Default for SimPermissions {
    fn default() -> Self {
        Self { scan: Arc::new(AtomicBool::new(true)), connect: Arc::new(AtomicBool::new(true)) }
    }
}

impl SimPermissions {
    fn flag(&self, permission: Permission) -> &AtomicBool {
        match permission {
            Permission::Scan => &self.scan,
            Permission::Connect => &self.connect,
        }
    }

    pub fn deny(&self, permission: Permission) {
        self.flag(permission).store(false, Ordering::SeqCst);
    }

    pub fn grant(&self, permission: Permission) {
        self.flag(permission).store(true, Ordering::SeqCst);
    }
}

impl PermissionGate for SimPermissions {
    fn is_granted(&self, permission: Permission) -> bool {
        self.flag(permission).load(Ordering::SeqCst)
    }
}
