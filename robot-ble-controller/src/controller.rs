//! Session controller actor and the handle callers talk to it through
//!
//! One task owns every piece of session state. Callers send [`Intent`]s through
//! a [`SessionHandle`]; adapter work runs in spawned tasks that report back as
//! [`Radio`] messages tagged with the scan cycle, connection attempt or command
//! id they belong to. A message whose tag is no longer current is dropped, so a
//! late completion can never touch a newer session.
//!
//! After each message the actor publishes a fresh [`SessionState`] snapshot and
//! only then answers the callers whose requests that message settled.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use robot_proto::ble::SERVICE_UUID;
use robot_proto::{CharacteristicRole, CommandPayload, Destination, StatusReport};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{
    BleAdapter, LinkEvent, PeerEvent, Permission, PermissionGate, ScanFilter, ServiceMap,
};
use crate::command::Ack;
use crate::config::SessionConfig;
use crate::error::{AdapterError, Error, Mismatch, Result};
use crate::lifecycle::{ConnectionState, RoleBindings};
use crate::registry::{DeviceRegistry, DiscoveredPeer};
use crate::scan::{ScanController, ScanStopReason};
use crate::session::{Session, SessionEvent, SessionState};
use crate::status::Ingested;

const MAILBOX_CAPACITY: usize = 32;

/// Requests from a [`SessionHandle`]
pub(crate) enum Intent {
    StartScan {
        filter: Option<ScanFilter>,
        reply: oneshot::Sender<Result<()>>,
    },
    StopScan(oneshot::Sender<()>),
    Peers(oneshot::Sender<Vec<DiscoveredPeer>>),
    Connect {
        address: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Submit {
        role: CharacteristicRole,
        token: String,
        reply: oneshot::Sender<Result<Ack>>,
    },
    Disconnect(oneshot::Sender<()>),
}

/// Completions and events from the radio side
pub(crate) enum Radio<A: BleAdapter> {
    PeerFound { cycle: u64, event: PeerEvent },
    ScanTimedOut { cycle: u64 },
    ScanEnded { cycle: u64 },
    Connected {
        attempt: u64,
        result: Result<A::Link, AdapterError>,
    },
    ServicesDiscovered {
        attempt: u64,
        result: Result<Option<ServiceMap<A::Characteristic>>, AdapterError>,
    },
    NotifyArmed { attempt: u64, result: Result<(), AdapterError> },
    StatusRead { attempt: u64, result: Result<Vec<u8>, AdapterError> },
    WriteDone {
        attempt: u64,
        command: u64,
        result: Result<(), AdapterError>,
    },
    Link { attempt: u64, event: LinkEvent },
}

type Reply = Box<dyn FnOnce() + Send>;

/// Single writer of the session state
pub struct SessionController<A: BleAdapter, G: PermissionGate> {
    adapter: Arc<A>,
    gate: G,
    config: SessionConfig,
    registry: DeviceRegistry,
    scan: ScanController,
    session: Session<A::Link, A::Characteristic>,
    radio: mpsc::Sender<Radio<A>>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    replies: Vec<Reply>,
}

impl<A: BleAdapter, G: PermissionGate> SessionController<A, G> {
    /// Start the actor on the current tokio runtime
    ///
    /// The actor runs until every clone of the returned handle is dropped.
    pub fn spawn(adapter: A, gate: G, config: SessionConfig) -> SessionHandle {
        let (intent_tx, intent_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (radio_tx, radio_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (state, state_rx) = watch::channel(SessionState::default());

        let filter = ScanFilter { name_prefix: config.name_prefix.clone() };
        let controller = Self {
            adapter: Arc::new(adapter),
            gate,
            config,
            registry: DeviceRegistry::new(filter),
            scan: ScanController::default(),
            session: Session::default(),
            radio: radio_tx,
            state,
            events: events.clone(),
            replies: Vec::new(),
        };
        tokio::spawn(controller.run(intent_rx, radio_rx));

        SessionHandle { intents: intent_tx, state: state_rx, events }
    }

    async fn run(
        mut self,
        mut intents: mpsc::Receiver<Intent>,
        mut radio: mpsc::Receiver<Radio<A>>,
    ) {
        info!(
            protocol = self.config.protocol.preset_name().unwrap_or("custom"),
            scan_timeout_secs = self.config.scan_timeout_secs,
            "session controller started"
        );

        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(intent) => self.on_intent(intent).await,
                    None => break,
                },
                Some(message) = radio.recv() => self.on_radio(message).await,
            }
            self.flush();
        }

        self.teardown(Error::Closed).await;
        self.flush();
        info!("session controller stopped");
    }

    async fn on_intent(&mut self, intent: Intent) {
        match intent {
            Intent::StartScan { filter, reply } => {
                let result = self.start_scan(filter).await;
                self.reply(reply, result);
            }
            Intent::StopScan(reply) => {
                self.stop_scan(ScanStopReason::Requested).await;
                self.reply(reply, ());
            }
            Intent::Peers(reply) => {
                let peers = self.registry.peers().to_vec();
                self.reply(reply, peers);
            }
            Intent::Connect { address, reply } => self.connect(address, reply).await,
            Intent::Submit { role, token, reply } => self.submit(role, &token, reply),
            Intent::Disconnect(reply) => {
                info!(peer = ?self.session.lifecycle.peer(), "disconnect requested");
                self.teardown(Error::Cancelled).await;
                self.reply(reply, ());
            }
        }
    }

    async fn on_radio(&mut self, message: Radio<A>) {
        match message {
            Radio::PeerFound { cycle, event } => self.on_peer(cycle, event),
            Radio::ScanTimedOut { cycle } => {
                if self.scan.is_current(cycle) {
                    self.stop_scan(ScanStopReason::Timeout).await;
                }
            }
            Radio::ScanEnded { cycle } => {
                if self.scan.is_current(cycle) {
                    warn!("adapter stopped delivering scan results");
                    self.stop_scan(ScanStopReason::Failed).await;
                }
            }
            Radio::Connected { attempt, result } => self.on_connected(attempt, result).await,
            Radio::ServicesDiscovered { attempt, result } => {
                self.on_services(attempt, result).await
            }
            Radio::NotifyArmed { attempt, result } => self.on_armed(attempt, result).await,
            Radio::StatusRead { attempt, result } => self.on_status_read(attempt, result).await,
            Radio::WriteDone { attempt, command, result } => {
                self.on_write_done(attempt, command, result).await
            }
            Radio::Link { attempt, event } => self.on_link_event(attempt, event).await,
        }
    }

    // scan

    /// `filter` narrows this cycle only; without one the configured filter applies
    async fn start_scan(&mut self, filter: Option<ScanFilter>) -> Result<()> {
        if !self.gate.is_granted(Permission::Scan) {
            warn!("scan permission denied");
            return Err(Error::PermissionDenied(Permission::Scan));
        }
        if self.scan.is_scanning() {
            debug!("scan already running");
            return Ok(());
        }
        if !self.adapter.is_powered().await? {
            warn!("Bluetooth is off, not scanning");
            return Err(AdapterError::PoweredOff.into());
        }

        let filter = filter.unwrap_or_else(|| ScanFilter {
            name_prefix: self.config.name_prefix.clone(),
        });
        let results = self
            .adapter
            .scan(&filter)
            .await
            .inspect_err(|error| warn!(%error, "scan failed to start"))?;
        self.registry.reset(filter);
        let cycle = self.scan.begin(results, self.config.scan_timeout(), self.radio.clone());
        info!(cycle, timeout_secs = self.config.scan_timeout_secs, "scan started");
        Ok(())
    }

    async fn stop_scan(&mut self, reason: ScanStopReason) {
        if !self.scan.end() {
            return;
        }
        if let Err(error) = self.adapter.stop_scan().await {
            warn!(%error, "failed to stop scan cleanly");
        }
        info!(?reason, peers = self.registry.len(), "scan stopped");
        self.emit(SessionEvent::ScanStopped(reason));
    }

    fn on_peer(&mut self, cycle: u64, event: PeerEvent) {
        if !self.scan.is_current(cycle) {
            debug!(address = %event.address, "dropping result from a finished scan");
            return;
        }
        if let Some(peer) = self.registry.insert(event, Instant::now()) {
            info!(
                address = %peer.address,
                name = ?peer.name,
                rssi = ?peer.rssi,
                "peer discovered"
            );
            self.emit(SessionEvent::PeerDiscovered(peer));
        }
    }

    // connection lifecycle

    async fn connect(&mut self, address: String, reply: oneshot::Sender<Result<()>>) {
        if !self.gate.is_granted(Permission::Connect) {
            warn!(%address, "connect permission denied");
            return self.reply(reply, Err(Error::PermissionDenied(Permission::Connect)));
        }
        let state = self.session.lifecycle.state();
        if state != ConnectionState::Idle {
            debug!(%address, %state, "connect rejected, session busy");
            return self.reply(reply, Err(Error::Busy));
        }

        self.stop_scan(ScanStopReason::PeerSelected).await;
        self.session.synced_by_push = false;
        let attempt = self.session.lifecycle.begin(address.clone(), reply);
        info!(%address, attempt, "connecting");
        self.spawn_op(move |adapter| async move {
            let result = adapter.connect(&address).await;
            Radio::Connected { attempt, result }
        });
    }

    async fn on_connected(&mut self, attempt: u64, result: Result<A::Link, AdapterError>) {
        if self.is_stale(attempt, "connect completion") {
            if let Ok(link) = result {
                self.release_link(link);
            }
            return;
        }
        let link = match result {
            Ok(link) => link,
            Err(error) => return self.fail(error.into()).await,
        };

        let pump = self.spawn_link_pump(attempt, link.clone());
        self.session.lifecycle.connected(link.clone(), pump);
        info!(attempt, "connected, discovering services");
        self.spawn_op(move |adapter| async move {
            let result = adapter.discover_services(&link, SERVICE_UUID).await;
            Radio::ServicesDiscovered { attempt, result }
        });
    }

    async fn on_services(
        &mut self,
        attempt: u64,
        result: Result<Option<ServiceMap<A::Characteristic>>, AdapterError>,
    ) {
        if self.is_stale(attempt, "service discovery") {
            return;
        }
        let services = match result {
            Ok(services) => services,
            Err(error) => return self.fail(error.into()).await,
        };
        let bindings = match RoleBindings::resolve(&self.config.protocol, services) {
            Ok(bindings) => bindings,
            Err(mismatch) => return self.fail(mismatch.into()).await,
        };
        let (Some(link), Some(push)) = (
            self.session.lifecycle.link().cloned(),
            bindings.get(CharacteristicRole::StatusPush).cloned(),
        ) else {
            return self.fail(AdapterError::LinkLost.into()).await;
        };

        info!(attempt, roles = bindings.len(), "characteristics resolved, arming notifications");
        self.session.lifecycle.resolved(bindings);
        self.spawn_op(move |adapter| async move {
            let result = adapter.set_notification(&link, &push, true).await;
            Radio::NotifyArmed { attempt, result }
        });
    }

    async fn on_armed(&mut self, attempt: u64, result: Result<(), AdapterError>) {
        if self.is_stale(attempt, "notification setup") {
            return;
        }
        if let Err(error) = result {
            return self.fail(error.into()).await;
        }
        let source = self.config.protocol.status_source();
        let (Some(link), Some(characteristic)) = (
            self.session.lifecycle.link().cloned(),
            self.session.lifecycle.binding(source).cloned(),
        ) else {
            return self.fail(Mismatch::MissingRoles(vec![source]).into()).await;
        };

        self.session.lifecycle.armed();
        info!(attempt, %source, "notifications armed, reading status");
        self.spawn_op(move |adapter| async move {
            let result = adapter.read_characteristic(&link, &characteristic).await;
            Radio::StatusRead { attempt, result }
        });
    }

    async fn on_status_read(&mut self, attempt: u64, result: Result<Vec<u8>, AdapterError>) {
        if self.is_stale(attempt, "status read") {
            return;
        }
        let payload = match result {
            Ok(payload) => payload,
            Err(error) => return self.fail(error.into()).await,
        };
        let status = match StatusReport::classify(&payload) {
            StatusReport::State(status) => status,
            _ => {
                let text = String::from_utf8_lossy(&payload).into_owned();
                return self.fail(Mismatch::UnrecognizedStatus(text).into()).await;
            }
        };

        if self.session.synced_by_push {
            debug!(read = ?status, "push arrived first, keeping pushed state");
        } else {
            self.session.robot.apply_status(status);
        }
        let waiter = self.session.lifecycle.synced();
        if let Some(address) = self.session.lifecycle.peer().map(str::to_string) {
            self.registry.remove(&address);
        }
        info!(attempt, robot = %self.session.robot.state, "session ready");
        if let Some(waiter) = waiter {
            self.reply(waiter, Ok(()));
        }
    }

    async fn on_link_event(&mut self, attempt: u64, event: LinkEvent) {
        if self.is_stale(attempt, "link event") {
            return;
        }
        match event {
            LinkEvent::Disconnected => {
                warn!(peer = ?self.session.lifecycle.peer(), "link dropped");
                self.teardown(AdapterError::LinkLost.into()).await;
            }
            LinkEvent::Notification { uuid, value } => self.on_notification(uuid, &value),
        }
    }

    fn on_notification(&mut self, uuid: Uuid, value: &[u8]) {
        let role = self.session.lifecycle.bindings().role_of(uuid);
        if role != Some(CharacteristicRole::StatusPush) {
            debug!(%uuid, ?role, "ignoring notification");
            return;
        }
        let state = self.session.lifecycle.state();
        let syncing = match state {
            ConnectionState::NotifyArmed | ConnectionState::Syncing => true,
            ConnectionState::Ready => false,
            _ => {
                debug!(%state, "notification before subscription, ignored");
                return;
            }
        };

        match self.session.robot.ingest(value) {
            Ingested::State { .. } if syncing => self.session.synced_by_push = true,
            Ingested::Message(text) => self.emit(SessionEvent::RobotMessage(text)),
            _ => {}
        }
    }

    fn spawn_link_pump(&self, attempt: u64, link: A::Link) -> JoinHandle<()> {
        let adapter = Arc::clone(&self.adapter);
        let tx = self.radio.clone();
        tokio::spawn(async move {
            match adapter.link_events(&link).await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        let dropped = matches!(event, LinkEvent::Disconnected);
                        if tx.send(Radio::Link { attempt, event }).await.is_err() || dropped {
                            return;
                        }
                    }
                }
                Err(error) => warn!(%error, "could not subscribe to link events"),
            }
            let _ = tx.send(Radio::Link { attempt, event: LinkEvent::Disconnected }).await;
        })
    }

    // commands

    fn submit(
        &mut self,
        role: CharacteristicRole,
        token: &str,
        reply: oneshot::Sender<Result<Ack>>,
    ) {
        let (payload, link, characteristic) = match self.prepare_write(role, token) {
            Ok(write) => write,
            Err(error) => {
                debug!(%role, token, %error, "command rejected");
                return self.reply(reply, Err(error));
            }
        };

        let attempt = self.session.lifecycle.attempt();
        let command = self.session.commands.begin(payload, reply).id;
        info!(command, %role, %payload, "writing command");
        let value = payload.to_bytes();
        self.spawn_op(move |adapter| async move {
            let result = adapter.write_characteristic(&link, &characteristic, &value).await;
            Radio::WriteDone { attempt, command, result }
        });
    }

    /// Checks a submit in reporting order; nothing is sent unless all pass
    fn prepare_write(
        &self,
        role: CharacteristicRole,
        token: &str,
    ) -> Result<(CommandPayload, A::Link, A::Characteristic)> {
        self.session.commands.admit(self.session.is_ready())?;
        let payload = CommandPayload::parse(role, token)?;
        if !self.config.protocol.contains(role) {
            return Err(Mismatch::RoleNotConfigured(role).into());
        }
        if !self.gate.is_granted(Permission::Connect) {
            return Err(Error::PermissionDenied(Permission::Connect));
        }
        let lifecycle = &self.session.lifecycle;
        match (lifecycle.link(), lifecycle.binding(role)) {
            (Some(link), Some(characteristic)) => {
                Ok((payload, link.clone(), characteristic.clone()))
            }
            (None, _) => Err(Error::NotReady),
            (_, None) => Err(Mismatch::RoleNotConfigured(role).into()),
        }
    }

    async fn on_write_done(&mut self, attempt: u64, id: u64, result: Result<(), AdapterError>) {
        if self.is_stale(attempt, "write completion") {
            return;
        }
        let Some(pending) = self.session.commands.complete(id) else {
            debug!(command = id, "ignoring completion of a write that is not pending");
            return;
        };
        let payload = pending.command.payload;

        match result {
            Ok(()) => {
                let ack = pending.ack();
                match payload {
                    CommandPayload::Destination(destination) => {
                        self.session.robot.destination_acknowledged(destination)
                    }
                    CommandPayload::Arrival(_) => self.session.robot.arrival_acknowledged(),
                }
                info!(
                    command = id,
                    %payload,
                    latency_ms = ack.latency.as_millis() as u64,
                    "command acknowledged"
                );
                self.emit(SessionEvent::CommandCompleted { payload, result: Ok(()) });
                self.reply(pending.reply, Ok(ack));
            }
            Err(error) => {
                warn!(command = id, %payload, %error, "command failed");
                let error = Error::from(error);
                self.emit(SessionEvent::CommandCompleted { payload, result: Err(error.clone()) });
                self.reply(pending.reply, Err(error.clone()));
                self.teardown(error).await;
            }
        }
    }

    // plumbing

    fn is_stale(&self, attempt: u64, what: &str) -> bool {
        let stale = !self.session.lifecycle.is_current(attempt);
        if stale {
            let current = self.session.lifecycle.attempt();
            debug!(attempt, current, "ignoring stale {what}");
        }
        stale
    }

    async fn fail(&mut self, reason: Error) {
        warn!(state = %self.session.lifecycle.state(), %reason, "connection attempt failed");
        self.teardown(reason).await;
    }

    /// Back to the disconnected baseline from whatever state we are in
    ///
    /// Every way out of a session ends here, so a running scan and its
    /// auto-stop timer never outlive the session.
    async fn teardown(&mut self, reason: Error) {
        self.stop_scan(ScanStopReason::Disconnected).await;
        if let Some(pending) = self.session.commands.abandon() {
            debug!(command = pending.command.id, "cancelling in-flight command");
            self.reply(pending.reply, Err(Error::Cancelled));
        }
        let released = self.session.lifecycle.teardown();
        if let Some(waiter) = released.waiter {
            self.reply(waiter, Err(reason.clone()));
        }
        if let Some(link) = released.link {
            self.release_link(link);
        }
        self.session.robot.reset();
        self.session.synced_by_push = false;

        if released.was_active {
            info!(%reason, "session back to idle");
            self.emit(SessionEvent::Disconnected { reason });
        }
    }

    fn release_link(&self, link: A::Link) {
        let adapter = Arc::clone(&self.adapter);
        tokio::spawn(async move {
            if let Err(error) = adapter.disconnect(&link).await {
                debug!(%error, "disconnect failed");
            }
        });
    }

    /// Run one adapter operation off the actor and feed its result back in
    fn spawn_op<F, Fut>(&self, op: F)
    where
        F: FnOnce(Arc<A>) -> Fut + Send + 'static,
        Fut: Future<Output = Radio<A>> + Send + 'static,
    {
        let adapter = Arc::clone(&self.adapter);
        let tx = self.radio.clone();
        tokio::spawn(async move {
            let message = op(adapter).await;
            let _ = tx.send(message).await;
        });
    }

    fn reply<T: Send + 'static>(&mut self, tx: oneshot::Sender<T>, value: T) {
        self.replies.push(Box::new(move || {
            let _ = tx.send(value);
        }));
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Publish the snapshot, then answer the callers settled by this message
    fn flush(&mut self) {
        let snapshot = self.session.snapshot(self.scan.is_scanning());
        let changed = self.state.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot.clone();
            true
        });
        if changed {
            self.emit(SessionEvent::StateChanged(snapshot));
        }
        for reply in std::mem::take(&mut self.replies) {
            reply();
        }
    }
}

/// Cheap, cloneable front of a running [`SessionController`]
///
/// Every request is answered after the snapshot reflecting it was published,
/// so [`state`](Self::state) read right after an `await` is never behind.
#[derive(Clone)]
pub struct SessionHandle {
    intents: mpsc::Sender<Intent>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    async fn request<T>(&self, intent: impl FnOnce(oneshot::Sender<T>) -> Intent) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.intents.send(intent(tx)).await.map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Start discovering peers; a no-op while a scan is already running
    pub async fn start_scan(&self) -> Result<()> {
        self.request(|reply| Intent::StartScan { filter: None, reply }).await?
    }

    /// Like [`start_scan`](Self::start_scan), with `filter` in place of the
    /// configured one for this cycle
    pub async fn start_scan_with(&self, filter: ScanFilter) -> Result<()> {
        self.request(|reply| Intent::StartScan { filter: Some(filter), reply }).await?
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.request(Intent::StopScan).await
    }

    /// Peers found by the current or last scan, in discovery order
    pub async fn peers(&self) -> Result<Vec<DiscoveredPeer>> {
        self.request(Intent::Peers).await
    }

    /// Connect to `address`; resolves once the session is Ready or the attempt failed
    pub async fn connect(&self, address: impl Into<String>) -> Result<()> {
        let address = address.into();
        self.request(|reply| Intent::Connect { address, reply }).await?
    }

    /// Write `token` to the characteristic with `role`
    pub async fn submit(&self, role: CharacteristicRole, token: impl Into<String>) -> Result<Ack> {
        let token = token.into();
        self.request(|reply| Intent::Submit { role, token, reply }).await?
    }

    pub async fn select_destination(&self, destination: Destination) -> Result<Ack> {
        self.submit(CharacteristicRole::Destination, destination.to_string()).await
    }

    pub async fn confirm_arrival(&self, confirmed: bool) -> Result<Ack> {
        let payload = CommandPayload::Arrival(confirmed);
        self.submit(CharacteristicRole::ArrivalAck, payload.to_string()).await
    }

    /// Tear the session down from any state; in-flight work is cancelled
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Intent::Disconnect).await
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Wait until the published snapshot satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionState) -> bool,
    ) -> Result<SessionState> {
        let mut state = self.state.clone();
        let snapshot = state.wait_for(predicate).await.map_err(|_| Error::Closed)?.clone();
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use robot_proto::RoleSet;
    use robot_proto::ble::{ARRIVAL_ACK_UUID, DESTINATION_UUID};

    use super::*;
    use crate::error::Operation;
    use crate::sim::{SimAdapter, SimPermissions};
    use crate::status::RobotState;

    const ROBOT: &str = "AA:BB:CC:00:00:01";

    fn robot() -> SimAdapter {
        SimAdapter::new().with_peer(ROBOT, Some("Robot-1"))
    }

    fn spawn(robot: &SimAdapter, config: SessionConfig) -> (SessionHandle, SimPermissions) {
        let gate = SimPermissions::default();
        let handle = SessionController::spawn(robot.clone(), gate.clone(), config);
        (handle, gate)
    }

    async fn ready(robot: &SimAdapter) -> SessionHandle {
        let (handle, _) = spawn(robot, SessionConfig::default());
        handle.connect(ROBOT).await.unwrap();
        handle
    }

    fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn scan_finds_each_robot_once_and_stops_after_timeout() {
        let robot = robot()
            .with_peer(ROBOT, Some("Robot-1"))
            .with_peer("AA:BB:CC:00:00:02", Some("Printer"));
        let config = SessionConfig { name_prefix: Some("Robot".to_string()), ..Default::default() };
        let (handle, _) = spawn(&robot, config);
        let mut events = handle.subscribe();

        let started = Instant::now();
        handle.start_scan().await.unwrap();
        assert!(handle.state().scanning);

        let state = handle.wait_for(|s| !s.scanning).await.unwrap();
        assert!(!state.scanning);
        assert_eq!(started.elapsed(), Duration::from_secs(20));

        let peers = handle.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, ROBOT);

        let seen = drain(&mut events);
        let discovered =
            seen.iter().filter(|e| matches!(e, SessionEvent::PeerDiscovered(_))).count();
        assert_eq!(discovered, 1);
        assert!(
            seen.iter().any(|e| matches!(e, SessionEvent::ScanStopped(ScanStopReason::Timeout)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scan_filter_can_be_narrowed_per_cycle() {
        let robot = robot().with_peer("AA:BB:CC:00:00:02", Some("Printer"));
        let (handle, _) = spawn(&robot, SessionConfig::default());

        let printers = ScanFilter { name_prefix: Some("Printer".to_string()) };
        handle.start_scan_with(printers).await.unwrap();
        handle.wait_for(|s| !s.scanning).await.unwrap();
        let peers = handle.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name.as_deref(), Some("Printer"));

        // the next plain scan is back on the configured filter
        handle.start_scan().await.unwrap();
        handle.wait_for(|s| !s.scanning).await.unwrap();
        assert_eq!(handle.peers().await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_early_cancels_the_auto_stop() {
        let robot = robot();
        let (handle, _) = spawn(&robot, SessionConfig::default());
        let mut events = handle.subscribe();

        handle.start_scan().await.unwrap();
        handle.start_scan().await.unwrap();
        assert_eq!(robot.call_count(Operation::Scan), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.stop_scan().await.unwrap();
        assert!(!handle.state().scanning);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let stops: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::ScanStopped(reason) => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(stops, vec![ScanStopReason::Requested]);
    }

    #[tokio::test]
    async fn scan_needs_permission_and_power() {
        let robot = robot();
        let (handle, gate) = spawn(&robot, SessionConfig::default());

        gate.deny(Permission::Scan);
        assert_eq!(handle.start_scan().await, Err(Error::PermissionDenied(Permission::Scan)));
        assert_eq!(robot.call_count(Operation::Scan), 0);
        assert!(!handle.state().scanning);

        gate.grant(Permission::Scan);
        robot.set_powered(false);
        let error = handle.start_scan().await.unwrap_err();
        assert_eq!(error, Error::TransportFailure(AdapterError::PoweredOff));
        assert_eq!(error.hint(), "Turn on Bluetooth.");
        assert_eq!(robot.call_count(Operation::Scan), 0);
    }

    #[tokio::test]
    async fn connecting_walks_to_ready() {
        let robot = robot();
        let (handle, _) = spawn(&robot, SessionConfig::default());
        let states = handle.watch();
        handle.start_scan().await.unwrap();

        handle.connect(ROBOT).await.unwrap();
        let state = handle.state();
        assert_eq!(state.connection, ConnectionState::Ready);
        assert_eq!(state.robot, RobotState::Idle);
        assert_eq!(state.peer.as_deref(), Some(ROBOT));
        assert!(state.destination_selectable);
        assert!(!state.command_in_flight);
        assert!(!state.scanning, "selecting a peer stops the scan");
        assert!(states.has_changed().unwrap());

        assert_eq!(
            robot.calls(),
            vec![
                Operation::Scan,
                Operation::Connect,
                Operation::DiscoverServices,
                Operation::SetNotification,
                Operation::Read,
            ]
        );
    }

    #[tokio::test]
    async fn destination_round_trip() {
        let robot = robot();
        let handle = ready(&robot).await;
        let mut events = handle.subscribe();

        let ack = handle.select_destination(Destination::B).await.unwrap();
        assert_eq!(ack.payload, CommandPayload::Destination(Destination::B));
        assert_eq!(robot.writes(), vec![(DESTINATION_UUID, b"b".to_vec())]);

        let state = handle.state();
        assert_eq!(state.selected_destination, Some(Destination::B));
        assert_eq!(state.robot, RobotState::Busy);
        assert!(!state.command_in_flight);
        assert!(!state.destination_selectable);

        // a confirming BUSY changes nothing; the arrival message that follows does
        assert!(robot.push_status("BUSY"));
        assert!(robot.push_status("Arrived at b"));
        let state = handle.wait_for(|s| s.arrival_confirmable).await.unwrap();
        assert_eq!(state.robot, RobotState::Busy);
        assert_eq!(state.selected_destination, Some(Destination::B));
        assert_eq!(state.last_message.as_deref(), Some("Arrived at b"));

        let seen = drain(&mut events);
        assert!(seen.iter().any(|e| matches!(
            e,
            SessionEvent::CommandCompleted {
                payload: CommandPayload::Destination(Destination::B),
                result: Ok(())
            }
        )));
        assert!(
            seen.iter().any(|e| matches!(e, SessionEvent::RobotMessage(m) if m == "Arrived at b"))
        );
        let after_ack = seen
            .iter()
            .skip_while(|e| !matches!(e, SessionEvent::CommandCompleted { .. }))
            .filter(|e| matches!(e, SessionEvent::StateChanged(_)))
            .count();
        assert_eq!(after_ack, 2, "one change for the ack, one for the arrival message");

        handle.confirm_arrival(true).await.unwrap();
        assert_eq!(robot.writes()[1], (ARRIVAL_ACK_UUID, b"1".to_vec()));
        let state = handle.state();
        assert_eq!(state.robot, RobotState::Idle);
        assert_eq!(state.selected_destination, None);
        assert!(state.destination_selectable);
    }

    #[tokio::test]
    async fn pushes_override_local_assumptions() {
        let robot = robot();
        let handle = ready(&robot).await;

        assert!(robot.push_status("BUSY"));
        let state = handle.wait_for(|s| s.robot == RobotState::Busy).await.unwrap();
        assert!(!state.destination_selectable);

        assert!(robot.push_status("  idle\r\n"));
        let state = handle.wait_for(|s| s.robot == RobotState::Idle).await.unwrap();
        assert!(state.destination_selectable);
        assert_eq!(state.connection, ConnectionState::Ready);
    }

    #[tokio::test]
    async fn second_command_while_one_is_in_flight_is_busy() {
        let robot = robot();
        let handle = ready(&robot).await;
        robot.hold_writes(true);

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.select_destination(Destination::A).await }
        });
        robot.wait_for_writes(1).await;
        assert!(handle.state().command_in_flight);

        assert_eq!(handle.select_destination(Destination::C).await, Err(Error::Busy));
        assert_eq!(handle.confirm_arrival(true).await, Err(Error::Busy));
        assert_eq!(robot.writes().len(), 1);

        assert!(robot.release_write(Ok(())));
        let ack = first.await.unwrap().unwrap();
        assert_eq!(ack.payload, CommandPayload::Destination(Destination::A));
        let state = handle.state();
        assert!(!state.command_in_flight);
        assert_eq!(state.selected_destination, Some(Destination::A));

        // the rejected arrival goes through once the channel is free
        robot.hold_writes(false);
        handle.confirm_arrival(true).await.unwrap();
        let arrivals = robot.writes().iter().filter(|(uuid, _)| *uuid == ARRIVAL_ACK_UUID).count();
        assert_eq!(arrivals, 1);
        assert_eq!(robot.writes().len(), 2);
        assert_eq!(robot.call_count(Operation::Write), 2);
    }

    #[tokio::test]
    async fn commands_before_ready_touch_nothing() {
        let robot = robot();
        let (handle, _) = spawn(&robot, SessionConfig::default());

        assert_eq!(handle.select_destination(Destination::A).await, Err(Error::NotReady));
        assert_eq!(
            handle.submit(CharacteristicRole::Destination, "zz").await,
            Err(Error::NotReady)
        );
        assert!(robot.calls().is_empty());
        assert!(robot.writes().is_empty());
        assert_eq!(handle.state(), SessionState::default());
    }

    #[tokio::test]
    async fn malformed_tokens_are_rejected_locally() {
        let robot = robot();
        let handle = ready(&robot).await;

        let error = handle.submit(CharacteristicRole::Destination, "e").await.unwrap_err();
        assert!(matches!(error, Error::InvalidPayload(_)));
        let error = handle.submit(CharacteristicRole::StatusPush, "a").await.unwrap_err();
        assert!(matches!(error, Error::InvalidPayload(_)));
        assert!(robot.writes().is_empty());
        assert!(handle.state().is_ready());
    }

    #[tokio::test]
    async fn minimal_variant_has_no_arrival_ack() {
        let robot =
            robot().with_roles(&[CharacteristicRole::Destination, CharacteristicRole::StatusPush]);
        let config = SessionConfig { protocol: RoleSet::minimal(), ..Default::default() };
        let (handle, _) = spawn(&robot, config);
        handle.connect(ROBOT).await.unwrap();
        assert_eq!(handle.state().robot, RobotState::Idle);

        assert_eq!(
            handle.confirm_arrival(true).await,
            Err(Error::ProtocolMismatch(Mismatch::RoleNotConfigured(
                CharacteristicRole::ArrivalAck
            )))
        );
        assert!(robot.writes().is_empty());
        handle.select_destination(Destination::D).await.unwrap();
    }

    #[tokio::test]
    async fn missing_characteristics_fail_the_connect() {
        let robot =
            robot().with_roles(&[CharacteristicRole::Destination, CharacteristicRole::StatusPush]);
        let (handle, _) = spawn(&robot, SessionConfig::default());
        let mut events = handle.subscribe();

        let error = handle.connect(ROBOT).await.unwrap_err();
        assert_eq!(
            error,
            Error::ProtocolMismatch(Mismatch::MissingRoles(vec![
                CharacteristicRole::ArrivalAck,
                CharacteristicRole::StatusRead,
            ]))
        );
        assert_eq!(handle.state(), SessionState::default());
        assert!(drain(&mut events).iter().any(|e| matches!(e, SessionEvent::Disconnected { .. })));
    }

    #[tokio::test]
    async fn missing_service_fails_the_connect() {
        let robot = robot().without_service();
        let (handle, _) = spawn(&robot, SessionConfig::default());
        assert_eq!(
            handle.connect(ROBOT).await,
            Err(Error::ProtocolMismatch(Mismatch::MissingService))
        );
        assert_eq!(handle.state().connection, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn unrecognized_initial_status_fails_the_connect() {
        let robot = robot().with_status("BOOTING");
        let (handle, _) = spawn(&robot, SessionConfig::default());
        assert_eq!(
            handle.connect(ROBOT).await,
            Err(Error::ProtocolMismatch(Mismatch::UnrecognizedStatus("BOOTING".to_string())))
        );
        assert_eq!(handle.state(), SessionState::default());
    }

    #[tokio::test]
    async fn transport_failures_at_each_step_return_to_idle() {
        let steps = [
            Operation::Connect,
            Operation::DiscoverServices,
            Operation::SetNotification,
            Operation::Read,
        ];
        for op in steps {
            let robot = robot();
            robot.fail(op);
            let (handle, _) = spawn(&robot, SessionConfig::default());

            let error = handle.connect(ROBOT).await.unwrap_err();
            assert!(
                matches!(
                    error,
                    Error::TransportFailure(AdapterError::Failed { op: failed, .. }) if failed == op
                ),
                "{op}: {error}"
            );
            assert_eq!(handle.state(), SessionState::default(), "{op}");

            robot.recover(op);
            handle.connect(ROBOT).await.unwrap();
            assert!(handle.state().is_ready(), "{op}");
        }
    }

    #[tokio::test]
    async fn connect_while_connected_is_busy() {
        let robot = robot();
        let handle = ready(&robot).await;
        assert_eq!(handle.connect(ROBOT).await, Err(Error::Busy));
        assert!(handle.state().is_ready());
        assert_eq!(robot.call_count(Operation::Connect), 1);
    }

    #[tokio::test]
    async fn connect_needs_permission() {
        let robot = robot();
        let (handle, gate) = spawn(&robot, SessionConfig::default());
        gate.deny(Permission::Connect);
        assert_eq!(handle.connect(ROBOT).await, Err(Error::PermissionDenied(Permission::Connect)));
        assert!(robot.calls().is_empty());
    }

    #[tokio::test]
    async fn revoked_permission_rejects_writes() {
        let robot = robot();
        let (handle, gate) = spawn(&robot, SessionConfig::default());
        handle.connect(ROBOT).await.unwrap();

        gate.deny(Permission::Connect);
        assert_eq!(
            handle.select_destination(Destination::A).await,
            Err(Error::PermissionDenied(Permission::Connect))
        );
        assert!(robot.writes().is_empty());
        assert!(handle.state().is_ready());
    }

    #[tokio::test]
    async fn failed_write_tears_the_session_down() {
        let robot = robot();
        let handle = ready(&robot).await;
        handle.start_scan().await.unwrap();
        let mut events = handle.subscribe();
        robot.fail(Operation::Write);

        let error = handle.select_destination(Destination::C).await.unwrap_err();
        assert!(matches!(
            error,
            Error::TransportFailure(AdapterError::Failed { op: Operation::Write, .. })
        ));
        assert_eq!(error.hint(), "Sending failed.");
        assert_eq!(handle.state(), SessionState::default());

        let seen = drain(&mut events);
        assert!(
            seen.iter().any(|e| matches!(e, SessionEvent::CommandCompleted { result: Err(_), .. }))
        );
        assert!(
            seen.iter()
                .any(|e| matches!(e, SessionEvent::ScanStopped(ScanStopReason::Disconnected)))
        );
        assert!(seen.iter().any(|e| matches!(e, SessionEvent::Disconnected { .. })));
    }

    #[tokio::test]
    async fn disconnect_cancels_in_flight_write_and_ignores_its_completion() {
        let robot = robot();
        let handle = ready(&robot).await;
        robot.hold_writes(true);

        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.select_destination(Destination::B).await }
        });
        robot.wait_for_writes(1).await;

        handle.disconnect().await.unwrap();
        assert_eq!(pending.await.unwrap(), Err(Error::Cancelled));
        assert_eq!(handle.state(), SessionState::default());

        // the old write acknowledges late; it belongs to a dead attempt
        robot.hold_writes(false);
        assert!(robot.release_write(Ok(())));
        handle.connect(ROBOT).await.unwrap();
        let state = handle.state();
        assert!(state.is_ready());
        assert_eq!(state.selected_destination, None);
        assert_eq!(state.robot, RobotState::Idle);
        assert!(!state.command_in_flight);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let robot = robot();
        let (handle, _) = spawn(&robot, SessionConfig::default());
        let mut events = handle.subscribe();

        handle.disconnect().await.unwrap();
        handle.disconnect().await.unwrap();
        assert_eq!(handle.state(), SessionState::default());
        assert!(drain(&mut events).is_empty());
        assert!(robot.calls().is_empty());
    }

    /// Connect with `op` hanging and wait for the step it leaves the session in
    async fn stuck_at(
        op: Operation,
        step: ConnectionState,
    ) -> (SimAdapter, SessionHandle, JoinHandle<Result<()>>) {
        let robot = robot();
        robot.stall(op);
        let (handle, _) = spawn(&robot, SessionConfig::default());
        let connecting = tokio::spawn({
            let handle = handle.clone();
            async move { handle.connect(ROBOT).await }
        });
        handle.wait_for(|s| s.connection == step).await.unwrap();
        (robot, handle, connecting)
    }

    #[tokio::test]
    async fn disconnect_during_each_setup_step_answers_the_waiter() {
        let steps = [
            (Operation::Connect, ConnectionState::Connecting),
            (Operation::DiscoverServices, ConnectionState::ServicesFound),
            (Operation::SetNotification, ConnectionState::NotifyArmed),
            (Operation::Read, ConnectionState::Syncing),
        ];
        for (op, step) in steps {
            let (_robot, handle, connecting) = stuck_at(op, step).await;

            handle.disconnect().await.unwrap();
            assert_eq!(connecting.await.unwrap(), Err(Error::Cancelled), "{step}");
            assert_eq!(handle.state(), SessionState::default(), "{step}");
        }
    }

    #[tokio::test]
    async fn link_drop_during_setup_fails_the_connect() {
        let steps = [
            (Operation::DiscoverServices, ConnectionState::ServicesFound),
            (Operation::SetNotification, ConnectionState::NotifyArmed),
            (Operation::Read, ConnectionState::Syncing),
        ];
        for (op, step) in steps {
            let (robot, handle, connecting) = stuck_at(op, step).await;

            assert!(robot.drop_link(), "{step}");
            assert_eq!(
                connecting.await.unwrap(),
                Err(Error::TransportFailure(AdapterError::LinkLost)),
                "{step}"
            );
            assert_eq!(handle.state(), SessionState::default(), "{step}");
        }
    }

    #[tokio::test]
    async fn link_loss_returns_to_idle() {
        let robot = robot();
        let handle = ready(&robot).await;
        let mut events = handle.subscribe();
        handle.select_destination(Destination::A).await.unwrap();

        assert!(robot.drop_link());
        let state = handle.wait_for(|s| s.connection == ConnectionState::Idle).await.unwrap();
        assert_eq!(state, SessionState::default());
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            SessionEvent::Disconnected { reason: Error::TransportFailure(AdapterError::LinkLost) }
        )));
        assert_eq!(handle.select_destination(Destination::A).await, Err(Error::NotReady));
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_stops_a_running_scan() {
        let robot = robot();
        let handle = ready(&robot).await;
        handle.start_scan().await.unwrap();
        assert!(handle.state().scanning);
        let mut events = handle.subscribe();

        assert!(robot.drop_link());
        let state = handle.wait_for(|s| s.connection == ConnectionState::Idle).await.unwrap();
        assert!(!state.scanning);

        // the auto-stop timer went with the scan
        tokio::time::sleep(Duration::from_secs(30)).await;
        let stops: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::ScanStopped(reason) => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(stops, vec![ScanStopReason::Disconnected]);
    }

    #[tokio::test]
    async fn push_during_sync_wins_over_the_initial_read() {
        let robot = robot().with_status("IDLE").with_announcement("BUSY");
        let handle = ready(&robot).await;
        let state = handle.wait_for(|s| s.robot == RobotState::Busy).await.unwrap();
        assert!(state.is_ready());
        assert!(!state.destination_selectable);
    }

    #[tokio::test]
    async fn status_read_uses_push_characteristic_without_a_read_role() {
        let robot = robot().with_roles(&[
            CharacteristicRole::Destination,
            CharacteristicRole::ArrivalAck,
            CharacteristicRole::StatusPush,
        ]);
        let config = SessionConfig { protocol: RoleSet::standard(), ..Default::default() };
        let (handle, _) = spawn(&robot, config);
        handle.connect(ROBOT).await.unwrap();
        assert_eq!(handle.state().robot, RobotState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn autopilot_delivery() {
        let robot = robot().with_autopilot(Duration::from_secs(3));
        let handle = ready(&robot).await;

        handle.select_destination(Destination::C).await.unwrap();
        let state = handle.wait_for(|s| s.arrival_confirmable).await.unwrap();
        assert_eq!(state.last_message.as_deref(), Some("Arrived at c"));

        handle.confirm_arrival(true).await.unwrap();
        let state = handle.wait_for(|s| s.robot == RobotState::Idle).await.unwrap();
        assert!(state.destination_selectable);
        assert_eq!(state.selected_destination, None);
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_actor() {
        let robot = robot();
        let handle = ready(&robot).await;
        let mut states = handle.watch();
        drop(handle);

        // the actor drops its watch sender on exit
        while states.changed().await.is_ok() {}
        assert_eq!(*states.borrow(), SessionState::default());
    }
}
