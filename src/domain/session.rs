//! Session State Machine
//!
//! Owns the connection lifecycle of the single peripheral and the
//! characteristic cache.
//!
//! ```text
//! Idle --scan--> Scanning --found--> (handle bound) --connect--> Connecting
//!      --connected--> Connected --discover--> DiscoveringServices
//!      --discovered--> Ready
//! any active state --disconnect/error--> Disconnecting --> Idle
//! ```
//!
//! The machine runs as one tokio task. Commands, transport completions and
//! unsolicited transport events are all handled there, one at a time, so
//! transitions never interleave. Transport calls run in spawned tasks and
//! report back through a completion channel tagged with the session
//! generation they were issued under; every teardown bumps the generation,
//! so completions of abandoned operations are recognised and dropped.

use crate::domain::event_bus::EventBus;
use crate::domain::models::{
    CharacteristicDescriptor, CharacteristicName, CharacteristicValue, CommandKind,
    DisconnectReason, DiscoveredDevice, Intent, PeripheralHandle, SessionEvent, SessionState,
};
use crate::domain::registry::{CharacteristicRegistry, RegistryView};
use crate::error::{SessionError, TransportError};
use crate::infrastructure::bluetooth::protocol::{self, ServiceDescriptor};
use crate::infrastructure::bluetooth::transport::{GattTransport, TransportEvent};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    StartAdapter(Reply<()>),
    Scan(Reply<PeripheralHandle>),
    Connect(Reply<()>),
    DiscoverServices(Reply<BTreeSet<CharacteristicName>>),
    Read(CharacteristicName, Reply<CharacteristicValue>),
    Write(CharacteristicName, Vec<u8>, Reply<()>),
    EnableNotifications(CharacteristicName, Reply<()>),
    Disconnect(Reply<()>),
    Close(Reply<()>),
}

impl Command {
    fn kind(&self) -> Option<CommandKind> {
        Some(match self {
            Self::StartAdapter(_) => CommandKind::StartAdapter,
            Self::Scan(_) => CommandKind::Scan,
            Self::Connect(_) => CommandKind::Connect,
            Self::DiscoverServices(_) => CommandKind::DiscoverServices,
            Self::Read(..) => CommandKind::ReadCharacteristic,
            Self::Write(..) => CommandKind::WriteCharacteristic,
            Self::EnableNotifications(..) => CommandKind::EnableNotifications,
            Self::Disconnect(_) => CommandKind::Disconnect,
            Self::Close(_) => return None,
        })
    }

    fn reject(self, err: SessionError) {
        match self {
            Self::StartAdapter(r)
            | Self::Connect(r)
            | Self::Write(_, _, r)
            | Self::EnableNotifications(_, r)
            | Self::Disconnect(r)
            | Self::Close(r) => {
                let _ = r.send(Err(err));
            }
            Self::Scan(r) => {
                let _ = r.send(Err(err));
            }
            Self::DiscoverServices(r) => {
                let _ = r.send(Err(err));
            }
            Self::Read(_, r) => {
                let _ = r.send(Err(err));
            }
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{kind}"),
            None => f.write_str("Close"),
        }
    }
}

/// Result of a transport call, delivered back to the machine's task
struct Completion {
    generation: u64,
    outcome: Outcome,
}

enum Outcome {
    AdapterStarted(Result<(), TransportError>, Reply<()>),
    Scanned(Result<DiscoveredDevice, TransportError>, Reply<PeripheralHandle>),
    Connected(Result<(), TransportError>, Reply<()>),
    Discovered(
        Result<Vec<CharacteristicDescriptor>, TransportError>,
        Reply<BTreeSet<CharacteristicName>>,
    ),
    Read {
        name: CharacteristicName,
        result: Result<Vec<u8>, TransportError>,
        /// `None` for the read issued on entering Ready
        reply: Option<Reply<CharacteristicValue>>,
    },
    Written {
        name: CharacteristicName,
        value: Vec<u8>,
        result: Result<(), TransportError>,
        reply: Reply<()>,
    },
    Subscribed(Result<(), TransportError>, Reply<()>),
    TornDown(DisconnectReason),
}

fn respond<T>(reply: Reply<T>, result: Result<T, TransportError>) {
    let _ = reply.send(result.map_err(SessionError::from));
}

pub struct SessionStateMachine {
    transport: Arc<dyn GattTransport>,
    service: ServiceDescriptor,
    state: SessionState,
    handle: Option<PeripheralHandle>,
    generation: u64,
    /// A link was established since the last Idle
    linked: bool,
    discovered: BTreeSet<CharacteristicName>,
    registry: Arc<RwLock<CharacteristicRegistry>>,
    bus: EventBus,
    state_tx: watch::Sender<SessionState>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    /// Answered once the current teardown reaches Idle
    teardown_replies: Vec<(Reply<()>, Result<(), TransportError>)>,
    close_reply: Option<Reply<()>>,
}

impl SessionStateMachine {
    /// Start the machine on the current tokio runtime.
    ///
    /// `transport_events` must be the receiving end of the sender the
    /// transport was built with.
    pub fn spawn(
        transport: Arc<dyn GattTransport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        service: ServiceDescriptor,
    ) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let registry = Arc::new(RwLock::new(CharacteristicRegistry::new(service)));
        let bus = EventBus::new();

        let machine = Self {
            transport,
            service,
            state: SessionState::Idle,
            handle: None,
            generation: 0,
            linked: false,
            discovered: BTreeSet::new(),
            registry: registry.clone(),
            bus: bus.clone(),
            state_tx,
            completion_tx,
            teardown_replies: Vec::new(),
            close_reply: None,
        };
        tokio::spawn(machine.run(command_rx, completion_rx, transport_events));

        SessionHandle {
            commands: command_tx,
            bus,
            state: state_rx,
            registry: RegistryView::new(registry),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        info!("Session started");
        loop {
            tokio::select! {
                biased;
                Some(completion) = completions.recv() => self.on_completion(completion),
                Some(event) = transport_events.recv() => self.on_transport_event(event),
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("All session handles dropped");
                        if self.state != SessionState::Idle {
                            if let Err(e) = self.transport.disconnect().await {
                                warn!("Transport disconnect failed: {}", e);
                            }
                        }
                        self.transport.close().await;
                        break;
                    }
                },
            }

            if self.state == SessionState::Idle {
                if let Some(reply) = self.close_reply.take() {
                    self.transport.close().await;
                    let _ = reply.send(Ok(()));
                    break;
                }
            }
        }

        commands.close();
        while let Ok(command) = commands.try_recv() {
            command.reject(SessionError::SessionClosed);
        }
        info!("Session closed");
    }

    fn on_command(&mut self, command: Command) {
        if self.close_reply.is_some() {
            command.reject(SessionError::SessionClosed);
            return;
        }

        if let Some(kind) = command.kind() {
            if !self.state.accepts(kind) {
                warn!("Rejected {} while {}", kind, self.state);
                command.reject(SessionError::InvalidState {
                    command: kind,
                    state: self.state,
                });
                return;
            }
        }

        match command {
            Command::StartAdapter(reply) => {
                let transport = self.transport.clone();
                self.dispatch(async move {
                    Outcome::AdapterStarted(transport.start_adapter().await, reply)
                });
            }
            Command::Scan(reply) => {
                self.transition(SessionState::Scanning);
                let transport = self.transport.clone();
                let service = self.service.service;
                self.dispatch(async move {
                    Outcome::Scanned(transport.scan(service).await, reply)
                });
            }
            Command::Connect(reply) => self.connect(reply),
            Command::DiscoverServices(reply) => {
                self.transition(SessionState::DiscoveringServices);
                let transport = self.transport.clone();
                self.dispatch(async move {
                    Outcome::Discovered(transport.discover_services().await, reply)
                });
            }
            Command::Read(name, reply) => self.read(name, Some(reply)),
            Command::Write(name, value, reply) => {
                let uuid = match self.discovered_uuid(name) {
                    Ok(uuid) => uuid,
                    Err(e) => return respond(reply, Err(e)),
                };
                let transport = self.transport.clone();
                self.dispatch(async move {
                    let result = transport.write_characteristic(uuid, &value).await;
                    Outcome::Written {
                        name,
                        value,
                        result,
                        reply,
                    }
                });
            }
            Command::EnableNotifications(name, reply) => {
                let uuid = match self.discovered_uuid(name) {
                    Ok(uuid) => uuid,
                    Err(e) => return respond(reply, Err(e)),
                };
                let transport = self.transport.clone();
                self.dispatch(async move {
                    Outcome::Subscribed(transport.subscribe(uuid).await, reply)
                });
            }
            Command::Disconnect(reply) => match self.state {
                SessionState::Idle => {
                    debug!("Disconnect while Idle: nothing to do");
                    let _ = reply.send(Ok(()));
                }
                SessionState::Disconnecting => self.teardown_replies.push((reply, Ok(()))),
                _ => {
                    self.teardown_replies.push((reply, Ok(())));
                    self.begin_teardown(DisconnectReason::Requested);
                }
            },
            Command::Close(reply) => {
                info!("Closing session");
                self.close_reply = Some(reply);
                if !matches!(self.state, SessionState::Idle | SessionState::Disconnecting) {
                    self.begin_teardown(DisconnectReason::Requested);
                }
            }
        }
    }

    fn connect(&mut self, reply: Reply<()>) {
        if self.state != SessionState::Scanning {
            debug!("Connect while {}: reusing link", self.state);
            let _ = reply.send(Ok(()));
            return;
        }
        let Some(handle) = self.handle.clone() else {
            warn!("Connect rejected: no peripheral bound");
            let _ = reply.send(Err(SessionError::InvalidState {
                command: CommandKind::Connect,
                state: self.state,
            }));
            return;
        };

        self.transition(SessionState::Connecting);
        let transport = self.transport.clone();
        self.dispatch(async move { Outcome::Connected(transport.connect(&handle).await, reply) });
    }

    fn read(&mut self, name: CharacteristicName, reply: Option<Reply<CharacteristicValue>>) {
        let (uuid, reply) = match (self.discovered_uuid(name), reply) {
            (Ok(uuid), reply) => (uuid, reply),
            (Err(e), Some(reply)) => return respond(reply, Err(e)),
            (Err(_), None) => return,
        };
        let transport = self.transport.clone();
        self.dispatch(async move {
            let result = transport.read_characteristic(uuid).await;
            Outcome::Read {
                name,
                result,
                reply,
            }
        });
    }

    /// UUID of `name`, provided service discovery reported it
    fn discovered_uuid(&self, name: CharacteristicName) -> Result<Uuid, TransportError> {
        let uuid = self.service.uuid_of(name).unwrap_or_default();
        if self.discovered.contains(&name) {
            Ok(uuid)
        } else {
            Err(TransportError::CharacteristicNotFound(uuid))
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        if completion.generation != self.generation {
            // The caller's reply sender is dropped with the outcome.
            debug!(
                "Discarding completion from generation {} (current {})",
                completion.generation, self.generation
            );
            return;
        }

        match completion.outcome {
            Outcome::AdapterStarted(result, reply) => {
                match &result {
                    Ok(()) => info!("BLE adapter ready"),
                    Err(e) => error!("BLE adapter unavailable: {}", e),
                }
                respond(reply, result);
            }
            Outcome::Scanned(result, reply) => match result {
                Ok(device) => {
                    let handle = PeripheralHandle::new(device, self.generation);
                    info!("Found peripheral {}", handle);
                    self.handle = Some(handle.clone());
                    self.bus.publish(SessionEvent::DeviceFound(handle.clone()));
                    let _ = reply.send(Ok(handle));
                }
                Err(e) => {
                    warn!("Scan failed: {}", e);
                    self.teardown_now(DisconnectReason::Failed);
                    respond(reply, Err(e));
                }
            },
            Outcome::Connected(result, reply) => match result {
                Ok(()) => {
                    self.transition(SessionState::Connected);
                    self.linked = true;
                    if let Some(handle) = &self.handle {
                        info!("Connected to {}", handle);
                        self.bus.publish(SessionEvent::Connected(handle.clone()));
                    }
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    // The radio may hold a half-open link; release it before answering.
                    warn!("Connect failed: {}", e);
                    self.teardown_replies.push((reply, Err(e)));
                    self.begin_teardown(DisconnectReason::Failed);
                }
            },
            Outcome::Discovered(result, reply) => self.on_discovered(result, reply),
            Outcome::Read {
                name,
                result,
                reply,
            } => {
                let result = result.map(|bytes| self.update(name, bytes));
                if let Err(e) = &result {
                    warn!("Read of {} failed: {}", name, e);
                }
                match (reply, result) {
                    (Some(reply), result) => respond(reply, result),
                    (None, Ok(value)) => debug!("{} initialised to {:02X?}", name, value.bytes),
                    (None, Err(_)) => {}
                }
            }
            Outcome::Written {
                name,
                value,
                result,
                reply,
            } => {
                match result {
                    Ok(()) => {
                        debug!("Wrote {:02X?} to {}", value, name);
                        self.update(name, value);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        warn!("Write to {} failed: {}", name, e);
                        respond(reply, Err(e));
                    }
                }
            }
            Outcome::Subscribed(result, reply) => {
                if let Err(e) = &result {
                    warn!("Subscribe failed: {}", e);
                }
                respond(reply, result);
            }
            Outcome::TornDown(reason) => self.finish_teardown(reason),
        }
    }

    fn on_discovered(
        &mut self,
        result: Result<Vec<CharacteristicDescriptor>, TransportError>,
        reply: Reply<BTreeSet<CharacteristicName>>,
    ) {
        let names = result.and_then(|characteristics| {
            let names: BTreeSet<_> = characteristics
                .iter()
                .filter_map(|c| self.service.name_of(c.uuid))
                .collect();
            if names.contains(&CharacteristicName::Led) {
                Ok(names)
            } else {
                Err(TransportError::Discovery(
                    "LED characteristic missing from service".into(),
                ))
            }
        });

        match names {
            Ok(names) => {
                self.transition(SessionState::Ready);
                self.write_registry().clear();
                self.discovered = names.clone();
                info!("Services discovered: {:?}", names);
                self.bus.publish(SessionEvent::ServicesDiscovered(names.clone()));
                let _ = reply.send(Ok(names));

                // Sync the cache with the hardware, which may have changed before we connected.
                self.read(CharacteristicName::Led, None);
            }
            Err(e) => {
                error!("Service discovery failed: {}", e);
                self.begin_teardown(DisconnectReason::Failed);
                respond(reply, Err(e));
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LinkLost { generation } => {
                if generation != self.generation || !self.state.has_link() {
                    debug!("Ignoring stale link loss (generation {})", generation);
                    return;
                }
                warn!("Peripheral dropped the link while {}", self.state);
                self.begin_teardown(DisconnectReason::LinkLost);
            }
            TransportEvent::ValueChanged {
                generation,
                uuid,
                value,
            } => {
                if generation != self.generation || self.state != SessionState::Ready {
                    debug!("Ignoring stale notification from {}", uuid);
                    return;
                }
                match self.service.name_of(uuid) {
                    Some(name) => {
                        self.update(name, value);
                    }
                    None => debug!("Notification from unknown characteristic {}", uuid),
                }
            }
        }
    }

    /// Store a confirmed value and tell observers
    fn update(&mut self, name: CharacteristicName, bytes: Vec<u8>) -> CharacteristicValue {
        let uuid = self.service.uuid_of(name).unwrap_or_default();
        let stored = self.write_registry().set(uuid, bytes.clone());
        let value = stored.unwrap_or(CharacteristicValue {
            uuid,
            bytes,
            revision: 0,
        });
        if name == CharacteristicName::Led {
            debug!("LED is {:?}", protocol::decode_led(&value.bytes));
        }
        self.bus.publish(SessionEvent::CharacteristicUpdated {
            name,
            value: value.clone(),
        });
        value
    }

    /// Enter Disconnecting and invalidate everything issued so far
    fn enter_disconnecting(&mut self) {
        self.transition(SessionState::Disconnecting);
        self.generation += 1;
        self.discovered.clear();
        self.write_registry().clear();
    }

    /// Teardown that has to release a link first
    fn begin_teardown(&mut self, reason: DisconnectReason) {
        self.enter_disconnecting();
        let transport = self.transport.clone();
        self.dispatch(async move {
            if let Err(e) = transport.disconnect().await {
                warn!("Transport disconnect failed: {}", e);
            }
            Outcome::TornDown(reason)
        });
    }

    /// Teardown with no link to release
    fn teardown_now(&mut self, reason: DisconnectReason) {
        self.enter_disconnecting();
        self.finish_teardown(reason);
    }

    fn finish_teardown(&mut self, reason: DisconnectReason) {
        self.transition(SessionState::Idle);
        self.handle = None;
        if std::mem::take(&mut self.linked) {
            info!("Disconnected ({:?})", reason);
            self.bus.publish(SessionEvent::Disconnected { reason });
        }
        for (reply, result) in self.teardown_replies.drain(..) {
            respond(reply, result);
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        info!("Session {} -> {}", self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn dispatch<F>(&self, operation: F)
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        let generation = self.generation;
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let outcome = operation.await;
            let _ = completions.send(Completion {
                generation,
                outcome,
            });
        });
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, CharacteristicRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Front-end handle to a running session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    bus: EventBus,
    state: watch::Receiver<SessionState>,
    registry: RegistryView,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.bus.subscribe()
    }

    pub fn registry(&self) -> &RegistryView {
        &self.registry
    }

    pub async fn start_adapter(&self) -> Result<(), SessionError> {
        self.request(Command::StartAdapter).await
    }

    pub async fn scan(&self) -> Result<PeripheralHandle, SessionError> {
        self.request(Command::Scan).await
    }

    pub async fn connect(&self) -> Result<(), SessionError> {
        self.request(Command::Connect).await
    }

    pub async fn discover_services(&self) -> Result<BTreeSet<CharacteristicName>, SessionError> {
        self.request(Command::DiscoverServices).await
    }

    pub async fn read(&self, name: CharacteristicName) -> Result<CharacteristicValue, SessionError> {
        self.request(|reply| Command::Read(name, reply)).await
    }

    pub async fn write(&self, name: CharacteristicName, value: Vec<u8>) -> Result<(), SessionError> {
        self.request(|reply| Command::Write(name, value, reply)).await
    }

    pub async fn set_led(&self, on: bool) -> Result<(), SessionError> {
        self.write(CharacteristicName::Led, protocol::encode_led(on).to_vec())
            .await
    }

    pub async fn enable_notifications(&self, name: CharacteristicName) -> Result<(), SessionError> {
        self.request(|reply| Command::EnableNotifications(name, reply))
            .await
    }

    /// Drop the link and return to Idle. A no-op when already idle or closed.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        match self.request(Command::Disconnect).await {
            Err(SessionError::SessionClosed) => Ok(()),
            other => other,
        }
    }

    /// Tear down, release the radio and stop the session. Repeated calls are no-ops.
    pub async fn close(&self) -> Result<(), SessionError> {
        match self.request(Command::Close).await {
            Err(SessionError::SessionClosed) | Err(SessionError::Abandoned) => Ok(()),
            other => other,
        }
    }

    /// Run a front-end intent, discarding its payload
    pub async fn execute(&self, intent: Intent) -> Result<(), SessionError> {
        match intent {
            Intent::StartAdapter => self.start_adapter().await,
            Intent::Scan => self.scan().await.map(drop),
            Intent::Connect => self.connect().await,
            Intent::DiscoverServices => self.discover_services().await.map(drop),
            Intent::Disconnect => self.disconnect().await,
            Intent::ReadCharacteristic(name) => self.read(name).await.map(drop),
            Intent::WriteCharacteristic(name, value) => self.write(name, value).await,
            Intent::EnableNotifications(name) => self.enable_notifications(name).await,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::Abandoned)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::registry::CachedValue;
    use crate::infrastructure::bluetooth::protocol::{CAPSENSE_CHAR_UUID, CAPSENSE_LED_SERVICE};
    use crate::infrastructure::bluetooth::simulated::{
        Operation, SimulatedPeripheral, SimulatedTransport,
    };
    use crate::infrastructure::bluetooth::transport::TransportConfig;
    use std::time::Duration;
    use tokio::time::timeout;

    fn start(board: &SimulatedPeripheral) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = SimulatedTransport::new(board.clone(), TransportConfig::default(), tx);
        SessionStateMachine::spawn(Arc::new(transport), rx, CAPSENSE_LED_SERVICE)
    }

    async fn wait_for_state(session: &SessionHandle, state: SessionState) {
        let mut rx = session.watch_state();
        timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached in time")
            .expect("session gone");
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no event in time")
            .expect("bus closed")
    }

    async fn ready(session: &SessionHandle) {
        session.scan().await.unwrap();
        session.connect().await.unwrap();
        session.discover_services().await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }

    /// Wait for the read issued on entering Ready to land
    async fn settle_led(session: &SessionHandle) {
        timeout(Duration::from_secs(2), async {
            while session.registry().get(CharacteristicName::Led).is_stale() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    async fn call_count_reaches(board: &SimulatedPeripheral, op: Operation, count: usize) {
        timeout(Duration::from_secs(2), async {
            while board.call_count(op) < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    /// Links the board, then reports the connect as failed
    struct HalfOpenTransport(SimulatedTransport);

    #[async_trait::async_trait]
    impl GattTransport for HalfOpenTransport {
        async fn start_adapter(&self) -> Result<(), TransportError> {
            self.0.start_adapter().await
        }

        async fn scan(&self, service: Uuid) -> Result<DiscoveredDevice, TransportError> {
            self.0.scan(service).await
        }

        async fn connect(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
            self.0.connect(handle).await?;
            Err(TransportError::ConnectFailed("notification stream refused".into()))
        }

        async fn discover_services(&self) -> Result<Vec<CharacteristicDescriptor>, TransportError> {
            self.0.discover_services().await
        }

        async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
            self.0.read_characteristic(uuid).await
        }

        async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError> {
            self.0.write_characteristic(uuid, value).await
        }

        async fn subscribe(&self, uuid: Uuid) -> Result<(), TransportError> {
            self.0.subscribe(uuid).await
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.0.disconnect().await
        }

        async fn close(&self) {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn test_full_bring_up_reads_led() {
        let board = SimulatedPeripheral::new().with_led(true);
        let session = start(&board);
        let mut events = session.subscribe();

        session.start_adapter().await.unwrap();
        let handle = session.scan().await.unwrap();
        assert_eq!(session.state(), SessionState::Scanning);
        assert_eq!(next_event(&mut events).await, SessionEvent::DeviceFound(handle.clone()));

        session.connect().await.unwrap();
        assert_eq!(next_event(&mut events).await, SessionEvent::Connected(handle));

        let names = session.discover_services().await.unwrap();
        assert!(names.contains(&CharacteristicName::Led));
        assert!(names.contains(&CharacteristicName::CapSense));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::ServicesDiscovered(_)
        ));

        match next_event(&mut events).await {
            SessionEvent::CharacteristicUpdated { name, value } => {
                assert_eq!(name, CharacteristicName::Led);
                assert_eq!(value.bytes, vec![0x01]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!session.registry().get(CharacteristicName::Led).is_stale());
        assert_eq!(session.registry().led_state(), Some(true));
    }

    #[tokio::test]
    async fn test_discover_while_idle_is_rejected_without_transport_call() {
        let board = SimulatedPeripheral::new();
        let session = start(&board);

        let err = session.discover_services().await.unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidState {
                command: CommandKind::DiscoverServices,
                state: SessionState::Idle,
            }
        );
        assert!(board.calls().is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_without_scan_is_rejected() {
        let board = SimulatedPeripheral::new();
        let session = start(&board);

        assert!(matches!(
            session.connect().await,
            Err(SessionError::InvalidState { .. })
        ));
        assert_eq!(board.call_count(Operation::Connect), 0);
    }

    #[tokio::test]
    async fn test_io_requires_ready() {
        let board = SimulatedPeripheral::new();
        let session = start(&board);
        session.scan().await.unwrap();
        session.connect().await.unwrap();

        assert!(matches!(
            session.set_led(true).await,
            Err(SessionError::InvalidState {
                state: SessionState::Connected,
                ..
            })
        ));
        assert!(matches!(
            session.read(CharacteristicName::Led).await,
            Err(SessionError::InvalidState { .. })
        ));
        assert_eq!(board.call_count(Operation::Write), 0);
    }

    #[tokio::test]
    async fn test_write_then_read_yields_written_value() {
        let board = SimulatedPeripheral::new();
        let session = start(&board);
        ready(&session).await;

        session.set_led(true).await.unwrap();
        assert_eq!(session.registry().led_state(), Some(true));
        assert!(board.led_on());

        let value = session.read(CharacteristicName::Led).await.unwrap();
        assert_eq!(protocol::decode_led(&value.bytes), Some(true));
        assert_eq!(session.registry().led_state(), Some(true));
    }

    #[tokio::test]
    async fn test_late_read_after_disconnect_is_discarded() {
        let board = SimulatedPeripheral::new().with_led(true);
        let session = start(&board);
        ready(&session).await;
        settle_led(&session).await;
        let mut events = session.subscribe();

        board.hold_reads();
        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.read(CharacteristicName::Led).await })
        };
        while board.call_count(Operation::Read) < 2 {
            tokio::task::yield_now().await;
        }

        session.disconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Disconnected {
                reason: DisconnectReason::Requested
            }
        );

        board.release_reads();
        let late = pending.await.unwrap();
        assert_eq!(late, Err(SessionError::Abandoned));
        assert_eq!(session.registry().get(CharacteristicName::Led), CachedValue::Stale);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unplugged_mid_session_returns_to_idle() {
        let board = SimulatedPeripheral::new();
        let session = start(&board);
        ready(&session).await;
        session
            .enable_notifications(CharacteristicName::CapSense)
            .await
            .unwrap();
        let mut events = session.subscribe();

        board.touch(0x0020);
        loop {
            if let SessionEvent::CharacteristicUpdated { name, .. } = next_event(&mut events).await {
                if name == CharacteristicName::CapSense {
                    break;
                }
            }
        }
        assert_eq!(session.registry().capsense(), Some(0x0020));

        board.drop_link();
        wait_for_state(&session, SessionState::Idle).await;
        loop {
            if let SessionEvent::Disconnected { reason } = next_event(&mut events).await {
                assert_eq!(reason, DisconnectReason::LinkLost);
                break;
            }
        }
        assert!(session.registry().get(CharacteristicName::CapSense).is_stale());
        assert!(session.registry().get(CharacteristicName::Led).is_stale());

        board.touch(0x0030);
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());

        // Recoverable: a fresh bring-up works.
        ready(&session).await;
    }

    #[tokio::test]
    async fn test_link_loss_during_discovery() {
        let board = SimulatedPeripheral::new();
        let session = start(&board);
        session.scan().await.unwrap();
        session.connect().await.unwrap();
        board.drop_link();

        // The loss is queued ahead of the command, so discovery never starts.
        let result = session.discover_services().await;
        assert!(
            matches!(
                result,
                Err(SessionError::InvalidState { .. }) | Err(SessionError::Abandoned)
            ),
            "unexpected discovery result {result:?}"
        );
        wait_for_state(&session, SessionState::Idle).await;
        assert_eq!(board.call_count(Operation::DiscoverServices), 0);
        assert!(session.registry().get(CharacteristicName::Led).is_stale());
    }

    #[tokio::test]
    async fn test_disconnect_and_close_are_idempotent() {
        let board = SimulatedPeripheral::new();
        let session = start(&board);
        ready(&session).await;
        let mut events = session.subscribe();

        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Disconnected {
                reason: DisconnectReason::Requested
            }
        );
        assert!(events.try_recv().is_err());

        session.close().await.unwrap();
        session.close().await.unwrap();
        session.disconnect().await.unwrap();
        assert_eq!(board.call_count(Operation::Close), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scan_failures() {
        let board = SimulatedPeripheral::new();
        board.set_advertising(false);
        let session = start(&board);

        let err = session.scan().await.unwrap_err();
        assert_eq!(err, SessionError::Transport(TransportError::NotFound));
        assert!(err.is_recoverable());
        assert_eq!(session.state(), SessionState::Idle);

        board.set_adapter_present(false);
        let err = session.scan().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_idle() {
        let board = SimulatedPeripheral::new();
        let session = start(&board);
        let mut events = session.subscribe();
        session.scan().await.unwrap();
        board.fail_next(Operation::Connect);

        assert!(matches!(
            session.connect().await,
            Err(SessionError::Transport(TransportError::ConnectFailed(_)))
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::DeviceFound(_)
        ));
        assert!(events.try_recv().is_err());
        assert_eq!(board.call_count(Operation::Disconnect), 1);

        ready(&session).await;
    }

    #[tokio::test]
    async fn test_half_open_connect_is_released() {
        let board = SimulatedPeripheral::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = HalfOpenTransport(SimulatedTransport::new(
            board.clone(),
            TransportConfig::default(),
            tx,
        ));
        let session = SessionStateMachine::spawn(Arc::new(transport), rx, CAPSENSE_LED_SERVICE);
        let mut events = session.subscribe();
        session.scan().await.unwrap();

        assert!(matches!(
            session.connect().await,
            Err(SessionError::Transport(TransportError::ConnectFailed(_)))
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!board.is_connected());
        assert_eq!(board.call_count(Operation::Disconnect), 1);
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::DeviceFound(_)
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_transport_events_after_reconnect_are_ignored() {
        let board = SimulatedPeripheral::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = SimulatedTransport::new(board.clone(), TransportConfig::default(), tx.clone());
        let session = SessionStateMachine::spawn(Arc::new(transport), rx, CAPSENSE_LED_SERVICE);

        ready(&session).await;
        settle_led(&session).await;
        session.disconnect().await.unwrap();
        ready(&session).await;
        settle_led(&session).await;
        let mut events = session.subscribe();

        tx.send(TransportEvent::ValueChanged {
            generation: 0,
            uuid: CAPSENSE_CHAR_UUID,
            value: vec![0x20, 0x00],
        })
        .unwrap();
        tx.send(TransportEvent::LinkLost { generation: 0 }).unwrap();
        // Transport events are handled before later commands.
        session.connect().await.unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.registry().get(CharacteristicName::CapSense).is_stale());
        assert!(events.try_recv().is_err());
        assert_eq!(board.call_count(Operation::Disconnect), 1);
    }

    #[tokio::test]
    async fn test_link_loss_with_read_outstanding() {
        let board = SimulatedPeripheral::new().with_led(true);
        let session = start(&board);
        ready(&session).await;
        settle_led(&session).await;
        let mut events = session.subscribe();

        board.hold_reads();
        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.read(CharacteristicName::Led).await })
        };
        call_count_reaches(&board, Operation::Read, 2).await;

        board.drop_link();
        wait_for_state(&session, SessionState::Idle).await;
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Disconnected {
                reason: DisconnectReason::LinkLost
            }
        );

        board.release_reads();
        assert_eq!(pending.await.unwrap(), Err(SessionError::Abandoned));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.registry().get(CharacteristicName::Led), CachedValue::Stale);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_while_disconnecting_waits_for_idle() {
        let board = SimulatedPeripheral::new();
        let session = start(&board);
        ready(&session).await;

        let first = async {
            session.disconnect().await.unwrap();
            session.state()
        };
        let second = async {
            session.disconnect().await.unwrap();
            session.state()
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first, SessionState::Idle);
        assert_eq!(second, SessionState::Idle);
        assert_eq!(board.call_count(Operation::Disconnect), 1);
    }

    #[tokio::test]
    async fn test_dropping_every_handle_releases_the_radio() {
        let board = SimulatedPeripheral::new();
        let session = start(&board);
        ready(&session).await;

        drop(session);
        call_count_reaches(&board, Operation::Close, 1).await;
        assert!(!board.is_connected());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_cache() {
        let board = SimulatedPeripheral::new();
        let session = start(&board);
        ready(&session).await;
        session.set_led(false).await.unwrap();

        board.fail_next(Operation::Write);
        assert!(matches!(
            session.set_led(true).await,
            Err(SessionError::Transport(TransportError::Write(_)))
        ));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.registry().led_state(), Some(false));
        assert!(!board.led_on());
    }

    #[tokio::test]
    async fn test_connect_when_linked_reuses_session() {
        let board = SimulatedPeripheral::new();
        let session = start(&board);
        ready(&session).await;

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(board.call_count(Operation::Connect), 1);
    }

    #[tokio::test]
    async fn test_execute_intents() {
        let board = SimulatedPeripheral::new();
        let session = start(&board);
        for intent in [
            Intent::StartAdapter,
            Intent::Scan,
            Intent::Connect,
            Intent::DiscoverServices,
            Intent::WriteCharacteristic(CharacteristicName::Led, vec![0x01]),
            Intent::ReadCharacteristic(CharacteristicName::Led),
            Intent::Disconnect,
        ] {
            session.execute(intent).await.unwrap();
        }
        assert_eq!(session.state(), SessionState::Idle);
        assert!(board.led_on());
        assert_eq!(board.calls().first(), Some(&Operation::StartAdapter));
    }
}
