//! BLE Connection Module
//!
//! [`BleDevice`] owns the session with one peer: it drives the connection
//! state machine, owns the per-epoch [`CommandQueue`] and [`ServiceRegistry`],
//! and republishes everything that happens through its event buses.
//!
//! ```text
//!                 connect()                transport: Connected
//! Disconnected ─────────────▶ Connecting ──────────────────────▶ Connected
//!      ▲                        │   │                               │
//!      │   attempt failed       │   │ disconnect()                  │ disconnect()
//!      ├────────────────────────┘   ▼                               ▼  / link loss
//!      └──────────────────────── Disconnecting ◀────────────────────┘
//!          transport: Disconnected
//! ```
//!
//! Entering `Disconnected` shuts the queue down, clears the registry and
//! schedules a deferred close of the native handle. A `connect()` issued
//! before the close fires cancels it and reuses the handle.

use crate::domain::models::{
    AttributeHandle, ConnectionState, GattStatus, OperationKind, PeerIdentity,
};
use crate::domain::settings::{DispatchMode, SessionSettings};
use crate::error::{Error, OperationError, RejectReason, Result};
use crate::infrastructure::bluetooth::events::{
    ConnectionEvent, DiscoveryEvent, ErrorEvent, ErrorSource, ValueEvent,
};
use crate::infrastructure::bluetooth::factory::FactoryChain;
use crate::infrastructure::bluetooth::gatt::GattService;
use crate::infrastructure::bluetooth::observer::{Dispatcher, EventBus};
use crate::infrastructure::bluetooth::protocol::{
    DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use crate::infrastructure::bluetooth::queue::{CommandQueue, OperationReceipt, QueueContext, Target};
use crate::infrastructure::bluetooth::registry::{AttributeRef, ServiceRegistry};
use crate::infrastructure::bluetooth::transport::{
    CharacteristicProperties, LinkHandle, NativeService, Transport, TransportSink,
};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reported by [`BleDevice::rssi`] until a reading arrives.
pub const RSSI_UNKNOWN: i16 = -127;

#[derive(Debug, Clone, Copy)]
struct Link {
    handle: LinkHandle,
    attempt: u64,
}

struct Session {
    state: ConnectionState,
    link: Option<Link>,
    next_attempt: u64,
    epoch: u64,
    queue: Option<CommandQueue>,
    /// Bumped to invalidate a scheduled deferred close.
    close_generation: u64,
    /// Bumped to invalidate a scheduled connect or disconnect deadline.
    link_generation: u64,
}

enum Published {
    Connection(ConnectionEvent),
    Discovery(DiscoveryEvent),
    Error(ErrorEvent),
}

#[derive(Default)]
struct Outbox {
    events: VecDeque<Published>,
    draining: bool,
}

pub(crate) struct DeviceInner {
    me: Weak<DeviceInner>,
    peer: PeerIdentity,
    transport: Arc<dyn Transport>,
    settings: SessionSettings,
    factories: FactoryChain,
    runtime: Handle,
    session: Mutex<Session>,
    registry: RwLock<Arc<ServiceRegistry>>,
    rssi: AtomicI16,
    outbox: Mutex<Outbox>,
    connection_events: EventBus<ConnectionEvent>,
    discovery_events: EventBus<DiscoveryEvent>,
    error_events: Arc<EventBus<ErrorEvent>>,
    value_events: EventBus<ValueEvent>,
}

/// Session manager for a single remote peer.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct BleDevice {
    inner: Arc<DeviceInner>,
}

impl BleDevice {
    /// Create a disconnected session for `peer`.
    ///
    /// Must be called from within a tokio runtime; timers and the queue worker
    /// are spawned on it.
    pub fn new(
        peer: PeerIdentity,
        transport: Arc<dyn Transport>,
        settings: &SessionSettings,
        factories: FactoryChain,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;
        let dispatcher = match settings.dispatch_mode {
            DispatchMode::Inline => None,
            DispatchMode::Dedicated => Some(Dispatcher::spawn(&runtime)),
        };

        let inner = Arc::new_cyclic(|me| DeviceInner {
            me: me.clone(),
            peer,
            transport,
            settings: settings.clone(),
            factories,
            runtime,
            session: Mutex::new(Session {
                state: ConnectionState::Disconnected,
                link: None,
                next_attempt: 1,
                epoch: 0,
                queue: None,
                close_generation: 0,
                link_generation: 0,
            }),
            registry: RwLock::new(Arc::new(ServiceRegistry::empty(0))),
            rssi: AtomicI16::new(RSSI_UNKNOWN),
            outbox: Mutex::new(Outbox::default()),
            connection_events: event_bus(&dispatcher),
            discovery_events: event_bus(&dispatcher),
            error_events: Arc::new(event_bus(&dispatcher)),
            value_events: event_bus(&dispatcher),
        });

        info!("Created session for {}", peer);
        Ok(Self { inner })
    }

    pub fn peer(&self) -> PeerIdentity {
        self.inner.peer
    }

    pub fn name(&self) -> Option<String> {
        self.inner.transport.peer_name(self.inner.peer)
    }

    pub fn rssi(&self) -> i16 {
        self.inner.rssi.load(Ordering::Relaxed)
    }

    pub fn update_rssi(&self, rssi: i16) {
        self.inner.rssi.store(rssi, Ordering::Relaxed);
    }

    /// Start connecting. Ignored while connecting, connected or disconnecting.
    pub fn connect(&self) {
        self.inner.connect();
    }

    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Release the native handle now. Safe to call repeatedly.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Current link state. Asks the transport while a link is bound and falls
    /// back to the tracked state otherwise.
    pub fn connection_state(&self) -> ConnectionState {
        let session = self.inner.session.lock();
        if session.state != ConnectionState::Disconnected {
            if let Some(link) = session.link {
                if let Some(state) = self.inner.transport.connection_state(link.handle) {
                    return state;
                }
            }
        }
        session.state
    }

    /// True while a link to a reachable peer is bound, from `Connecting`
    /// until the session is back in `Disconnected`.
    pub fn is_available(&self) -> bool {
        let session = self.inner.session.lock();
        self.inner.available(session.state)
    }

    /// Number of connection epochs so far; 0 before the first connect.
    pub fn epoch(&self) -> u64 {
        self.inner.session.lock().epoch
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.inner.registry.read().clone()
    }

    pub fn services(&self) -> Vec<Arc<dyn GattService>> {
        self.registry().services().to_vec()
    }

    pub fn service(&self, uuid: &Uuid) -> Option<Arc<dyn GattService>> {
        self.registry().service(uuid)
    }

    pub fn service_instance(&self, uuid: &Uuid, instance: u16) -> Option<Arc<dyn GattService>> {
        self.registry().service_instance(uuid, instance)
    }

    pub fn services_with_uuid(&self, uuid: &Uuid) -> Vec<Arc<dyn GattService>> {
        self.registry().services_with_uuid(uuid)
    }

    pub fn service_of<T: GattService>(&self) -> Option<Arc<T>> {
        self.registry().service_of::<T>()
    }

    pub fn read(&self, attribute: &AttributeHandle) -> OperationReceipt {
        self.inner.submit(attribute, OperationKind::Read, Vec::new())
    }

    pub fn write(&self, attribute: &AttributeHandle, value: &[u8]) -> OperationReceipt {
        self.inner.submit(attribute, OperationKind::Write, value.to_vec())
    }

    pub fn set_notification(&self, characteristic: &AttributeHandle, enabled: bool) -> OperationReceipt {
        self.inner.set_notification(characteristic, enabled)
    }

    pub fn subscribe(&self, characteristic: &AttributeHandle) -> OperationReceipt {
        self.set_notification(characteristic, true)
    }

    pub fn unsubscribe(&self, characteristic: &AttributeHandle) -> OperationReceipt {
        self.set_notification(characteristic, false)
    }

    /// Queue another service discovery. On success the registry is replaced
    /// wholesale; on failure the connection is torn down.
    pub fn discover_services(&self) -> OperationReceipt {
        self.inner.discover_services()
    }

    /// A non-owning handle for issuing operations, as given to services.
    pub fn client(&self) -> GattClient {
        self.inner.client()
    }

    pub fn connection_events(&self) -> &EventBus<ConnectionEvent> {
        &self.inner.connection_events
    }

    pub fn discovery_events(&self) -> &EventBus<DiscoveryEvent> {
        &self.inner.discovery_events
    }

    pub fn error_events(&self) -> &EventBus<ErrorEvent> {
        &self.inner.error_events
    }

    pub fn value_events(&self) -> &EventBus<ValueEvent> {
        &self.inner.value_events
    }
}

fn event_bus<E: Send + Sync + 'static>(dispatcher: &Option<Dispatcher>) -> EventBus<E> {
    match dispatcher {
        Some(dispatcher) => EventBus::with_dispatcher(dispatcher.clone()),
        None => EventBus::new(),
    }
}

impl std::fmt::Debug for BleDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleDevice")
            .field("peer", &self.inner.peer)
            .field("state", &self.inner.session.lock().state)
            .finish()
    }
}

impl DeviceInner {
    fn client(&self) -> GattClient {
        GattClient {
            device: self.me.clone(),
        }
    }

    // ---- publishing -------------------------------------------------------

    /// Events are queued while the session lock is held and delivered by
    /// `flush` after it is released, in the order they were produced.
    fn post(&self, event: Published) {
        self.outbox.lock().events.push_back(event);
    }

    fn post_error(&self, source: ErrorSource, error: OperationError) {
        self.post(Published::Error(ErrorEvent {
            peer: self.peer,
            source,
            error,
        }));
    }

    fn flush(&self) {
        {
            let mut outbox = self.outbox.lock();
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }
        loop {
            let event = {
                let mut outbox = self.outbox.lock();
                match outbox.events.pop_front() {
                    Some(event) => event,
                    None => {
                        outbox.draining = false;
                        return;
                    }
                }
            };
            match event {
                Published::Connection(e) => self.connection_events.notify(e),
                Published::Discovery(e) => self.discovery_events.notify(e),
                Published::Error(e) => self.error_events.notify(e),
            }
        }
    }

    // ---- state machine ----------------------------------------------------

    fn available(&self, state: ConnectionState) -> bool {
        state != ConnectionState::Disconnected && self.transport.is_available(self.peer)
    }

    fn transition(&self, session: &mut Session, next: ConnectionState) {
        if !session.state.can_transition_to(next) {
            error!(
                "Refusing illegal transition {} -> {} for {}",
                session.state, next, self.peer
            );
            return;
        }
        info!("{}: {} -> {}", self.peer, session.state, next);
        session.state = next;
        let available = self.available(next);
        self.post(Published::Connection(ConnectionEvent::StateChanged {
            peer: self.peer,
            state: next,
        }));
        self.post(Published::Connection(ConnectionEvent::AvailabilityChanged {
            peer: self.peer,
            available,
        }));
    }

    /// Move to `Disconnected` from any other state, ending the epoch.
    fn teardown(&self, session: &mut Session) {
        if session.state == ConnectionState::Disconnected {
            return;
        }
        if session.state == ConnectionState::Connected {
            self.transition(session, ConnectionState::Disconnecting);
        }
        if let Some(queue) = session.queue.take() {
            queue.shutdown();
        }
        *self.registry.write() = Arc::new(ServiceRegistry::empty(session.epoch));
        session.link_generation += 1;
        self.transition(session, ConnectionState::Disconnected);
        self.schedule_close(session);
    }

    fn spawn_timer(&self, delay: Duration, fire: impl FnOnce(&DeviceInner) + Send + 'static) {
        let device = self.me.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(device) = device.upgrade() {
                fire(&device);
            }
        });
    }

    fn schedule_close(&self, session: &mut Session) {
        if session.link.is_none() {
            return;
        }
        session.close_generation += 1;
        let generation = session.close_generation;
        debug!(
            "Deferred close of {} in {:?}",
            self.peer,
            self.settings.close_delay()
        );
        self.spawn_timer(self.settings.close_delay(), move |device| {
            device.on_close_timer(generation)
        });
    }

    fn on_close_timer(&self, generation: u64) {
        let link = {
            let mut session = self.session.lock();
            if session.close_generation != generation
                || session.state != ConnectionState::Disconnected
            {
                return;
            }
            session.link.take()
        };
        if let Some(link) = link {
            info!("Releasing {} for {}", link.handle, self.peer);
            self.transport.close(link.handle);
        }
    }

    fn schedule_link_deadline(&self, session: &mut Session) {
        session.link_generation += 1;
        let generation = session.link_generation;
        self.spawn_timer(self.settings.connect_timeout(), move |device| {
            device.on_link_deadline(generation)
        });
    }

    fn on_link_deadline(&self, generation: u64) {
        {
            let mut session = self.session.lock();
            if session.link_generation != generation {
                return;
            }
            match session.state {
                ConnectionState::Connecting => {
                    warn!("Connect attempt to {} timed out", self.peer);
                    self.post_error(
                        ErrorSource::Connection,
                        OperationError::Gatt(GattStatus::CONNECTION_TIMEOUT),
                    );
                    if let Some(link) = session.link {
                        if let Err(e) = self.transport.disconnect(link.handle) {
                            debug!("Cancelling connect on {} failed: {}", link.handle, e);
                        }
                    }
                    self.teardown(&mut session);
                }
                ConnectionState::Disconnecting => {
                    warn!(
                        "No disconnect confirmation from {}; tearing down locally",
                        self.peer
                    );
                    self.teardown(&mut session);
                }
                _ => return,
            }
        }
        self.flush();
    }

    fn connect(&self) {
        {
            let mut session = self.session.lock();
            match session.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    debug!("connect() ignored: {} is {}", self.peer, session.state);
                    return;
                }
                ConnectionState::Disconnecting => {
                    warn!("connect() ignored while disconnecting from {}", self.peer);
                    return;
                }
                ConnectionState::Disconnected => {}
            }

            if !self.transport.is_available(self.peer) {
                warn!("{} is not available; nothing to connect to", self.peer);
                self.post(Published::Connection(ConnectionEvent::StateChanged {
                    peer: self.peer,
                    state: ConnectionState::Disconnected,
                }));
                self.post(Published::Connection(ConnectionEvent::AvailabilityChanged {
                    peer: self.peer,
                    available: false,
                }));
            } else {
                // a pending deferred close must not undo this attempt
                session.close_generation += 1;
                let attempt = session.next_attempt;
                session.next_attempt += 1;
                let sink = TransportSink {
                    device: self.me.clone(),
                    attempt,
                };

                info!("Connecting to {} (attempt {})", self.peer, attempt);
                self.transition(&mut session, ConnectionState::Connecting);
                let previous = session.link.take();
                let started = match previous {
                    Some(link) => {
                        debug!("Reusing {} for {}", link.handle, self.peer);
                        self.transport.reconnect(self.peer, link.handle, sink)
                    }
                    None => self.transport.connect(self.peer, sink),
                };
                match started {
                    Ok(handle) => {
                        session.link = Some(Link { handle, attempt });
                        self.schedule_link_deadline(&mut session);
                    }
                    Err(e) => {
                        error!("Failed to start connecting to {}: {}", self.peer, e);
                        // the reused handle is no longer tracked anywhere
                        if let Some(link) = previous {
                            info!("Releasing {} for {}", link.handle, self.peer);
                            self.transport.close(link.handle);
                        }
                        self.post_error(ErrorSource::Connection, e.into());
                        self.transition(&mut session, ConnectionState::Disconnected);
                    }
                }
            }
        }
        self.flush();
    }

    fn disconnect(&self) {
        {
            let mut session = self.session.lock();
            match session.state {
                ConnectionState::Connected | ConnectionState::Connecting => {}
                state => {
                    debug!("disconnect() ignored: {} is {}", self.peer, state);
                    return;
                }
            }

            info!("Disconnecting from {}", self.peer);
            self.transition(&mut session, ConnectionState::Disconnecting);
            let requested = match session.link {
                Some(link) => self.transport.disconnect(link.handle),
                None => Ok(()),
            };
            match requested {
                Ok(()) => self.schedule_link_deadline(&mut session),
                Err(e) => {
                    warn!("Transport refused to disconnect {}: {}", self.peer, e);
                    self.post_error(ErrorSource::Connection, e.into());
                    self.teardown(&mut session);
                }
            }
        }
        self.flush();
    }

    fn close(&self) {
        let link = {
            let mut session = self.session.lock();
            self.teardown(&mut session);
            session.close_generation += 1;
            session.link.take()
        };
        match link {
            Some(link) => {
                info!("Closing {} for {}", link.handle, self.peer);
                self.transport.close(link.handle);
            }
            None => debug!("close(): {} holds no handle", self.peer),
        }
        self.flush();
    }

    fn enter_connected(&self, session: &mut Session, link: Link) {
        session.link_generation += 1;
        session.close_generation += 1;
        session.epoch += 1;
        let epoch = session.epoch;

        let device = self.me.clone();
        let queue = CommandQueue::start(
            QueueContext {
                peer: self.peer,
                epoch,
                link: link.handle,
                transport: self.transport.clone(),
                errors: self.error_events.clone(),
                operation_timeout: self.settings.operation_timeout(),
                discovery_timeout: self.settings.discovery_timeout(),
                settle_delay: self.settings.settle_delay(),
                abort: Arc::new(move |epoch| {
                    if let Some(device) = device.upgrade() {
                        device.abort_epoch(epoch);
                    }
                }),
            },
            &self.runtime,
        );
        let _discovery = queue.submit(OperationKind::Discover, Target::Discovery, Vec::new());
        session.queue = Some(queue);
        *self.registry.write() = Arc::new(ServiceRegistry::empty(epoch));
        self.transition(session, ConnectionState::Connected);
    }

    /// End `epoch` after a failure that leaves it unusable.
    fn abort_epoch(&self, epoch: u64) {
        {
            let mut session = self.session.lock();
            if session.epoch != epoch
                || !matches!(
                    session.state,
                    ConnectionState::Connected | ConnectionState::Disconnecting
                )
            {
                return;
            }
            warn!("Aborting epoch {} of {}", epoch, self.peer);
            if let Some(link) = session.link {
                if let Err(e) = self.transport.disconnect(link.handle) {
                    debug!("Disconnect of {} failed: {}", link.handle, e);
                }
            }
            self.teardown(&mut session);
        }
        self.flush();
    }

    // ---- transport callbacks ----------------------------------------------

    pub(crate) fn on_connection_state_changed(
        &self,
        attempt: u64,
        status: GattStatus,
        reported: ConnectionState,
    ) {
        {
            let mut session = self.session.lock();
            let Some(link) = session.link.filter(|l| l.attempt == attempt) else {
                debug!(
                    "Ignoring {} from stale attempt {} of {}",
                    reported, attempt, self.peer
                );
                return;
            };
            if !status.is_success() {
                warn!("{} reported status {} ({})", self.peer, status, reported);
                self.post_error(ErrorSource::Connection, OperationError::Gatt(status));
            }

            match (session.state, reported) {
                (ConnectionState::Connecting, ConnectionState::Connected) if status.is_success() => {
                    self.enter_connected(&mut session, link);
                }
                (ConnectionState::Connecting, ConnectionState::Connected) => {
                    if let Err(e) = self.transport.disconnect(link.handle) {
                        debug!("Disconnect of {} failed: {}", link.handle, e);
                    }
                    self.teardown(&mut session);
                }
                (ConnectionState::Connecting, ConnectionState::Disconnected) => {
                    if status.is_success() {
                        self.post_error(
                            ErrorSource::Connection,
                            OperationError::Gatt(GattStatus::FAILURE),
                        );
                    }
                    self.teardown(&mut session);
                }
                (ConnectionState::Connected, ConnectionState::Disconnecting) => {
                    self.transition(&mut session, ConnectionState::Disconnecting);
                    self.schedule_link_deadline(&mut session);
                }
                (ConnectionState::Connected, ConnectionState::Disconnected)
                | (ConnectionState::Disconnecting, ConnectionState::Disconnected) => {
                    self.teardown(&mut session);
                }
                (current, reported) => {
                    debug!("Ignoring {} while {} ({})", reported, current, self.peer);
                }
            }
        }
        self.flush();
    }

    pub(crate) fn on_discovery_complete(
        &self,
        attempt: u64,
        status: GattStatus,
        services: Vec<NativeService>,
    ) {
        let (queue, epoch) = {
            let session = self.session.lock();
            match (&session.link, &session.queue) {
                (Some(link), Some(queue))
                    if link.attempt == attempt && session.state == ConnectionState::Connected =>
                {
                    (queue.clone(), session.epoch)
                }
                _ => {
                    debug!("Ignoring discovery result for {} (attempt {})", self.peer, attempt);
                    return;
                }
            }
        };

        // a result nobody asked for (the peer's attributes changed) still
        // replaces the registry; failures of a queued discovery are reported
        // by the queue, which also ends the epoch
        let solicited = queue.complete_discovery(status);
        if !status.is_success() {
            if !solicited {
                warn!("Unsolicited discovery on {} failed ({})", self.peer, status);
                self.post_error(ErrorSource::Discovery, OperationError::Gatt(status));
                self.flush();
            }
            return;
        }
        if !solicited {
            info!("Services of {} changed; replacing registry", self.peer);
        }

        let registry = Arc::new(ServiceRegistry::build(
            epoch,
            &self.factories,
            &self.client(),
            &services,
        ));
        {
            let session = self.session.lock();
            if session.epoch != epoch || session.state != ConnectionState::Connected {
                debug!("Discarding registry for finished epoch {}", epoch);
                return;
            }
            *self.registry.write() = registry.clone();
            for service in registry.services() {
                self.post(Published::Discovery(DiscoveryEvent::ServiceDiscovered {
                    peer: self.peer,
                    epoch,
                    service: service.clone(),
                }));
            }
            self.post(Published::Discovery(DiscoveryEvent::Completed {
                peer: self.peer,
                epoch,
                services: registry.services().len(),
            }));
        }
        info!(
            "Discovered {} services on {} (epoch {})",
            registry.services().len(),
            self.peer,
            epoch
        );
        self.flush();
    }

    pub(crate) fn on_operation_complete(
        &self,
        attempt: u64,
        attr: AttributeHandle,
        status: GattStatus,
        value: Vec<u8>,
    ) {
        let queue = {
            let session = self.session.lock();
            match (&session.link, &session.queue) {
                (Some(link), Some(queue)) if link.attempt == attempt => queue.clone(),
                _ => {
                    debug!("Dropping completion for {} from attempt {}", attr, attempt);
                    return;
                }
            }
        };
        queue.complete_attribute(attr, status, value);
    }

    pub(crate) fn on_value_changed(&self, attempt: u64, attr: AttributeHandle, value: Vec<u8>) {
        let registry = {
            let session = self.session.lock();
            let current = session.link.map(|l| l.attempt) == Some(attempt);
            if !current || session.state != ConnectionState::Connected {
                debug!("Dropping value change for {} from attempt {}", attr, attempt);
                return;
            }
            self.registry.read().clone()
        };

        let Some(AttributeRef::Characteristic {
            service,
            characteristic,
        }) = registry.resolve(&attr)
        else {
            warn!("Value change for unknown characteristic {}", attr);
            return;
        };

        characteristic.set_value(&value);
        let hooked = catch_unwind(AssertUnwindSafe(|| {
            service.on_characteristic_changed(&characteristic)
        }));
        if hooked.is_err() {
            error!("Change hook panicked for {}", attr);
            self.error_events.notify(ErrorEvent {
                peer: self.peer,
                source: ErrorSource::Notification { attribute: attr },
                error: OperationError::Fatal(format!("change hook panicked for {}", attr)),
            });
        }
        self.value_events.notify(ValueEvent {
            peer: self.peer,
            attribute: attr,
            value,
        });
    }

    // ---- operations -------------------------------------------------------

    /// The epoch's queue and the resolved attribute, or why not.
    fn resolve(
        &self,
        attribute: &AttributeHandle,
    ) -> std::result::Result<(CommandQueue, AttributeRef), RejectReason> {
        let session = self.session.lock();
        let queue = match (&session.queue, session.state) {
            (Some(queue), ConnectionState::Connected) => queue.clone(),
            _ => return Err(RejectReason::NotConnected),
        };
        let target = self
            .registry
            .read()
            .resolve(attribute)
            .ok_or(RejectReason::UnknownAttribute(*attribute))?;
        Ok((queue, target))
    }

    fn submit(&self, attribute: &AttributeHandle, kind: OperationKind, payload: Vec<u8>) -> OperationReceipt {
        match self.resolve(attribute) {
            Ok((queue, target)) => queue.submit(kind, Target::Attribute(target), payload),
            Err(reason) => {
                debug!("Rejected {} of {}: {}", kind, attribute, reason);
                OperationReceipt::rejected(reason)
            }
        }
    }

    fn discover_services(&self) -> OperationReceipt {
        let session = self.session.lock();
        match (&session.queue, session.state) {
            (Some(queue), ConnectionState::Connected) => {
                debug!("Queueing rediscovery of {}", self.peer);
                queue.submit(OperationKind::Discover, Target::Discovery, Vec::new())
            }
            _ => OperationReceipt::rejected(RejectReason::NotConnected),
        }
    }

    fn set_notification(&self, attribute: &AttributeHandle, enabled: bool) -> OperationReceipt {
        let (queue, target) = match self.resolve(attribute) {
            Ok(resolved) => resolved,
            Err(reason) => return OperationReceipt::rejected(reason),
        };
        let AttributeRef::Characteristic {
            service,
            characteristic,
        } = target
        else {
            return OperationReceipt::rejected(RejectReason::NotACharacteristic(*attribute));
        };
        let Some(descriptor) = characteristic.config_descriptor().cloned() else {
            return OperationReceipt::rejected(RejectReason::MissingConfigDescriptor(*attribute));
        };

        let properties = characteristic.properties();
        if !properties.can_subscribe() {
            warn!(
                "{} advertises neither notify nor indicate; writing configuration anyway",
                attribute
            );
        }
        let payload = if !enabled {
            DISABLE_NOTIFICATION_VALUE
        } else if properties.contains(CharacteristicProperties::INDICATE)
            && !properties.contains(CharacteristicProperties::NOTIFY)
        {
            ENABLE_INDICATION_VALUE
        } else {
            ENABLE_NOTIFICATION_VALUE
        };

        debug!(
            "{} notifications for {}",
            if enabled { "Enabling" } else { "Disabling" },
            attribute
        );
        queue.submit(
            OperationKind::Subscribe,
            Target::Attribute(AttributeRef::Descriptor {
                service,
                characteristic,
                descriptor,
            }),
            payload.to_vec(),
        )
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        if let Some(queue) = session.queue.take() {
            queue.shutdown();
        }
        if let Some(link) = session.link.take() {
            debug!("Closing {} for dropped session {}", link.handle, self.peer);
            self.transport.close(link.handle);
        }
    }
}

/// Non-owning operation handle given to services.
///
/// Holds a weak reference, so services never keep their device alive.
#[derive(Clone)]
pub struct GattClient {
    device: Weak<DeviceInner>,
}

impl GattClient {
    /// A client bound to no device; every operation is rejected with
    /// [`RejectReason::NotConnected`].
    pub fn detached() -> Self {
        Self { device: Weak::new() }
    }

    pub fn peer(&self) -> Option<PeerIdentity> {
        self.device.upgrade().map(|d| d.peer)
    }

    pub fn is_connected(&self) -> bool {
        self.device
            .upgrade()
            .map(|d| d.session.lock().state == ConnectionState::Connected)
            .unwrap_or(false)
    }

    pub fn read(&self, attribute: &AttributeHandle) -> OperationReceipt {
        match self.device.upgrade() {
            Some(device) => device.submit(attribute, OperationKind::Read, Vec::new()),
            None => OperationReceipt::rejected(RejectReason::NotConnected),
        }
    }

    pub fn write(&self, attribute: &AttributeHandle, value: &[u8]) -> OperationReceipt {
        match self.device.upgrade() {
            Some(device) => device.submit(attribute, OperationKind::Write, value.to_vec()),
            None => OperationReceipt::rejected(RejectReason::NotConnected),
        }
    }

    pub fn set_notification(&self, characteristic: &AttributeHandle, enabled: bool) -> OperationReceipt {
        match self.device.upgrade() {
            Some(device) => device.set_notification(characteristic, enabled),
            None => OperationReceipt::rejected(RejectReason::NotConnected),
        }
    }
}
