use ble_session::infrastructure::bluetooth::protocol::{uuid_from_u16, CLIENT_CHARACTERISTIC_CONFIG};
use ble_session::infrastructure::bluetooth::services::BatteryService;
use ble_session::infrastructure::bluetooth::testing::{MockTransport, TransportCall};
use ble_session::{
    AttributeHandle, BleDevice, CharacteristicProperties, ConnectionEvent, ConnectionState,
    DiscoveryEvent, DispatchMode, ErrorEvent, ErrorSource, FactoryChain, GattService, GattStatus,
    LinkHandle, NativeCharacteristic, NativeDescriptor, NativeService, OperationError, OperationKind,
    PeerIdentity, RejectReason, SessionSettings, TransportError, ValueEvent,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn peer() -> PeerIdentity {
    "c0:ff:ee:00:00:01".parse().unwrap()
}

fn level() -> AttributeHandle {
    AttributeHandle::new(BatteryService::BATTERY_LEVEL, 1)
}

fn level_config() -> AttributeHandle {
    AttributeHandle::new(CLIENT_CHARACTERISTIC_CONFIG, 2)
}

fn custom() -> AttributeHandle {
    AttributeHandle::new(uuid_from_u16(0xFFF1), 4)
}

fn peer_services() -> Vec<NativeService> {
    vec![
        NativeService {
            handle: AttributeHandle::new(BatteryService::UUID, 0),
            characteristics: vec![NativeCharacteristic {
                handle: level(),
                properties: CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                descriptors: vec![NativeDescriptor {
                    handle: level_config(),
                }],
            }],
        },
        NativeService {
            handle: AttributeHandle::new(uuid_from_u16(0xFFF0), 3),
            characteristics: vec![NativeCharacteristic {
                handle: custom(),
                properties: CharacteristicProperties::READ | CharacteristicProperties::WRITE,
                descriptors: vec![],
            }],
        },
    ]
}

/// Collects everything a device publishes.
#[derive(Default)]
struct Recorded {
    states: Mutex<Vec<ConnectionState>>,
    availability: Mutex<Vec<bool>>,
    errors: Mutex<Vec<ErrorEvent>>,
    values: Mutex<Vec<ValueEvent>>,
    discovered: Mutex<Vec<u64>>,
}

struct Harness {
    transport: Arc<MockTransport>,
    device: BleDevice,
    recorded: Arc<Recorded>,
    // observers are held weakly by the buses
    _observers: Vec<Arc<dyn std::any::Any>>,
}

impl Harness {
    fn new(settings: SessionSettings) -> Self {
        let transport = MockTransport::new();
        let device = BleDevice::new(
            peer(),
            transport.clone(),
            &settings,
            FactoryChain::standard(),
        )
        .unwrap();
        let recorded = Arc::new(Recorded::default());

        let r = recorded.clone();
        let connection = Arc::new(move |e: &ConnectionEvent| match e {
            ConnectionEvent::StateChanged { state, .. } => r.states.lock().push(*state),
            ConnectionEvent::AvailabilityChanged { available, .. } => {
                r.availability.lock().push(*available)
            }
        });
        let r = recorded.clone();
        let errors = Arc::new(move |e: &ErrorEvent| r.errors.lock().push(e.clone()));
        let r = recorded.clone();
        let values = Arc::new(move |e: &ValueEvent| r.values.lock().push(e.clone()));
        let r = recorded.clone();
        let discovery = Arc::new(move |e: &DiscoveryEvent| {
            if let DiscoveryEvent::Completed { epoch, .. } = e {
                r.discovered.lock().push(*epoch);
            }
        });
        device.connection_events().register(&connection);
        device.error_events().register(&errors);
        device.value_events().register(&values);
        device.discovery_events().register(&discovery);

        Self {
            transport,
            device,
            recorded,
            _observers: vec![
                connection as Arc<dyn std::any::Any>,
                errors as Arc<dyn std::any::Any>,
                values as Arc<dyn std::any::Any>,
                discovery as Arc<dyn std::any::Any>,
            ],
        }
    }

    fn link(&self) -> LinkHandle {
        self.transport.last_link().unwrap()
    }

    async fn wait_for_discovery_request(&self) {
        self.transport
            .wait_for(|calls| calls.iter().any(|c| matches!(c, TransportCall::Discover { .. })))
            .await;
    }

    /// Connect and finish discovery with [`peer_services`].
    async fn connected(settings: SessionSettings) -> Self {
        let harness = Self::new(settings);
        harness.device.connect();
        harness.transport.signal_connected(harness.link());
        harness.wait_for_discovery_request().await;
        harness
            .transport
            .signal_discovered(harness.link(), GattStatus::SUCCESS, peer_services());
        assert_eq!(harness.device.connection_state(), ConnectionState::Connected);
        harness
    }

    fn states(&self) -> Vec<ConnectionState> {
        self.recorded.states.lock().clone()
    }

    fn errors(&self) -> Vec<ErrorEvent> {
        self.recorded.errors.lock().clone()
    }

    fn count(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.transport.calls().iter().filter(|c| predicate(c)).count()
    }
}

#[tokio::test(start_paused = true)]
async fn discovery_populates_registry_after_settling() {
    let h = Harness::new(SessionSettings::default());
    h.device.connect();
    h.transport.signal_connected(h.link());
    assert_eq!(h.device.epoch(), 1);
    assert!(h.device.registry().is_empty());

    let started = tokio::time::Instant::now();
    h.wait_for_discovery_request().await;
    assert!(started.elapsed() >= SessionSettings::default().settle_delay());

    h.transport
        .signal_discovered(h.link(), GattStatus::SUCCESS, peer_services());

    let registry = h.device.registry();
    assert_eq!(registry.epoch(), 1);
    assert_eq!(h.device.services().len(), 2);
    assert!(h.device.service_of::<BatteryService>().is_some());
    assert!(h.device.service(&uuid_from_u16(0xFFF0)).is_some());
    assert_eq!(registry.attribute_count(), 3);
    assert_eq!(*h.recorded.discovered.lock(), vec![1]);
    assert!(h.device.is_available());
    assert_eq!(
        h.states(),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
}

#[tokio::test(start_paused = true)]
async fn read_updates_battery_level() {
    let h = Harness::connected(SessionSettings::default()).await;
    let battery = h.device.service_of::<BatteryService>().unwrap();

    let receipt = h.device.read(&level());
    h.transport
        .wait_for(|calls| calls.iter().any(|c| matches!(c, TransportCall::Read { .. })))
        .await;
    h.transport.complete(h.link(), level(), GattStatus::SUCCESS, &[0x64]);

    assert_eq!(receipt.await, Ok(vec![0x64]));
    assert_eq!(battery.battery_level(), 100);
    assert_eq!(h.device.connection_state(), ConnectionState::Connected);
    assert!(h.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn write_timeout_keeps_connection() {
    let h = Harness::connected(SessionSettings::default()).await;

    let receipt = h.device.write(&custom(), &[0x01]);
    assert_eq!(
        receipt.await,
        Err(OperationError::TimedOut(Duration::from_secs(3)))
    );
    assert_eq!(h.device.connection_state(), ConnectionState::Connected);
    let errors = h.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].source,
        ErrorSource::Operation {
            kind: OperationKind::Write,
            attribute: custom()
        }
    );

    let next = h.device.read(&level());
    h.transport
        .wait_for(|calls| calls.iter().any(|c| matches!(c, TransportCall::Read { .. })))
        .await;
    h.transport.complete(h.link(), level(), GattStatus::SUCCESS, &[0x10]);
    assert_eq!(next.await, Ok(vec![0x10]));
}

#[tokio::test(start_paused = true)]
async fn operations_never_overlap() {
    let h = Harness::connected(SessionSettings::default()).await;

    let reads = |count: usize| {
        move |calls: &[TransportCall]| {
            calls
                .iter()
                .filter(|c| matches!(c, TransportCall::Read { .. }))
                .count()
                >= count
        }
    };

    let first = h.device.read(&level());
    let second = h.device.read(&custom());
    h.transport.wait_for(reads(1)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.count(|c| matches!(c, TransportCall::Read { .. })), 1);
    h.transport.complete(h.link(), level(), GattStatus::SUCCESS, &[1]);
    assert_eq!(first.await, Ok(vec![1]));

    h.transport.wait_for(reads(2)).await;
    assert!(matches!(
        h.transport.calls().last(),
        Some(TransportCall::Read { attr, .. }) if *attr == custom()
    ));
    h.transport.complete(h.link(), custom(), GattStatus::SUCCESS, &[2]);
    assert_eq!(second.await, Ok(vec![2]));
    assert_eq!(h.transport.max_outstanding(), 1);
}

#[tokio::test(start_paused = true)]
async fn link_loss_fails_queued_operations() {
    let h = Harness::connected(SessionSettings::default()).await;

    let receipts: Vec<_> = [level(), custom(), level()]
        .iter()
        .map(|attr| h.device.read(attr))
        .collect();
    h.transport
        .wait_for(|calls| calls.iter().any(|c| matches!(c, TransportCall::Read { .. })))
        .await;

    h.transport.set_available(peer(), false);
    h.transport.signal_disconnected(h.link(), GattStatus::SUCCESS);

    for receipt in receipts {
        assert_eq!(receipt.await, Err(OperationError::ConnectionClosed));
    }
    assert_eq!(h.device.connection_state(), ConnectionState::Disconnected);
    assert!(h.device.registry().is_empty());
    assert_eq!(h.recorded.availability.lock().last(), Some(&false));
    assert_eq!(
        h.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ]
    );
    // closed connections are reported through receipts only
    assert!(h.errors().is_empty());
    assert_eq!(
        h.device.read(&level()).await,
        Err(OperationError::Rejected(RejectReason::NotConnected))
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_fails_queued_reads_and_clears_session() {
    let h = Harness::connected(SessionSettings::default()).await;
    assert!(h.device.is_available());

    let receipts: Vec<_> = (0..3).map(|_| h.device.read(&level())).collect();
    h.transport
        .wait_for(|calls| calls.iter().any(|c| matches!(c, TransportCall::Read { .. })))
        .await;

    h.device.disconnect();
    assert_eq!(h.device.connection_state(), ConnectionState::Disconnecting);
    h.transport.signal_disconnected(h.link(), GattStatus::SUCCESS);

    for receipt in receipts {
        assert_eq!(receipt.await, Err(OperationError::ConnectionClosed));
    }
    assert_eq!(h.device.connection_state(), ConnectionState::Disconnected);
    assert!(h.device.registry().is_empty());
    assert!(!h.device.is_available());
    assert_eq!(h.recorded.availability.lock().last(), Some(&false));
}

#[tokio::test(start_paused = true)]
async fn observed_states_follow_legal_edges() {
    let h = Harness::connected(SessionSettings::default()).await;
    h.device.disconnect();
    h.transport.signal_disconnected(h.link(), GattStatus::SUCCESS);
    h.device.connect();
    h.transport.signal_disconnected(h.link(), GattStatus::FAILURE);

    let states = h.states();
    let mut previous = ConnectionState::Disconnected;
    for state in &states {
        assert!(
            previous.can_transition_to(*state),
            "illegal edge {} -> {}",
            previous,
            state
        );
        previous = *state;
    }
    assert_eq!(previous, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn reconnect_within_close_delay_keeps_handle() {
    let h = Harness::connected(SessionSettings::default()).await;
    let link = h.link();
    let old_sink = h.transport.sink(link).unwrap();

    h.device.disconnect();
    h.transport.signal_disconnected(link, GattStatus::SUCCESS);
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.device.connect();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(h.count(|c| matches!(c, TransportCall::Close { .. })), 0);
    assert_eq!(
        h.count(|c| matches!(c, TransportCall::Reconnect { link: l, .. } if *l == link)),
        1
    );

    // the previous attempt can no longer move the session
    old_sink.connection_state_changed(GattStatus::SUCCESS, ConnectionState::Disconnected);
    assert_eq!(h.device.connection_state(), ConnectionState::Connecting);

    h.transport.signal_connected(link);
    assert_eq!(h.device.connection_state(), ConnectionState::Connected);
    assert_eq!(h.device.epoch(), 2);
}

#[tokio::test(start_paused = true)]
async fn handle_is_closed_after_close_delay() {
    let h = Harness::connected(SessionSettings::default()).await;
    let link = h.link();

    h.device.disconnect();
    h.transport.signal_disconnected(link, GattStatus::SUCCESS);
    assert_eq!(h.count(|c| matches!(c, TransportCall::Close { .. })), 0);

    tokio::time::sleep(SessionSettings::default().close_delay() + Duration::from_millis(10)).await;
    assert_eq!(
        h.count(|c| matches!(c, TransportCall::Close { link: l } if *l == link)),
        1
    );

    h.device.close();
    assert_eq!(h.count(|c| matches!(c, TransportCall::Close { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_connect_reports_error() {
    let h = Harness::new(SessionSettings::default());
    h.transport
        .fail_next(TransportError::Other("radio off".to_string()));

    h.device.connect();

    assert_eq!(h.device.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        h.states(),
        vec![ConnectionState::Connecting, ConnectionState::Disconnected]
    );
    let errors = h.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].source, ErrorSource::Connection);
    assert_eq!(errors[0].error, OperationError::Fatal("radio off".to_string()));
    assert_eq!(h.device.peer(), peer());
}

#[tokio::test(start_paused = true)]
async fn level_observer_subscribes_and_receives_notifications() {
    let h = Harness::connected(SessionSettings::default()).await;
    let battery = h.device.service_of::<BatteryService>().unwrap();
    let levels = Arc::new(Mutex::new(Vec::new()));
    let sink = levels.clone();
    let observer = Arc::new(move |level: &i32| sink.lock().push(*level));

    let receipt = battery.observe_level(&observer);
    h.transport
        .wait_for(|calls| calls.iter().any(|c| matches!(c, TransportCall::Write { .. })))
        .await;
    assert_eq!(
        h.count(|c| matches!(
            c,
            TransportCall::SetNotify { attr, enabled: true, .. } if *attr == level()
        )),
        1
    );
    assert_eq!(
        h.count(|c| matches!(
            c,
            TransportCall::Write { attr, value, .. } if *attr == level_config() && value == &vec![0x01, 0x00]
        )),
        1
    );
    h.transport
        .complete(h.link(), level_config(), GattStatus::SUCCESS, &[]);
    assert!(receipt.await.is_ok());

    h.transport.signal_value(h.link(), level(), &[0x32]);
    assert_eq!(*levels.lock(), vec![50]);
    let values = h.recorded.values.lock().clone();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].attribute, level());
    assert_eq!(values[0].value, vec![0x32]);
    assert_eq!(battery.battery_level(), 50);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_writes_disable_value() {
    let h = Harness::connected(SessionSettings::default()).await;

    let receipt = h.device.unsubscribe(&level());
    h.transport
        .wait_for(|calls| calls.iter().any(|c| matches!(c, TransportCall::Write { .. })))
        .await;
    assert_eq!(
        h.count(|c| matches!(
            c,
            TransportCall::Write { value, .. } if value == &vec![0x00, 0x00]
        )),
        1
    );
    h.transport
        .complete(h.link(), level_config(), GattStatus::SUCCESS, &[]);
    assert!(receipt.await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn invalid_submissions_are_rejected() {
    let h = Harness::connected(SessionSettings::default()).await;
    let unknown = AttributeHandle::new(uuid_from_u16(0x2A00), 9);

    assert_eq!(
        h.device.read(&unknown).await,
        Err(OperationError::Rejected(RejectReason::UnknownAttribute(unknown)))
    );
    assert_eq!(
        h.device.subscribe(&custom()).await,
        Err(OperationError::Rejected(RejectReason::MissingConfigDescriptor(custom())))
    );
    assert_eq!(
        h.device.subscribe(&level_config()).await,
        Err(OperationError::Rejected(RejectReason::NotACharacteristic(level_config())))
    );
}

#[tokio::test(start_paused = true)]
async fn discovery_failure_aborts_epoch() {
    let h = Harness::new(SessionSettings::default());
    h.device.connect();
    h.transport.signal_connected(h.link());
    h.wait_for_discovery_request().await;

    h.transport
        .signal_discovered(h.link(), GattStatus::FAILURE, Vec::new());
    h.transport
        .wait_for(|calls| calls.iter().any(|c| matches!(c, TransportCall::Disconnect { .. })))
        .await;

    assert_eq!(h.device.connection_state(), ConnectionState::Disconnected);
    assert!(h.device.registry().is_empty());
    let errors = h.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].source, ErrorSource::Discovery);
    assert_eq!(errors[0].error, OperationError::Gatt(GattStatus::FAILURE));
}

#[tokio::test(start_paused = true)]
async fn discovery_timeout_aborts_epoch() {
    let h = Harness::new(SessionSettings::default());
    h.device.connect();
    h.transport.signal_connected(h.link());
    h.wait_for_discovery_request().await;

    tokio::time::sleep(SessionSettings::default().discovery_timeout() + Duration::from_millis(10))
        .await;

    assert_eq!(h.device.connection_state(), ConnectionState::Disconnected);
    assert!(matches!(
        h.errors()[0].error,
        OperationError::TimedOut(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn dedicated_dispatch_delivers_off_the_caller() {
    let settings = SessionSettings {
        dispatch_mode: DispatchMode::Dedicated,
        ..SessionSettings::default()
    };
    let h = Harness::new(settings);

    h.device.connect();
    // nothing delivered until the dispatcher task runs
    assert!(h.states().is_empty());

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(h.states(), vec![ConnectionState::Connecting]);
}

#[tokio::test(start_paused = true)]
async fn dropped_observer_stops_receiving() {
    let h = Harness::new(SessionSettings::default());
    let seen = Arc::new(Mutex::new(0usize));
    let sink = seen.clone();
    let observer = Arc::new(move |_: &ConnectionEvent| *sink.lock() += 1);
    assert!(h.device.connection_events().register(&observer));

    h.device.connect();
    let after_connect = *seen.lock();
    assert_eq!(after_connect, 2);

    drop(observer);
    h.transport.signal_disconnected(h.link(), GattStatus::FAILURE);
    assert_eq!(*seen.lock(), after_connect);
    assert_eq!(h.device.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn service_hooks_see_typed_services() {
    let h = Harness::connected(SessionSettings::default()).await;
    let service = h.device.service(&BatteryService::UUID).unwrap();
    assert_eq!(service.instance_id(), 0);
    assert!(service.characteristic(&BatteryService::BATTERY_LEVEL).is_some());
    assert_eq!(h.device.services_with_uuid(&uuid_from_u16(0xFFF0)).len(), 1);
    assert!(h.device.service_instance(&uuid_from_u16(0xFFF0), 3).is_some());
}

#[tokio::test(start_paused = true)]
async fn retries_after_timeout_receive_prompt_answers() {
    let h = Harness::connected(SessionSettings::default()).await;
    let reads = |count: usize| {
        move |calls: &[TransportCall]| {
            calls
                .iter()
                .filter(|c| matches!(c, TransportCall::Read { .. }))
                .count()
                >= count
        }
    };

    assert_eq!(
        h.device.read(&custom()).await,
        Err(OperationError::TimedOut(Duration::from_secs(3)))
    );

    let mut retries = Vec::new();
    for attempt in 0..3 {
        let retry = h.device.read(&custom());
        h.transport.wait_for(reads(2 + attempt)).await;
        h.transport.complete(h.link(), custom(), GattStatus::SUCCESS, &[0x64]);
        retries.push(retry.await);
    }

    assert_eq!(retries, vec![Ok(vec![0x64]); 3]);
    assert_eq!(h.count(|c| matches!(c, TransportCall::Read { .. })), 4);
    assert_eq!(h.errors().len(), 1);
    assert_eq!(h.device.connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn late_answer_during_retry_wait_is_not_taken_for_the_retry() {
    let h = Harness::connected(SessionSettings::default()).await;

    assert!(matches!(
        h.device.read(&custom()).await,
        Err(OperationError::TimedOut(_))
    ));
    let retry = h.device.read(&custom());
    tokio::time::sleep(Duration::from_millis(500)).await;
    // answer to the read that already timed out
    h.transport.complete(h.link(), custom(), GattStatus::SUCCESS, &[0x01]);

    h.transport
        .wait_for(|calls| {
            calls
                .iter()
                .filter(|c| matches!(c, TransportCall::Read { .. }))
                .count()
                == 2
        })
        .await;
    h.transport.complete(h.link(), custom(), GattStatus::SUCCESS, &[0x02]);
    assert_eq!(retry.await, Ok(vec![0x02]));
}

#[tokio::test(start_paused = true)]
async fn failed_reconnect_releases_reused_handle() {
    let h = Harness::connected(SessionSettings::default()).await;
    let link = h.link();

    h.device.disconnect();
    h.transport.signal_disconnected(link, GattStatus::SUCCESS);
    h.transport
        .fail_next(TransportError::Other("busy".to_string()));
    h.device.connect();

    assert_eq!(h.device.connection_state(), ConnectionState::Disconnected);
    let closes = |h: &Harness| h.count(|c| matches!(c, TransportCall::Close { link: l } if *l == link));
    assert_eq!(closes(&h), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    h.device.close();
    assert_eq!(closes(&h), 1);
    let errors = h.errors();
    assert_eq!(errors.last().map(|e| &e.source), Some(&ErrorSource::Connection));
}

#[tokio::test(start_paused = true)]
async fn later_discovery_replaces_registry() {
    let h = Harness::connected(SessionSettings::default()).await;
    let before = h.device.registry();
    assert_eq!(before.services().len(), 2);

    // the peer's attributes changed; only the battery service is left
    let battery_only: Vec<NativeService> = peer_services().into_iter().take(1).collect();
    h.transport
        .signal_discovered(h.link(), GattStatus::SUCCESS, battery_only);

    let after = h.device.registry();
    assert_eq!(after.services().len(), 1);
    assert_eq!(after.epoch(), before.epoch());
    assert!(h.device.service(&uuid_from_u16(0xFFF0)).is_none());
    assert_eq!(
        h.device.read(&custom()).await,
        Err(OperationError::Rejected(RejectReason::UnknownAttribute(custom())))
    );
    assert_eq!(*h.recorded.discovered.lock(), vec![1, 1]);
    assert_eq!(h.device.connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn discover_services_runs_through_the_queue() {
    let h = Harness::connected(SessionSettings::default()).await;
    let discoveries = |count: usize| {
        move |calls: &[TransportCall]| {
            calls
                .iter()
                .filter(|c| matches!(c, TransportCall::Discover { .. }))
                .count()
                >= count
        }
    };

    let receipt = h.device.discover_services();
    h.transport.wait_for(discoveries(2)).await;
    let mut services = peer_services();
    services.push(NativeService {
        handle: AttributeHandle::new(uuid_from_u16(0x180A), 5),
        characteristics: vec![],
    });
    h.transport
        .signal_discovered(h.link(), GattStatus::SUCCESS, services);

    assert!(receipt.await.is_ok());
    assert_eq!(h.device.services().len(), 3);
    assert_eq!(*h.recorded.discovered.lock(), vec![1, 1]);

    h.device.disconnect();
    assert_eq!(
        h.device.discover_services().await,
        Err(OperationError::Rejected(RejectReason::NotConnected))
    );
}

#[tokio::test(start_paused = true)]
async fn level_observer_after_failed_subscribe_retries() {
    let h = Harness::connected(SessionSettings::default()).await;
    let battery = h.device.service_of::<BatteryService>().unwrap();
    let first = Arc::new(|_: &i32| {});
    let second = Arc::new(|_: &i32| {});
    let config_writes = |count: usize| {
        move |calls: &[TransportCall]| {
            calls
                .iter()
                .filter(|c| matches!(c, TransportCall::Write { attr, .. } if *attr == level_config()))
                .count()
                >= count
        }
    };

    let receipt = battery.observe_level(&first);
    h.transport.wait_for(config_writes(1)).await;
    h.transport
        .complete(h.link(), level_config(), GattStatus::WRITE_NOT_PERMITTED, &[]);
    assert!(receipt.await.is_err());
    assert!(!battery.is_notifying());

    let receipt = battery.observe_level(&second);
    h.transport.wait_for(config_writes(2)).await;
    h.transport
        .complete(h.link(), level_config(), GattStatus::SUCCESS, &[]);
    assert!(receipt.await.is_ok());
    assert!(battery.is_notifying());
}
