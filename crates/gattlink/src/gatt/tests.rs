//! Unit tests for GATT functionality

use crate::error::{Error, TransportError};
use crate::gap::{BdAddr, DeviceIdentity};
use crate::gatt::router::{BCP_NOTIFY, BCP_WRITE, BCP_WRITE_PREFIX, MMP_NOTIFY, MMP_WRITE};
use crate::gatt::*;
use crate::queue::NotificationQueue;
use crate::transport::sim::{milk_meter_profile, SimTransport, DEVICE_NAME};
use crate::transport::DisconnectReason;
use crate::uuid::Uuid;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(5000);

fn meter_address() -> BdAddr {
    "AA:BB:CC:DD:EE:FF".parse().unwrap()
}

fn bcp_frame() -> Vec<u8> {
    let mut frame = BCP_WRITE_PREFIX.to_vec();
    frame.extend_from_slice(&[0x01, 0x02]);
    frame
}

/// A simulated milk meter plus a session for it
fn meter_session() -> (Arc<SimTransport>, DeviceSession) {
    let sim = Arc::new(SimTransport::new());
    sim.add_peripheral(meter_address(), milk_meter_profile());
    let session = DeviceSession::new(
        DeviceIdentity::new(meter_address()),
        sim.clone(),
        Arc::new(NotificationQueue::new()),
        RoutingConfig::milk_meter(),
    );
    (sim, session)
}

#[test]
fn test_signature_matching() {
    let sig = WriteSignature::prefix(&[0x04, 0x0f]);
    assert!(sig.matches(&[0x04, 0x0f]));
    assert!(sig.matches(&[0x04, 0x0f, 0x00]));
    assert!(!sig.matches(&[0x04]));
    assert!(!sig.matches(&[0x05, 0x0f]));

    let single = WriteSignature::exact_len(1);
    assert!(single.matches(&[0x6e]));
    assert!(!single.matches(&[0x6e, 0x00]));
    assert!(!single.matches(&[]));

    assert!(!WriteSignature::any().matches(&[]));
}

#[test]
fn test_signature_overlap() {
    // Different prefixes never overlap
    assert!(!WriteSignature::prefix(&[0x01]).overlaps(&WriteSignature::prefix(&[0x02])));

    // A prefix that extends another does
    assert!(WriteSignature::prefix(&[0x01]).overlaps(&WriteSignature::prefix(&[0x01, 0x02])));

    // Disjoint length ranges do not
    assert!(!WriteSignature::exact_len(1).overlaps(&WriteSignature::len_range(2, 20)));
    assert!(WriteSignature::len_range(1, 4).overlaps(&WriteSignature::len_range(4, 8)));

    // A 3-byte prefix cannot fit a 1-byte payload
    assert!(!WriteSignature::prefix(&[0x01, 0x02, 0x03]).overlaps(&WriteSignature::exact_len(1)));

    assert!(WriteSignature::any().overlaps(&WriteSignature::exact_len(1)));
    assert!(WriteSignature::exact_len(2)
        .with_prefix(&[0xAA])
        .overlaps(&WriteSignature::prefix(&[0xAA, 0xBB])));
}

#[test]
fn test_routing_config_validation() {
    let a = Uuid::from_u16(0xFFF1);
    let b = Uuid::from_u16(0xFFF2);
    let c = Uuid::from_u16(0xFFF3);

    let duplicate_tag = RoutingConfig::new(vec![
        ServiceBinding::new("MMP", a, b),
        ServiceBinding::new("MMP", c, c).as_fallback(),
    ]);
    assert!(matches!(duplicate_tag, Err(Error::Configuration(_))));

    let duplicate_notify = RoutingConfig::new(vec![
        ServiceBinding::new("A", a, b).accepting(WriteSignature::exact_len(1)),
        ServiceBinding::new("B", c, b).as_fallback(),
    ]);
    assert!(matches!(duplicate_notify, Err(Error::Configuration(_))));

    let two_fallbacks = RoutingConfig::new(vec![
        ServiceBinding::new("A", a, a).as_fallback(),
        ServiceBinding::new("B", b, b).as_fallback(),
    ]);
    assert!(matches!(two_fallbacks, Err(Error::Configuration(_))));

    let overlapping = RoutingConfig::new(vec![
        ServiceBinding::new("A", a, a).accepting(WriteSignature::prefix(&[0x01])),
        ServiceBinding::new("B", b, b).accepting(WriteSignature::len_range(1, 4)),
    ]);
    assert!(matches!(overlapping, Err(Error::Configuration(_))));

    let valid = RoutingConfig::new(vec![
        ServiceBinding::new("A", a, a).accepting(WriteSignature::exact_len(1)),
        ServiceBinding::new("B", b, b).accepting(WriteSignature::len_range(2, 20)),
        ServiceBinding::new("C", c, c).as_fallback(),
    ]);
    assert_eq!(valid.unwrap().bindings().len(), 3);
}

#[test]
fn test_milk_meter_routing() {
    let config = RoutingConfig::milk_meter();
    let router = ServiceRouter::bind(&config, &milk_meter_profile()).unwrap();

    assert_eq!(router.route_write(&bcp_frame()).unwrap().write, BCP_WRITE);
    assert_eq!(router.route_write(&[0x6e]).unwrap().write, MMP_WRITE);
    assert_eq!(router.route_write(&BCP_WRITE_PREFIX[..7]).unwrap().tag, "MMP");

    assert_eq!(router.tag_for(&MMP_NOTIFY).unwrap(), "MMP");
    assert_eq!(router.tag_for(&BCP_NOTIFY).unwrap(), "BCP");
    assert!(router.tag_for(&MMP_WRITE).is_none());
    assert_eq!(router.write_characteristic("BCP"), Some(BCP_WRITE));
}

#[test]
fn test_route_write_without_fallback() {
    let config = RoutingConfig::new(vec![ServiceBinding::new("MMP", MMP_WRITE, MMP_NOTIFY)
        .accepting(WriteSignature::exact_len(1))])
    .unwrap();
    let router = ServiceRouter::bind(&config, &milk_meter_profile()).unwrap();

    assert_eq!(router.route_write(&[0x6e]).unwrap().tag, "MMP");
    assert!(matches!(
        router.route_write(&[0x6e, 0x6f]),
        Err(Error::Write(_))
    ));
}

#[test]
fn test_bind_requires_characteristics() {
    let missing = RoutingConfig::new(vec![ServiceBinding::new(
        "X",
        Uuid::from_u16(0xFFF1),
        MMP_NOTIFY,
    )])
    .unwrap();
    assert!(matches!(
        ServiceRouter::bind(&missing, &milk_meter_profile()),
        Err(Error::Discovery(_))
    ));

    // The device name is readable but neither writable nor notifiable
    let not_notify =
        RoutingConfig::new(vec![ServiceBinding::new("X", MMP_WRITE, DEVICE_NAME)]).unwrap();
    assert!(matches!(
        ServiceRouter::bind(&not_notify, &milk_meter_profile()),
        Err(Error::Discovery(_))
    ));
}

#[test]
fn test_service_map_rendering() {
    let map = ServiceMap::from_services(&milk_meter_profile());
    assert_eq!(map.len(), 3);

    let mmp = map
        .get(&Uuid::from_u128(0x10000000_0000_1000_8000_00805f9baaaa))
        .unwrap();
    assert_eq!(mmp.len(), 2);
    assert_eq!(mmp[0].uuid, MMP_WRITE);
    assert!(mmp[1].properties.can_notify());

    let text = map.to_string();
    assert!(text.contains("Service: MMP (10000000-0000-1000-8000-00805f9baaaa)"));
    assert!(text.contains("    Characteristic: MMP notify [notify] (10000000-2000-1000-8000-00805f9baaaa)"));
}

#[test]
fn test_connect_discovers_and_subscribes() {
    let (sim, session) = meter_session();
    assert_eq!(session.state(), ConnectionState::Disconnected);

    session.connect(TIMEOUT).unwrap();

    assert!(session.is_connected());
    assert!(sim.is_connected(meter_address()));
    assert!(sim.is_subscribed(meter_address(), MMP_NOTIFY));
    assert!(sim.is_subscribed(meter_address(), BCP_NOTIFY));

    let router = session.router().unwrap();
    let tags: Vec<&str> = router.routes().iter().map(|r| r.tag.as_str()).collect();
    assert_eq!(tags, vec!["MMP", "BCP"]);
}

#[test]
fn test_connect_twice_fails() {
    let (_sim, session) = meter_session();
    session.connect(TIMEOUT).unwrap();
    assert!(matches!(session.connect(TIMEOUT), Err(Error::Connection(_))));
    assert!(session.is_connected());
}

#[test]
fn test_connect_failure_is_retryable() {
    let (sim, session) = meter_session();
    sim.fail_next_connect(meter_address(), TransportError::Rejected("busy".into()));

    assert!(matches!(session.connect(TIMEOUT), Err(Error::Connection(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);

    session.connect(TIMEOUT).unwrap();
    assert!(session.is_connected());
}

#[test]
fn test_connect_unknown_device_times_out() {
    let sim = Arc::new(SimTransport::new());
    let session = DeviceSession::new(
        DeviceIdentity::new(meter_address()),
        sim,
        Arc::new(NotificationQueue::new()),
        RoutingConfig::milk_meter(),
    );
    assert!(!session.try_connect(Duration::from_millis(10)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[test]
fn test_slow_link_exceeds_timeout() {
    let (sim, session) = meter_session();
    sim.set_connect_delay(meter_address(), Some(Duration::from_millis(200)));

    assert!(matches!(
        session.connect(Duration::from_millis(20)),
        Err(Error::Connection(_))
    ));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[test]
fn test_discovery_failure_tears_down() {
    let (sim, session) = meter_session();
    sim.set_fail_discovery(meter_address(), true);

    assert!(matches!(session.connect(TIMEOUT), Err(Error::Discovery(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!sim.is_connected(meter_address()));

    sim.set_fail_discovery(meter_address(), false);
    session.connect(TIMEOUT).unwrap();
}

#[test]
fn test_missing_routed_service_tears_down() {
    let sim = Arc::new(SimTransport::new());
    let mut profile = milk_meter_profile();
    profile.pop(); // no BCP
    sim.add_peripheral(meter_address(), profile);
    let session = DeviceSession::new(
        DeviceIdentity::new(meter_address()),
        sim.clone(),
        Arc::new(NotificationQueue::new()),
        RoutingConfig::milk_meter(),
    );

    assert!(matches!(session.connect(TIMEOUT), Err(Error::Discovery(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!sim.is_connected(meter_address()));
}

#[test]
fn test_discovery_is_cached() {
    let (sim, session) = meter_session();
    session.connect(TIMEOUT).unwrap();

    let first = session.discover_services().unwrap();
    let second = session.discover_services().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(sim.discover_count(meter_address()), 1);

    // A fresh connection discovers again
    session.disconnect(TIMEOUT).unwrap();
    assert!(session.services().is_none());
    session.connect(TIMEOUT).unwrap();
    assert_eq!(sim.discover_count(meter_address()), 2);
}

#[test]
fn test_discover_requires_connection() {
    let (_sim, session) = meter_session();
    assert!(matches!(
        session.discover_services(),
        Err(Error::NotConnected)
    ));
}

#[test]
fn test_disconnect() {
    let (sim, session) = meter_session();
    assert!(matches!(
        session.disconnect(TIMEOUT),
        Err(Error::NotConnected)
    ));

    session.connect(TIMEOUT).unwrap();
    assert!(sim.notify(meter_address(), MMP_NOTIFY, &[0x01]));

    session.disconnect(TIMEOUT).unwrap();
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!sim.is_connected(meter_address()));
    assert!(session.router().is_none());

    // Undelivered notifications went with the connection
    assert!(session.queue().is_empty());
    assert!(!session.try_disconnect(TIMEOUT));
}

#[test]
fn test_concurrent_connect_is_busy() {
    let (sim, session) = meter_session();
    sim.set_connect_delay(meter_address(), Some(Duration::from_millis(200)));

    let connecting = {
        let session = session.clone();
        thread::spawn(move || session.connect(TIMEOUT))
    };
    thread::sleep(Duration::from_millis(50));

    assert_eq!(session.state(), ConnectionState::Connecting);
    assert!(matches!(session.connect(TIMEOUT), Err(Error::Busy)));

    connecting.join().unwrap().unwrap();
    assert!(session.is_connected());
}

#[test]
fn test_disconnect_cancels_connect_in_flight() {
    let (sim, session) = meter_session();
    sim.set_connect_delay(meter_address(), Some(Duration::from_millis(200)));

    let connecting = {
        let session = session.clone();
        thread::spawn(move || session.connect(TIMEOUT))
    };
    thread::sleep(Duration::from_millis(50));

    session.disconnect(TIMEOUT).unwrap();
    let result = connecting.join().unwrap();

    assert!(matches!(result, Err(Error::Connection(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!sim.is_connected(meter_address()));
}

#[test]
fn test_cancelled_connect_when_link_cannot_be_dropped() {
    let (sim, session) = meter_session();
    sim.set_connect_delay(meter_address(), Some(Duration::from_millis(200)));

    let connecting = {
        let session = session.clone();
        thread::spawn(move || session.connect(TIMEOUT))
    };
    thread::sleep(Duration::from_millis(50));
    sim.set_fail_disconnect(meter_address(), true);

    assert!(matches!(
        session.disconnect(TIMEOUT),
        Err(Error::Connection(_))
    ));
    assert!(matches!(
        connecting.join().unwrap(),
        Err(Error::Connection(_))
    ));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(session.router().is_none());
}

#[test]
fn test_stale_connect_leaves_newer_link_alone() {
    let (sim, session) = meter_session();
    sim.set_connect_delay(meter_address(), Some(Duration::from_millis(300)));

    let stale = {
        let session = session.clone();
        thread::spawn(move || session.connect(TIMEOUT))
    };
    thread::sleep(Duration::from_millis(50));
    session.disconnect(TIMEOUT).unwrap();

    sim.set_connect_delay(meter_address(), None);
    session.connect(TIMEOUT).unwrap();

    assert!(matches!(stale.join().unwrap(), Err(Error::Connection(_))));
    assert!(session.is_connected());
    assert!(sim.is_connected(meter_address()));
    assert!(sim.notify(meter_address(), MMP_NOTIFY, &[0x01]));
}

#[test]
fn test_concurrent_discovery_is_busy() {
    let (sim, session) = meter_session();
    sim.set_discovery_delay(meter_address(), Some(Duration::from_millis(200)));

    let connecting = {
        let session = session.clone();
        thread::spawn(move || session.connect(TIMEOUT))
    };
    thread::sleep(Duration::from_millis(50));

    // Connected, with the first discovery still running
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(matches!(session.discover_services(), Err(Error::Busy)));

    connecting.join().unwrap().unwrap();
    assert!(session.discover_services().is_ok());
    assert_eq!(sim.discover_count(meter_address()), 1);
}

#[test]
fn test_link_loss_during_discovery() {
    let (sim, session) = meter_session();
    sim.drop_link_during_discovery(meter_address());

    assert!(matches!(session.connect(TIMEOUT), Err(Error::Discovery(_))));
    assert!(session.services().is_none());
    assert!(session.router().is_none());
    assert_eq!(session.state(), ConnectionState::Disconnected);

    // Nothing half-built survives into the next connection
    session.connect(TIMEOUT).unwrap();
    assert_eq!(sim.discover_count(meter_address()), 2);
    assert!(session.services().is_some());
}

#[test]
fn test_link_loss_keeps_queued_notifications() {
    let (sim, session) = meter_session();
    session.connect(TIMEOUT).unwrap();

    assert!(sim.notify(meter_address(), MMP_NOTIFY, &[0x01, 0x02]));
    sim.drop_link(meter_address(), DisconnectReason::ConnectionTimeout);

    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(session.services().is_none());
    assert!(session.router().is_none());

    let events = session.queue().drain(session.identity(), None).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].service, "MMP");
    assert_eq!(events[0].payload, vec![0x01, 0x02]);

    assert!(matches!(
        session.queue().drain(session.identity(), None),
        Err(Error::NotConnected)
    ));

    // Reconnect after link loss works
    session.connect(TIMEOUT).unwrap();
    assert!(session.is_connected());
}

#[test]
fn test_notifications_are_tagged_by_service() {
    let (sim, session) = meter_session();
    session.connect(TIMEOUT).unwrap();

    sim.notify(meter_address(), BCP_NOTIFY, &[0xB0]);
    sim.notify(meter_address(), MMP_NOTIFY, &[0xA0]);

    let events = session
        .queue()
        .drain(session.identity(), Some(Duration::ZERO))
        .unwrap();
    let tags: Vec<&str> = events.iter().map(|e| e.service.as_str()).collect();
    assert_eq!(tags, vec!["BCP", "MMP"]);
    assert_eq!(events[0].characteristic, BCP_NOTIFY);
}

#[test]
fn test_characteristic_access() {
    let (sim, session) = meter_session();
    sim.set_value(meter_address(), DEVICE_NAME, b"MilkMeter".to_vec());

    assert!(matches!(
        session.read_characteristic(&DEVICE_NAME, TIMEOUT),
        Err(Error::NotConnected)
    ));

    session.connect(TIMEOUT).unwrap();
    assert_eq!(
        session.read_characteristic(&DEVICE_NAME, TIMEOUT).unwrap(),
        b"MilkMeter".to_vec()
    );

    session
        .write_characteristic(&MMP_WRITE, &[0x6e], TIMEOUT)
        .unwrap();
    assert_eq!(sim.writes(meter_address()), vec![(MMP_WRITE, vec![0x6e])]);

    sim.set_reject_writes(meter_address(), true);
    assert!(matches!(
        session.write_characteristic(&MMP_WRITE, &[0x6e], TIMEOUT),
        Err(Error::Write(_))
    ));
}

#[test]
fn test_start_and_stop_notify() {
    let sim = Arc::new(SimTransport::new());
    let extra = Uuid::from_u16(0x2A19);
    let mut profile = milk_meter_profile();
    profile.push(
        ServiceDescriptor::new(Uuid::from_u16(0x180F), "Battery").with_characteristic(
            CharacteristicDescriptor::new(
                extra,
                "Battery Level",
                CharacteristicProperty::READ | CharacteristicProperty::NOTIFY,
            ),
        ),
    );
    sim.add_peripheral(meter_address(), profile);
    let session = DeviceSession::new(
        DeviceIdentity::new(meter_address()),
        sim.clone(),
        Arc::new(NotificationQueue::new()),
        RoutingConfig::milk_meter(),
    );
    session.connect(TIMEOUT).unwrap();

    assert!(matches!(
        session.start_notify(&DEVICE_NAME, "NAME"),
        Err(Error::Discovery(_))
    ));

    session.start_notify(&extra, "BATTERY").unwrap();
    assert!(sim.notify(meter_address(), extra, &[87]));
    let events = session
        .queue()
        .drain(session.identity(), Some(Duration::ZERO))
        .unwrap();
    assert_eq!(events[0].service, "BATTERY");

    session.stop_notify(&extra).unwrap();
    assert!(!sim.is_subscribed(meter_address(), extra));
    assert!(matches!(
        session.stop_notify(&extra),
        Err(Error::Configuration(_))
    ));
}
