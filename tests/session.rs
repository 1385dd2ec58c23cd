//! Link session behavior against an in-memory peer.

mod common;

use btleplug::api::{CharPropFlags, WriteType};
use pretty_assertions::assert_eq;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use common::*;
use dive_computer_ble::ble::uuids::NORDIC_UPGRADE_SERVICE_UUID;
use dive_computer_ble::ble::DisconnectOrigin;
use dive_computer_ble::{Error, LinkSession, LinkState};

fn session(peripheral: &Arc<FakePeripheral>) -> LinkSession {
    LinkSession::new(peripheral.clone(), fast_link())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_reaches_ready_through_discovery_states() {
    init_tracing();
    let peer = Arc::new(FakePeripheral::new("AA:BB"));
    let session = session(&peer);
    let mut events = session.subscribe();

    assert_eq!(session.state(), LinkState::Idle);
    assert_ok!(session.connect().await);
    assert!(session.is_ready());

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.identifier, "AA:BB");
        states.push(event.state);
    }
    assert_eq!(
        states,
        vec![
            LinkState::Connecting,
            LinkState::DiscoveringServices,
            LinkState::DiscoveringCharacteristics,
            LinkState::Ready,
        ]
    );

    let pair = session.characteristics().unwrap();
    assert_eq!(pair.write.uuid, WRITE_UUID);
    assert_eq!(pair.notify.uuid, NOTIFY_UUID);
    assert_eq!(peer.subscribed(), vec![NOTIFY_UUID]);

    // Connecting again is a no-op
    assert_ok!(session.connect().await);
    assert_eq!(peer.connect_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upgrade_service_is_never_chosen() {
    let upgrade = service(
        NORDIC_UPGRADE_SERVICE_UUID,
        vec![
            characteristic(
                NORDIC_UPGRADE_SERVICE_UUID,
                Uuid::from_u128(0x51),
                CharPropFlags::WRITE,
            ),
            characteristic(
                NORDIC_UPGRADE_SERVICE_UUID,
                Uuid::from_u128(0x52),
                CharPropFlags::NOTIFY,
            ),
        ],
    );
    let peer = Arc::new(FakePeripheral::new("AA").with_services(vec![upgrade, serial_service()]));
    let session = session(&peer);

    assert_ok!(session.connect().await);
    let pair = session.characteristics().unwrap();
    assert_eq!(pair.write.uuid, WRITE_UUID);
    assert_eq!(pair.notify.uuid, NOTIFY_UUID);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_notify_characteristic_fails_the_session() {
    let svc = Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0);
    let peer = Arc::new(FakePeripheral::new("AA").with_services(vec![service(
        svc,
        vec![characteristic(svc, Uuid::from_u128(1), CharPropFlags::WRITE)],
    )]));
    let session = session(&peer);

    let err = assert_err!(session.connect().await);
    assert!(matches!(err, Error::NegotiationFailed { .. }));
    assert_eq!(session.state(), LinkState::Failed);
    assert!(session.characteristics().is_none());

    // Failed is absorbing
    let err = assert_err!(session.connect().await);
    assert!(matches!(err, Error::ConnectionFailed { .. }));
    assert_ok!(session.close().await);
    assert_eq!(session.state(), LinkState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_connection_fails_the_session() {
    let peer = Arc::new(FakePeripheral::new("AA"));
    peer.set_fail_connect(true);
    let session = session(&peer);

    assert_err!(session.connect().await);
    assert_eq!(session.state(), LinkState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_connection_times_out() {
    let peer = Arc::new(FakePeripheral::new("AA"));
    peer.set_connect_delay(Duration::from_secs(5));
    let session = session(&peer);

    let err = assert_err!(session.connect().await);
    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(session.state(), LinkState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notifications_fill_the_buffer() {
    let peer = Arc::new(FakePeripheral::new("AA"));
    let session = session(&peer);
    assert_ok!(session.connect().await);

    peer.push(NOTIFY_UUID, &[1, 2, 3]);
    peer.push(Uuid::from_u128(0xdead), &[9, 9]);
    peer.push(NOTIFY_UUID, &[4]);

    let buffer = session.buffer();
    let received = tokio::task::spawn_blocking(move || {
        let mut received = Vec::new();
        while received.len() < 4 {
            match buffer.read_partial(16, Duration::from_millis(500)) {
                Some(chunk) => received.extend_from_slice(&chunk),
                None => break,
            }
        }
        received
    })
    .await
    .unwrap();

    assert_eq!(received, vec![1, 2, 3, 4]);
    let stats = session.transfer_stats();
    assert_eq!(stats.total_bytes, 4);
    assert!(stats.last_chunk_at().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_round_trip() {
    let peer = Arc::new(
        FakePeripheral::new("AA").with_responder(dive_computer(three_dives())),
    );
    let session = session(&peer);
    assert_ok!(session.connect().await);

    let mut stream = session.stream().unwrap();
    let (identify, count) = tokio::task::spawn_blocking(move || {
        stream.write_all(&[CMD_IDENTIFY]).unwrap();
        let identify = stream.read_frame().unwrap();

        stream.write_all(&[CMD_COUNT]).unwrap();
        let mut count = [0u8; 3];
        stream.read_exact(&mut count).unwrap();

        // Nothing more is coming
        let err = stream.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

        (identify, count)
    })
    .await
    .unwrap();

    assert_eq!(identify.as_ref(), frame(&SERIAL.to_be_bytes()).as_slice());
    assert_eq!(count, [0x7e, 3, 0x7e]);
    assert_eq!(peer.writes(), vec![vec![CMD_IDENTIFY], vec![CMD_COUNT]]);
    assert_eq!(
        peer.write_types(),
        vec![WriteType::WithoutResponse, WriteType::WithoutResponse]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_requires_ready_session() {
    let peer = Arc::new(FakePeripheral::new("AA"));
    let session = session(&peer);

    assert!(matches!(session.stream(), Err(Error::NoDeviceConnected)));
    assert!(matches!(
        session.write(&[1]).await,
        Err(Error::NoDeviceConnected)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_returns_to_idle_and_marks_self_initiated() {
    let peer = Arc::new(FakePeripheral::new("AA"));
    let session = session(&peer);
    assert_ok!(session.connect().await);
    peer.push(NOTIFY_UUID, &[1, 2]);

    assert_ok!(session.close().await);
    assert_eq!(session.state(), LinkState::Idle);
    assert!(session.characteristics().is_none());
    assert!(session.buffer().is_empty());
    assert_eq!(peer.disconnect_calls(), 1);

    assert!(session.is_disconnecting());
    assert_eq!(
        session.handle_link_lost().await,
        DisconnectOrigin::SelfInitiated
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!session.is_disconnecting());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn link_loss_is_unsolicited() {
    let peer = Arc::new(FakePeripheral::new("AA"));
    let session = session(&peer);
    assert_ok!(session.connect().await);

    peer.drop_link();
    assert_eq!(
        session.handle_link_lost().await,
        DisconnectOrigin::Unsolicited
    );
    assert_eq!(session.state(), LinkState::Idle);
    assert!(session.characteristics().is_none());
}
