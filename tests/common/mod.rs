//! In-memory dive computer used by the integration tests.
//!
//! [`FakePeripheral`] answers writes through a responder closure with
//! notifications, like a dive computer behind a BLE serial service.
//! [`FakeOpener`] opens a small command/response protocol over the
//! resulting `BleStream`.

#![allow(dead_code)]

use async_trait::async_trait;
use btleplug::api::{CharPropFlags, Characteristic, Service, ValueNotification, WriteType};
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use dive_computer_ble::ble::uuids::{FRAME_DELIMITER, KNOWN_SERIAL_SERVICES};
use dive_computer_ble::ble::NotificationStream;
use dive_computer_ble::{
    BleStream, Descriptor, DeviceEvents, DeviceInfo, DeviceOpener, DeviceStatus, DiveDevice,
    Error, GattPeripheral, IterationControl, LinkConfig, Result,
};

pub const WRITE_UUID: Uuid = Uuid::from_u128(0x27b7570b_359e_45a3_91bb_cf7e70049bd2);
pub const NOTIFY_UUID: Uuid = Uuid::from_u128(0x27b7570b_359e_45a3_91bb_cf7e70049bd3);

pub const CMD_IDENTIFY: u8 = 0x10;
pub const CMD_COUNT: u8 = 0x20;
pub const CMD_RECORD: u8 = 0x30;

pub const SERIAL: u32 = 0x00c0_ffee;
pub const SERIAL_STRING: &str = "00c0ffee";

pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

/// Session settings short enough for tests.
pub fn fast_link() -> LinkConfig {
    LinkConfig::default()
        .with_connect_timeout(Duration::from_millis(500))
        .with_discovery_timeout(Duration::from_millis(500))
        .with_notify_timeout(Duration::from_millis(500))
        .with_read_timeout(Duration::from_millis(300))
        .with_disconnect_grace(Duration::from_millis(50))
}

pub fn characteristic(service: Uuid, uuid: Uuid, properties: CharPropFlags) -> Characteristic {
    Characteristic {
        uuid,
        service_uuid: service,
        properties,
        descriptors: BTreeSet::new(),
    }
}

pub fn service(uuid: Uuid, characteristics: Vec<Characteristic>) -> Service {
    Service {
        uuid,
        primary: true,
        characteristics: characteristics.into_iter().collect(),
    }
}

/// The serial service of a supported dive computer.
pub fn serial_service() -> Service {
    let uuid = KNOWN_SERIAL_SERVICES[0].uuid;
    service(
        uuid,
        vec![
            characteristic(uuid, WRITE_UUID, CharPropFlags::WRITE_WITHOUT_RESPONSE),
            characteristic(uuid, NOTIFY_UUID, CharPropFlags::NOTIFY),
        ],
    )
}

/// Wrap a payload in frame delimiters.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 2);
    framed.push(FRAME_DELIMITER);
    framed.extend_from_slice(payload);
    framed.push(FRAME_DELIMITER);
    framed
}

/// Answers the test protocol for a dive computer holding `records`,
/// newest first. The identify answer arrives in two notifications.
pub fn dive_computer(records: Vec<Vec<u8>>) -> Responder {
    Arc::new(move |command: &[u8]| match command {
        [CMD_IDENTIFY] => {
            let framed = frame(&SERIAL.to_be_bytes());
            let (head, tail) = framed.split_at(3);
            vec![head.to_vec(), tail.to_vec()]
        }
        [CMD_COUNT] => vec![frame(&[records.len() as u8])],
        [CMD_RECORD, index] => match records.get(*index as usize) {
            Some(record) => vec![frame(record)],
            None => Vec::new(),
        },
        _ => Vec::new(),
    })
}

/// A scriptable BLE peer.
pub struct FakePeripheral {
    id: String,
    services: Mutex<Vec<Service>>,
    connected: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    fail_connect: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ValueNotification>>>,
    subscribed: Mutex<Vec<Uuid>>,
    writes: Mutex<Vec<(Vec<u8>, WriteType)>>,
    responder: Mutex<Option<Responder>>,
}

impl FakePeripheral {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            services: Mutex::new(vec![serial_service()]),
            connected: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            connect_delay: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
        }
    }

    pub fn with_services(self, services: Vec<Service>) -> Self {
        *self.services.lock() = services;
        self
    }

    pub fn with_responder(self, responder: Responder) -> Self {
        *self.responder.lock() = Some(responder);
        self
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    /// Deliver a notification to every open notification stream.
    pub fn push(&self, uuid: Uuid, value: &[u8]) {
        self.subscribers.lock().retain(|tx| {
            tx.unbounded_send(ValueNotification {
                uuid,
                value: value.to_vec(),
            })
            .is_ok()
        });
    }

    /// Simulate the peer going out of range.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.subscribers.lock().clear();
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().iter().map(|(data, _)| data.clone()).collect()
    }

    pub fn write_types(&self) -> Vec<WriteType> {
        self.writes.lock().iter().map(|(_, kind)| *kind).collect()
    }

    pub fn subscribed(&self) -> Vec<Uuid> {
        self.subscribed.lock().clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GattPeripheral for FakePeripheral {
    fn identifier(&self) -> String {
        self.id.clone()
    }

    async fn is_connected(&self) -> Result<bool> {
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn connect(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed {
                reason: "peer rejected the connection".to_string(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<Service>> {
        Ok(self.services.lock().clone())
    }

    async fn subscribe(&self, characteristic: &Characteristic) -> Result<()> {
        self.subscribed.lock().push(characteristic.uuid);
        Ok(())
    }

    async fn write(
        &self,
        _characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.writes.lock().push((data.to_vec(), write_type));

        let responder = self.responder.lock().clone();
        if let Some(responder) = responder {
            for chunk in responder(data) {
                self.push(NOTIFY_UUID, &chunk);
            }
        }
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().push(tx);
        Ok(Box::pin(rx))
    }
}

/// Opens [`ProtocolDevice`]s and counts opens and closes.
#[derive(Default)]
pub struct FakeOpener {
    pub opened: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    pub fail_with: Mutex<Option<DeviceStatus>>,
    /// Extra time the handshake takes before the device is handed back.
    pub open_delay: Mutex<Option<Duration>>,
}

impl FakeOpener {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DeviceOpener for FakeOpener {
    fn open(
        &self,
        descriptor: &Descriptor,
        mut stream: BleStream,
        events: Arc<DeviceEvents>,
    ) -> std::result::Result<Box<dyn DiveDevice>, DeviceStatus> {
        if let Some(status) = *self.fail_with.lock() {
            return Err(status);
        }

        stream.write_all(&[CMD_IDENTIFY]).map_err(|_| DeviceStatus::Io)?;
        let answer = stream.read_frame().map_err(|_| DeviceStatus::Timeout)?;
        let payload = unframe(&answer);
        let serial = <[u8; 4]>::try_from(payload)
            .map(u32::from_be_bytes)
            .map_err(|_| DeviceStatus::Protocol)?;

        if let Some(delay) = *self.open_delay.lock() {
            std::thread::sleep(delay);
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ProtocolDevice {
            stream,
            events,
            model: descriptor.model,
            serial,
            filter: Vec::new(),
            closed: self.closed.clone(),
        }))
    }
}

fn unframe(framed: &[u8]) -> &[u8] {
    &framed[1..framed.len() - 1]
}

/// Driver for the test protocol. The first two bytes of a record are its
/// fingerprint.
pub struct ProtocolDevice {
    stream: BleStream,
    events: Arc<DeviceEvents>,
    model: u32,
    serial: u32,
    filter: Vec<u8>,
    closed: Arc<AtomicUsize>,
}

impl ProtocolDevice {
    fn request(&mut self, command: &[u8]) -> std::result::Result<Vec<u8>, DeviceStatus> {
        self.stream.write_all(command).map_err(|_| DeviceStatus::Io)?;
        let answer = self.stream.read_frame().map_err(|_| DeviceStatus::Timeout)?;
        Ok(unframe(&answer).to_vec())
    }
}

impl DiveDevice for ProtocolDevice {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) -> std::result::Result<(), DeviceStatus> {
        self.filter = fingerprint.to_vec();
        Ok(())
    }

    fn foreach(
        &mut self,
        callback: &mut dive_computer_ble::device::RecordCallback<'_>,
    ) -> std::result::Result<(), DeviceStatus> {
        if let Some(fingerprint) = self.events.report_devinfo(DeviceInfo {
            model: self.model,
            firmware: 1,
            serial: self.serial,
        }) {
            self.filter = fingerprint;
        }

        let count = self.request(&[CMD_COUNT])?;
        let total = *count.first().ok_or(DeviceStatus::Protocol)?;

        for index in 0..total {
            self.events.report_progress(index as u32, total as u32);
            let record = self.request(&[CMD_RECORD, index])?;
            if record.len() < 2 {
                return Err(DeviceStatus::DataFormat);
            }
            let fingerprint = &record[..2];
            if !self.filter.is_empty() && fingerprint == self.filter.as_slice() {
                break;
            }
            if callback(&record, fingerprint) == IterationControl::Stop {
                break;
            }
        }

        self.events.report_progress(total as u32, total as u32);
        Ok(())
    }

    fn close(self: Box<Self>) -> std::result::Result<(), DeviceStatus> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Three dives, newest first, with fingerprints `aa01`, `bb02`, `cc03`.
pub fn three_dives() -> Vec<Vec<u8>> {
    vec![
        vec![0xaa, 0x01, 0x10, 0x11, 0x12],
        vec![0xbb, 0x02, 0x20, 0x21],
        vec![0xcc, 0x03, 0x30],
    ]
}

/// Opt-in log output: `RUST_LOG=dive_computer_ble=trace cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
