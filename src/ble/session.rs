//! Link session: one connection to one dive computer.
//!
//! A session connects, discovers services, negotiates the serial
//! characteristic pair, pumps notifications into its receive buffer and
//! owns the device opened over it until it is closed.

use btleplug::api::WriteType;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::characteristics::{negotiate, CharacteristicPair};
use crate::ble::frame_buffer::{FrameBuffer, DEFAULT_POLL_INTERVAL};
use crate::ble::peripheral::{GattPeripheral, NotificationStream};
use crate::ble::stream::{BleStream, DEFAULT_READ_TIMEOUT};
use crate::device::driver::{DeviceEvents, OpenDevice};
use crate::error::{Error, Result};

/// Weight of the previous estimate in the transfer-rate average.
const RATE_HISTORY_WEIGHT: f64 = 0.7;

/// Timeouts of a link session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Bound on the link-layer connect.
    pub connect_timeout: Duration,
    /// Bound on service discovery.
    pub discovery_timeout: Duration,
    /// Bound on enabling notifications.
    pub notify_timeout: Duration,
    /// How long a stream read waits for data.
    pub read_timeout: Duration,
    /// Wait slice of blocked reads.
    pub poll_interval: Duration,
    /// Delay before a self-initiated disconnect stops being reported as such.
    pub disconnect_grace: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(10),
            notify_timeout: Duration::from_secs(5),
            read_timeout: DEFAULT_READ_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            disconnect_grace: Duration::from_millis(500),
        }
    }
}

impl LinkConfig {
    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the service discovery timeout.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the notification enable timeout.
    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    /// Set the stream read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the disconnect grace period.
    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }
}

/// State of a link session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    /// No connection.
    #[default]
    Idle,
    /// Link-layer connect in progress.
    Connecting,
    /// Waiting for the service list.
    DiscoveringServices,
    /// Choosing the write/notify pair and enabling notifications.
    DiscoveringCharacteristics,
    /// Ready for data transfer.
    Ready,
    /// Teardown in progress.
    Disconnecting,
    /// Connection setup failed; the session cannot connect again.
    Failed,
}

impl LinkState {
    /// Check if data can be transferred.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if a connect or teardown is in progress.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::DiscoveringServices
                | Self::DiscoveringCharacteristics
                | Self::Disconnecting
        )
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "Discovering services"),
            Self::DiscoveringCharacteristics => write!(f, "Discovering characteristics"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Event for session state changes.
#[derive(Debug, Clone)]
pub struct LinkEvent {
    /// Identity of the peer.
    pub identifier: String,
    /// The new state.
    pub state: LinkState,
}

/// Who ended a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOrigin {
    /// The session closed it.
    SelfInitiated,
    /// The peer or the radio dropped it.
    Unsolicited,
}

/// Received-byte counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferStats {
    /// Bytes received since the session was created.
    pub total_bytes: u64,
    /// Smoothed receive rate in bytes per second.
    pub bytes_per_second: f64,
    last_chunk_at: Option<Instant>,
}

impl TransferStats {
    /// Account for a chunk of `len` bytes received at `at`.
    pub fn record_chunk(&mut self, len: usize, at: Instant) {
        if let Some(last) = self.last_chunk_at {
            let elapsed = at.saturating_duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                let current = len as f64 / elapsed;
                self.bytes_per_second = RATE_HISTORY_WEIGHT * self.bytes_per_second
                    + (1.0 - RATE_HISTORY_WEIGHT) * current;
            }
        }
        self.total_bytes += len as u64;
        self.last_chunk_at = Some(at);
    }

    /// When the most recent chunk arrived.
    pub fn last_chunk_at(&self) -> Option<Instant> {
        self.last_chunk_at
    }
}

/// One connection to a dive computer.
pub struct LinkSession {
    /// The peer.
    peripheral: Arc<dyn GattPeripheral>,
    /// Cached peer identity.
    identifier: String,
    config: LinkConfig,
    state: Arc<RwLock<LinkState>>,
    /// Negotiated pair; set only while connected.
    characteristics: Arc<RwLock<Option<CharacteristicPair>>>,
    buffer: Arc<FrameBuffer>,
    stats: Arc<Mutex<TransferStats>>,
    /// Device opened over this session.
    device: Arc<Mutex<Option<OpenDevice>>>,
    device_events: RwLock<Option<Arc<DeviceEvents>>>,
    /// Set while a self-initiated disconnect settles.
    disconnecting: Arc<AtomicBool>,
    is_listening: Arc<AtomicBool>,
    listener_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    event_tx: broadcast::Sender<LinkEvent>,
}

impl LinkSession {
    /// Create an idle session for a peer.
    pub fn new(peripheral: Arc<dyn GattPeripheral>, config: LinkConfig) -> Self {
        let (event_tx, _) = broadcast::channel(16);
        let identifier = peripheral.identifier();
        let buffer = FrameBuffer::new().with_poll_interval(config.poll_interval);

        Self {
            peripheral,
            identifier,
            config,
            state: Arc::new(RwLock::new(LinkState::Idle)),
            characteristics: Arc::new(RwLock::new(None)),
            buffer: Arc::new(buffer),
            stats: Arc::new(Mutex::new(TransferStats::default())),
            device: Arc::new(Mutex::new(None)),
            device_events: RwLock::new(None),
            disconnecting: Arc::new(AtomicBool::new(false)),
            is_listening: Arc::new(AtomicBool::new(false)),
            listener_handle: Mutex::new(None),
            event_tx,
        }
    }

    /// Identity of the peer.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Session configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Get the current state.
    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    /// Check if the session is ready for data transfer.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Subscribe to state change events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    /// The negotiated characteristic pair, if any.
    pub fn characteristics(&self) -> Option<CharacteristicPair> {
        self.characteristics.read().clone()
    }

    /// The receive buffer.
    pub fn buffer(&self) -> Arc<FrameBuffer> {
        self.buffer.clone()
    }

    /// Received-byte counters.
    pub fn transfer_stats(&self) -> TransferStats {
        *self.stats.lock()
    }

    /// Check if a self-initiated disconnect is still settling.
    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    /// Connect, negotiate characteristics and enable notifications.
    ///
    /// # Errors
    ///
    /// Any failure moves the session to [`LinkState::Failed`], after which
    /// only [`close`](Self::close) is useful.
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            LinkState::Ready => {
                debug!("Already connected");
                return Ok(());
            }
            LinkState::Idle => {}
            LinkState::Failed => {
                return Err(Error::ConnectionFailed {
                    reason: "session failed earlier; create a new session".to_string(),
                })
            }
            other => {
                return Err(Error::ConnectionFailed {
                    reason: format!("cannot connect while {}", other),
                })
            }
        }

        match self.establish().await {
            Ok(()) => {
                info!("Session ready: {}", self.identifier);
                self.set_state(LinkState::Ready);
                Ok(())
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", self.identifier, e);
                self.stop_listener().await;
                *self.characteristics.write() = None;
                self.set_state(LinkState::Failed);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        self.set_state(LinkState::Connecting);

        if self.peripheral.is_connected().await.unwrap_or(false) {
            info!("Peripheral already connected at BLE level");
        } else {
            timeout(self.config.connect_timeout, self.peripheral.connect())
                .await
                .map_err(|_| Error::Timeout {
                    operation: format!("connecting to {}", self.identifier),
                })??;
        }

        self.set_state(LinkState::DiscoveringServices);

        let services = timeout(
            self.config.discovery_timeout,
            self.peripheral.discover_services(),
        )
        .await
        .map_err(|_| Error::NegotiationFailed {
            reason: "service discovery timed out".to_string(),
        })??;
        debug!("Discovered {} services", services.len());

        self.set_state(LinkState::DiscoveringCharacteristics);

        let pair = negotiate(&services)?;

        timeout(
            self.config.notify_timeout,
            self.peripheral.subscribe(&pair.notify),
        )
        .await
        .map_err(|_| Error::NegotiationFailed {
            reason: format!("enabling notifications on {} timed out", pair.notify.uuid),
        })??;

        let notifications = self.peripheral.notifications().await?;
        self.buffer.clear();
        self.start_listener(notifications, pair.notify.uuid);

        *self.characteristics.write() = Some(pair);
        Ok(())
    }

    fn start_listener(&self, mut notifications: NotificationStream, notify_uuid: Uuid) {
        self.is_listening.store(true, Ordering::SeqCst);

        let is_listening = self.is_listening.clone();
        let buffer = self.buffer.clone();
        let stats = self.stats.clone();

        let handle = tokio::spawn(async move {
            debug!("Notification listener starting");

            while is_listening.load(Ordering::SeqCst) {
                tokio::select! {
                    notification = notifications.next() => {
                        let Some(notification) = notification else {
                            debug!("Notification stream ended");
                            break;
                        };
                        if notification.uuid != notify_uuid {
                            trace!("Ignoring notification from {}", notification.uuid);
                            continue;
                        }
                        buffer.append(&notification.value);
                        stats.lock().record_chunk(notification.value.len(), Instant::now());
                    }
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }

            debug!("Notification listener stopped");
        });

        *self.listener_handle.lock() = Some(handle);
    }

    async fn stop_listener(&self) {
        self.is_listening.store(false, Ordering::SeqCst);

        let handle = self.listener_handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Write to the dive computer.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let pair = self.ready_pair()?;
        self.peripheral
            .write(&pair.write, data, write_type_for(&pair))
            .await
    }

    /// A blocking byte stream over this session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn stream(&self) -> Result<BleStream> {
        let pair = self.ready_pair()?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("no tokio runtime: {}", e)))?;

        Ok(BleStream::new(
            self.peripheral.clone(),
            pair.write.clone(),
            write_type_for(&pair),
            self.buffer.clone(),
            self.config.read_timeout,
            runtime,
        ))
    }

    fn ready_pair(&self) -> Result<CharacteristicPair> {
        if !self.is_ready() {
            return Err(Error::NoDeviceConnected);
        }
        self.characteristics().ok_or(Error::NoDeviceConnected)
    }

    /// Hand an opened device to the session.
    ///
    /// Returns the previously attached device, if any, for the caller to close.
    pub fn attach_device(&self, device: OpenDevice) -> Option<OpenDevice> {
        *self.device_events.write() = Some(device.events.clone());
        self.device.lock().replace(device)
    }

    /// Shared slot holding the opened device.
    pub fn device_slot(&self) -> Arc<Mutex<Option<OpenDevice>>> {
        self.device.clone()
    }

    /// Event sink of the attached device.
    pub fn device_events(&self) -> Option<Arc<DeviceEvents>> {
        self.device_events.read().clone()
    }

    /// Check if a device is attached.
    pub fn has_device(&self) -> bool {
        self.device_events.read().is_some()
    }

    /// Tear the session down.
    ///
    /// Closes the attached device exactly once, clears the negotiated pair and
    /// the receive buffer, and disconnects the link. The session reports the
    /// disconnect as self-initiated until the grace period passes.
    pub async fn close(&self) -> Result<()> {
        let failed = self.state() == LinkState::Failed;

        self.disconnecting.store(true, Ordering::SeqCst);
        if !failed {
            self.set_state(LinkState::Disconnecting);
        }

        self.stop_listener().await;
        self.buffer.clear();

        *self.device_events.write() = None;
        let slot = self.device.clone();
        match tokio::task::spawn_blocking(move || slot.lock().take().map(OpenDevice::close)).await
        {
            Ok(Some(Ok(()))) => debug!("Device closed"),
            Ok(Some(Err(status))) => warn!("Device close reported: {}", status),
            Ok(None) => {}
            Err(e) => warn!("Device close task failed: {}", e),
        }

        *self.characteristics.write() = None;

        let result = self.peripheral.disconnect().await;
        match &result {
            Ok(()) => info!("Disconnected from {}", self.identifier),
            Err(e) => warn!("Failed to disconnect from {}: {}", self.identifier, e),
        }

        if !failed {
            self.set_state(LinkState::Idle);
        }

        let disconnecting = self.disconnecting.clone();
        let grace = self.config.disconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            disconnecting.store(false, Ordering::SeqCst);
        });

        result
    }

    /// React to the link layer reporting a disconnect.
    pub async fn handle_link_lost(&self) -> DisconnectOrigin {
        let origin = if self.is_disconnecting() {
            DisconnectOrigin::SelfInitiated
        } else {
            DisconnectOrigin::Unsolicited
        };
        info!("Link to {} lost ({:?})", self.identifier, origin);

        self.stop_listener().await;
        self.buffer.clear();
        *self.characteristics.write() = None;

        if self.state() != LinkState::Failed {
            self.set_state(LinkState::Idle);
        }

        origin
    }

    /// Update the state and emit an event.
    fn set_state(&self, new_state: LinkState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };

        if old_state != new_state {
            debug!("Link state changed: {} -> {}", old_state, new_state);

            let _ = self.event_tx.send(LinkEvent {
                identifier: self.identifier.clone(),
                state: new_state,
            });
        }
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        self.is_listening.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener_handle.lock().take() {
            handle.abort();
        }
    }
}

fn write_type_for(pair: &CharacteristicPair) -> WriteType {
    if pair.supports_write_without_response() {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_state() {
        assert!(LinkState::Ready.is_ready());
        assert!(!LinkState::Idle.is_ready());
        assert!(LinkState::DiscoveringServices.is_transitioning());
        assert!(LinkState::Disconnecting.is_transitioning());
        assert!(!LinkState::Failed.is_transitioning());
        assert_eq!(LinkState::default(), LinkState::Idle);
    }

    #[test]
    fn test_link_state_display() {
        assert_eq!(format!("{}", LinkState::Ready), "Ready");
        assert_eq!(
            format!("{}", LinkState::DiscoveringCharacteristics),
            "Discovering characteristics"
        );
    }

    #[test]
    fn test_transfer_rate_moving_average() {
        let start = Instant::now();
        let mut stats = TransferStats::default();
        assert!(stats.last_chunk_at().is_none());

        stats.record_chunk(20, start);
        assert_eq!(stats.total_bytes, 20);
        assert_eq!(stats.last_chunk_at(), Some(start));
        assert_eq!(stats.bytes_per_second, 0.0);

        stats.record_chunk(100, start + Duration::from_secs(1));
        assert!((stats.bytes_per_second - 30.0).abs() < 1e-9);

        stats.record_chunk(100, start + Duration::from_secs(2));
        assert!((stats.bytes_per_second - 51.0).abs() < 1e-9);
        assert_eq!(stats.total_bytes, 220);
    }

    #[test]
    fn test_link_config_builders() {
        let config = LinkConfig::default()
            .with_connect_timeout(Duration::from_secs(3))
            .with_read_timeout(Duration::from_millis(100));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.read_timeout, Duration::from_millis(100));
        assert_eq!(config.disconnect_grace, Duration::from_millis(500));
    }
}
