//! Device manager for discovering, connecting and downloading from dive computers.
//!
//! One dive computer is connected at a time. The manager owns the stores,
//! the current [`LinkSession`] and the device opened over it, and watches
//! the adapter for disconnects so a remembered device can be reconnected.

use btleplug::api::{Central, CentralEvent, Peripheral as _};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::ble::discovery::{DiscoveryRecord, DiscoveryRegistry};
use crate::ble::peripheral::GattPeripheral;
use crate::ble::scanner::BleScanner;
use crate::ble::session::{DisconnectOrigin, LinkConfig, LinkEvent, LinkSession};
use crate::device::descriptor::{Descriptor, DescriptorCatalog, DeviceFamily, StaticCatalog};
use crate::device::driver::{DeviceOpener, OpenDevice, Progress};
use crate::device::parser::{DiveParser, PassthroughParser};
use crate::download::cancel::CancellationToken;
use crate::download::log::DiveLog;
use crate::download::retriever::{
    DiveLogRetriever, RetrievalConfig, RetrievalEvent, RetrievalOutcome, RetrievalRequest,
};
use crate::error::{Error, Result};
use crate::storage::backend::{FileBackend, KeyValueBackend, MemoryBackend};
use crate::storage::devices::DeviceStore;
use crate::storage::fingerprints::FingerprintStore;
use crate::utils::parse_fingerprint_hex;

/// Default duration of [`DiveComputerManager::scan`].
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(5);

/// Default bound on a whole connect, including opening the device.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle for unregistering a callback.
///
/// When dropped, the callback is automatically unregistered.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long [`DiveComputerManager::scan`] listens.
    pub scan_duration: Duration,
    /// Only report peers advertising a known serial service.
    pub restrict_to_known_services: bool,
    /// Session timeouts.
    pub link: LinkConfig,
    /// Download settings.
    pub retrieval: RetrievalConfig,
    /// Directory for persisted stores; in memory when unset.
    pub storage_dir: Option<PathBuf>,
    /// Reconnect remembered devices after an unsolicited disconnect.
    pub reconnect_remembered: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_duration: DEFAULT_SCAN_DURATION,
            restrict_to_known_services: false,
            link: LinkConfig::default(),
            retrieval: RetrievalConfig::default(),
            storage_dir: None,
            reconnect_remembered: true,
        }
    }
}

impl ManagerConfig {
    /// Set the scan duration.
    pub fn with_scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    /// Restrict scans to known serial services.
    pub fn with_known_services_only(mut self, restrict: bool) -> Self {
        self.restrict_to_known_services = restrict;
        self
    }

    /// Set the session timeouts.
    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    /// Set the download settings.
    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    /// Persist stores under `dir`.
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Enable or disable automatic reconnects.
    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect_remembered = enabled;
        self
    }
}

/// Pluggable pieces the manager delegates to.
#[derive(Clone)]
pub struct Collaborators {
    /// Opens a device over a byte stream.
    pub opener: Arc<dyn DeviceOpener>,
    /// Decodes raw dive records.
    pub parser: Arc<dyn DiveParser>,
    /// Resolves names to descriptors.
    pub catalog: Arc<dyn DescriptorCatalog>,
    /// Storage backend; overrides `storage_dir` when set.
    pub backend: Option<Arc<dyn KeyValueBackend>>,
}

impl Collaborators {
    /// Use `opener` with the pass-through parser and the built-in catalog.
    pub fn new(opener: Arc<dyn DeviceOpener>) -> Self {
        Self {
            opener,
            parser: Arc::new(PassthroughParser),
            catalog: Arc::new(StaticCatalog::default()),
            backend: None,
        }
    }

    /// Use a different parser.
    pub fn with_parser(mut self, parser: Arc<dyn DiveParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Use a different catalog.
    pub fn with_catalog(mut self, catalog: Arc<dyn DescriptorCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Use a specific storage backend.
    pub fn with_backend(mut self, backend: Arc<dyn KeyValueBackend>) -> Self {
        self.backend = Some(backend);
        self
    }
}

/// The connected dive computer.
#[derive(Clone)]
struct Connection {
    session: Arc<LinkSession>,
    peripheral: Arc<dyn GattPeripheral>,
    name: String,
    descriptor: Descriptor,
}

/// State shared with the disconnect watcher.
struct Shared {
    config: ManagerConfig,
    opener: Arc<dyn DeviceOpener>,
    catalog: Arc<dyn DescriptorCatalog>,
    devices: Arc<DeviceStore>,
    retriever: DiveLogRetriever,
    connection: RwLock<Option<Connection>>,
    /// Serializes connect and disconnect.
    connect_lock: tokio::sync::Mutex<()>,
    active_cancel: Mutex<Option<CancellationToken>>,
    dive_tx: broadcast::Sender<DiveLog>,
    progress_tx: broadcast::Sender<Progress>,
    link_tx: broadcast::Sender<LinkEvent>,
}

/// Central manager for dive computers.
pub struct DiveComputerManager {
    shared: Arc<Shared>,
    scanner: Option<Arc<BleScanner>>,
    registry: Arc<DiscoveryRegistry>,
    fingerprints: Arc<FingerprintStore>,
    callback_counter: AtomicU64,
    watcher_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
    is_running: Arc<AtomicBool>,
}

impl DiveComputerManager {
    /// Create a manager on the first Bluetooth adapter and start watching
    /// for disconnects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LinkUnavailable`] if Bluetooth is not available.
    pub async fn initialize(config: ManagerConfig, collaborators: Collaborators) -> Result<Self> {
        let mut manager = Self::build(config, collaborators)?;
        let scanner = Arc::new(BleScanner::new(manager.registry.clone()).await?);
        manager.scanner = Some(scanner.clone());
        manager.start_disconnect_watcher(&scanner).await?;
        Ok(manager)
    }

    /// Create a manager without a Bluetooth adapter.
    ///
    /// Scanning and connecting by identity are unavailable; peripherals can
    /// still be connected through [`connect_peripheral`](Self::connect_peripheral).
    pub fn without_adapter(config: ManagerConfig, collaborators: Collaborators) -> Result<Self> {
        Self::build(config, collaborators)
    }

    fn build(config: ManagerConfig, collaborators: Collaborators) -> Result<Self> {
        let backend: Arc<dyn KeyValueBackend> = match (&collaborators.backend, &config.storage_dir)
        {
            (Some(backend), _) => backend.clone(),
            (None, Some(dir)) => Arc::new(FileBackend::new(dir)?),
            (None, None) => Arc::new(MemoryBackend::new()),
        };

        let catalog = collaborators.catalog;
        let devices = Arc::new(DeviceStore::load(backend.clone()));
        let fingerprints = Arc::new(FingerprintStore::new(backend, catalog.clone()));
        let registry = Arc::new(DiscoveryRegistry::new(devices.clone(), catalog.clone()));
        let retriever = DiveLogRetriever::new(fingerprints.clone(), collaborators.parser)
            .with_config(config.retrieval.clone());

        let (dive_tx, _) = broadcast::channel(64);
        let (progress_tx, _) = broadcast::channel(32);
        let (link_tx, _) = broadcast::channel(16);

        let shared = Arc::new(Shared {
            config,
            opener: collaborators.opener,
            catalog,
            devices,
            retriever,
            connection: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            active_cancel: Mutex::new(None),
            dive_tx,
            progress_tx,
            link_tx,
        });

        Ok(Self {
            shared,
            scanner: None,
            registry,
            fingerprints,
            callback_counter: AtomicU64::new(0),
            watcher_handle: RwLock::new(None),
            is_running: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn start_disconnect_watcher(&self, scanner: &BleScanner) -> Result<()> {
        let mut events = scanner.adapter().events().await?;
        self.is_running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let is_running = self.is_running.clone();

        let handle = tokio::spawn(async move {
            while is_running.load(Ordering::SeqCst) {
                tokio::select! {
                    Some(event) = events.next() => {
                        if let CentralEvent::DeviceDisconnected(id) = event {
                            shared.handle_disconnect(&id.to_string()).await;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }

            debug!("Disconnect watcher ended");
        });

        *self.watcher_handle.write() = Some(handle);
        Ok(())
    }

    fn scanner(&self) -> Result<&Arc<BleScanner>> {
        self.scanner.as_ref().ok_or_else(|| Error::LinkUnavailable {
            reason: "manager was created without a Bluetooth adapter".to_string(),
        })
    }

    /// Scan for dive computers for the configured duration.
    pub async fn scan(&self) -> Result<Vec<DiscoveryRecord>> {
        let scanner = self.scanner()?;

        self.registry.clear();
        scanner
            .start_scanning(self.shared.config.restrict_to_known_services)
            .await?;
        tokio::time::sleep(self.shared.config.scan_duration).await;
        scanner.stop_scanning().await?;

        let records = self.registry.records();
        info!("Scan finished with {} dive computers", records.len());
        Ok(records)
    }

    /// Candidates from the last scan.
    pub fn discovered(&self) -> Vec<DiscoveryRecord> {
        self.registry.records()
    }

    /// Check if a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.registry.is_scanning()
    }

    /// Connect to a scanned or remembered dive computer and open it.
    ///
    /// `family_hint` is checked against the resolved descriptor. `timeout`
    /// bounds the whole operation.
    pub async fn connect(
        &self,
        identity: &str,
        family_hint: Option<DeviceFamily>,
        timeout: Duration,
    ) -> Result<()> {
        let peripheral = self.scanner()?.peripheral(identity).await?;

        let name = match self
            .registry
            .get(identity)
            .and_then(|r| r.name)
            .or_else(|| self.shared.devices.get(identity).map(|d| d.name))
        {
            Some(name) => name,
            None => peripheral
                .properties()
                .await?
                .and_then(|p| p.local_name)
                .unwrap_or_else(|| identity.to_string()),
        };

        self.connect_peripheral(Arc::new(peripheral), &name, family_hint, timeout)
            .await
    }

    /// Connect to a peripheral and open the dive computer behind it.
    pub async fn connect_peripheral(
        &self,
        peripheral: Arc<dyn GattPeripheral>,
        name: &str,
        family_hint: Option<DeviceFamily>,
        timeout: Duration,
    ) -> Result<()> {
        self.shared
            .connect_peripheral(peripheral, name, family_hint, timeout)
            .await
    }

    /// Check if a dive computer is connected and open.
    pub fn is_connected(&self) -> bool {
        self.shared
            .current()
            .map(|c| c.session.is_ready() && c.session.has_device())
            .unwrap_or(false)
    }

    /// The current session.
    pub fn session(&self) -> Option<Arc<LinkSession>> {
        self.shared.current().map(|c| c.session)
    }

    /// Descriptor of the connected dive computer.
    pub fn connected_descriptor(&self) -> Option<Descriptor> {
        self.shared.current().map(|c| c.descriptor)
    }

    /// Download dives from the connected dive computer.
    ///
    /// With `force_all` every dive is downloaded and `fingerprint_hint` is
    /// ignored. Otherwise stops at `fingerprint_hint` (hex) when given, else
    /// at the stored fingerprint for this device. A cancelled download
    /// returns the dives received so far.
    pub async fn download(
        &self,
        force_all: bool,
        fingerprint_hint: Option<&str>,
    ) -> Result<Vec<DiveLog>> {
        let connection = self.shared.current().ok_or(Error::NoDeviceConnected)?;
        let session = connection.session.clone();
        if !session.is_ready() || !session.has_device() {
            return Err(Error::NoDeviceConnected);
        }

        let hint = match fingerprint_hint {
            Some(hint) => parse_fingerprint_hex(hint)?,
            None => None,
        };

        let stop_fingerprint = match hint {
            _ if force_all => None,
            Some(fp) => Some(fp),
            None => session
                .device_events()
                .and_then(|events| events.serial())
                .and_then(|serial| self.fingerprints.get(&connection.name, &serial)),
        };
        let lookup = !force_all && stop_fingerprint.is_none();

        let cancel = CancellationToken::new();
        *self.shared.active_cancel.lock() = Some(cancel.clone());

        let request = RetrievalRequest::new(connection.name.clone())
            .with_stop_fingerprint(stop_fingerprint)
            .with_stored_lookup(lookup)
            .with_cancellation(cancel);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let forwarder = self.spawn_event_forwarder(events_rx);

        let result = self
            .shared
            .retriever
            .retrieve(&session, request, events_tx)
            .await;

        *self.shared.active_cancel.lock() = None;
        let _ = forwarder.await;

        match result? {
            RetrievalOutcome::Cancelled { dives } => {
                info!("Download cancelled with {} dives", dives.len());
                Ok(dives)
            }
            outcome => Ok(outcome.into_dives()),
        }
    }

    fn spawn_event_forwarder(
        &self,
        mut events_rx: mpsc::UnboundedReceiver<RetrievalEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let dive_tx = self.shared.dive_tx.clone();
        let progress_tx = self.shared.progress_tx.clone();

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    RetrievalEvent::Dive(dive) => {
                        let _ = dive_tx.send(dive);
                    }
                    RetrievalEvent::Progress(progress) => {
                        let _ = progress_tx.send(progress);
                    }
                }
            }
        })
    }

    /// Ask a running download to stop at the next record.
    pub fn cancel_download(&self) {
        if let Some(cancel) = self.shared.active_cancel.lock().as_ref() {
            info!("Cancelling download");
            cancel.cancel();
        }
    }

    /// Cancel any download and close the connection.
    pub async fn disconnect(&self) -> Result<()> {
        self.cancel_download();
        self.shared.disconnect().await
    }

    /// React to the adapter reporting a disconnect of `identity`.
    pub async fn handle_disconnect(&self, identity: &str) {
        self.shared.handle_disconnect(identity).await;
    }

    /// Remembered dive computers.
    pub fn devices(&self) -> &Arc<DeviceStore> {
        &self.shared.devices
    }

    /// Stored download fingerprints.
    pub fn fingerprints(&self) -> &Arc<FingerprintStore> {
        &self.fingerprints
    }

    /// Forget a remembered dive computer.
    pub fn forget_device(&self, identity: &str) -> Result<bool> {
        self.shared.devices.remove(identity)
    }

    /// Subscribe to downloaded dives.
    pub fn subscribe_dives(&self) -> broadcast::Receiver<DiveLog> {
        self.shared.dive_tx.subscribe()
    }

    /// Subscribe to download progress.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<Progress> {
        self.shared.progress_tx.subscribe()
    }

    /// Subscribe to link state changes of every session.
    pub fn subscribe_link(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.link_tx.subscribe()
    }

    /// Register a callback for each downloaded dive.
    pub fn on_dive<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(DiveLog) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.shared.dive_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(dive) = rx.recv().await {
                callback(dive);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback for download progress.
    pub fn on_progress<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.shared.progress_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(progress) = rx.recv().await {
                callback(progress);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Clean shutdown of scanning, the connection and the watcher.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down dive computer manager");

        if let Some(scanner) = &self.scanner {
            scanner.stop_scanning().await?;
        }

        self.is_running.store(false, Ordering::SeqCst);
        let handle = self.watcher_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.disconnect().await
    }
}

impl Drop for DiveComputerManager {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}

impl Shared {
    fn current(&self) -> Option<Connection> {
        self.connection.read().clone()
    }

    async fn connect_peripheral(
        &self,
        peripheral: Arc<dyn GattPeripheral>,
        name: &str,
        family_hint: Option<DeviceFamily>,
        timeout: Duration,
    ) -> Result<()> {
        let _guard = self.connect_lock.lock().await;

        let previous = self.connection.write().take();
        if let Some(previous) = previous {
            info!("Closing previous connection to {}", previous.name);
            if let Err(e) = previous.session.close().await {
                warn!("Failed to close previous session: {}", e);
            }
        }

        let identity = peripheral.identifier();
        info!("Connecting to {} ({})", name, identity);

        let session = Arc::new(LinkSession::new(peripheral.clone(), self.config.link.clone()));
        let forward = self.forward_link_events(&session);

        let result = self
            .open_within(&session, &identity, name, family_hint, timeout)
            .await;

        match result {
            Ok(descriptor) => {
                *self.connection.write() = Some(Connection {
                    session,
                    peripheral,
                    name: name.to_string(),
                    descriptor,
                });
                Ok(())
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", name, e);
                if let Err(close_err) = session.close().await {
                    debug!("Closing failed session: {}", close_err);
                }
                forward.abort();
                Err(e)
            }
        }
    }

    fn forward_link_events(&self, session: &LinkSession) -> tokio::task::JoinHandle<()> {
        let mut rx = session.subscribe();
        let link_tx = self.link_tx.clone();

        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let _ = link_tx.send(event);
            }
        })
    }

    /// Connect the session and open the device before `timeout` runs out.
    ///
    /// The open runs on a blocking thread that cannot be interrupted. If the
    /// deadline passes first, a device it still produces is closed when the
    /// open finishes.
    async fn open_within(
        &self,
        session: &LinkSession,
        identity: &str,
        name: &str,
        family_hint: Option<DeviceFamily>,
        timeout: Duration,
    ) -> Result<Descriptor> {
        let timed_out = || Error::Timeout {
            operation: format!("connecting to {}", name),
        };
        let deadline = tokio::time::Instant::now() + timeout;

        let (descriptor, stream) = tokio::time::timeout_at(deadline, async {
            session.connect().await?;
            let descriptor = self.resolve_descriptor(identity, name, family_hint)?;
            let stream = session.stream()?;
            Ok::<_, Error>((descriptor, stream))
        })
        .await
        .map_err(|_| timed_out())??;

        let opener = self.opener.clone();
        let open_descriptor = descriptor.clone();
        let mut open_task = tokio::task::spawn_blocking(move || {
            OpenDevice::open(opener.as_ref(), open_descriptor, stream)
        });

        let device = match tokio::time::timeout_at(deadline, &mut open_task).await {
            Ok(joined) => joined??,
            Err(_) => {
                close_when_opened(open_task);
                return Err(timed_out());
            }
        };

        if let Some(stale) = session.attach_device(device) {
            if let Err(status) = tokio::task::spawn_blocking(move || stale.close()).await? {
                warn!("Closing replaced device: {}", status);
            }
        }

        if let Err(e) = self
            .devices
            .store(identity, name, descriptor.family, descriptor.model)
        {
            warn!("Failed to remember {}: {}", name, e);
        }

        info!("Connected to {}", descriptor.display_name());
        Ok(descriptor)
    }

    /// Stored device first, then the advertised name.
    fn resolve_descriptor(
        &self,
        identity: &str,
        name: &str,
        family_hint: Option<DeviceFamily>,
    ) -> Result<Descriptor> {
        let descriptor = self
            .devices
            .get(identity)
            .and_then(|stored| self.catalog.resolve_by_model(stored.family, stored.model))
            .or_else(|| self.catalog.resolve_by_name(name))
            .ok_or_else(|| Error::ConnectionFailed {
                reason: format!("unsupported dive computer '{}'", name),
            })?;

        if let Some(hint) = family_hint {
            if hint != descriptor.family {
                warn!(
                    "Family hint {} does not match {} ({})",
                    hint,
                    descriptor.display_name(),
                    descriptor.family
                );
            }
        }

        Ok(descriptor)
    }

    async fn disconnect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;

        let connection = self.connection.write().take();
        match connection {
            Some(connection) => {
                info!("Disconnecting from {}", connection.name);
                connection.session.close().await
            }
            None => {
                debug!("Not connected, ignoring disconnect");
                Ok(())
            }
        }
    }

    async fn handle_disconnect(&self, identity: &str) {
        let Some(connection) = self.current() else {
            return;
        };
        if connection.session.identifier() != identity {
            return;
        }

        if connection.session.handle_link_lost().await == DisconnectOrigin::SelfInitiated {
            return;
        }

        if let Some(cancel) = self.active_cancel.lock().as_ref() {
            cancel.cancel();
        }

        let remembered = self.devices.contains(identity);
        if let Err(e) = self.disconnect().await {
            debug!("Closing lost session: {}", e);
        }

        if !(remembered && self.config.reconnect_remembered) {
            info!("{} disconnected", connection.name);
            return;
        }

        info!("Reconnecting to {}", connection.name);
        if let Err(e) = self
            .connect_peripheral(
                connection.peripheral,
                &connection.name,
                Some(connection.descriptor.family),
                DEFAULT_CONNECT_TIMEOUT,
            )
            .await
        {
            warn!("Reconnect to {} failed: {}", connection.name, e);
        }
    }
}

/// Close the device an abandoned open still produces.
fn close_when_opened(open_task: tokio::task::JoinHandle<Result<OpenDevice>>) {
    tokio::spawn(async move {
        let Ok(Ok(device)) = open_task.await else {
            return;
        };
        debug!("Closing {} opened after the connect timed out", device.descriptor.display_name());
        match tokio::task::spawn_blocking(move || device.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(status)) => warn!("Closing late device: {}", status),
            Err(e) => warn!("Closing late device failed: {}", e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::stream::BleStream;
    use crate::device::driver::{DeviceEvents, DeviceStatus, DiveDevice};

    struct NoOpener;

    impl DeviceOpener for NoOpener {
        fn open(
            &self,
            _descriptor: &Descriptor,
            _stream: BleStream,
            _events: Arc<DeviceEvents>,
        ) -> std::result::Result<Box<dyn DiveDevice>, DeviceStatus> {
            Err(DeviceStatus::Unsupported)
        }
    }

    fn manager() -> DiveComputerManager {
        DiveComputerManager::without_adapter(
            ManagerConfig::default(),
            Collaborators::new(Arc::new(NoOpener)),
        )
        .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.scan_duration, DEFAULT_SCAN_DURATION);
        assert!(config.reconnect_remembered);
        assert!(config.storage_dir.is_none());

        let config = config
            .with_scan_duration(Duration::from_secs(2))
            .with_reconnect(false);
        assert_eq!(config.scan_duration, Duration::from_secs(2));
        assert!(!config.reconnect_remembered);
    }

    #[tokio::test]
    async fn test_requires_adapter_for_scan() {
        let manager = manager();
        assert!(matches!(
            manager.scan().await,
            Err(Error::LinkUnavailable { .. })
        ));
        assert!(matches!(
            manager
                .connect("AA", None, DEFAULT_CONNECT_TIMEOUT)
                .await,
            Err(Error::LinkUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_download_without_connection() {
        let manager = manager();
        assert!(!manager.is_connected());
        assert!(matches!(
            manager.download(false, None).await,
            Err(Error::NoDeviceConnected)
        ));
        manager.disconnect().await.unwrap();
    }

    #[test]
    fn test_callback_handle_unregisters_once() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let handle = CallbackHandle::new(7, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(handle.id(), 7);
        handle.unregister();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
