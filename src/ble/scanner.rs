//! BLE scanning for dive computers.
//!
//! Feeds advertisements from the adapter into a [`DiscoveryRegistry`] and
//! keeps the platform peripheral handles so a candidate can be connected.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace};

use crate::ble::discovery::{DiscoveryRegistry, Observation};
use crate::ble::uuids::known_service_uuids;
use crate::error::{Error, Result};

/// BLE scanner for dive computers.
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    registry: Arc<DiscoveryRegistry>,
    /// Platform handles of everything seen, by identity.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    is_running: Arc<AtomicBool>,
    /// Handle to the scanning task.
    scan_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl BleScanner {
    /// Create a scanner on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LinkUnavailable`] if there is no usable adapter.
    pub async fn new(registry: Arc<DiscoveryRegistry>) -> Result<Self> {
        let manager = Manager::new().await.map_err(|e| Error::LinkUnavailable {
            reason: e.to_string(),
        })?;

        let adapters = manager.adapters().await.map_err(|e| Error::LinkUnavailable {
            reason: e.to_string(),
        })?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| Error::LinkUnavailable {
                reason: "no Bluetooth adapter found".to_string(),
            })?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter, registry))
    }

    /// Create a scanner with a specific adapter.
    pub fn with_adapter(adapter: Adapter, registry: Arc<DiscoveryRegistry>) -> Self {
        Self {
            adapter,
            registry,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            is_running: Arc::new(AtomicBool::new(false)),
            scan_handle: RwLock::new(None),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// The registry this scanner feeds.
    pub fn registry(&self) -> &Arc<DiscoveryRegistry> {
        &self.registry
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.registry.is_scanning()
    }

    /// Start scanning.
    ///
    /// With `restrict_to_known_services`, only peers advertising one of the
    /// known serial services are reported by the adapter.
    pub async fn start_scanning(&self, restrict_to_known_services: bool) -> Result<()> {
        if self.is_running.load(Ordering::SeqCst) {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        let filter = if restrict_to_known_services {
            ScanFilter {
                services: known_service_uuids(),
            }
        } else {
            ScanFilter::default()
        };

        info!(
            "Starting BLE scan for dive computers (filtered: {})",
            restrict_to_known_services
        );

        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(filter).await?;

        self.is_running.store(true, Ordering::SeqCst);
        self.registry.set_scanning(true);

        let adapter = self.adapter.clone();
        let registry = self.registry.clone();
        let peripherals = self.peripherals.clone();
        let is_running = self.is_running.clone();

        let handle = tokio::spawn(async move {
            while is_running.load(Ordering::SeqCst) {
                tokio::select! {
                    Some(event) = events.next() => {
                        Self::handle_event(event, &adapter, &registry, &peripherals).await;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }

            debug!("Scan event loop ended");
        });

        *self.scan_handle.write() = Some(handle);

        Ok(())
    }

    /// Stop scanning.
    pub async fn stop_scanning(&self) -> Result<()> {
        if !self.is_running.load(Ordering::SeqCst) {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        self.is_running.store(false, Ordering::SeqCst);
        self.registry.set_scanning(false);

        let result = self.adapter.stop_scan().await;

        let handle = self.scan_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        result.map_err(Error::Bluetooth)
    }

    /// Find the platform peripheral for an identity.
    ///
    /// Falls back to asking the adapter when the peer was not seen by
    /// this scanner.
    pub async fn peripheral(&self, identity: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.read().get(identity).cloned() {
            return Ok(peripheral);
        }

        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == identity)
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: identity.to_string(),
            })
    }

    /// Handle a BLE central event.
    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        registry: &DiscoveryRegistry,
        peripherals: &RwLock<HashMap<String, Peripheral>>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                Self::process_peripheral(adapter, id, registry, peripherals).await;
            }
            CentralEvent::ServicesAdvertisement { id, .. } => {
                Self::process_peripheral(adapter, id, registry, peripherals).await;
            }
            other => trace!("Ignoring central event: {:?}", other),
        }
    }

    /// Process a discovered peripheral.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        registry: &DiscoveryRegistry,
        peripherals: &RwLock<HashMap<String, Peripheral>>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to read properties of {:?}: {}", id, e);
                return;
            }
        };

        let identity = id.to_string();
        let observation = registry.observe(
            &identity,
            properties.local_name.as_deref(),
            properties.rssi,
        );

        if observation != Observation::Rejected {
            peripherals.write().insert(identity, peripheral);
        }
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}
