//! Incremental dive download.
//!
//! The driver walks the records on the device newest first and calls back
//! once per record. The retriever forwards each new dive, stops when it
//! reaches the fingerprint of the newest dive from the previous download,
//! and stores the fingerprint of the newest dive afterwards. The walk runs
//! on a blocking thread while a separate task polls progress.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::ble::session::LinkSession;
use crate::device::descriptor::Descriptor;
use crate::device::driver::{DeviceEvents, DeviceStatus, IterationControl, OpenDevice, Progress};
use crate::device::parser::DiveParser;
use crate::download::cancel::CancellationToken;
use crate::download::log::DiveLog;
use crate::error::{Error, Result};
use crate::storage::fingerprints::FingerprintStore;
use crate::utils::hex_preview;

/// Default interval between progress reports.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Retriever settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalConfig {
    /// How often progress counters are read.
    pub progress_interval: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl RetrievalConfig {
    /// Set the progress polling interval.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

/// Parameters of one download.
#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest {
    /// Name the device is stored under in the fingerprint store.
    pub device_name: String,
    /// Stop when a dive with this fingerprint is reached.
    pub stop_fingerprint: Option<Vec<u8>>,
    /// Without a stop fingerprint, look one up when the device reports its serial.
    pub lookup_stored_fingerprint: bool,
    /// Checked before each record.
    pub cancel: CancellationToken,
}

impl RetrievalRequest {
    /// Download everything from `device_name`.
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            ..Self::default()
        }
    }

    /// Stop at a known fingerprint.
    pub fn with_stop_fingerprint(mut self, fingerprint: Option<Vec<u8>>) -> Self {
        self.stop_fingerprint = fingerprint;
        self
    }

    /// Look up the stored fingerprint once the serial is known.
    pub fn with_stored_lookup(mut self, enabled: bool) -> Self {
        self.lookup_stored_fingerprint = enabled;
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Observations sent while a download runs.
#[derive(Debug, Clone)]
pub enum RetrievalEvent {
    /// Progress counters changed.
    Progress(Progress),
    /// A new dive was downloaded.
    Dive(DiveLog),
}

/// How a download ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalOutcome {
    /// New dives were downloaded and the newest fingerprint stored.
    Updated {
        /// Downloaded dives, newest first.
        dives: Vec<DiveLog>,
        /// Fingerprint of the newest dive.
        newest_fingerprint: Vec<u8>,
    },
    /// The newest dive on the device was downloaded before.
    NoNewDives,
    /// The device holds no dives.
    Completed,
    /// Cancelled between records.
    Cancelled {
        /// Dives downloaded before cancellation.
        dives: Vec<DiveLog>,
    },
}

impl RetrievalOutcome {
    /// Dives downloaded by this run.
    pub fn dives(&self) -> &[DiveLog] {
        match self {
            Self::Updated { dives, .. } | Self::Cancelled { dives } => dives,
            Self::NoNewDives | Self::Completed => &[],
        }
    }

    /// Take the downloaded dives.
    pub fn into_dives(self) -> Vec<DiveLog> {
        match self {
            Self::Updated { dives, .. } | Self::Cancelled { dives } => dives,
            Self::NoNewDives | Self::Completed => Vec::new(),
        }
    }
}

/// State threaded through the record callback of one walk.
struct RetrievalContext<'a> {
    /// Number of the next forwarded dive.
    next_number: u32,
    newest_fingerprint: Option<Vec<u8>>,
    stop_fingerprint: Option<Vec<u8>>,
    /// Fingerprint found by the device-info lookup.
    looked_up: Arc<Mutex<Option<Vec<u8>>>>,
    cancel: &'a CancellationToken,
    saw_cancel: bool,
    parse_failure: Option<Error>,
    dives: Vec<DiveLog>,
}

impl<'a> RetrievalContext<'a> {
    fn new(
        stop_fingerprint: Option<Vec<u8>>,
        looked_up: Arc<Mutex<Option<Vec<u8>>>>,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            next_number: 1,
            newest_fingerprint: None,
            stop_fingerprint,
            looked_up,
            cancel,
            saw_cancel: false,
            parse_failure: None,
            dives: Vec::new(),
        }
    }

    fn effective_stop(&self) -> Option<Vec<u8>> {
        self.stop_fingerprint
            .clone()
            .or_else(|| self.looked_up.lock().clone())
    }

    fn found_new(&self) -> bool {
        !self.dives.is_empty()
    }

    fn on_record(
        &mut self,
        data: &[u8],
        fingerprint: &[u8],
        descriptor: &Descriptor,
        parser: &dyn DiveParser,
        events: &mpsc::UnboundedSender<RetrievalEvent>,
    ) -> IterationControl {
        if self.cancel.is_cancelled() {
            debug!("Download cancelled before dive #{}", self.next_number);
            self.saw_cancel = true;
            return IterationControl::Stop;
        }

        if self.newest_fingerprint.is_none() {
            self.newest_fingerprint = Some(fingerprint.to_vec());
        }

        if self.effective_stop().as_deref() == Some(fingerprint) {
            info!(
                "Reached previously downloaded dive {}",
                hex::encode(fingerprint)
            );
            return IterationControl::Stop;
        }

        match parser.parse(descriptor, data) {
            Ok(dive) => {
                let log = DiveLog::new(self.next_number, fingerprint, data, dive);
                trace!(
                    "Dive #{} fingerprint {}: {}",
                    log.number,
                    log.fingerprint_hex(),
                    hex_preview(data, 16)
                );
                let _ = events.send(RetrievalEvent::Dive(log.clone()));
                self.dives.push(log);
                self.next_number += 1;
                IterationControl::Continue
            }
            Err(e) => {
                warn!("Failed to parse dive #{}: {}", self.next_number, e);
                self.parse_failure = Some(Error::ParseFailed {
                    dive: self.next_number,
                    reason: e.to_string(),
                });
                IterationControl::Stop
            }
        }
    }
}

/// Downloads dives from the device attached to a session.
#[derive(Clone)]
pub struct DiveLogRetriever {
    fingerprints: Arc<FingerprintStore>,
    parser: Arc<dyn DiveParser>,
    config: RetrievalConfig,
}

impl DiveLogRetriever {
    /// Create a retriever.
    pub fn new(fingerprints: Arc<FingerprintStore>, parser: Arc<dyn DiveParser>) -> Self {
        Self {
            fingerprints,
            parser,
            config: RetrievalConfig::default(),
        }
    }

    /// Replace the settings.
    pub fn with_config(mut self, config: RetrievalConfig) -> Self {
        self.config = config;
        self
    }

    /// The fingerprint store used for persistence.
    pub fn fingerprints(&self) -> &Arc<FingerprintStore> {
        &self.fingerprints
    }

    /// Download new dives from the device attached to `session`.
    ///
    /// The walk runs on a blocking thread holding the session's device;
    /// a second concurrent call waits for the first. Dives and progress
    /// are also sent to `events` as they arrive.
    pub async fn retrieve(
        &self,
        session: &LinkSession,
        request: RetrievalRequest,
        events: mpsc::UnboundedSender<RetrievalEvent>,
    ) -> Result<RetrievalOutcome> {
        if !session.is_ready() {
            return Err(Error::NoDeviceConnected);
        }
        let device_events = session.device_events().ok_or(Error::NoDeviceConnected)?;

        let poller = self.spawn_progress_poller(device_events, events.clone());

        let slot = session.device_slot();
        let retriever = self.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock();
            let device = guard.as_mut().ok_or(Error::NoDeviceConnected)?;
            retriever.run_blocking(device, request, &events)
        })
        .await;

        poller.abort();
        result?
    }

    fn spawn_progress_poller(
        &self,
        device_events: Arc<DeviceEvents>,
        events: mpsc::UnboundedSender<RetrievalEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let interval = self.config.progress_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last = Progress::default();

            loop {
                ticker.tick().await;
                let progress = device_events.progress();
                if progress == last {
                    continue;
                }
                last = progress;
                if events.send(RetrievalEvent::Progress(progress)).is_err() {
                    break;
                }
            }
        })
    }

    /// Run one walk on the calling thread. Blocks on device I/O.
    pub fn run_blocking(
        &self,
        device: &mut OpenDevice,
        request: RetrievalRequest,
        events: &mpsc::UnboundedSender<RetrievalEvent>,
    ) -> Result<RetrievalOutcome> {
        let RetrievalRequest {
            device_name,
            stop_fingerprint,
            lookup_stored_fingerprint,
            cancel,
        } = request;

        info!(
            "Downloading dives from {} (stop at {})",
            device_name,
            stop_fingerprint
                .as_deref()
                .map(hex::encode)
                .unwrap_or_else(|| "none".to_string())
        );

        let fingerprint_filter = stop_fingerprint.as_deref().unwrap_or(&[]);
        if let Err(status) = device.device.set_fingerprint(fingerprint_filter) {
            debug!("Driver did not take the fingerprint filter: {}", status);
        }

        let looked_up = Arc::new(Mutex::new(None));
        if lookup_stored_fingerprint && stop_fingerprint.is_none() {
            let store = self.fingerprints.clone();
            let cell = looked_up.clone();
            device
                .events
                .set_fingerprint_lookup(Some(Box::new(move |model: &str, serial: &str| {
                    let found = store.get(model, serial)?;
                    *cell.lock() = Some(found.clone());
                    Some(found)
                })));
        }

        let descriptor = device.descriptor.clone();
        let parser = self.parser.clone();
        let mut context = RetrievalContext::new(stop_fingerprint, looked_up, &cancel);

        let status = {
            let mut callback = |data: &[u8], fingerprint: &[u8]| {
                context.on_record(data, fingerprint, &descriptor, parser.as_ref(), events)
            };
            device.device.foreach(&mut callback)
        };
        device.events.set_fingerprint_lookup(None);

        if let Some(failure) = context.parse_failure.take() {
            return Err(failure);
        }

        let cancelled = context.saw_cancel
            || (cancel.is_cancelled() && status == Err(DeviceStatus::Cancelled));
        if cancelled {
            info!(
                "Download cancelled after {} dives",
                context.dives.len()
            );
            return Ok(RetrievalOutcome::Cancelled {
                dives: context.dives,
            });
        }

        if let Err(status) = status {
            warn!("Dive enumeration failed: {}", status);
            return Err(Error::EnumerationFailed { status });
        }

        let stop_supplied = context.effective_stop().is_some();

        match (context.found_new(), context.newest_fingerprint.take()) {
            (true, Some(newest)) => {
                match device.events.serial() {
                    Some(serial) => {
                        if let Err(e) = self.fingerprints.put(&newest, &device_name, &serial) {
                            warn!("Failed to store fingerprint: {}", e);
                        }
                    }
                    None => warn!("Device reported no serial; fingerprint not stored"),
                }
                info!("Downloaded {} new dives", context.dives.len());
                Ok(RetrievalOutcome::Updated {
                    dives: context.dives,
                    newest_fingerprint: newest,
                })
            }
            _ if stop_supplied => {
                info!("No new dives since last download");
                Ok(RetrievalOutcome::NoNewDives)
            }
            _ => {
                info!("Device has no dives");
                Ok(RetrievalOutcome::Completed)
            }
        }
    }
}
