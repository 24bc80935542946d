//! Sync Controller Module
//!
//! Owns the location subsystem's lifecycle:
//!
//! ```text
//! Idle --mount--> PermissionPending --granted--> Active --unmount--> TornDown
//!                        |                                             ^
//!                        +------------------denied--------------------+
//! ```
//!
//! While Active, three independent producers feed coordinates in: the
//! startup one-shot fetch, the continuous watch, and background wakes. No
//! relative order is assumed between them. Each coordinate updates the view,
//! then is queued for upload and has its address looked up. Uploads go out
//! one at a time in the order samples were accepted, so the backend's latest
//! position is always the newest one.
//!
//! Every mutation of the view happens under the phase lock and is refused
//! once the phase is TornDown, so continuations that outlive the controller
//! cannot change what the UI sees.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::geo::{Coordinate, LocationSample};
use crate::geocode::AddressResolver;
use crate::permission::{PermissionGate, PermissionPlatform};
use crate::position::{LocationProvider, PositionError, PositionOptions, PositionSource, WatchHandle};
use crate::scheduler::{
    BackgroundOptions, BackgroundPlatform, BackgroundScheduler, BackgroundTask, ErrorHook, SchedulerError,
    TaskId,
};
use crate::upload::{UploadClient, UploadOutcome};

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    PermissionPending,
    Active,
    TornDown,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "idle"),
            ControllerState::PermissionPending => write!(f, "permission_pending"),
            ControllerState::Active => write!(f, "active"),
            ControllerState::TornDown => write!(f, "torn_down"),
        }
    }
}

/// Which producer a coordinate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOrigin {
    OneShot,
    Watch,
    Background,
    Manual,
}

/// What the UI renders
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationView {
    pub sample: Option<LocationSample>,
    pub origin: Option<SampleOrigin>,
    pub last_uploaded_at: Option<DateTime<Utc>>,
    pub last_upload_error: Option<String>,
    pub uploads_in_flight: u32,
    /// Sequence number of `sample`
    pub sample_seq: u64,
    /// Sequence number of the sample the upload status refers to
    pub upload_seq: u64,
    /// Bumped on every change
    pub revision: u64,
}

impl LocationView {
    pub fn coordinate(&self) -> Option<Coordinate> {
        self.sample.as_ref().map(|s| s.coordinate)
    }

    pub fn address(&self) -> Option<&str> {
        self.sample.as_ref().and_then(|s| s.address.as_deref())
    }
}

/// Per-call-site acquisition and scheduling settings
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub require_background: bool,
    pub one_shot: PositionOptions,
    pub watch: PositionOptions,
    pub background: BackgroundOptions,
    pub background_position: PositionOptions,
    pub language: String,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            require_background: false,
            one_shot: PositionOptions::one_shot(),
            watch: PositionOptions::watch(),
            background: BackgroundOptions::default(),
            background_position: PositionOptions {
                maximum_age_secs: 0,
                ..PositionOptions::one_shot()
            },
            language: "zh-TW".to_string(),
        }
    }
}

/// Everything the controller talks to
#[derive(Clone)]
pub struct Collaborators {
    pub permissions: Arc<dyn PermissionPlatform>,
    pub positions: Arc<dyn LocationProvider>,
    pub background: Arc<dyn BackgroundPlatform>,
    pub uploader: Arc<dyn UploadClient>,
    pub resolver: Arc<dyn AddressResolver>,
}

/// Controller errors
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Cannot go from {from} to {to}")]
    InvalidTransition { from: ControllerState, to: ControllerState },

    #[error("Controller was torn down")]
    TornDown,

    #[error(transparent)]
    Position(#[from] PositionError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

struct Inner {
    options: ControllerOptions,
    gate: PermissionGate<dyn PermissionPlatform>,
    source: PositionSource,
    scheduler: Arc<BackgroundScheduler>,
    uploader: Arc<dyn UploadClient>,
    resolver: Arc<dyn AddressResolver>,
    phase: Mutex<ControllerState>,
    view: watch::Sender<LocationView>,
    alive: CancellationToken,
    watch: Mutex<Option<WatchHandle>>,
    uploads: Mutex<Option<mpsc::UnboundedSender<PendingUpload>>>,
}

struct PendingUpload {
    seq: u64,
    coordinate: Coordinate,
}

/// Location tracking and synchronization for one mounted screen
pub struct SyncController {
    inner: Arc<Inner>,
}

impl SyncController {
    pub fn new(options: ControllerOptions, collaborators: Collaborators) -> Self {
        let (view, _) = watch::channel(LocationView::default());

        let inner = Inner {
            options,
            gate: PermissionGate::new(collaborators.permissions),
            source: PositionSource::new(collaborators.positions),
            scheduler: Arc::new(BackgroundScheduler::new(collaborators.background)),
            uploader: collaborators.uploader,
            resolver: collaborators.resolver,
            phase: Mutex::new(ControllerState::Idle),
            view,
            alive: CancellationToken::new(),
            watch: Mutex::new(None),
            uploads: Mutex::new(None),
        };

        Self { inner: Arc::new(inner) }
    }

    pub fn state(&self) -> ControllerState {
        *self.inner.lock_phase()
    }

    /// Current view
    pub fn snapshot(&self) -> LocationView {
        self.inner.view.borrow().clone()
    }

    /// Receiver that is notified on every view change
    pub fn subscribe(&self) -> watch::Receiver<LocationView> {
        self.inner.view.subscribe()
    }

    /// Scheduler the host forwards OS wakes to
    pub fn scheduler(&self) -> Arc<BackgroundScheduler> {
        self.inner.scheduler.clone()
    }

    /// Acquire permissions and, if granted, start every producer.
    ///
    /// A denial tears the controller down; it is never retried here.
    pub async fn mount(&self) -> Result<(), SyncError> {
        {
            let mut phase = self.inner.lock_phase();
            if *phase != ControllerState::Idle {
                return Err(SyncError::InvalidTransition {
                    from: *phase,
                    to: ControllerState::PermissionPending,
                });
            }
            *phase = ControllerState::PermissionPending;
        }
        debug!("Requesting location permissions");

        let granted = self.inner.gate.acquire(self.inner.options.require_background).await;

        let mut phase = self.inner.lock_phase();
        if *phase != ControllerState::PermissionPending {
            debug!("Unmounted while waiting for permissions");
            return Err(SyncError::TornDown);
        }

        if !granted {
            *phase = ControllerState::TornDown;
            self.inner.alive.cancel();
            warn!("Location sync not started: permission denied");
            return Err(SyncError::PermissionDenied);
        }

        *phase = ControllerState::Active;
        // Producers are started under the phase lock so a concurrent unmount
        // sees either nothing started or everything started.
        Inner::activate(&self.inner);
        drop(phase);

        info!("Location sync active");
        Ok(())
    }

    /// Locate now and push the fix through the normal pipeline
    pub async fn upload_now(&self) -> Result<Coordinate, SyncError> {
        let state = self.state();
        if state != ControllerState::Active {
            return Err(SyncError::InvalidTransition { from: state, to: ControllerState::Active });
        }

        let options = self.inner.options.one_shot.clone();
        let coordinate = tokio::select! {
            _ = self.inner.alive.cancelled() => return Err(SyncError::TornDown),
            fix = self.inner.source.get_once(&options) => fix?,
        };

        if Inner::accept(&self.inner, coordinate, SampleOrigin::Manual) {
            Ok(coordinate)
        } else {
            Err(SyncError::TornDown)
        }
    }

    /// Cancel the watch, stop the scheduler and freeze the view. Idempotent.
    pub fn unmount(&self) {
        self.inner.teardown();
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl Inner {
    fn lock_phase(&self) -> MutexGuard<'_, ControllerState> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_watch(&self) -> MutexGuard<'_, Option<WatchHandle>> {
        self.watch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_uploads(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<PendingUpload>>> {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the upload worker, the one-shot fetch, the watch and the scheduler
    fn activate(this: &Arc<Self>) {
        *this.lock_uploads() = Some(Inner::spawn_upload_worker(this));

        // One-shot startup fetch
        let weak = Arc::downgrade(this);
        let source = this.source.clone();
        let options = this.options.one_shot.clone();
        let alive = this.alive.clone();
        tokio::spawn(async move {
            let fix = tokio::select! {
                _ = alive.cancelled() => return,
                fix = source.get_once(&options) => fix,
            };
            match fix {
                Ok(coordinate) => {
                    if let Some(inner) = weak.upgrade() {
                        Inner::accept(&inner, coordinate, SampleOrigin::OneShot);
                    }
                }
                Err(e) => debug!("Startup fix produced no sample: {}", e),
            }
        });

        // Continuous watch, at most one per controller
        {
            let mut slot = this.lock_watch();
            if slot.as_ref().map_or(true, |w| !w.is_active()) {
                let weak = Arc::downgrade(this);
                let handle = this.source.watch(
                    move |coordinate| {
                        if let Some(inner) = weak.upgrade() {
                            Inner::accept(&inner, coordinate, SampleOrigin::Watch);
                        }
                    },
                    |e| warn!("Position watch error: {}", e),
                    &this.options.watch,
                );
                *slot = Some(handle);
            }
        }

        // Background wakes
        let task = Arc::new(ControllerTask {
            inner: Arc::downgrade(this),
            source: this.source.clone(),
            options: this.options.background_position.clone(),
        });
        let on_error: ErrorHook = Arc::new(|task_id: &TaskId, e: &anyhow::Error| {
            debug!(%task_id, "Wake produced no sample: {}", e)
        });

        let started = this
            .scheduler
            .configure(&this.options.background, task, Some(on_error))
            .and_then(|()| this.scheduler.start());
        if let Err(e) = started {
            warn!("Background scheduling unavailable: {}", e);
        }
    }

    /// Single consumer of the upload queue. Drains what was queued before
    /// teardown, then exits once the sender is dropped.
    fn spawn_upload_worker(this: &Arc<Self>) -> mpsc::UnboundedSender<PendingUpload> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PendingUpload>();
        let weak = Arc::downgrade(this);
        let uploader = this.uploader.clone();

        tokio::spawn(async move {
            while let Some(PendingUpload { seq, coordinate }) = rx.recv().await {
                let outcome = uploader.post_sample(coordinate).await;
                if let Some(inner) = weak.upgrade() {
                    inner.record_upload(seq, &outcome);
                }
            }
            debug!("Upload worker stopped");
        });

        tx
    }

    /// Handle one coordinate from any producer. Returns false once torn down.
    fn accept(this: &Arc<Self>, coordinate: Coordinate, origin: SampleOrigin) -> bool {
        let mut seq = 0;
        let mut queued = false;
        let applied = this.mutate(|view| {
            seq = view.sample_seq + 1;
            view.sample = Some(LocationSample::new(coordinate));
            view.origin = Some(origin);
            view.sample_seq = seq;

            // Queued under the phase lock so queue order matches `seq`
            queued = this
                .lock_uploads()
                .as_ref()
                .map_or(false, |tx| tx.send(PendingUpload { seq, coordinate }).is_ok());
            if queued {
                view.uploads_in_flight += 1;
            }
        });
        if !applied {
            debug!(%coordinate, ?origin, "Coordinate after teardown discarded");
            return false;
        }

        debug!(%coordinate, ?origin, seq, "New location sample");
        if !queued {
            warn!(%coordinate, "Upload queue closed, sample not uploaded");
        }

        let inner = this.clone();
        tokio::spawn(async move {
            let address = inner.resolver.resolve(coordinate, &inner.options.language).await;
            inner.mutate(|view| {
                // Only the newest sample gets an address
                if view.sample_seq == seq {
                    if let Some(sample) = view.sample.as_mut() {
                        sample.address = Some(address);
                    }
                }
            });
        });

        true
    }

    /// Apply an upload result. Status from a sample older than the one
    /// already reported is ignored.
    fn record_upload(&self, seq: u64, outcome: &UploadOutcome) {
        self.mutate(|view| {
            view.uploads_in_flight = view.uploads_in_flight.saturating_sub(1);
            if seq < view.upload_seq {
                return;
            }
            view.upload_seq = seq;
            match outcome {
                UploadOutcome::Delivered => {
                    view.last_uploaded_at = Some(Utc::now());
                    view.last_upload_error = None;
                }
                UploadOutcome::Skipped => {
                    view.last_upload_error = Some("not signed in".to_string());
                }
                UploadOutcome::Failed(e) => {
                    view.last_upload_error = Some(e.to_string());
                }
            }
        });
    }

    /// Apply `f` to the view unless torn down
    fn mutate(&self, f: impl FnOnce(&mut LocationView)) -> bool {
        let phase = self.lock_phase();
        if *phase == ControllerState::TornDown {
            return false;
        }
        self.view.send_modify(|view| {
            f(view);
            view.revision += 1;
        });
        true
    }

    fn teardown(&self) {
        let mut phase = self.lock_phase();
        if *phase == ControllerState::TornDown {
            return;
        }
        let previous = *phase;
        *phase = ControllerState::TornDown;
        self.alive.cancel();

        if let Some(handle) = self.lock_watch().take() {
            handle.cancel();
        }
        self.lock_uploads().take();
        if let Err(e) = self.scheduler.stop() {
            warn!("Failed to stop background scheduler: {}", e);
        }

        info!(%previous, "Location sync torn down");
    }
}

/// Background wake bound to a live controller
struct ControllerTask {
    inner: Weak<Inner>,
    source: PositionSource,
    options: PositionOptions,
}

#[async_trait]
impl BackgroundTask for ControllerTask {
    async fn run(&self, task_id: &TaskId) -> anyhow::Result<()> {
        if self.inner.upgrade().map_or(true, |i| i.alive.is_cancelled()) {
            debug!(%task_id, "Wake after teardown ignored");
            return Ok(());
        }

        let coordinate = self.source.get_once(&self.options).await?;

        if let Some(inner) = self.inner.upgrade() {
            Inner::accept(&inner, coordinate, SampleOrigin::Background);
        }
        Ok(())
    }
}
