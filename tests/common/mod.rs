//! Scripted platform doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use care_tracker_lib::controller::{Collaborators, ControllerOptions, SyncController};
use care_tracker_lib::geo::Coordinate;
use care_tracker_lib::geocode::{AddressResolver, ADDRESS_UNAVAILABLE};
use care_tracker_lib::permission::{PermissionKind, PermissionPlatform, PermissionStatus};
use care_tracker_lib::position::{
    Fix, FixSubscription, LocationProvider, PositionError, PositionOptions, WatchId,
};
use care_tracker_lib::scheduler::{BackgroundOptions, BackgroundPlatform, SchedulerError, TaskId};
use care_tracker_lib::sync::ApiError;
use care_tracker_lib::upload::{UploadClient, UploadOutcome};

/// Poll `cond` until it holds, failing the test after two seconds
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for: {what}");
}

/// Give spawned tasks a chance to run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Offsets a coordinate northwards by roughly `meters`
pub fn north_of(c: Coordinate, meters: f64) -> Coordinate {
    Coordinate::new(c.latitude + meters / 111_195.0, c.longitude)
}

// Permissions

pub struct MockPermissions {
    fine: bool,
    coarse: bool,
    background: bool,
    hold: Option<Arc<Semaphore>>,
    pub requests: AtomicUsize,
}

impl MockPermissions {
    pub fn granting() -> Self {
        Self::new(true, true, true)
    }

    pub fn new(fine: bool, coarse: bool, background: bool) -> Self {
        Self { fine, coarse, background, hold: None, requests: AtomicUsize::new(0) }
    }

    /// Prompts block until a permit is added to `gate`
    pub fn held(gate: Arc<Semaphore>) -> Self {
        Self { hold: Some(gate), ..Self::granting() }
    }
}

#[async_trait]
impl PermissionPlatform for MockPermissions {
    async fn request(&self, kind: PermissionKind) -> PermissionStatus {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.hold {
            gate.acquire().await.unwrap().forget();
        }
        let granted = match kind {
            PermissionKind::Fine => self.fine,
            PermissionKind::Coarse => self.coarse,
            PermissionKind::Background => self.background,
        };
        if granted { PermissionStatus::Granted } else { PermissionStatus::Denied }
    }

    fn requires_background_grant(&self) -> bool {
        true
    }
}

// Location

#[derive(Default)]
pub struct MockLocation {
    one_shot: Mutex<VecDeque<Fix>>,
    subscriptions: Mutex<HashMap<WatchId, mpsc::UnboundedSender<Fix>>>,
    next_id: AtomicU64,
    pub one_shot_calls: AtomicUsize,
    pub watch_starts: AtomicUsize,
    pub watch_stops: AtomicUsize,
}

impl MockLocation {
    /// Queue the result of the next `current_position`; an empty queue yields Unavailable
    pub fn queue_one_shot(&self, fix: Fix) {
        self.one_shot.lock().unwrap().push_back(fix);
    }

    /// Deliver a fix to every live subscription, returning how many received it
    pub fn push(&self, fix: Fix) -> usize {
        let subs = self.subscriptions.lock().unwrap();
        subs.values().filter(|tx| tx.send(fix.clone()).is_ok()).count()
    }

    pub fn live_subscriptions(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }
}

#[async_trait]
impl LocationProvider for MockLocation {
    async fn current_position(&self, _options: &PositionOptions) -> Fix {
        self.one_shot_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.one_shot.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(PositionError::Unavailable("no fix scripted".into())))
    }

    fn start_updates(&self, _options: &PositionOptions) -> FixSubscription {
        self.watch_starts.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, fixes) = mpsc::unbounded_channel();
        self.subscriptions.lock().unwrap().insert(id, tx);
        FixSubscription { id, fixes }
    }

    fn stop_updates(&self, id: WatchId) {
        self.watch_stops.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().unwrap().remove(&id);
    }
}

// Background

#[derive(Default)]
pub struct MockBackground {
    pub configured: Mutex<Option<BackgroundOptions>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub finished: Mutex<Vec<TaskId>>,
}

impl MockBackground {
    pub fn finished(&self) -> Vec<TaskId> {
        self.finished.lock().unwrap().clone()
    }
}

impl BackgroundPlatform for MockBackground {
    fn configure(&self, options: &BackgroundOptions) -> Result<(), SchedulerError> {
        *self.configured.lock().unwrap() = Some(options.clone());
        Ok(())
    }

    fn start(&self) -> Result<(), SchedulerError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<(), SchedulerError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finish(&self, task_id: &TaskId) {
        self.finished.lock().unwrap().push(task_id.clone());
    }
}

// Upload

#[derive(Default)]
pub struct SpyUploader {
    pub calls: Mutex<Vec<Coordinate>>,
    hold: Option<Arc<Semaphore>>,
    rejected: Mutex<Vec<Coordinate>>,
}

impl SpyUploader {
    /// Uploads block until a permit is added to `gate`
    pub fn held(gate: Arc<Semaphore>) -> Self {
        Self { hold: Some(gate), ..Self::default() }
    }

    /// Uploads of `coordinate` fail with a timeout
    pub fn failing_for(coordinate: Coordinate) -> Self {
        Self { rejected: Mutex::new(vec![coordinate]), ..Self::default() }
    }

    pub fn calls(&self) -> Vec<Coordinate> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl UploadClient for SpyUploader {
    async fn post_sample(&self, coordinate: Coordinate) -> UploadOutcome {
        self.calls.lock().unwrap().push(coordinate);
        if let Some(gate) = &self.hold {
            gate.acquire().await.unwrap().forget();
        }
        if self.rejected.lock().unwrap().contains(&coordinate) {
            return UploadOutcome::Failed(ApiError::Timeout);
        }
        UploadOutcome::Delivered
    }
}

// Address

pub struct SpyResolver {
    answer: Option<String>,
    pub calls: Mutex<Vec<(Coordinate, String)>>,
}

impl SpyResolver {
    pub fn answering(address: &str) -> Self {
        Self { answer: Some(address.to_string()), calls: Mutex::new(Vec::new()) }
    }

    /// Behaves like a proxy that timed out
    pub fn failing() -> Self {
        Self { answer: None, calls: Mutex::new(Vec::new()) }
    }

    pub fn calls(&self) -> Vec<(Coordinate, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AddressResolver for SpyResolver {
    async fn resolve(&self, coordinate: Coordinate, language: &str) -> String {
        self.calls.lock().unwrap().push((coordinate, language.to_string()));
        self.answer.clone().unwrap_or_else(|| ADDRESS_UNAVAILABLE.to_string())
    }
}

/// A controller wired to fresh doubles
pub struct Harness {
    pub permissions: Arc<MockPermissions>,
    pub location: Arc<MockLocation>,
    pub background: Arc<MockBackground>,
    pub uploader: Arc<SpyUploader>,
    pub resolver: Arc<SpyResolver>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            permissions: Arc::new(MockPermissions::granting()),
            location: Arc::new(MockLocation::default()),
            background: Arc::new(MockBackground::default()),
            uploader: Arc::new(SpyUploader::default()),
            resolver: Arc::new(SpyResolver::answering("No. 7, Xinyi Rd")),
        }
    }

    pub fn controller(&self, options: ControllerOptions) -> SyncController {
        SyncController::new(
            options,
            Collaborators {
                permissions: self.permissions.clone(),
                positions: self.location.clone(),
                background: self.background.clone(),
                uploader: self.uploader.clone(),
                resolver: self.resolver.clone(),
            },
        )
    }
}

/// Options with a given watch displacement filter
pub fn options_with_filter(distance_filter_m: f64) -> ControllerOptions {
    let mut options = ControllerOptions::default();
    options.watch.distance_filter_m = distance_filter_m;
    options
}
