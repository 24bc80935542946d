//! Care Tracker Location Library
//!
//! Location tracking and synchronization core embedded by the mobile app.

pub mod auth;
pub mod commands;
pub mod config;
pub mod controller;
pub mod geo;
pub mod geocode;
pub mod logging;
pub mod permission;
pub mod position;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod upload;

use std::sync::Arc;

use auth::SessionStore;
use config::TrackerConfig;
use controller::{Collaborators, SyncController};
use geocode::ProxyAddressResolver;
use permission::PermissionPlatform;
use position::{LocationProvider, PositionSource};
use scheduler::{BackgroundPlatform, BackgroundScheduler, HeadlessUploadTask};
use storage::KeyValueStore;
use sync::{ApiClient, ApiError};
use upload::HttpUploadClient;

/// Application state shared across commands
pub struct AppState {
    pub config: TrackerConfig,
    pub storage: Arc<KeyValueStore>,
    pub api: Arc<ApiClient>,
}

impl AppState {
    pub fn new(config: TrackerConfig, storage: KeyValueStore) -> Result<Self, ApiError> {
        let api = ApiClient::new(
            &config.api.base_url,
            config.api.upload_timeout(),
            config.api.geocode_timeout(),
        )?;

        Ok(Self {
            config,
            storage: Arc::new(storage),
            api: Arc::new(api),
        })
    }

    pub fn sessions(&self) -> Arc<dyn SessionStore> {
        self.storage.clone()
    }

    /// HTTP-backed collaborators around the host's platform bindings
    pub fn collaborators(
        &self,
        permissions: Arc<dyn PermissionPlatform>,
        positions: Arc<dyn LocationProvider>,
        background: Arc<dyn BackgroundPlatform>,
    ) -> Collaborators {
        Collaborators {
            permissions,
            positions,
            background,
            uploader: Arc::new(HttpUploadClient::new(self.api.clone(), self.sessions())),
            resolver: Arc::new(ProxyAddressResolver::new(self.api.clone())),
        }
    }

    /// Controller for a foreground screen
    pub fn controller(
        &self,
        permissions: Arc<dyn PermissionPlatform>,
        positions: Arc<dyn LocationProvider>,
        background: Arc<dyn BackgroundPlatform>,
    ) -> SyncController {
        SyncController::new(
            self.config.controller_options(),
            self.collaborators(permissions, positions, background),
        )
    }

    /// Scheduler for a wake delivered while no screen is mounted.
    ///
    /// Configures and starts it with a fetch-and-upload task.
    pub fn headless_scheduler(
        &self,
        positions: Arc<dyn LocationProvider>,
        background: Arc<dyn BackgroundPlatform>,
    ) -> Result<BackgroundScheduler, scheduler::SchedulerError> {
        let task = HeadlessUploadTask::new(
            PositionSource::new(positions),
            Arc::new(HttpUploadClient::new(self.api.clone(), self.sessions())),
            self.config.background.position.clone(),
        );

        let scheduler = BackgroundScheduler::new(background);
        scheduler.configure(&self.config.background.schedule, Arc::new(task), None)?;
        scheduler.start()?;
        Ok(scheduler)
    }
}
