//! Background Scheduler Module
//!
//! Periodic wake-ups that run independently of the foreground lifecycle.
//!
//! The platform contract: every wake must be finished exactly once, whatever
//! the task did. [`BackgroundScheduler::wake`] owns that call so task code
//! cannot skip it or repeat it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::task::AbortHandle;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::position::{PositionOptions, PositionSource};
use crate::upload::{UploadClient, UploadOutcome};

/// Network condition required before the OS delivers a wake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRequirement {
    #[default]
    Any,
    Unmetered,
    None,
}

impl std::fmt::Display for NetworkRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkRequirement::Any => write!(f, "any"),
            NetworkRequirement::Unmetered => write!(f, "unmetered"),
            NetworkRequirement::None => write!(f, "none"),
        }
    }
}

/// Wake registration parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundOptions {
    pub interval_minutes: u32,
    /// Keep scheduling after the app is terminated when false
    pub stop_on_terminate: bool,
    pub start_on_boot: bool,
    pub network: NetworkRequirement,
}

impl Default for BackgroundOptions {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            stop_on_terminate: false,
            start_on_boot: true,
            network: NetworkRequirement::Any,
        }
    }
}

/// OS-issued identifier of one wake
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        TaskId(id.to_string())
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Background scheduler started before configure")]
    NotConfigured,

    #[error("Background platform error: {0}")]
    Platform(String),
}

/// Native background-execution API
pub trait BackgroundPlatform: Send + Sync {
    fn configure(&self, options: &BackgroundOptions) -> Result<(), SchedulerError>;
    fn start(&self) -> Result<(), SchedulerError>;
    fn stop(&self) -> Result<(), SchedulerError>;
    /// Tell the OS the wake is done
    fn finish(&self, task_id: &TaskId);
}

/// Work performed on each wake
#[async_trait]
pub trait BackgroundTask: Send + Sync {
    async fn run(&self, task_id: &TaskId) -> anyhow::Result<()>;
}

/// Called with every task failure, after it has been logged
pub type ErrorHook = Arc<dyn Fn(&TaskId, &anyhow::Error) + Send + Sync>;

struct Registration {
    task: Arc<dyn BackgroundTask>,
    on_error: Option<ErrorHook>,
}

#[derive(Default)]
struct SchedulerState {
    registration: Option<Registration>,
    running: bool,
}

/// Periodic background wake-ups
pub struct BackgroundScheduler {
    platform: Arc<dyn BackgroundPlatform>,
    state: Mutex<SchedulerState>,
    in_flight: Mutex<HashSet<TaskId>>,
}

impl BackgroundScheduler {
    pub fn new(platform: Arc<dyn BackgroundPlatform>) -> Self {
        Self {
            platform,
            state: Mutex::new(SchedulerState::default()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Register the periodic wake and the task it runs
    pub fn configure(
        &self,
        options: &BackgroundOptions,
        task: Arc<dyn BackgroundTask>,
        on_error: Option<ErrorHook>,
    ) -> Result<(), SchedulerError> {
        self.platform.configure(options)?;
        self.lock_state().registration = Some(Registration { task, on_error });

        info!(
            interval_minutes = options.interval_minutes,
            stop_on_terminate = options.stop_on_terminate,
            start_on_boot = options.start_on_boot,
            network = %options.network,
            "Background scheduler configured"
        );
        Ok(())
    }

    /// Idempotent
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.lock_state();
        if state.registration.is_none() {
            return Err(SchedulerError::NotConfigured);
        }
        if state.running {
            debug!("Background scheduler already running");
            return Ok(());
        }
        self.platform.start()?;
        state.running = true;
        info!("Background scheduler started");
        Ok(())
    }

    /// Idempotent
    pub fn stop(&self) -> Result<(), SchedulerError> {
        let mut state = self.lock_state();
        if !state.running {
            return Ok(());
        }
        state.running = false;
        self.platform.stop()?;
        info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Entry point for an OS wake. Runs the task and finishes the wake exactly once,
    /// including when this future is dropped before it completes.
    pub async fn wake(&self, task_id: TaskId) {
        let registration = {
            let state = self.lock_state();
            match (&state.registration, state.running) {
                (Some(reg), true) => Some((reg.task.clone(), reg.on_error.clone())),
                _ => None,
            }
        };

        if !self.lock_in_flight().insert(task_id.clone()) {
            // The earlier delivery keeps its own finish
            warn!(%task_id, "Wake delivered while the same id is in flight, finishing without running");
            self.platform.finish(&task_id);
            return;
        }
        let mut guard = FinishGuard { scheduler: self, task_id: &task_id, running: None };

        let Some((task, on_error)) = registration else {
            debug!(%task_id, "Wake while scheduler inactive");
            return;
        };

        debug!(%task_id, "Background wake");

        // Spawned so a panicking task still reaches `finish`
        let run_id = task_id.clone();
        let handle = tokio::spawn(async move { task.run(&run_id).await });
        guard.running = Some(handle.abort_handle());
        let outcome = handle.await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(join) => Some(anyhow::anyhow!("background task aborted: {join}")),
        };

        if let Some(e) = failure {
            warn!(%task_id, "Background task failed: {:#}", e);
            if let Some(hook) = on_error {
                hook(&task_id, &e);
            }
        }
    }

    /// The OS is about to reclaim the wake. Finishes it now if the task has not.
    pub fn expire(&self, task_id: &TaskId) {
        warn!(%task_id, "Background wake expired");
        self.finish(task_id);
    }

    fn finish(&self, task_id: &TaskId) {
        if self.lock_in_flight().remove(task_id) {
            self.platform.finish(task_id);
            debug!(%task_id, "Background wake finished");
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<TaskId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Finishes a wake when dropped, aborting its task if still running
struct FinishGuard<'a> {
    scheduler: &'a BackgroundScheduler,
    task_id: &'a TaskId,
    running: Option<AbortHandle>,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.abort();
        }
        self.scheduler.finish(self.task_id);
    }
}

/// Fetch-and-upload for wakes that arrive with no controller in memory
pub struct HeadlessUploadTask {
    source: PositionSource,
    uploader: Arc<dyn UploadClient>,
    options: PositionOptions,
}

impl HeadlessUploadTask {
    pub fn new(source: PositionSource, uploader: Arc<dyn UploadClient>, options: PositionOptions) -> Self {
        Self { source, uploader, options }
    }
}

#[async_trait]
impl BackgroundTask for HeadlessUploadTask {
    async fn run(&self, task_id: &TaskId) -> anyhow::Result<()> {
        let coordinate = self.source.get_once(&self.options).await?;

        match self.uploader.post_sample(coordinate).await {
            UploadOutcome::Delivered => {
                info!(%task_id, %coordinate, "Background sample uploaded");
                Ok(())
            }
            UploadOutcome::Skipped => {
                debug!(%task_id, "No session, background sample skipped");
                Ok(())
            }
            UploadOutcome::Failed(e) => {
                error!(%task_id, "Background upload failed: {}", e);
                Err(e.into())
            }
        }
    }
}
