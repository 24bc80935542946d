//! Position Module
//!
//! One-shot and continuous position acquisition on top of the platform
//! location provider. The continuous watch applies a minimum-displacement
//! filter and is torn down through an idempotent [`WatchHandle::cancel`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::geo::{Coordinate, DisplacementFilter};

/// Per-call acquisition options. There is no subsystem-wide default:
/// every call site passes its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionOptions {
    pub high_accuracy: bool,
    pub timeout_secs: u64,
    /// How old a cached fix may be and still be returned
    pub maximum_age_secs: u64,
    /// Minimum movement in meters before a watch emits again
    pub distance_filter_m: f64,
    /// Requested update interval for watches
    pub interval_secs: Option<u64>,
}

impl PositionOptions {
    /// Settings for a single foreground fetch
    pub fn one_shot() -> Self {
        Self {
            high_accuracy: true,
            timeout_secs: 15,
            maximum_age_secs: 10,
            distance_filter_m: 0.0,
            interval_secs: None,
        }
    }

    /// Settings for the continuous foreground watch
    pub fn watch() -> Self {
        Self {
            high_accuracy: true,
            timeout_secs: 15,
            maximum_age_secs: 10,
            distance_filter_m: 5.0,
            interval_secs: Some(60),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Position acquisition errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PositionError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Timed out waiting for a position fix")]
    Timeout,

    #[error("Position unavailable: {0}")]
    Unavailable(String),
}

/// A single OS-delivered reading
pub type Fix = Result<Coordinate, PositionError>;

/// Identifier of a platform watch registration
pub type WatchId = u64;

/// Live platform subscription: fixes arrive on `fixes` until `stop_updates(id)`
pub struct FixSubscription {
    pub id: WatchId,
    pub fixes: mpsc::UnboundedReceiver<Fix>,
}

/// Platform location API
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Resolve a single fix
    async fn current_position(&self, options: &PositionOptions) -> Fix;

    /// Register for continuous updates
    fn start_updates(&self, options: &PositionOptions) -> FixSubscription;

    /// Release a registration returned by `start_updates`
    fn stop_updates(&self, id: WatchId);
}

/// One-shot and continuous acquisition
#[derive(Clone)]
pub struct PositionSource {
    provider: Arc<dyn LocationProvider>,
}

impl PositionSource {
    pub fn new(provider: Arc<dyn LocationProvider>) -> Self {
        Self { provider }
    }

    /// Fetch one coordinate, bounded by `options.timeout_secs`
    pub async fn get_once(&self, options: &PositionOptions) -> Fix {
        match tokio::time::timeout(options.timeout(), self.provider.current_position(options)).await {
            Ok(Ok(coordinate)) => {
                debug!(%coordinate, "One-shot position acquired");
                Ok(coordinate)
            }
            Ok(Err(e)) => {
                warn!("One-shot position failed: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!(timeout_secs = options.timeout_secs, "One-shot position timed out");
                Err(PositionError::Timeout)
            }
        }
    }

    /// Start a continuous watch.
    ///
    /// `on_update` receives every fix that passes the displacement filter,
    /// `on_error` receives provider errors. Once [`WatchHandle::cancel`]
    /// returns no further fix is taken from the provider; a callback that was
    /// already running when `cancel` was called may still complete.
    pub fn watch<U, E>(&self, on_update: U, on_error: E, options: &PositionOptions) -> WatchHandle
    where
        U: Fn(Coordinate) + Send + 'static,
        E: Fn(PositionError) + Send + 'static,
    {
        let FixSubscription { id, mut fixes } = self.provider.start_updates(options);
        let token = CancellationToken::new();
        let mut filter = DisplacementFilter::new(options.distance_filter_m);

        debug!(watch_id = id, distance_filter_m = options.distance_filter_m, "Position watch started");

        let task_token = token.clone();
        tokio::spawn(async move {
            loop {
                let fix = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    fix = fixes.recv() => match fix {
                        Some(fix) => fix,
                        None => break,
                    },
                };

                if task_token.is_cancelled() {
                    break;
                }

                match fix {
                    Ok(coordinate) if filter.accept(coordinate) => on_update(coordinate),
                    Ok(coordinate) => trace!(%coordinate, "Fix below displacement threshold"),
                    Err(e) => on_error(e),
                }
            }
            debug!(watch_id = id, "Position watch ended");
        });

        WatchHandle {
            id,
            provider: self.provider.clone(),
            token,
            stopped: AtomicBool::new(false),
        }
    }
}

/// Owner of a running watch. Cancels on drop.
pub struct WatchHandle {
    id: WatchId,
    provider: Arc<dyn LocationProvider>,
    token: CancellationToken,
    stopped: AtomicBool,
}

impl WatchHandle {
    pub fn id(&self) -> WatchId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    /// Stop delivery and release the platform registration. Idempotent.
    pub fn cancel(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        self.provider.stop_updates(self.id);
        debug!(watch_id = self.id, "Position watch cancelled");
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
