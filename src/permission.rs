//! Permission Module
//!
//! Requests and evaluates OS location permissions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Location permission kinds requested by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    Fine,
    Coarse,
    Background,
}

impl std::fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionKind::Fine => write!(f, "fine"),
            PermissionKind::Coarse => write!(f, "coarse"),
            PermissionKind::Background => write!(f, "background"),
        }
    }
}

/// Outcome of a single OS permission prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Denied,
    /// Denied and the OS will no longer show the prompt
    NeverAskAgain,
}

impl PermissionStatus {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionStatus::Granted)
    }
}

/// Snapshot of the three location permissions, derived fresh on every acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionState {
    pub fine: bool,
    pub coarse: bool,
    /// `None` when background access was not requested or not needed
    pub background: Option<bool>,
}

impl PermissionState {
    /// True iff fine and coarse are granted and background is not denied
    pub fn is_sufficient(&self) -> bool {
        self.fine && self.coarse && self.background.unwrap_or(true)
    }
}

/// Platform permission API
#[async_trait]
pub trait PermissionPlatform: Send + Sync {
    /// Show (or silently resolve) the OS prompt for `kind`
    async fn request(&self, kind: PermissionKind) -> PermissionStatus;

    /// Whether background location is a separate grant on this OS version
    fn requires_background_grant(&self) -> bool;
}

/// Drives the permission prompts in a fixed order: fine, coarse, then background
pub struct PermissionGate<P: ?Sized> {
    platform: std::sync::Arc<P>,
}

impl<P: PermissionPlatform + ?Sized> PermissionGate<P> {
    pub fn new(platform: std::sync::Arc<P>) -> Self {
        Self { platform }
    }

    /// Request every permission the tracker needs and report the combined state.
    ///
    /// All prompts are shown even after a denial so the host sees one consistent pass.
    pub async fn evaluate(&self, require_background: bool) -> PermissionState {
        let fine = self.platform.request(PermissionKind::Fine).await;
        let coarse = self.platform.request(PermissionKind::Coarse).await;

        let background = if require_background && self.platform.requires_background_grant() {
            let status = self.platform.request(PermissionKind::Background).await;
            Some(status.is_granted())
        } else {
            None
        };

        for (kind, status) in [(PermissionKind::Fine, fine), (PermissionKind::Coarse, coarse)] {
            if status == PermissionStatus::NeverAskAgain {
                warn!(%kind, "Location permission permanently denied");
            }
        }

        let state = PermissionState {
            fine: fine.is_granted(),
            coarse: coarse.is_granted(),
            background,
        };
        debug!(?state, "Location permissions evaluated");
        state
    }

    /// Returns true iff fine AND coarse AND (background not required OR background granted)
    pub async fn acquire(&self, require_background: bool) -> bool {
        let granted = self.evaluate(require_background).await.is_sufficient();
        if granted {
            info!("Location permissions granted");
        } else {
            warn!("Location permissions denied");
        }
        granted
    }
}
