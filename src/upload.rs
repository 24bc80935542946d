//! Upload Module
//!
//! Authenticated, best-effort delivery of position samples. A failed sample
//! is logged and dropped; nothing is queued for retry.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::auth::SessionStore;
use crate::geo::Coordinate;
use crate::sync::{ApiClient, ApiError};

/// Result of one delivery attempt
#[derive(Debug)]
pub enum UploadOutcome {
    Delivered,
    /// No session token; nothing was sent
    Skipped,
    Failed(ApiError),
}

impl UploadOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, UploadOutcome::Delivered)
    }
}

/// Delivery of a sample to the backend
#[async_trait]
pub trait UploadClient: Send + Sync {
    async fn post_sample(&self, coordinate: Coordinate) -> UploadOutcome;
}

/// Bearer-token upload over [`ApiClient`]
pub struct HttpUploadClient {
    api: Arc<ApiClient>,
    sessions: Arc<dyn SessionStore>,
}

impl HttpUploadClient {
    pub fn new(api: Arc<ApiClient>, sessions: Arc<dyn SessionStore>) -> Self {
        Self { api, sessions }
    }
}

#[async_trait]
impl UploadClient for HttpUploadClient {
    async fn post_sample(&self, coordinate: Coordinate) -> UploadOutcome {
        let Some(token) = self.sessions.access_token() else {
            debug!("No access token, upload skipped");
            return UploadOutcome::Skipped;
        };

        match self.api.upload_location(&token, &coordinate).await {
            Ok(()) => UploadOutcome::Delivered,
            Err(e) => {
                warn!(%coordinate, "Location upload failed, sample dropped: {}", e);
                UploadOutcome::Failed(e)
            }
        }
    }
}
