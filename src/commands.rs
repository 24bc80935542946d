//! Commands Module
//!
//! Host-facing calls. Results are flat, serializable records that the UI
//! layer renders directly; failures come back as `success: false` with an
//! error message instead of an `Err`.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::auth::SessionStore;
use crate::controller::SyncController;
use crate::geo::{format_timestamp, Coordinate};
use crate::geocode::{AddressResolver, ProxyAddressResolver};
use crate::AppState;

// Response types for the UI

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub access_token: String,
    pub has_refresh_token: bool,
}

#[derive(Debug, Serialize)]
pub struct UploadResult {
    pub success: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ElderLocationResult {
    pub success: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LocationStatus {
    pub state: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub last_uploaded_at: Option<String>,
    pub uploading: bool,
    pub last_error: Option<String>,
}

// Commands

/// Get the session the login flow stored
pub fn get_stored_session(state: &AppState) -> Option<SessionResponse> {
    debug!("Getting stored session");

    state.storage.load_session().map(|session| SessionResponse {
        access_token: session.access_token,
        has_refresh_token: session.refresh_token.is_some(),
    })
}

/// Locate now and upload through the mounted controller
pub async fn upload_current_location(controller: &SyncController) -> UploadResult {
    match controller.upload_now().await {
        Ok(coordinate) => {
            info!(%coordinate, "Manual location upload queued");
            UploadResult {
                success: true,
                latitude: Some(coordinate.latitude),
                longitude: Some(coordinate.longitude),
                error: None,
            }
        }
        Err(e) => {
            warn!("Manual location upload failed: {}", e);
            UploadResult {
                success: false,
                latitude: None,
                longitude: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Latest known position of an elder plus its address, for the family view
pub async fn fetch_elder_location(state: &AppState, elder_id: &str) -> ElderLocationResult {
    let Some(token) = state.storage.access_token() else {
        return ElderLocationResult::failure("Not signed in");
    };

    let coordinate: Coordinate = match state.api.latest_location(&token, elder_id).await {
        Ok(coordinate) => coordinate,
        Err(e) => {
            warn!(elder_id, "Failed to fetch elder location: {}", e);
            return ElderLocationResult::failure(&e.to_string());
        }
    };

    let resolver = ProxyAddressResolver::new(state.api.clone());
    let address = resolver.resolve(coordinate, &state.config.api.language).await;

    ElderLocationResult {
        success: true,
        latitude: Some(coordinate.latitude),
        longitude: Some(coordinate.longitude),
        address: Some(address),
        error: None,
    }
}

/// Render the controller's current view
pub fn location_status(controller: &SyncController) -> LocationStatus {
    let view = controller.snapshot();

    LocationStatus {
        state: controller.state().to_string(),
        latitude: view.coordinate().map(|c| c.latitude),
        longitude: view.coordinate().map(|c| c.longitude),
        address: view.address().map(str::to_string),
        last_uploaded_at: view.last_uploaded_at.as_ref().map(format_timestamp),
        uploading: view.uploads_in_flight > 0,
        last_error: view.last_upload_error,
    }
}

impl ElderLocationResult {
    fn failure(error: &str) -> Self {
        Self {
            success: false,
            latitude: None,
            longitude: None,
            address: None,
            error: Some(error.to_string()),
        }
    }
}
