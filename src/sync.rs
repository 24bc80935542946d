//! API Sync Module
//!
//! Handles HTTP communication with the Care Tracker backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::geo::Coordinate;

const UPLOAD_PATH: &str = "/api/location/upload/";
const REVERSE_GEOCODE_PATH: &str = "/api/reverse_geocode/";
const LATEST_LOCATION_PATH: &str = "/api/location/latest";

/// API client for the Care Tracker backend
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
    upload_timeout: Duration,
    geocode_timeout: Duration,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(
        base_url: &str,
        upload_timeout: Duration,
        geocode_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(upload_timeout.min(geocode_timeout))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            upload_timeout,
            geocode_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Upload one position sample. Any 2xx is success.
    pub async fn upload_location(
        &self,
        access_token: &str,
        coordinate: &Coordinate,
    ) -> Result<(), ApiError> {
        let url = format!("{}{}", self.base_url, UPLOAD_PATH);

        let response = self.client
            .post(&url)
            .header("Authorization", format!("Bearer {}", access_token))
            .json(&UploadRequest { lat: coordinate.latitude, lon: coordinate.longitude })
            .timeout(self.upload_timeout)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        if !response.status().is_success() {
            return Err(ApiError::from_response(response).await);
        }

        debug!(%coordinate, "Location uploaded");
        Ok(())
    }

    /// Ask the backend proxy for a human-readable address.
    ///
    /// `Ok(None)` means the proxy answered but had no address for the point.
    pub async fn reverse_geocode(
        &self,
        coordinate: &Coordinate,
        language: &str,
    ) -> Result<Option<String>, ApiError> {
        let url = format!("{}{}", self.base_url, REVERSE_GEOCODE_PATH);
        let query = ReverseGeocodeQuery {
            lat: coordinate.latitude,
            lng: coordinate.longitude,
            lang: language,
        };

        let response = self.client
            .get(&url)
            .query(&query)
            .timeout(self.geocode_timeout)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        if !response.status().is_success() {
            return Err(ApiError::from_response(response).await);
        }

        let data = response.json::<ReverseGeocodeResponse>().await
            .map_err(|e| ApiError::Parse(e.to_string()))?;

        Ok(data.address.filter(|a| !a.trim().is_empty()))
    }

    /// Latest uploaded position of an elder, for the family view
    pub async fn latest_location(
        &self,
        access_token: &str,
        elder_id: &str,
    ) -> Result<Coordinate, ApiError> {
        let url = format!("{}{}/{}/", self.base_url, LATEST_LOCATION_PATH, elder_id);

        let response = self.client
            .get(&url)
            .header("Authorization", format!("Bearer {}", access_token))
            .timeout(self.upload_timeout)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        if !response.status().is_success() {
            return Err(ApiError::from_response(response).await);
        }

        let data = response.json::<LatestLocationResponse>().await
            .map_err(|e| ApiError::Parse(e.to_string()))?;

        info!(elder_id, "Fetched latest elder location");
        Ok(Coordinate::new(data.latitude, data.longitude))
    }
}

// Request/Response types

#[derive(Serialize)]
struct UploadRequest {
    lat: f64,
    lon: f64,
}

#[derive(Serialize)]
struct ReverseGeocodeQuery<'a> {
    lat: f64,
    lng: f64,
    lang: &'a str,
}

#[derive(Debug, Deserialize)]
struct ReverseGeocodeResponse {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LatestLocationResponse {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: Option<String>,
    detail: Option<String>,
}

/// API errors
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Not signed in or session expired (401)")]
    Unauthorized,

    #[error("Account is not allowed to do this (403)")]
    Forbidden,

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl ApiError {
    fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Network(e.to_string())
        }
    }

    async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::Forbidden,
            code => {
                let message = response.json::<ErrorResponse>().await
                    .ok()
                    .and_then(|body| body.error.or(body.detail))
                    .unwrap_or_else(|| format!("Status: {}", status));
                ApiError::Server { status: code, message }
            }
        }
    }
}
