//! Geocode Module
//!
//! Best-effort reverse geocoding through the backend proxy, which keeps the
//! geocoding credential server-side. Failures never escape this module.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::geo::Coordinate;
use crate::sync::ApiClient;

/// Shown when no address could be resolved
pub const ADDRESS_UNAVAILABLE: &str = "address unavailable";

/// Coordinate to display address
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Resolved address, or [`ADDRESS_UNAVAILABLE`]
    async fn resolve(&self, coordinate: Coordinate, language: &str) -> String;
}

pub struct ProxyAddressResolver {
    api: Arc<ApiClient>,
}

impl ProxyAddressResolver {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl AddressResolver for ProxyAddressResolver {
    async fn resolve(&self, coordinate: Coordinate, language: &str) -> String {
        match self.api.reverse_geocode(&coordinate, language).await {
            Ok(Some(address)) => {
                debug!(%coordinate, "Address resolved");
                address
            }
            Ok(None) => {
                debug!(%coordinate, "Proxy returned no address");
                ADDRESS_UNAVAILABLE.to_string()
            }
            Err(e) => {
                warn!(%coordinate, "Reverse geocode failed: {}", e);
                ADDRESS_UNAVAILABLE.to_string()
            }
        }
    }
}
