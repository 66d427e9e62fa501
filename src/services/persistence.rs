//! Persistence gateway — load/save map snapshots against the backing store.
//!
//! DESIGN
//! ======
//! The store is a remote HTTP API keyed by room. `MapStore` is the seam:
//! production uses `HttpMapStore`, tests inject mocks. Snapshots are
//! structurally validated before a save transmits, so an invalid snapshot
//! never costs a network round-trip; loaded snapshots are normalized with
//! the same dimension-scaling helpers the editor-side policy uses, so both
//! surfaces agree on the final size.
//!
//! ERROR HANDLING
//! ==============
//! Every failure is a `PersistenceError` returned to the caller; nothing
//! here retries or mutates service state. A failed load is expected to be
//! answered by the caller with a fresh default snapshot.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::dimensions::{DEFAULT_WORLD_DIMENSIONS, MAX_WORLD_DIMENSIONS, scale_to_fit};
use crate::snapshot::{AreaShape, MapSnapshot};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("invalid snapshot: {}", .0.join("; "))]
    InvalidSnapshot(Vec<String>),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("store rejected save: {0}")]
    Rejected(String),
    #[error("store call timed out after {0}ms")]
    Timeout(u64),
}

/// Seam between the sync service and the backing store.
#[async_trait]
pub trait MapStore: Send + Sync {
    /// Fetch the authoritative snapshot for a room.
    async fn load_map(&self, room_id: Uuid) -> Result<MapSnapshot, PersistenceError>;

    /// Persist a snapshot; returns the version the store accepted.
    async fn save_map(&self, room_id: Uuid, snapshot: &MapSnapshot) -> Result<i64, PersistenceError>;
}

/// Save response envelope from the backing API.
#[derive(Debug, Deserialize)]
struct SaveResponse {
    success: bool,
    version: Option<i64>,
    error: Option<String>,
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Structural validation run before any save transmits.
///
/// # Errors
///
/// Returns `InvalidSnapshot` listing every violation found.
pub fn validate_snapshot(snapshot: &MapSnapshot) -> Result<(), PersistenceError> {
    let mut errors = Vec::new();

    if !snapshot.world_dimensions.is_positive() {
        errors.push(format!(
            "world dimensions must be positive (got {}x{})",
            snapshot.world_dimensions.width, snapshot.world_dimensions.height
        ));
    }
    if snapshot.version < 0 {
        errors.push(format!("version must be non-negative (got {})", snapshot.version));
    }

    check_unique(&mut errors, "interactive area", snapshot.interactive_areas.iter().map(|a| a.id));
    check_unique(&mut errors, "impassable area", snapshot.impassable_areas.iter().map(|a| a.id));
    check_unique(&mut errors, "asset", snapshot.assets.iter().map(|a| a.id));
    check_unique(&mut errors, "layer", snapshot.layers.iter().map(|l| l.id));

    let polygons = snapshot
        .interactive_areas
        .iter()
        .map(|a| (a.id, &a.shape))
        .chain(snapshot.impassable_areas.iter().map(|a| (a.id, &a.shape)));
    for (id, shape) in polygons {
        if let AreaShape::Polygon { points, .. } = shape {
            if points.len() < 3 {
                errors.push(format!("polygon area {id} has fewer than 3 points"));
            }
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(PersistenceError::InvalidSnapshot(errors)) }
}

fn check_unique(errors: &mut Vec<String>, label: &str, ids: impl Iterator<Item = Uuid>) {
    let mut seen = std::collections::HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            errors.push(format!("duplicate {label} id: {id}"));
        }
    }
}

/// Normalization applied to every loaded snapshot: derived polygon bounds
/// recomputed, background world-clamped with the shared scaling algorithm,
/// unusable world dimensions replaced with the default.
pub fn normalize_loaded(snapshot: &mut MapSnapshot) {
    if !snapshot.world_dimensions.is_positive() {
        snapshot.world_dimensions = DEFAULT_WORLD_DIMENSIONS;
    }
    if let Some(background) = snapshot.background_image_dimensions {
        let (clamped, scaled) = scale_to_fit(background, MAX_WORLD_DIMENSIONS);
        if scaled {
            snapshot.background_image_dimensions = Some(clamped);
        }
    }
    snapshot.normalize();
}

// =============================================================================
// HTTP STORE
// =============================================================================

/// Backing store over the room map API:
/// `GET/PUT {base}/api/rooms/{room_id}/map`.
pub struct HttpMapStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMapStore {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.trim_end_matches('/').to_owned() }
    }

    fn map_url(&self, room_id: Uuid) -> String {
        format!("{}/api/rooms/{room_id}/map", self.base_url)
    }
}

#[async_trait]
impl MapStore for HttpMapStore {
    async fn load_map(&self, room_id: Uuid) -> Result<MapSnapshot, PersistenceError> {
        let response = self
            .client
            .get(self.map_url(room_id))
            .send()
            .await?
            .error_for_status()?;
        let mut snapshot: MapSnapshot = response.json().await?;
        normalize_loaded(&mut snapshot);
        debug!(%room_id, version = snapshot.version, "map loaded from store");
        Ok(snapshot)
    }

    async fn save_map(&self, room_id: Uuid, snapshot: &MapSnapshot) -> Result<i64, PersistenceError> {
        validate_snapshot(snapshot)?;

        let response = self
            .client
            .put(self.map_url(room_id))
            .json(snapshot)
            .send()
            .await?
            .error_for_status()?;
        let envelope: SaveResponse = response.json().await?;

        if !envelope.success {
            return Err(PersistenceError::Rejected(
                envelope.error.unwrap_or_else(|| "unspecified store error".to_owned()),
            ));
        }
        envelope
            .version
            .ok_or_else(|| PersistenceError::Rejected("store did not return a version".to_owned()))
    }
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
