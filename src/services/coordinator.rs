//! Dimension coordinator — single authority for reconciling world,
//! background, and effective dimensions.
//!
//! DESIGN
//! ======
//! The coordinator owns the per-room `DimensionCache`, the runtime source
//! of truth consulted before trusting a snapshot's own dimensions. Every
//! accepted change runs the dimension policy, updates the cache, and
//! notifies subscribers with the full reconciled state.
//!
//! Dimension updates can trigger listeners that request further updates. A
//! reentrancy flag is held for the duration of each update; a nested
//! request fails with `CircularUpdate` instead of recursing.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::dimensions::{self, Dimensions, MAX_BACKGROUND_DIMENSIONS, MAX_WORLD_DIMENSIONS};
use crate::snapshot::{MapSnapshot, now_ms};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DimensionError {
    #[error("invalid dimensions: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("circular dimension update prevented (requested by {0})")]
    CircularUpdate(String),
}

/// Per-room runtime dimension state. Never persisted directly; dimensions
/// persist only as part of the map snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionCache {
    pub world: Dimensions,
    pub background: Option<Dimensions>,
    /// Background size when present, else world size.
    pub effective: Dimensions,
    pub last_updated: i64,
    /// Tag naming the caller of the last accepted change.
    pub source: String,
}

impl DimensionCache {
    #[must_use]
    pub fn new(world: Dimensions) -> Self {
        Self { world, background: None, effective: world, last_updated: now_ms(), source: "init".to_owned() }
    }

    fn reconcile(&mut self, source: &str) {
        self.effective = self.background.unwrap_or(self.world);
        self.last_updated = now_ms();
        self.source = source.to_owned();
    }
}

type DimensionListener = Box<dyn Fn(&DimensionCache) + Send + Sync>;

// =============================================================================
// COORDINATOR
// =============================================================================

pub struct DimensionCoordinator {
    cache: Mutex<DimensionCache>,
    listeners: Mutex<Vec<DimensionListener>>,
    in_flight: AtomicBool,
}

impl DimensionCoordinator {
    #[must_use]
    pub fn new(world: Dimensions) -> Self {
        Self {
            cache: Mutex::new(DimensionCache::new(world)),
            listeners: Mutex::new(Vec::new()),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Current reconciled state.
    #[must_use]
    pub fn cache(&self) -> DimensionCache {
        self.cache.lock().expect("dimension cache poisoned").clone()
    }

    #[must_use]
    pub fn effective(&self) -> Dimensions {
        self.cache().effective
    }

    /// Register a synchronous listener. Listeners receive the full
    /// reconciled cache after every accepted change; an update requested
    /// from inside a listener is rejected as circular.
    pub fn subscribe(&self, listener: impl Fn(&DimensionCache) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("dimension listeners poisoned")
            .push(Box::new(listener));
    }

    /// Update the world dimensions. Unless `sync_background` is off, the
    /// background dimensions follow the world so the two stay synchronized
    /// until a real background image says otherwise.
    ///
    /// # Errors
    ///
    /// `Invalid` if the policy rejects the pair; `CircularUpdate` if called
    /// while another update is in flight.
    pub fn update_world(
        &self,
        dims: Dimensions,
        source: &str,
        sync_background: bool,
    ) -> Result<DimensionCache, DimensionError> {
        let _guard = self.acquire(source)?;

        let check = dimensions::validate(dims, MAX_WORLD_DIMENSIONS);
        if !check.is_valid {
            return Err(DimensionError::Invalid(check.errors));
        }
        for warning in &check.warnings {
            warn!(source, "{warning}");
        }

        let updated = {
            let mut cache = self.cache.lock().expect("dimension cache poisoned");
            cache.world = check.dims;
            if sync_background {
                cache.background = Some(check.dims);
            }
            cache.reconcile(source);
            cache.clone()
        };
        debug!(source, width = updated.world.width, height = updated.world.height, "world dimensions updated");

        self.notify(&updated);
        Ok(updated)
    }

    /// Update the background image dimensions. Validated against the raw
    /// background maximum, then world-clamped with the shared scaling
    /// helper. Never touches the world dimensions.
    ///
    /// # Errors
    ///
    /// `Invalid` if the policy rejects the pair; `CircularUpdate` if called
    /// while another update is in flight.
    pub fn update_background(
        &self,
        dims: Dimensions,
        source: &str,
    ) -> Result<DimensionCache, DimensionError> {
        let _guard = self.acquire(source)?;

        let check = dimensions::validate(dims, MAX_BACKGROUND_DIMENSIONS);
        if !check.is_valid {
            return Err(DimensionError::Invalid(check.errors));
        }
        for warning in &check.warnings {
            warn!(source, "{warning}");
        }
        let (clamped, clamped_to_world) = dimensions::scale_to_fit(check.dims, MAX_WORLD_DIMENSIONS);
        if clamped_to_world {
            warn!(
                source,
                width = clamped.width,
                height = clamped.height,
                "background dimensions clamped to world maximum"
            );
        }

        let updated = {
            let mut cache = self.cache.lock().expect("dimension cache poisoned");
            cache.background = Some(clamped);
            cache.reconcile(source);
            cache.clone()
        };

        self.notify(&updated);
        Ok(updated)
    }

    /// Drop the background dimensions; effective falls back to world.
    ///
    /// # Errors
    ///
    /// `CircularUpdate` if called while another update is in flight.
    pub fn clear_background(&self, source: &str) -> Result<DimensionCache, DimensionError> {
        let _guard = self.acquire(source)?;

        let updated = {
            let mut cache = self.cache.lock().expect("dimension cache poisoned");
            cache.background = None;
            cache.reconcile(source);
            cache.clone()
        };

        self.notify(&updated);
        Ok(updated)
    }

    /// Adopt a snapshot's dimensions wholesale (load and remote-apply
    /// paths). The snapshot is authoritative here, so the policy is not
    /// re-run.
    ///
    /// # Errors
    ///
    /// `CircularUpdate` if called while another update is in flight.
    pub fn absorb(&self, snapshot: &MapSnapshot, source: &str) -> Result<DimensionCache, DimensionError> {
        let _guard = self.acquire(source)?;

        let updated = {
            let mut cache = self.cache.lock().expect("dimension cache poisoned");
            cache.world = snapshot.world_dimensions;
            cache.background = snapshot.background_image_dimensions;
            cache.reconcile(source);
            cache.clone()
        };

        self.notify(&updated);
        Ok(updated)
    }

    fn acquire(&self, source: &str) -> Result<InFlightGuard<'_>, DimensionError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(DimensionError::CircularUpdate(source.to_owned()));
        }
        Ok(InFlightGuard(&self.in_flight))
    }

    fn notify(&self, cache: &DimensionCache) {
        let listeners = self.listeners.lock().expect("dimension listeners poisoned");
        for listener in listeners.iter() {
            listener(cache);
        }
    }
}

/// Clears the reentrancy flag when the update finishes, error paths
/// included.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[path = "coordinator_test.rs"]
mod tests;
