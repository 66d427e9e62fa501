//! Map state service — the single entry point for reading and mutating a
//! room's map.
//!
//! DESIGN
//! ======
//! The service owns the live `MapSnapshot`, the change ledger, and the
//! save scheduling state behind one async mutex. Collaborators never touch
//! the snapshot directly: mutations go through the operations here, reads
//! get clones, and reactions ride the event bus.
//!
//! LIFECYCLE
//! =========
//! `Uninitialized -> Loading -> Ready -> Stopped`. `initialize` joins the
//! realtime room, loads the authoritative snapshot (falling back to a
//! fresh default when the store cannot answer), absorbs its dimensions
//! into the coordinator, and starts the remote-update pump. Every mutation
//! requires `Ready`.
//!
//! SAVE PIPELINE
//! =============
//! Mutations mark the state dirty and arm a debounced save; further edits
//! re-arm it, so a burst of edits costs one write. At most one save is in
//! flight at a time: a debounced save yields when one is running, a forced
//! save queues behind it. The candidate bumps the version and is validated
//! before transmitting; on success the service adopts the store's version,
//! emits `Saved`, and broadcasts the snapshot to the room. On failure the
//! local snapshot is untouched and the dirty flag survives, so the next
//! edit or explicit save retries.
//!
//! CONFLICTS
//! =========
//! Last-writer-wins. A remote snapshot replaces local state wholesale and
//! is never re-saved or re-broadcast, which keeps two peers from ping-
//! ponging the same update forever.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::dimensions::Dimensions;
use crate::events::{ChangeSource, EventBus, MapEvent};
use crate::ledger::{ChangeKind, ChangeLedger, ChangeRecord, ChangeSubject};
use crate::services::areas::{self, AreaError, ImpassableAreaPatch, InteractiveAreaPatch};
use crate::services::coordinator::{DimensionCoordinator, DimensionError};
use crate::services::persistence::{
    MapStore, PersistenceError, normalize_loaded, validate_snapshot,
};
use crate::services::realtime::{RealtimeChannel, RemoteUpdate};
use crate::snapshot::{
    ImpassableArea, InteractiveArea, MapLayer, MapMetadata, MapSnapshot, PlacedAsset, now_ms,
};

const ACTOR_LOCAL: &str = "local";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MapServiceError {
    #[error("service not ready (phase: {0:?})")]
    NotReady(ServicePhase),
    #[error("service already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Dimensions(#[from] DimensionError),
    #[error(transparent)]
    Area(#[from] AreaError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("asset not found: {0}")]
    AssetNotFound(Uuid),
    #[error("duplicate asset id: {0}")]
    DuplicateAssetId(Uuid),
    #[error("layer not found: {0}")]
    LayerNotFound(Uuid),
    #[error("nothing to undo")]
    NothingToUndo,
    #[error("cannot revert change record: {0}")]
    Undo(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePhase {
    Uninitialized,
    Loading,
    Ready,
    Stopped,
}

/// Partial update for a placed asset. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct AssetPatch {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub scale: Option<f64>,
    pub rotation: Option<f64>,
    pub source: Option<String>,
}

/// Dimension fields captured around a dimension change so the ledger can
/// revert them as one unit.
#[derive(Debug, Serialize, Deserialize)]
struct DimensionRecord {
    world: Dimensions,
    background_image: Option<String>,
    background: Option<Dimensions>,
}

impl DimensionRecord {
    fn of(snapshot: &MapSnapshot) -> Self {
        Self {
            world: snapshot.world_dimensions,
            background_image: snapshot.background_image.clone(),
            background: snapshot.background_image_dimensions,
        }
    }

    fn apply(self, snapshot: &mut MapSnapshot) {
        snapshot.world_dimensions = self.world;
        snapshot.background_image = self.background_image;
        snapshot.background_image_dimensions = self.background;
    }
}

struct ServiceState {
    phase: ServicePhase,
    room_id: Option<Uuid>,
    snapshot: MapSnapshot,
    ledger: ChangeLedger,
    dirty: bool,
    /// Bumped on every local edit; a finishing save clears `dirty` only if
    /// no edit landed while it was in flight.
    edit_seq: u64,
    pending_save: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    save_error: Option<String>,
    last_save_time: Option<i64>,
}

struct Inner {
    state: Mutex<ServiceState>,
    /// Held for the duration of a store round-trip. Forced saves wait for
    /// it; debounced saves yield when it is taken.
    save_gate: Mutex<()>,
    coordinator: Arc<DimensionCoordinator>,
    store: Arc<dyn MapStore>,
    channel: RealtimeChannel,
    events: EventBus,
    config: SyncConfig,
}

/// Handle to the shared service. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MapStateService {
    inner: Arc<Inner>,
}

// =============================================================================
// CONSTRUCTION AND LIFECYCLE
// =============================================================================

impl MapStateService {
    #[must_use]
    pub fn new(
        store: Arc<dyn MapStore>,
        channel: RealtimeChannel,
        coordinator: Arc<DimensionCoordinator>,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                save_gate: Mutex::new(()),
                state: Mutex::new(ServiceState {
                    phase: ServicePhase::Uninitialized,
                    room_id: None,
                    snapshot: MapSnapshot::new_default(),
                    ledger: ChangeLedger::new(config.ledger_capacity),
                    dirty: false,
                    edit_seq: 0,
                    pending_save: None,
                    pump: None,
                    save_error: None,
                    last_save_time: None,
                }),
                coordinator,
                store,
                channel,
                events: EventBus::new(),
                config,
            }),
        }
    }

    /// Join the room, load its map, and start applying remote updates.
    /// A store that cannot answer yields a fresh default snapshot rather
    /// than a failed initialization.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInitialized` when called more than once.
    pub async fn initialize(
        &self,
        room_id: Uuid,
        mut updates_rx: mpsc::Receiver<RemoteUpdate>,
    ) -> Result<(), MapServiceError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.phase != ServicePhase::Uninitialized {
                return Err(MapServiceError::AlreadyInitialized);
            }
            state.phase = ServicePhase::Loading;
            state.room_id = Some(room_id);
        }

        // Realtime is best-effort: a dead channel must not block editing.
        if let Err(e) = self.inner.channel.join(room_id).await {
            warn!(%room_id, error = %e, "realtime join failed; continuing without live sync");
        }

        let io = Duration::from_millis(self.inner.config.io_timeout_ms);
        let snapshot = match timeout(io, self.inner.store.load_map(room_id)).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!(%room_id, error = %e, "map load failed; starting from default snapshot");
                MapSnapshot::new_default()
            }
            Err(_) => {
                warn!(%room_id, "map load timed out; starting from default snapshot");
                MapSnapshot::new_default()
            }
        };

        if let Err(e) = self.inner.coordinator.absorb(&snapshot, "load") {
            warn!(%room_id, error = %e, "could not absorb loaded dimensions");
        }

        let pump = {
            let service = self.clone();
            tokio::spawn(async move {
                while let Some(update) = updates_rx.recv().await {
                    service.apply_remote_update(update).await;
                }
            })
        };

        {
            let mut state = self.inner.state.lock().await;
            state.snapshot = snapshot.clone();
            state.pump = Some(pump);
            state.phase = ServicePhase::Ready;
        }

        info!(%room_id, version = snapshot.version, "map state ready");
        self.inner.events.emit(MapEvent::Loaded { snapshot });
        Ok(())
    }

    /// Flush unsaved work and stop background tasks. Safe to call once;
    /// the service is unusable afterwards.
    pub async fn shutdown(&self) {
        let dirty = {
            let mut state = self.inner.state.lock().await;
            if let Some(pending) = state.pending_save.take() {
                pending.abort();
            }
            state.dirty
        };

        if dirty {
            if let Err(e) = self.save(true).await {
                warn!(error = %e, "final save on shutdown failed");
            }
        }

        {
            let mut state = self.inner.state.lock().await;
            state.phase = ServicePhase::Stopped;
            // The flush may have re-armed the timer for mid-flight edits.
            if let Some(pending) = state.pending_save.take() {
                pending.abort();
            }
            if let Some(pump) = state.pump.take() {
                pump.abort();
            }
        }
        self.inner.channel.shutdown().await;
        info!("map state service stopped");
    }

    async fn lock_ready(&self) -> Result<MutexGuard<'_, ServiceState>, MapServiceError> {
        let state = self.inner.state.lock().await;
        if state.phase == ServicePhase::Ready {
            Ok(state)
        } else {
            Err(MapServiceError::NotReady(state.phase))
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    pub async fn snapshot(&self) -> MapSnapshot {
        self.inner.state.lock().await.snapshot.clone()
    }

    pub async fn phase(&self) -> ServicePhase {
        self.inner.state.lock().await.phase
    }

    pub async fn room_id(&self) -> Option<Uuid> {
        self.inner.state.lock().await.room_id
    }

    #[must_use]
    pub fn effective_dimensions(&self) -> Dimensions {
        self.inner.coordinator.effective()
    }

    pub async fn last_save_time(&self) -> Option<i64> {
        self.inner.state.lock().await.last_save_time
    }

    pub async fn save_error(&self) -> Option<String> {
        self.inner.state.lock().await.save_error.clone()
    }

    /// The most recent `n` change records, oldest first.
    pub async fn history(&self, n: usize) -> Vec<ChangeRecord> {
        self.inner.state.lock().await.ledger.recent(n)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MapEvent> {
        self.inner.events.subscribe()
    }

    // =========================================================================
    // AREA OPERATIONS
    // =========================================================================

    /// Add an interactive area.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `Area` on a duplicate id.
    pub async fn add_interactive_area(
        &self,
        area: InteractiveArea,
    ) -> Result<InteractiveArea, MapServiceError> {
        let mut guard = self.lock_ready().await?;
        let state = &mut *guard;
        let added = areas::add_interactive(&mut state.snapshot, &mut state.ledger, area, ACTOR_LOCAL)?;
        self.after_edit(&mut guard, Some(MapEvent::ElementAdded {
            subject: ChangeSubject::Area,
            id: added.id,
        }));
        Ok(added)
    }

    /// Merge patch fields into an interactive area.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `Area` when the id is unknown.
    pub async fn update_interactive_area(
        &self,
        id: Uuid,
        patch: InteractiveAreaPatch,
    ) -> Result<InteractiveArea, MapServiceError> {
        let mut guard = self.lock_ready().await?;
        let state = &mut *guard;
        let updated =
            areas::update_interactive(&mut state.snapshot, &mut state.ledger, id, patch, ACTOR_LOCAL)?;
        self.after_edit(&mut guard, None);
        Ok(updated)
    }

    /// Remove an interactive area.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `Area` when the id is unknown.
    pub async fn remove_interactive_area(
        &self,
        id: Uuid,
    ) -> Result<InteractiveArea, MapServiceError> {
        let mut guard = self.lock_ready().await?;
        let state = &mut *guard;
        let removed = areas::remove_interactive(&mut state.snapshot, &mut state.ledger, id, ACTOR_LOCAL)?;
        self.after_edit(&mut guard, Some(MapEvent::ElementRemoved {
            subject: ChangeSubject::Area,
            id,
        }));
        Ok(removed)
    }

    /// Add an impassable area.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `Area` on a duplicate id.
    pub async fn add_impassable_area(
        &self,
        area: ImpassableArea,
    ) -> Result<ImpassableArea, MapServiceError> {
        let mut guard = self.lock_ready().await?;
        let state = &mut *guard;
        let added = areas::add_impassable(&mut state.snapshot, &mut state.ledger, area, ACTOR_LOCAL)?;
        self.after_edit(&mut guard, Some(MapEvent::ElementAdded {
            subject: ChangeSubject::CollisionArea,
            id: added.id,
        }));
        Ok(added)
    }

    /// Merge patch fields into an impassable area.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `Area` when the id is unknown.
    pub async fn update_impassable_area(
        &self,
        id: Uuid,
        patch: ImpassableAreaPatch,
    ) -> Result<ImpassableArea, MapServiceError> {
        let mut guard = self.lock_ready().await?;
        let state = &mut *guard;
        let updated =
            areas::update_impassable(&mut state.snapshot, &mut state.ledger, id, patch, ACTOR_LOCAL)?;
        self.after_edit(&mut guard, None);
        Ok(updated)
    }

    /// Remove an impassable area.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `Area` when the id is unknown.
    pub async fn remove_impassable_area(
        &self,
        id: Uuid,
    ) -> Result<ImpassableArea, MapServiceError> {
        let mut guard = self.lock_ready().await?;
        let state = &mut *guard;
        let removed = areas::remove_impassable(&mut state.snapshot, &mut state.ledger, id, ACTOR_LOCAL)?;
        self.after_edit(&mut guard, Some(MapEvent::ElementRemoved {
            subject: ChangeSubject::CollisionArea,
            id,
        }));
        Ok(removed)
    }

    // =========================================================================
    // ASSET AND LAYER OPERATIONS
    // =========================================================================

    /// Place an asset on the map.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `DuplicateAssetId`.
    pub async fn add_asset(&self, asset: PlacedAsset) -> Result<PlacedAsset, MapServiceError> {
        let mut guard = self.lock_ready().await?;
        if guard.snapshot.assets.iter().any(|a| a.id == asset.id) {
            return Err(MapServiceError::DuplicateAssetId(asset.id));
        }
        guard.ledger.record(ChangeRecord::new(
            ChangeKind::Add,
            ChangeSubject::Asset,
            None,
            to_value(&asset),
            ACTOR_LOCAL,
        ));
        guard.snapshot.assets.push(asset.clone());
        self.after_edit(&mut guard, Some(MapEvent::ElementAdded {
            subject: ChangeSubject::Asset,
            id: asset.id,
        }));
        Ok(asset)
    }

    /// Merge patch fields into a placed asset.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `AssetNotFound`.
    pub async fn update_asset(
        &self,
        id: Uuid,
        patch: AssetPatch,
    ) -> Result<PlacedAsset, MapServiceError> {
        let mut guard = self.lock_ready().await?;
        let asset = guard
            .snapshot
            .assets
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(MapServiceError::AssetNotFound(id))?;
        let before = to_value(&*asset);

        if let Some(x) = patch.x {
            asset.x = x;
        }
        if let Some(y) = patch.y {
            asset.y = y;
        }
        if let Some(scale) = patch.scale {
            asset.scale = scale;
        }
        if let Some(rotation) = patch.rotation {
            asset.rotation = rotation;
        }
        if let Some(source) = patch.source {
            asset.source = source;
        }

        let updated = asset.clone();
        guard.ledger.record(ChangeRecord::new(
            ChangeKind::Update,
            ChangeSubject::Asset,
            before,
            to_value(&updated),
            ACTOR_LOCAL,
        ));
        self.after_edit(&mut guard, None);
        Ok(updated)
    }

    /// Remove an asset; layer membership is dropped with it.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `AssetNotFound`.
    pub async fn remove_asset(&self, id: Uuid) -> Result<PlacedAsset, MapServiceError> {
        let mut guard = self.lock_ready().await?;
        let index = guard
            .snapshot
            .assets
            .iter()
            .position(|a| a.id == id)
            .ok_or(MapServiceError::AssetNotFound(id))?;
        let removed = guard.snapshot.assets.remove(index);
        for layer in &mut guard.snapshot.layers {
            layer.asset_ids.retain(|&asset_id| asset_id != id);
        }

        guard.ledger.record(ChangeRecord::new(
            ChangeKind::Remove,
            ChangeSubject::Asset,
            to_value(&removed),
            None,
            ACTOR_LOCAL,
        ));
        self.after_edit(&mut guard, Some(MapEvent::ElementRemoved {
            subject: ChangeSubject::Asset,
            id,
        }));
        Ok(removed)
    }

    /// Create an empty layer.
    ///
    /// # Errors
    ///
    /// `NotReady`.
    pub async fn add_layer(&self, name: &str) -> Result<MapLayer, MapServiceError> {
        let mut guard = self.lock_ready().await?;
        let layer = MapLayer { id: Uuid::new_v4(), name: name.to_owned(), asset_ids: Vec::new() };
        guard.ledger.record(ChangeRecord::new(
            ChangeKind::Add,
            ChangeSubject::Layer,
            None,
            to_value(&layer),
            ACTOR_LOCAL,
        ));
        guard.snapshot.layers.push(layer.clone());
        self.after_edit(&mut guard, Some(MapEvent::ElementAdded {
            subject: ChangeSubject::Layer,
            id: layer.id,
        }));
        Ok(layer)
    }

    /// Remove a layer. Its assets stay on the map, just ungrouped.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `LayerNotFound`.
    pub async fn remove_layer(&self, id: Uuid) -> Result<MapLayer, MapServiceError> {
        let mut guard = self.lock_ready().await?;
        let index = guard
            .snapshot
            .layers
            .iter()
            .position(|l| l.id == id)
            .ok_or(MapServiceError::LayerNotFound(id))?;
        let removed = guard.snapshot.layers.remove(index);

        guard.ledger.record(ChangeRecord::new(
            ChangeKind::Remove,
            ChangeSubject::Layer,
            to_value(&removed),
            None,
            ACTOR_LOCAL,
        ));
        self.after_edit(&mut guard, Some(MapEvent::ElementRemoved {
            subject: ChangeSubject::Layer,
            id,
        }));
        Ok(removed)
    }

    // =========================================================================
    // DIMENSION AND METADATA OPERATIONS
    // =========================================================================

    /// Resize the world. Background dimensions follow along unless a real
    /// background image owns them.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `Dimensions` when the policy rejects the size.
    pub async fn update_world_dimensions(
        &self,
        dims: Dimensions,
    ) -> Result<Dimensions, MapServiceError> {
        let mut guard = self.lock_ready().await?;
        let before = to_value(&DimensionRecord::of(&guard.snapshot));

        let sync_background = guard.snapshot.background_image.is_none();
        let cache = self.inner.coordinator.update_world(dims, ACTOR_LOCAL, sync_background)?;

        guard.snapshot.world_dimensions = cache.world;
        if sync_background {
            guard.snapshot.background_image_dimensions = cache.background;
        }
        let after = to_value(&DimensionRecord::of(&guard.snapshot));
        guard.ledger.record(ChangeRecord::new(
            ChangeKind::Update,
            ChangeSubject::Dimensions,
            before,
            after,
            ACTOR_LOCAL,
        ));

        self.after_edit(&mut guard, Some(MapEvent::DimensionsChanged { cache: cache.clone() }));
        Ok(cache.world)
    }

    /// Install a background image. Its dimensions are policy-checked and
    /// world-clamped; the world is then resized to match, so the canvas and
    /// the image agree.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `Dimensions` when the policy rejects the size.
    pub async fn set_background_image(
        &self,
        url: &str,
        dims: Dimensions,
    ) -> Result<Dimensions, MapServiceError> {
        let mut guard = self.lock_ready().await?;
        let before = to_value(&DimensionRecord::of(&guard.snapshot));

        let cache = self.inner.coordinator.update_background(dims, ACTOR_LOCAL)?;
        let clamped = cache.effective;
        let cache = self.inner.coordinator.update_world(clamped, ACTOR_LOCAL, true)?;

        guard.snapshot.background_image = Some(url.to_owned());
        guard.snapshot.background_image_dimensions = Some(clamped);
        guard.snapshot.world_dimensions = clamped;
        let after = to_value(&DimensionRecord::of(&guard.snapshot));
        guard.ledger.record(ChangeRecord::new(
            ChangeKind::Update,
            ChangeSubject::Dimensions,
            before,
            after,
            ACTOR_LOCAL,
        ));

        self.after_edit(&mut guard, Some(MapEvent::DimensionsChanged { cache }));
        Ok(clamped)
    }

    /// Remove the background image; effective dimensions fall back to the
    /// declared world size.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `Dimensions` on a circular update.
    pub async fn clear_background_image(&self) -> Result<(), MapServiceError> {
        let mut guard = self.lock_ready().await?;
        let before = to_value(&DimensionRecord::of(&guard.snapshot));

        let cache = self.inner.coordinator.clear_background(ACTOR_LOCAL)?;

        guard.snapshot.background_image = None;
        guard.snapshot.background_image_dimensions = None;
        let after = to_value(&DimensionRecord::of(&guard.snapshot));
        guard.ledger.record(ChangeRecord::new(
            ChangeKind::Update,
            ChangeSubject::Dimensions,
            before,
            after,
            ACTOR_LOCAL,
        ));

        self.after_edit(&mut guard, Some(MapEvent::DimensionsChanged { cache }));
        Ok(())
    }

    /// Replace the map metadata. Not ledger-tracked; metadata edits are not
    /// undoable.
    ///
    /// # Errors
    ///
    /// `NotReady`.
    pub async fn set_metadata(&self, metadata: MapMetadata) -> Result<(), MapServiceError> {
        let mut guard = self.lock_ready().await?;
        guard.snapshot.metadata = metadata;
        self.after_edit(&mut guard, None);
        Ok(())
    }

    // =========================================================================
    // UNDO
    // =========================================================================

    /// Revert the most recent tracked change and schedule a save.
    ///
    /// # Errors
    ///
    /// `NothingToUndo` on an empty ledger; `Undo` when the record cannot be
    /// reverted (the record is kept in that case).
    pub async fn undo(&self) -> Result<(), MapServiceError> {
        let mut guard = self.lock_ready().await?;
        let record = guard.ledger.pop_last().ok_or(MapServiceError::NothingToUndo)?;

        let result = {
            let state = &mut *guard;
            match record.subject {
                ChangeSubject::Area => {
                    revert_collection(&mut state.snapshot.interactive_areas, &record, |a| a.id)
                }
                ChangeSubject::CollisionArea => {
                    revert_collection(&mut state.snapshot.impassable_areas, &record, |a| a.id)
                }
                ChangeSubject::Asset => {
                    revert_collection(&mut state.snapshot.assets, &record, |a| a.id)
                }
                ChangeSubject::Layer => {
                    revert_collection(&mut state.snapshot.layers, &record, |l| l.id)
                }
                ChangeSubject::Dimensions => revert_dimensions(state, &self.inner.coordinator, &record),
            }
        };

        if let Err(e) = result {
            guard.ledger.record(record);
            return Err(e);
        }

        debug!(kind = ?record.kind, subject = ?record.subject, "change reverted");
        self.after_edit(&mut guard, None);
        Ok(())
    }

    // =========================================================================
    // SAVE PIPELINE
    // =========================================================================

    /// Persist the current snapshot. A non-forced call short-circuits to
    /// `Ok(None)` while another save is in flight; `force` waits its turn
    /// and bypasses the dirty check, so a shutdown flush never drops edits
    /// that landed behind an in-flight save.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `Persistence` when validation or the store rejects
    /// the snapshot. The local snapshot survives every failure.
    pub async fn save(&self, force: bool) -> Result<Option<i64>, MapServiceError> {
        let _gate = if force {
            self.inner.save_gate.lock().await
        } else {
            match self.inner.save_gate.try_lock() {
                Ok(gate) => gate,
                Err(_) => return Ok(None),
            }
        };

        let (room_id, candidate, seq) = {
            let mut state = self.lock_ready().await?;
            if !state.dirty && !force {
                return Ok(None);
            }

            if let Err(e) = validate_snapshot(&state.snapshot) {
                state.save_error = Some(e.to_string());
                self.inner.events.emit(MapEvent::SaveError { message: e.to_string() });
                return Err(e.into());
            }

            let room_id = state.room_id.ok_or(MapServiceError::NotReady(state.phase))?;
            let mut candidate = state.snapshot.clone();
            candidate.version += 1;
            candidate.last_modified = now_ms();
            (room_id, candidate, state.edit_seq)
        };

        let io = Duration::from_millis(self.inner.config.io_timeout_ms);
        let result = match timeout(io, self.inner.store.save_map(room_id, &candidate)).await {
            Ok(result) => result,
            Err(_) => Err(PersistenceError::Timeout(self.inner.config.io_timeout_ms)),
        };

        let mut state = self.inner.state.lock().await;

        match result {
            Ok(version) => {
                state.snapshot.version = version;
                state.snapshot.last_modified = candidate.last_modified;
                if state.edit_seq == seq {
                    state.dirty = false;
                } else {
                    // Edits landed mid-flight; put them back on the timer.
                    self.schedule_save(&mut state);
                }
                state.save_error = None;
                state.last_save_time = Some(now_ms());
                info!(%room_id, version, "map saved");
                self.inner.events.emit(MapEvent::Saved { version });

                let broadcast = state.snapshot.clone();
                drop(state);
                let _ = self.inner.channel.broadcast_map(room_id, broadcast);
                Ok(Some(version))
            }
            Err(e) => {
                state.save_error = Some(e.to_string());
                warn!(%room_id, error = %e, "map save failed; local changes retained");
                self.inner.events.emit(MapEvent::SaveError { message: e.to_string() });
                Err(e.into())
            }
        }
    }

    /// Common tail of every local edit: mark dirty, emit events, re-arm the
    /// debounced save.
    fn after_edit(&self, guard: &mut MutexGuard<'_, ServiceState>, extra: Option<MapEvent>) {
        guard.dirty = true;
        guard.edit_seq += 1;
        if let Some(event) = extra {
            self.inner.events.emit(event);
        }
        self.inner.events.emit(MapEvent::Changed {
            snapshot: guard.snapshot.clone(),
            source: ChangeSource::Local,
        });
        self.schedule_save(guard);
    }

    /// Arm (or re-arm) the debounced save. Each edit replaces the pending
    /// timer, so the save fires once the editor goes quiet.
    fn schedule_save(&self, guard: &mut MutexGuard<'_, ServiceState>) {
        if let Some(pending) = guard.pending_save.take() {
            pending.abort();
        }
        let service = self.clone();
        let delay = Duration::from_millis(self.inner.config.save_debounce_ms);
        guard.pending_save = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = service.save(false).await {
                warn!(error = %e, "debounced save failed");
            }
        }));
    }

    // =========================================================================
    // REMOTE UPDATES
    // =========================================================================

    /// Apply a change received from the realtime channel. Remote changes
    /// never mark the state dirty and never schedule a save.
    async fn apply_remote_update(&self, update: RemoteUpdate) {
        let mut state = self.inner.state.lock().await;
        if state.phase != ServicePhase::Ready {
            return;
        }

        match update {
            RemoteUpdate::Snapshot(mut snapshot) => {
                normalize_loaded(&mut snapshot);
                debug!(version = snapshot.version, "applying remote snapshot");
                state.snapshot = snapshot;
                if let Err(e) = self.inner.coordinator.absorb(&state.snapshot, "remote") {
                    warn!(error = %e, "could not absorb remote dimensions");
                }
            }
            RemoteUpdate::Asset(asset) => {
                debug!(asset_id = %asset.id, "applying remote asset");
                match state.snapshot.assets.iter().position(|a| a.id == asset.id) {
                    Some(index) => state.snapshot.assets[index] = asset,
                    None => {
                        self.inner.events.emit(MapEvent::ElementAdded {
                            subject: ChangeSubject::Asset,
                            id: asset.id,
                        });
                        state.snapshot.assets.push(asset);
                    }
                }
            }
        }

        self.inner.events.emit(MapEvent::Changed {
            snapshot: state.snapshot.clone(),
            source: ChangeSource::Remote,
        });
    }
}

// =============================================================================
// UNDO HELPERS
// =============================================================================

fn to_value<T: Serialize>(value: &T) -> Option<Value> {
    serde_json::to_value(value).ok()
}

fn id_from(value: Option<&Value>) -> Result<Uuid, MapServiceError> {
    value
        .and_then(|v| v.get("id"))
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| MapServiceError::Undo("record payload has no id".to_owned()))
}

fn from_value<T: serde::de::DeserializeOwned>(value: Option<&Value>) -> Result<T, MapServiceError> {
    let value = value
        .ok_or_else(|| MapServiceError::Undo("record payload missing".to_owned()))?
        .clone();
    serde_json::from_value(value).map_err(|e| MapServiceError::Undo(e.to_string()))
}

/// Invert one change record against its collection: adds are removed,
/// removals reinserted, updates rolled back to the before image.
fn revert_collection<T: serde::de::DeserializeOwned>(
    items: &mut Vec<T>,
    record: &ChangeRecord,
    id_of: fn(&T) -> Uuid,
) -> Result<(), MapServiceError> {
    match record.kind {
        ChangeKind::Add => {
            let id = id_from(record.after.as_ref())?;
            items.retain(|item| id_of(item) != id);
            Ok(())
        }
        ChangeKind::Remove => {
            let item: T = from_value(record.before.as_ref())?;
            items.push(item);
            Ok(())
        }
        ChangeKind::Update => {
            let item: T = from_value(record.before.as_ref())?;
            let id = id_of(&item);
            match items.iter().position(|i| id_of(i) == id) {
                Some(index) => items[index] = item,
                None => items.push(item),
            }
            Ok(())
        }
    }
}

fn revert_dimensions(
    state: &mut ServiceState,
    coordinator: &DimensionCoordinator,
    record: &ChangeRecord,
) -> Result<(), MapServiceError> {
    let before: DimensionRecord = from_value(record.before.as_ref())?;
    before.apply(&mut state.snapshot);
    if let Err(e) = coordinator.absorb(&state.snapshot, "undo") {
        warn!(error = %e, "could not absorb reverted dimensions");
    }
    Ok(())
}

#[cfg(test)]
#[path = "map_state_test.rs"]
mod tests;
