//! Area registry — CRUD over interactive and impassable zones.
//!
//! DESIGN
//! ======
//! Operations mutate a given snapshot in place and record the transition
//! in the given ledger. They are synchronous and side-effect-free beyond
//! that: no network, no persistence. The caller (the map state service)
//! marks the snapshot dirty and schedules the save.
//!
//! Order is preserved: removal splices the entry out without disturbing
//! the relative order of untouched entries.

use uuid::Uuid;

use crate::ledger::{ChangeKind, ChangeLedger, ChangeRecord, ChangeSubject};
use crate::snapshot::{AreaShape, ImpassableArea, InteractiveArea, MapSnapshot};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AreaError {
    #[error("area not found: {0}")]
    NotFound(Uuid),
    #[error("duplicate area id: {0}")]
    DuplicateId(Uuid),
}

/// Partial update for an interactive area. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct InteractiveAreaPatch {
    pub name: Option<String>,
    pub shape: Option<AreaShape>,
    pub kind: Option<String>,
    pub behavior: Option<serde_json::Value>,
}

/// Partial update for an impassable area.
#[derive(Debug, Clone, Default)]
pub struct ImpassableAreaPatch {
    pub shape: Option<AreaShape>,
}

fn to_value<T: serde::Serialize>(value: &T) -> Option<serde_json::Value> {
    serde_json::to_value(value).ok()
}

// =============================================================================
// INTERACTIVE AREAS
// =============================================================================

/// Append an interactive area.
///
/// # Errors
///
/// Returns `DuplicateId` if an area with the same id already exists.
pub fn add_interactive(
    snapshot: &mut MapSnapshot,
    ledger: &mut ChangeLedger,
    mut area: InteractiveArea,
    actor: &str,
) -> Result<InteractiveArea, AreaError> {
    if snapshot.interactive_areas.iter().any(|a| a.id == area.id) {
        return Err(AreaError::DuplicateId(area.id));
    }
    area.shape.normalize();

    ledger.record(ChangeRecord::new(
        ChangeKind::Add,
        ChangeSubject::Area,
        None,
        to_value(&area),
        actor,
    ));
    snapshot.interactive_areas.push(area.clone());
    Ok(area)
}

/// Merge patch fields into an existing interactive area.
///
/// # Errors
///
/// Returns `NotFound` if no area has that id; the snapshot is unchanged.
pub fn update_interactive(
    snapshot: &mut MapSnapshot,
    ledger: &mut ChangeLedger,
    id: Uuid,
    patch: InteractiveAreaPatch,
    actor: &str,
) -> Result<InteractiveArea, AreaError> {
    let area = snapshot
        .interactive_areas
        .iter_mut()
        .find(|a| a.id == id)
        .ok_or(AreaError::NotFound(id))?;
    let before = to_value(&*area);

    if let Some(name) = patch.name {
        area.name = name;
    }
    if let Some(mut shape) = patch.shape {
        shape.normalize();
        area.shape = shape;
    }
    if let Some(kind) = patch.kind {
        area.kind = kind;
    }
    if let Some(behavior) = patch.behavior {
        area.behavior = behavior;
    }

    let updated = area.clone();
    ledger.record(ChangeRecord::new(
        ChangeKind::Update,
        ChangeSubject::Area,
        before,
        to_value(&updated),
        actor,
    ));
    Ok(updated)
}

/// Remove an interactive area by id.
///
/// # Errors
///
/// Returns `NotFound` if no area has that id.
pub fn remove_interactive(
    snapshot: &mut MapSnapshot,
    ledger: &mut ChangeLedger,
    id: Uuid,
    actor: &str,
) -> Result<InteractiveArea, AreaError> {
    let index = snapshot
        .interactive_areas
        .iter()
        .position(|a| a.id == id)
        .ok_or(AreaError::NotFound(id))?;
    let removed = snapshot.interactive_areas.remove(index);

    ledger.record(ChangeRecord::new(
        ChangeKind::Remove,
        ChangeSubject::Area,
        to_value(&removed),
        None,
        actor,
    ));
    Ok(removed)
}

// =============================================================================
// IMPASSABLE AREAS
// =============================================================================

/// Append an impassable area.
///
/// # Errors
///
/// Returns `DuplicateId` if an area with the same id already exists.
pub fn add_impassable(
    snapshot: &mut MapSnapshot,
    ledger: &mut ChangeLedger,
    mut area: ImpassableArea,
    actor: &str,
) -> Result<ImpassableArea, AreaError> {
    if snapshot.impassable_areas.iter().any(|a| a.id == area.id) {
        return Err(AreaError::DuplicateId(area.id));
    }
    area.shape.normalize();

    ledger.record(ChangeRecord::new(
        ChangeKind::Add,
        ChangeSubject::CollisionArea,
        None,
        to_value(&area),
        actor,
    ));
    snapshot.impassable_areas.push(area.clone());
    Ok(area)
}

/// Merge patch fields into an existing impassable area.
///
/// # Errors
///
/// Returns `NotFound` if no area has that id; the snapshot is unchanged.
pub fn update_impassable(
    snapshot: &mut MapSnapshot,
    ledger: &mut ChangeLedger,
    id: Uuid,
    patch: ImpassableAreaPatch,
    actor: &str,
) -> Result<ImpassableArea, AreaError> {
    let area = snapshot
        .impassable_areas
        .iter_mut()
        .find(|a| a.id == id)
        .ok_or(AreaError::NotFound(id))?;
    let before = to_value(&*area);

    if let Some(mut shape) = patch.shape {
        shape.normalize();
        area.shape = shape;
    }

    let updated = area.clone();
    ledger.record(ChangeRecord::new(
        ChangeKind::Update,
        ChangeSubject::CollisionArea,
        before,
        to_value(&updated),
        actor,
    ));
    Ok(updated)
}

/// Remove an impassable area by id.
///
/// # Errors
///
/// Returns `NotFound` if no area has that id.
pub fn remove_impassable(
    snapshot: &mut MapSnapshot,
    ledger: &mut ChangeLedger,
    id: Uuid,
    actor: &str,
) -> Result<ImpassableArea, AreaError> {
    let index = snapshot
        .impassable_areas
        .iter()
        .position(|a| a.id == id)
        .ok_or(AreaError::NotFound(id))?;
    let removed = snapshot.impassable_areas.remove(index);

    ledger.record(ChangeRecord::new(
        ChangeKind::Remove,
        ChangeSubject::CollisionArea,
        to_value(&removed),
        None,
        actor,
    ));
    Ok(removed)
}

#[cfg(test)]
#[path = "areas_test.rs"]
mod tests;
