use super::*;
use crate::ledger::ChangeLedger;
use crate::snapshot::test_helpers::{polygon_wall, rect_area};
use crate::snapshot::{Rect, test_helpers};

fn fixture() -> (MapSnapshot, ChangeLedger) {
    (test_helpers::populated_snapshot(), ChangeLedger::default())
}

#[test]
fn add_interactive_appends_and_records() {
    let (mut snapshot, mut ledger) = fixture();
    let area = rect_area("stage");

    let added = add_interactive(&mut snapshot, &mut ledger, area.clone(), "editor").unwrap();
    assert_eq!(added, area);
    assert_eq!(snapshot.interactive_areas.len(), 2);

    let record = ledger.last().unwrap();
    assert_eq!(record.kind, ChangeKind::Add);
    assert_eq!(record.subject, ChangeSubject::Area);
    assert!(record.before.is_none());
    assert!(record.after.is_some());
    assert_eq!(record.actor, "editor");
}

#[test]
fn add_interactive_rejects_duplicate_id() {
    let (mut snapshot, mut ledger) = fixture();
    let existing = snapshot.interactive_areas[0].clone();

    let err = add_interactive(&mut snapshot, &mut ledger, existing, "editor").unwrap_err();
    assert!(matches!(err, AreaError::DuplicateId(_)));
    assert_eq!(snapshot.interactive_areas.len(), 1);
    assert!(ledger.is_empty());
}

#[test]
fn update_interactive_merges_partial_fields() {
    let (mut snapshot, mut ledger) = fixture();
    let id = snapshot.interactive_areas[0].id;
    let original_shape = snapshot.interactive_areas[0].shape.clone();

    let patch = InteractiveAreaPatch { name: Some("renamed".into()), ..Default::default() };
    let updated = update_interactive(&mut snapshot, &mut ledger, id, patch, "editor").unwrap();

    assert_eq!(updated.name, "renamed");
    assert_eq!(updated.shape, original_shape); // untouched
    assert_eq!(updated.kind, "meeting"); // untouched

    let record = ledger.last().unwrap();
    assert_eq!(record.kind, ChangeKind::Update);
    assert!(record.before.is_some());
    assert!(record.after.is_some());
}

#[test]
fn update_missing_id_fails_and_leaves_snapshot_unchanged() {
    let (mut snapshot, mut ledger) = fixture();
    let before = snapshot.clone();

    let err = update_interactive(
        &mut snapshot,
        &mut ledger,
        Uuid::new_v4(),
        InteractiveAreaPatch::default(),
        "editor",
    )
    .unwrap_err();

    assert!(matches!(err, AreaError::NotFound(_)));
    assert_eq!(snapshot, before);
    assert!(ledger.is_empty());
}

#[test]
fn add_then_remove_restores_prior_order() {
    let (mut snapshot, mut ledger) = fixture();
    let existing_ids: Vec<Uuid> = snapshot.interactive_areas.iter().map(|a| a.id).collect();

    let added = add_interactive(&mut snapshot, &mut ledger, rect_area("temp"), "editor").unwrap();
    remove_interactive(&mut snapshot, &mut ledger, added.id, "editor").unwrap();

    let after_ids: Vec<Uuid> = snapshot.interactive_areas.iter().map(|a| a.id).collect();
    assert_eq!(after_ids, existing_ids);
}

#[test]
fn remove_preserves_order_of_untouched_entries() {
    let (mut snapshot, mut ledger) = fixture();
    let a = add_interactive(&mut snapshot, &mut ledger, rect_area("a"), "editor").unwrap();
    let b = add_interactive(&mut snapshot, &mut ledger, rect_area("b"), "editor").unwrap();
    let c = add_interactive(&mut snapshot, &mut ledger, rect_area("c"), "editor").unwrap();

    remove_interactive(&mut snapshot, &mut ledger, b.id, "editor").unwrap();

    let ids: Vec<Uuid> = snapshot.interactive_areas.iter().map(|x| x.id).collect();
    let a_pos = ids.iter().position(|&id| id == a.id).unwrap();
    let c_pos = ids.iter().position(|&id| id == c.id).unwrap();
    assert!(a_pos < c_pos);
    assert!(!ids.contains(&b.id));
}

#[test]
fn remove_missing_id_fails() {
    let (mut snapshot, mut ledger) = fixture();
    let err = remove_interactive(&mut snapshot, &mut ledger, Uuid::new_v4(), "editor").unwrap_err();
    assert!(matches!(err, AreaError::NotFound(_)));
}

#[test]
fn add_polygon_normalizes_bounds() {
    let (mut snapshot, mut ledger) = fixture();
    let wall = polygon_wall(&[(5.0, 5.0), (15.0, 5.0), (15.0, 25.0)]);
    assert!(wall.shape.bounds().is_zero());

    let added = add_impassable(&mut snapshot, &mut ledger, wall, "editor").unwrap();
    assert_eq!(added.shape.bounds(), Rect { x: 5.0, y: 5.0, width: 10.0, height: 20.0 });
}

#[test]
fn impassable_crud_records_collision_subject() {
    let (mut snapshot, mut ledger) = fixture();
    let wall = polygon_wall(&[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)]);
    let added = add_impassable(&mut snapshot, &mut ledger, wall, "editor").unwrap();
    assert_eq!(ledger.last().unwrap().subject, ChangeSubject::CollisionArea);

    let patch =
        ImpassableAreaPatch { shape: Some(AreaShape::Rect(Rect { x: 0.0, y: 0.0, width: 9.0, height: 9.0 })) };
    update_impassable(&mut snapshot, &mut ledger, added.id, patch, "editor").unwrap();
    assert_eq!(ledger.last().unwrap().kind, ChangeKind::Update);

    remove_impassable(&mut snapshot, &mut ledger, added.id, "editor").unwrap();
    let record = ledger.last().unwrap();
    assert_eq!(record.kind, ChangeKind::Remove);
    assert!(record.after.is_none());
    assert_eq!(ledger.len(), 3);
}

#[test]
fn update_impassable_missing_id_fails() {
    let (mut snapshot, mut ledger) = fixture();
    let err = update_impassable(
        &mut snapshot,
        &mut ledger,
        Uuid::new_v4(),
        ImpassableAreaPatch::default(),
        "editor",
    )
    .unwrap_err();
    assert!(matches!(err, AreaError::NotFound(_)));
}
