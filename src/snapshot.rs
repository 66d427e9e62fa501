//! Map snapshot — the full in-memory representation of one room's map.
//!
//! DESIGN
//! ======
//! `MapSnapshot` is the root aggregate. It is owned exclusively by the map
//! state service; collaborators only ever receive clones, so nothing outside
//! the service can mutate live state behind its back.
//!
//! The persisted document is the snapshot itself plus `version` and
//! `last_modified`. Export/import round-trips are equal modulo the
//! timestamp, which the importer is allowed to overwrite.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dimensions::{DEFAULT_WORLD_DIMENSIONS, Dimensions};

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// GEOMETRY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.width == 0.0 && self.height == 0.0
    }

    /// Axis-aligned bounding box of a point set. Empty input yields the
    /// zero rect.
    #[must_use]
    pub fn bounding(points: &[Point]) -> Self {
        let Some(first) = points.first() else {
            return Self::default();
        };
        let mut min_x = first.x;
        let mut min_y = first.y;
        let mut max_x = first.x;
        let mut max_y = first.y;
        for p in &points[1..] {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Self { x: min_x, y: min_y, width: max_x - min_x, height: max_y - min_y }
    }
}

/// Area geometry: an axis-aligned rectangle or a polygon with a cached
/// bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum AreaShape {
    Rect(Rect),
    Polygon { points: Vec<Point>, bounds: Rect },
}

impl AreaShape {
    /// Recompute a polygon's bounding box from its points when the stored
    /// box is missing or zero. The box is derived data and must never be
    /// independently stale.
    pub fn normalize(&mut self) {
        if let AreaShape::Polygon { points, bounds } = self {
            if bounds.is_zero() && !points.is_empty() {
                *bounds = Rect::bounding(points);
            }
        }
    }

    #[must_use]
    pub fn bounds(&self) -> Rect {
        match self {
            AreaShape::Rect(rect) => *rect,
            AreaShape::Polygon { bounds, .. } => *bounds,
        }
    }
}

// =============================================================================
// MAP ELEMENTS
// =============================================================================

/// A zone avatars can interact with (portal, meeting spot, embed, ...).
/// `kind` is the semantic type; `behavior` carries the kind-specific config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveArea {
    pub id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub shape: AreaShape,
    pub kind: String,
    #[serde(default)]
    pub behavior: serde_json::Value,
}

/// A zone avatars cannot enter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpassableArea {
    pub id: Uuid,
    #[serde(flatten)]
    pub shape: AreaShape,
}

/// A placed image on the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedAsset {
    pub id: Uuid,
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    pub rotation: f64,
    pub source: String,
}

/// Presentation grouping of assets. Carries no invariants of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapLayer {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub asset_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Unlisted,
    Public,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub visibility: Visibility,
}

impl Default for MapMetadata {
    fn default() -> Self {
        Self {
            name: "Untitled Map".to_owned(),
            description: String::new(),
            tags: Vec::new(),
            visibility: Visibility::Private,
        }
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// The root aggregate: one room's map at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSnapshot {
    pub world_dimensions: Dimensions,
    #[serde(default)]
    pub background_image: Option<String>,
    #[serde(default)]
    pub background_image_dimensions: Option<Dimensions>,
    #[serde(default)]
    pub interactive_areas: Vec<InteractiveArea>,
    #[serde(default)]
    pub impassable_areas: Vec<ImpassableArea>,
    #[serde(default)]
    pub assets: Vec<PlacedAsset>,
    #[serde(default)]
    pub layers: Vec<MapLayer>,
    pub version: i64,
    pub last_modified: i64,
    #[serde(default)]
    pub metadata: MapMetadata,
}

impl MapSnapshot {
    /// Fresh default snapshot: default world size, no background, empty
    /// collections. Used when a room has never been saved or a load fails.
    #[must_use]
    pub fn new_default() -> Self {
        Self {
            world_dimensions: DEFAULT_WORLD_DIMENSIONS,
            background_image: None,
            background_image_dimensions: None,
            interactive_areas: Vec::new(),
            impassable_areas: Vec::new(),
            assets: Vec::new(),
            layers: Vec::new(),
            version: 0,
            last_modified: now_ms(),
            metadata: MapMetadata::default(),
        }
    }

    /// Dimensions actually used for rendering and bounds: the background
    /// image size when present, else the declared world size.
    #[must_use]
    pub fn effective_dimensions(&self) -> Dimensions {
        self.background_image_dimensions
            .unwrap_or(self.world_dimensions)
    }

    /// Recompute every polygon bounding box that is missing or zero.
    pub fn normalize(&mut self) {
        for area in &mut self.interactive_areas {
            area.shape.normalize();
        }
        for area in &mut self.impassable_areas {
            area.shape.normalize();
        }
    }

    /// Export as a self-describing JSON document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the snapshot cannot be encoded.
    pub fn export_document(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Import a previously exported document. `last_modified` is stamped
    /// with the import time; everything else round-trips unchanged.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the document is malformed.
    pub fn import_document(doc: serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut snapshot: Self = serde_json::from_value(doc)?;
        snapshot.last_modified = now_ms();
        snapshot.normalize();
        Ok(snapshot)
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    #[must_use]
    pub fn rect_area(name: &str) -> InteractiveArea {
        InteractiveArea {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            shape: AreaShape::Rect(Rect { x: 10.0, y: 20.0, width: 100.0, height: 80.0 }),
            kind: "meeting".to_owned(),
            behavior: serde_json::json!({"capacity": 4}),
        }
    }

    #[must_use]
    pub fn polygon_wall(points: &[(f64, f64)]) -> ImpassableArea {
        ImpassableArea {
            id: Uuid::new_v4(),
            shape: AreaShape::Polygon {
                points: points.iter().map(|&(x, y)| Point { x, y }).collect(),
                bounds: Rect::default(),
            },
        }
    }

    #[must_use]
    pub fn placed_asset(source: &str) -> PlacedAsset {
        PlacedAsset {
            id: Uuid::new_v4(),
            x: 50.0,
            y: 60.0,
            scale: 1.0,
            rotation: 0.0,
            source: source.to_owned(),
        }
    }

    /// Snapshot with one of everything, for round-trip and service tests.
    #[must_use]
    pub fn populated_snapshot() -> MapSnapshot {
        let mut snapshot = MapSnapshot::new_default();
        snapshot.interactive_areas.push(rect_area("lounge"));
        let mut wall = polygon_wall(&[(0.0, 0.0), (40.0, 0.0), (40.0, 30.0)]);
        wall.shape.normalize();
        snapshot.impassable_areas.push(wall);
        snapshot.assets.push(placed_asset("https://cdn.example/tree.png"));
        snapshot.layers.push(MapLayer {
            id: Uuid::new_v4(),
            name: "props".to_owned(),
            asset_ids: vec![snapshot.assets[0].id],
        });
        snapshot.version = 3;
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::Dimensions;

    #[test]
    fn effective_dimensions_prefer_background() {
        let mut snapshot = MapSnapshot::new_default();
        snapshot.world_dimensions = Dimensions::new(2000.0, 1000.0);
        assert_eq!(snapshot.effective_dimensions(), Dimensions::new(2000.0, 1000.0));

        snapshot.background_image_dimensions = Some(Dimensions::new(3000.0, 1500.0));
        assert_eq!(snapshot.effective_dimensions(), Dimensions::new(3000.0, 1500.0));

        snapshot.background_image_dimensions = None;
        assert_eq!(snapshot.effective_dimensions(), Dimensions::new(2000.0, 1000.0));
    }

    #[test]
    fn bounding_box_from_points() {
        let points =
            vec![Point { x: 5.0, y: 8.0 }, Point { x: -3.0, y: 12.0 }, Point { x: 7.0, y: 2.0 }];
        let bounds = Rect::bounding(&points);
        assert_eq!(bounds, Rect { x: -3.0, y: 2.0, width: 10.0, height: 10.0 });
    }

    #[test]
    fn normalize_fills_zero_polygon_bounds() {
        let mut wall = test_helpers::polygon_wall(&[(0.0, 0.0), (40.0, 0.0), (40.0, 30.0)]);
        assert!(wall.shape.bounds().is_zero());
        wall.shape.normalize();
        assert_eq!(wall.shape.bounds(), Rect { x: 0.0, y: 0.0, width: 40.0, height: 30.0 });
    }

    #[test]
    fn normalize_keeps_existing_polygon_bounds() {
        let mut shape = AreaShape::Polygon {
            points: vec![Point { x: 0.0, y: 0.0 }, Point { x: 10.0, y: 10.0 }],
            bounds: Rect { x: 1.0, y: 1.0, width: 2.0, height: 2.0 },
        };
        shape.normalize();
        assert_eq!(shape.bounds(), Rect { x: 1.0, y: 1.0, width: 2.0, height: 2.0 });
    }

    #[test]
    fn export_import_round_trip_modulo_timestamp() {
        let snapshot = test_helpers::populated_snapshot();
        let doc = snapshot.export_document().unwrap();
        let restored = MapSnapshot::import_document(doc).unwrap();

        let mut expected = snapshot;
        expected.last_modified = restored.last_modified;
        assert_eq!(restored, expected);
    }

    #[test]
    fn import_recomputes_missing_polygon_bounds() {
        let mut snapshot = MapSnapshot::new_default();
        snapshot
            .impassable_areas
            .push(test_helpers::polygon_wall(&[(2.0, 2.0), (6.0, 2.0), (6.0, 9.0)]));
        let doc = snapshot.export_document().unwrap();
        let restored = MapSnapshot::import_document(doc).unwrap();
        assert_eq!(
            restored.impassable_areas[0].shape.bounds(),
            Rect { x: 2.0, y: 2.0, width: 4.0, height: 7.0 }
        );
    }

    #[test]
    fn default_snapshot_shape() {
        let snapshot = MapSnapshot::new_default();
        assert_eq!(snapshot.world_dimensions, DEFAULT_WORLD_DIMENSIONS);
        assert!(snapshot.background_image.is_none());
        assert!(snapshot.interactive_areas.is_empty());
        assert_eq!(snapshot.version, 0);
        assert_eq!(snapshot.metadata.visibility, Visibility::Private);
    }
}
