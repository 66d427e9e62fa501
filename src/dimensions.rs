//! Dimension policy — pure validation and scaling rules for map dimensions.
//!
//! DESIGN
//! ======
//! Stateless functions shared by the dimension coordinator (editor-side
//! resize/upload validation) and the persistence gateway (world-clamping of
//! loaded background dimensions). Both paths run the same algorithm so the
//! two surfaces always agree on the final size.
//!
//! Oversized dimensions are not rejected: they are scaled down to the given
//! maximum with the aspect ratio preserved. Undersized or non-positive
//! dimensions are rejected with one error per offending axis, and so is a
//! pair so stretched that scaling it under the maximum would push an axis
//! below the minimum.

use serde::{Deserialize, Serialize};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Smallest usable map size. Anything below is rejected outright.
pub const MIN_DIMENSIONS: Dimensions = Dimensions { width: 400.0, height: 300.0 };

/// Largest world size. Oversized candidates are scaled down to fit.
pub const MAX_WORLD_DIMENSIONS: Dimensions = Dimensions { width: 8000.0, height: 4000.0 };

/// Largest raw background image size, checked before world-clamping.
pub const MAX_BACKGROUND_DIMENSIONS: Dimensions = Dimensions { width: 10000.0, height: 10000.0 };

/// World size used for freshly constructed default snapshots.
pub const DEFAULT_WORLD_DIMENSIONS: Dimensions = Dimensions { width: 1920.0, height: 1080.0 };

// =============================================================================
// TYPES
// =============================================================================

/// A width/height pair in world units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: f64,
    pub height: f64,
}

impl Dimensions {
    #[must_use]
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }

    #[must_use]
    pub fn aspect_ratio(&self) -> f64 {
        self.width / self.height
    }
}

/// Result of validating a candidate dimension pair. `dims` is always a new
/// pair; the input is never mutated.
#[derive(Debug, Clone)]
pub struct DimensionCheck {
    pub is_valid: bool,
    pub dims: Dimensions,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub scaled: bool,
}

// =============================================================================
// POLICY
// =============================================================================

/// Validate a candidate dimension pair against the minimum and the given
/// maximum. Oversized pairs come back scaled to fit with a warning; pairs
/// below the minimum come back invalid with one error per violated axis.
#[must_use]
pub fn validate(dims: Dimensions, max: Dimensions) -> DimensionCheck {
    let mut errors = Vec::new();

    if dims.width <= 0.0 {
        errors.push(format!("width must be positive (got {})", dims.width));
    }
    if dims.height <= 0.0 {
        errors.push(format!("height must be positive (got {})", dims.height));
    }
    if errors.is_empty() {
        if dims.width < MIN_DIMENSIONS.width {
            errors.push(format!(
                "width {} is below the minimum {}",
                dims.width, MIN_DIMENSIONS.width
            ));
        }
        if dims.height < MIN_DIMENSIONS.height {
            errors.push(format!(
                "height {} is below the minimum {}",
                dims.height, MIN_DIMENSIONS.height
            ));
        }
    }
    if !errors.is_empty() {
        return DimensionCheck { is_valid: false, dims, errors, warnings: Vec::new(), scaled: false };
    }

    let (fitted, scaled) = scale_to_fit(dims, max);
    // An extreme aspect ratio can scale under the maximum and land below
    // the minimum at the same time; no valid size exists for such a pair.
    if scaled && (fitted.width < MIN_DIMENSIONS.width || fitted.height < MIN_DIMENSIONS.height) {
        errors.push(format!(
            "dimensions {}x{} scale to {}x{} under the maximum {}x{}, below the minimum {}x{}",
            dims.width,
            dims.height,
            fitted.width,
            fitted.height,
            max.width,
            max.height,
            MIN_DIMENSIONS.width,
            MIN_DIMENSIONS.height
        ));
        return DimensionCheck { is_valid: false, dims, errors, warnings: Vec::new(), scaled: false };
    }
    let warnings = if scaled {
        vec![format!(
            "dimensions {}x{} exceed the maximum {}x{}; scaled to {}x{}",
            dims.width, dims.height, max.width, max.height, fitted.width, fitted.height
        )]
    } else {
        Vec::new()
    };

    DimensionCheck { is_valid: true, dims: fitted, errors, warnings, scaled }
}

/// Scale a dimension pair down to fit within `max`, preserving the aspect
/// ratio. Returns the (possibly unchanged) pair and whether scaling applied.
#[must_use]
pub fn scale_to_fit(dims: Dimensions, max: Dimensions) -> (Dimensions, bool) {
    if dims.width <= max.width && dims.height <= max.height {
        return (dims, false);
    }

    let scale = (max.width / dims.width).min(max.height / dims.height);
    let fitted = Dimensions {
        width: (dims.width * scale).floor(),
        height: (dims.height * scale).floor(),
    };
    (fitted, true)
}

// =============================================================================
// TESTS
// =============================================================================
