//! Bounding boxes and the matrix layout acceleration structure instances use.

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounds. `min > max` on any axis means empty.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Aabb {
    /// An inverted box that any point expands into.
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        points.into_iter().fold(Self::EMPTY, |mut bounds, p| {
            bounds.expand_to_include(p);
            bounds
        })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    #[inline]
    pub fn expand_to_include(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Smallest box holding both.
    #[inline]
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb::new(self.min.min(other.min), self.max.max(other.max))
    }

    /// Bounds of this box after transforming all eight corners.
    pub fn transformed(&self, matrix: Mat4) -> Aabb {
        if self.is_empty() {
            return *self;
        }
        let corners = (0..8).map(|i| {
            Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            )
        });
        Aabb::from_points(corners.map(|c| matrix.transform_point3(c)))
    }
}

/// Flatten the affine part of a matrix into the row-major 3x4 layout used by
/// acceleration structure instances.
pub fn transform_rows_3x4(matrix: Mat4) -> [f32; 12] {
    let r0 = matrix.row(0);
    let r1 = matrix.row(1);
    let r2 = matrix.row(2);
    [
        r0.x, r0.y, r0.z, r0.w, //
        r1.x, r1.y, r1.z, r1.w, //
        r2.x, r2.y, r2.z, r2.w,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn empty_aabb_absorbs_points() {
        let mut aabb = Aabb::EMPTY;
        assert!(aabb.is_empty());
        aabb.expand_to_include(Vec3::new(1.0, 2.0, 3.0));
        assert!(!aabb.is_empty());
        assert_eq!(aabb.min, aabb.max);
    }

    #[test]
    fn union_with_empty_is_identity() {
        let aabb = Aabb::new(Vec3::NEG_ONE, Vec3::ONE);
        assert_eq!(Aabb::EMPTY.union(&aabb), aabb);
    }

    #[test]
    fn transformed_bounds_follow_translation() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let moved = aabb.transformed(Mat4::from_translation(Vec3::new(5.0, 0.0, -2.0)));
        assert_relative_eq!(moved.min.x, 5.0);
        assert_relative_eq!(moved.max.x, 6.0);
        assert_relative_eq!(moved.min.z, -2.0);
    }

    #[test]
    fn rows_3x4_place_translation_in_last_column() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let rows = transform_rows_3x4(m);
        assert_eq!(rows, [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]);
    }

    #[test]
    fn rows_3x4_of_scale() {
        let rows = transform_rows_3x4(Mat4::from_scale(Vec3::new(2.0, 3.0, 4.0)));
        assert_relative_eq!(rows[0], 2.0);
        assert_relative_eq!(rows[5], 3.0);
        assert_relative_eq!(rows[10], 4.0);
    }
}
