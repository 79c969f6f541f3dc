// THEORY:
// A `Blob` is one 8-connected component of positive pixels. It is the unit every
// later decision is made on: the calibrator measures pure blobs, the classifier
// passes, discards or splits them.
//
// Key architectural principles:
// 1.  **Stateless Data Container**: A `Blob` is a snapshot of one component of one
//     mask at one erosion depth. It has no memory of the mask it came from beyond
//     its own pixel coordinates.
// 2.  **Derived Geometry**: Size, centroid and bounding box are computed from the
//     coordinates on demand; nothing is cached that could drift out of sync.

use crate::core_modules::binary_mask::{BinaryMask, Point};

/// A single connected component of a binary mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// Every pixel of the component. Internal order is the traversal order and is
    /// not meaningful.
    pub pixels: Vec<Point>,
}

impl Blob {
    pub fn new(pixels: Vec<Point>) -> Self {
        Self { pixels }
    }

    /// The pixel count of the component, i.e. its area.
    pub fn size(&self) -> usize {
        self.pixels.len()
    }

    pub fn contains(&self, point: &Point) -> bool {
        self.pixels.contains(point)
    }

    /// The exact mean coordinate as `(x, y)`.
    pub fn mean(&self) -> (f64, f64) {
        if self.pixels.is_empty() {
            return (0.0, 0.0);
        }
        let (sum_x, sum_y) = self
            .pixels
            .iter()
            .fold((0u64, 0u64), |(sx, sy), p| (sx + p.x as u64, sy + p.y as u64));
        let n = self.pixels.len() as f64;
        (sum_x as f64 / n, sum_y as f64 / n)
    }

    /// The mean coordinate rounded to the nearest pixel, where the object's
    /// centroid is placed.
    pub fn centroid(&self) -> Point {
        let (x, y) = self.mean();
        Point::new(x.round() as u32, y.round() as u32)
    }

    /// Top-left and bottom-right corners (inclusive).
    pub fn bounding_box(&self) -> (Point, Point) {
        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0;
        let mut max_y = 0;
        for point in &self.pixels {
            min_x = min_x.min(point.x);
            min_y = min_y.min(point.y);
            max_x = max_x.max(point.x);
            max_y = max_y.max(point.y);
        }
        (Point::new(min_x, min_y), Point::new(max_x, max_y))
    }

    /// Renders the blob into a mask sized to its bounding box. Returns the mask and
    /// the offset of its top-left corner in image coordinates.
    pub fn to_local_mask(&self) -> (BinaryMask, Point) {
        if self.pixels.is_empty() {
            return (BinaryMask::new(0, 0), Point::new(0, 0));
        }
        let (min, max) = self.bounding_box();
        let mut mask = BinaryMask::new(max.x - min.x + 1, max.y - min.y + 1);
        for point in &self.pixels {
            mask.set(point.x - min.x, point.y - min.y, true);
        }
        (mask, min)
    }
}
