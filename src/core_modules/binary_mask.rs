// THEORY:
// The `BinaryMask` is the lingua franca of the engine. The pixel classifier hands us
// one mask per image and category; every stage after it either reads a mask
// (labeling, calibration) or produces one (classification leaves exactly one
// positive pixel per centroid).
//
// Key architectural principles:
// 1.  **Dumb Data Container**: A mask is a flat, row-major `Vec<bool>` plus its
//     dimensions. It knows how to index itself and how to erode itself, nothing more.
// 2.  **Exclusive Ownership**: Masks are moved from stage to stage. No stage ever
//     holds a mask that another stage is mutating.
// 3.  **Terminating Erosion**: Erosion treats everything outside the image as
//     background, so each pass strips the outer boundary of every blob and repeated
//     erosion always ends in an empty mask.

/// An integer pixel coordinate. `x` is the column, `y` the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    pub fn distance_sq(&self, other: &Point) -> u64 {
        let dx = self.x.abs_diff(other.x) as u64;
        let dy = self.y.abs_diff(other.y) as u64;
        dx * dx + dy * dy
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (self.distance_sq(other) as f64).sqrt()
    }
}

/// A width x height grid of "positive" / "not positive" pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    width: u32,
    height: u32,
    /// Row-major pixel states, `width * height` entries.
    data: Vec<bool>,
}

impl BinaryMask {
    /// Creates an all-background mask.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![false; width as usize * height as usize],
        }
    }

    /// Wraps an existing row-major buffer. Returns `None` if the length does not match.
    pub fn from_vec(width: u32, height: u32, data: Vec<bool>) -> Option<Self> {
        if data.len() != width as usize * height as usize {
            return None;
        }
        Some(Self { width, height, data })
    }

    /// Builds a mask with the given positive pixels. Out-of-bounds points are ignored.
    pub fn from_points(width: u32, height: u32, points: &[Point]) -> Self {
        let mut mask = Self::new(width, height);
        for point in points {
            mask.set(point.x, point.y, true);
        }
        mask
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.data
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    #[inline]
    pub fn in_bounds(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < self.width as i64 && y < self.height as i64
    }

    /// Returns the pixel state, `false` outside the mask.
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.data[self.index(x, y)]
    }

    /// Sets a pixel. Writes outside the mask are ignored.
    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        if x < self.width && y < self.height {
            let idx = self.index(x, y);
            self.data[idx] = value;
        }
    }

    pub fn count_positive(&self) -> usize {
        self.data.iter().filter(|&&p| p).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|&p| p)
    }

    /// All positive pixels in row-major order.
    pub fn positives(&self) -> Vec<Point> {
        let width = self.width as usize;
        self.data
            .iter()
            .enumerate()
            .filter(|(_, p)| **p)
            .map(|(i, _)| Point::new((i % width) as u32, (i / width) as u32))
            .collect()
    }

    /// One pass of binary erosion with a 3x3 cross structuring element.
    ///
    /// A positive pixel survives only if its four orthogonal neighbours are positive.
    /// Pixels outside the mask are background.
    pub fn erode(&self) -> BinaryMask {
        let width = self.width as usize;
        let height = self.height as usize;
        let mut eroded = vec![false; self.data.len()];

        for y in 0..height {
            for x in 0..width {
                let idx = y * width + x;
                if !self.data[idx] {
                    continue;
                }
                let up = y > 0 && self.data[idx - width];
                let down = y + 1 < height && self.data[idx + width];
                let left = x > 0 && self.data[idx - 1];
                let right = x + 1 < width && self.data[idx + 1];
                eroded[idx] = up && down && left && right;
            }
        }

        BinaryMask {
            width: self.width,
            height: self.height,
            data: eroded,
        }
    }

    /// Applies [`erode`](Self::erode) `depth` times. Depth 0 returns a copy.
    pub fn eroded(&self, depth: usize) -> BinaryMask {
        let mut mask = self.clone();
        for _ in 0..depth {
            if mask.is_empty() {
                break;
            }
            mask = mask.erode();
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_rect(width: u32, height: u32, x0: u32, y0: u32, w: u32, h: u32) -> BinaryMask {
        let mut mask = BinaryMask::new(width, height);
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                mask.set(x, y, true);
            }
        }
        mask
    }

    #[test]
    fn from_vec_rejects_wrong_length() {
        assert!(BinaryMask::from_vec(3, 3, vec![false; 8]).is_none());
        assert!(BinaryMask::from_vec(3, 3, vec![false; 9]).is_some());
    }

    #[test]
    fn out_of_bounds_access_is_background() {
        let mut mask = BinaryMask::new(4, 4);
        mask.set(10, 10, true);
        assert!(!mask.get(10, 10));
        assert_eq!(mask.count_positive(), 0);
    }

    #[test]
    fn erosion_strips_one_ring() {
        let mask = filled_rect(10, 10, 2, 2, 5, 5);
        let eroded = mask.erode();
        assert_eq!(eroded.count_positive(), 9);
        assert!(eroded.get(3, 3));
        assert!(!eroded.get(2, 2));
    }

    #[test]
    fn erosion_treats_border_as_background() {
        let mask = filled_rect(3, 3, 0, 0, 3, 3);
        let eroded = mask.erode();
        assert_eq!(eroded.positives(), vec![Point::new(1, 1)]);
        assert!(eroded.erode().is_empty());
    }

    #[test]
    fn erosion_count_is_monotonic() {
        let mut mask = filled_rect(32, 32, 1, 1, 20, 12);
        for (x, y) in [(25, 25), (26, 25), (25, 26), (30, 3), (15, 20), (16, 21)] {
            mask.set(x, y, true);
        }
        let mut previous = mask.count_positive();
        for depth in 1..12 {
            let count = mask.eroded(depth).count_positive();
            assert!(count <= previous, "depth {depth}: {count} > {previous}");
            previous = count;
        }
        assert_eq!(previous, 0);
    }

    #[test]
    fn distance_is_euclidean() {
        let a = Point::new(0, 0);
        let b = Point::new(3, 4);
        assert_eq!(a.distance_sq(&b), 25);
        assert!((a.distance(&b) - 5.0).abs() < 1e-12);
    }
}
