// Synthetic classifier output: rectangular "objects" painted into per-category
// masks together with the point a user would have clicked on each of them.
// Used by the unit tests and the demo binary.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core_modules::binary_mask::{BinaryMask, Point};
use crate::core_modules::erosion_calibrator::TrainingImage;

/// Object footprints (width, height) cycled through by `isolated_training_set`.
pub const ISOLATED_SIDES: [(usize, usize); 4] = [(4, 4), (5, 4), (5, 5), (6, 5)];

/// Gap kept between placed objects so that they never touch.
const PLACEMENT_MARGIN: u32 = 3;
const PLACEMENT_ATTEMPTS: usize = 200;

/// Sets every pixel of the rectangle; pixels outside the mask are ignored.
pub fn paint_rect(mask: &mut BinaryMask, x0: u32, y0: u32, w: u32, h: u32) {
    for y in y0..y0.saturating_add(h) {
        for x in x0..x0.saturating_add(w) {
            mask.set(x, y, true);
        }
    }
}

fn center_of(x0: u32, y0: u32, w: u32, h: u32) -> Point {
    Point::new(x0 + w / 2, y0 + h / 2)
}

/// `n` training images with four well separated objects each and one training
/// point per object. Every size in `ISOLATED_SIDES` appears once per image.
pub fn isolated_training_set(n: usize, category: &str) -> Vec<TrainingImage> {
    const ANCHORS: [(u32, u32); 4] = [(8, 8), (40, 8), (8, 40), (40, 40)];

    (0..n)
        .map(|i| {
            let mut mask = BinaryMask::new(64, 64);
            let mut points = Vec::with_capacity(ANCHORS.len());
            for (j, (ax, ay)) in ANCHORS.iter().enumerate() {
                let (w, h) = ISOLATED_SIDES[(i + j) % ISOLATED_SIDES.len()];
                let (w, h) = (w as u32, h as u32);
                // Small deterministic jitter so images are not identical.
                let x0 = ax + (i as u32 % 5);
                let y0 = ay + (i as u32 * 3 % 7);
                paint_rect(&mut mask, x0, y0, w, h);
                points.push(center_of(x0, y0, w, h));
            }
            TrainingImage {
                name: format!("train_{i:02}"),
                masks: BTreeMap::from([(category.to_string(), mask)]),
                points: BTreeMap::from([(category.to_string(), points)]),
            }
        })
        .collect()
}

/// Shape of a random scene.
#[derive(Debug, Clone)]
pub struct SceneOptions {
    pub width: u32,
    pub height: u32,
    /// Isolated objects per category.
    pub objects_per_category: usize,
    /// Pairs of objects joined by a thin bridge, per category.
    pub merged_pairs: usize,
    /// One- or two-pixel specks of classifier noise, per category.
    pub noise_specks: usize,
}

impl Default for SceneOptions {
    fn default() -> Self {
        Self {
            width: 96,
            height: 96,
            objects_per_category: 6,
            merged_pairs: 1,
            noise_specks: 3,
        }
    }
}

/// One synthetic image: classified masks plus the true object locations.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub name: String,
    pub masks: BTreeMap<String, BinaryMask>,
    pub truth: BTreeMap<String, Vec<Point>>,
}

impl Scene {
    pub fn to_training_image(&self) -> TrainingImage {
        TrainingImage {
            name: self.name.clone(),
            masks: self.masks.clone(),
            points: self.truth.clone(),
        }
    }
}

/// Rectangles already placed in a scene, shared by all categories.
struct Occupancy {
    width: u32,
    height: u32,
    taken: Vec<(u32, u32, u32, u32)>,
}

impl Occupancy {
    fn overlaps(&self, x: u32, y: u32, w: u32, h: u32) -> bool {
        let m = PLACEMENT_MARGIN;
        self.taken.iter().any(|&(tx, ty, tw, th)| {
            x < tx + tw + m && tx < x + w + m && y < ty + th + m && ty < y + h + m
        })
    }

    fn place<R: Rng>(&mut self, w: u32, h: u32, rng: &mut R) -> Option<(u32, u32)> {
        if w + 2 >= self.width || h + 2 >= self.height {
            return None;
        }
        for _ in 0..PLACEMENT_ATTEMPTS {
            let x = rng.random_range(1..self.width - w - 1);
            let y = rng.random_range(1..self.height - h - 1);
            if !self.overlaps(x, y, w, h) {
                self.taken.push((x, y, w, h));
                return Some((x, y));
            }
        }
        None
    }
}

/// Paints a random scene. Objects that find no free spot are left out, so a
/// crowded scene holds fewer objects than requested.
pub fn random_scene<R: Rng>(
    name: &str,
    categories: &[String],
    options: &SceneOptions,
    rng: &mut R,
) -> Scene {
    let mut scene = Scene {
        name: name.to_string(),
        ..Scene::default()
    };
    let mut occupancy = Occupancy {
        width: options.width,
        height: options.height,
        taken: Vec::new(),
    };

    for category in categories {
        let mut mask = BinaryMask::new(options.width, options.height);
        let mut truth = Vec::new();

        // --- Isolated objects ---
        for _ in 0..options.objects_per_category {
            let (w, h) = ISOLATED_SIDES[rng.random_range(0..ISOLATED_SIDES.len())];
            let (w, h) = (w as u32, h as u32);
            if let Some((x, y)) = occupancy.place(w, h, rng) {
                paint_rect(&mut mask, x, y, w, h);
                truth.push(center_of(x, y, w, h));
            }
        }

        // --- Merged pairs: two objects joined through a one-pixel neck ---
        for _ in 0..options.merged_pairs {
            let (w, h) = ISOLATED_SIDES[rng.random_range(0..ISOLATED_SIDES.len())];
            let (w, h) = (w as u32, h as u32);
            if let Some((x, y)) = occupancy.place(2 * w + 3, h, rng) {
                paint_rect(&mut mask, x, y, w, h);
                paint_rect(&mut mask, x + w + 3, y, w, h);
                paint_rect(&mut mask, x + w, y + h / 2, 3, 1);
                truth.push(center_of(x, y, w, h));
                truth.push(center_of(x + w + 3, y, w, h));
            }
        }

        // --- Noise ---
        for _ in 0..options.noise_specks {
            let w = rng.random_range(1..=2);
            if let Some((x, y)) = occupancy.place(w, 1, rng) {
                paint_rect(&mut mask, x, y, w, 1);
            }
        }

        scene.masks.insert(category.clone(), mask);
        scene.truth.insert(category.clone(), truth);
    }
    scene
}

/// `count` scenes named `<prefix>_NN`, reproducible from `seed`.
pub fn random_batch(
    prefix: &str,
    count: usize,
    categories: &[String],
    options: &SceneOptions,
    seed: u64,
) -> Vec<Scene> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| random_scene(&format!("{prefix}_{i:02}"), categories, options, &mut rng))
        .collect()
}
