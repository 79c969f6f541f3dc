// THEORY:
// The `BlobDetector` is the engine of the spatial grouping layer. It implements a
// plain binary connected-component analysis over a classified mask: every positive
// pixel ends up in exactly one 8-connected blob.
//
// Key architectural principles & algorithm steps:
// 1.  **Row-Major Seeding**: The mask is scanned row by row. The first positive pixel
//     that has not been visited yet becomes the seed of a new blob, so the order of
//     the returned blobs is deterministic for a given mask.
// 2.  **Region Growing**: From the seed, the algorithm expands over all eight
//     neighbours (orthogonal and diagonal) using an explicit worklist. Nothing is
//     recursive, so a blob of a million pixels costs heap, never call stack.
// 3.  **Bounded Resources**: Every per-mask buffer (visited flags, worklist, blob
//     pixels, label map) is allocated through `try_reserve`. If the allocator
//     refuses, the labeling of this mask is abandoned with a
//     `LabelError::ResourceExhausted` instead of taking the process down.
// 4.  **Cooperative Cancellation**: The shared `CancelFlag` is checked before each
//     new blob and every `CANCEL_POLL_INTERVAL` pixels inside a traversal. On
//     cancellation the blobs completed so far are returned; a half-grown blob is
//     dropped.
// 5.  **Stateless Utility**: Like the rest of the spatial layer, the detector keeps
//     no state between calls.

use crate::core_modules::binary_mask::{BinaryMask, Point};
use crate::core_modules::blob::Blob;
use crate::core_modules::cancellation::CancelFlag;
use crate::error::LabelError;

pub mod blob_detector {
    use super::*;

    /// How many pixels a traversal pops between two looks at the cancel flag.
    pub const CANCEL_POLL_INTERVAL: usize = 4096;

    const INITIAL_CAPACITY: usize = 64;

    /// The eight neighbours of a pixel.
    const NEIGHBOURS: [(i64, i64); 8] = [
        (-1, -1),
        (0, -1),
        (1, -1),
        (-1, 0),
        (1, 0),
        (-1, 1),
        (0, 1),
        (1, 1),
    ];

    /// The result of labeling one mask.
    #[derive(Debug, Clone, Default)]
    pub struct Labeling {
        /// Completed blobs in seed order.
        pub blobs: Vec<Blob>,
        /// True if the labeling stopped early because the run was cancelled.
        pub cancelled: bool,
    }

    /// Extracts every 8-connected component of positive pixels.
    pub fn label(mask: &BinaryMask, cancel: &CancelFlag) -> Result<Labeling, LabelError> {
        label_with(mask, || cancel.is_cancelled())
    }

    /// Like [`label`], but asks `should_stop` wherever the cancel flag would be polled.
    pub fn label_with(mask: &BinaryMask, should_stop: impl Fn() -> bool) -> Result<Labeling, LabelError> {
        let width = mask.width() as usize;
        let pixels = mask.as_slice();
        let limit = pixels.len();
        let mut visited = filled(limit, false)?;
        let mut worklist: Vec<usize> = Vec::new();
        let mut labeling = Labeling::default();

        for seed in 0..pixels.len() {
            if !pixels[seed] || visited[seed] {
                continue;
            }
            if should_stop() {
                labeling.cancelled = true;
                break;
            }

            // --- Grow the blob from this unvisited seed ---
            visited[seed] = true;
            worklist.clear();
            push(&mut worklist, seed, limit)?;

            let mut blob_pixels = Vec::new();
            let mut popped = 0usize;

            while let Some(current) = worklist.pop() {
                popped += 1;
                if popped % CANCEL_POLL_INTERVAL == 0 && should_stop() {
                    labeling.cancelled = true;
                    return Ok(labeling);
                }

                let x = (current % width) as i64;
                let y = (current / width) as i64;
                push(&mut blob_pixels, Point::new(x as u32, y as u32), limit)?;

                for (dx, dy) in NEIGHBOURS {
                    let nx = x + dx;
                    let ny = y + dy;
                    if !mask.in_bounds(nx, ny) {
                        continue;
                    }
                    let neighbour = ny as usize * width + nx as usize;
                    if pixels[neighbour] && !visited[neighbour] {
                        visited[neighbour] = true;
                        push(&mut worklist, neighbour, limit)?;
                    }
                }
            }

            labeling.blobs.push(Blob::new(blob_pixels));
        }

        Ok(labeling)
    }

    /// Pushes onto `list`, growing it fallibly and never past `max_len` entries.
    pub(crate) fn push<T>(list: &mut Vec<T>, item: T, max_len: usize) -> Result<(), LabelError> {
        let len = list.len();
        if len >= max_len {
            return Err(LabelError::ResourceExhausted { requested: len + 1 });
        }
        if len == list.capacity() {
            let additional = list.capacity().max(INITIAL_CAPACITY).min(max_len - len);
            list.try_reserve(additional)
                .map_err(|_| LabelError::ResourceExhausted {
                    requested: len + additional,
                })?;
        }
        list.push(item);
        Ok(())
    }

    /// A vector of `len` copies of `value`, allocated fallibly.
    fn filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>, LabelError> {
        let mut list = Vec::new();
        list.try_reserve_exact(len)
            .map_err(|_| LabelError::ResourceExhausted { requested: len })?;
        list.resize(len, value);
        Ok(list)
    }

    /// Maps every pixel to the index of the blob that owns it.
    pub fn label_map(width: u32, height: u32, blobs: &[Blob]) -> Result<Vec<Option<usize>>, LabelError> {
        let mut map = filled(width as usize * height as usize, None)?;
        for (blob_index, blob) in blobs.iter().enumerate() {
            for point in &blob.pixels {
                if point.x < width && point.y < height {
                    map[point.y as usize * width as usize + point.x as usize] = Some(blob_index);
                }
            }
        }
        Ok(map)
    }
}
