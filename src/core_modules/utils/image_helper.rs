pub mod image_helper {
    use std::collections::BTreeMap;
    use std::path::Path;

    use image::{ImageEncoder, Rgba, RgbaImage};

    use crate::core_modules::binary_mask::{BinaryMask, Point};

    /// Marker colours, assigned to categories in name order and reused cyclically.
    pub const MARKER_PALETTE: [Rgba<u8>; 6] = [
        Rgba([255, 0, 0, 255]),
        Rgba([0, 255, 0, 255]),
        Rgba([0, 128, 255, 255]),
        Rgba([255, 255, 0, 255]),
        Rgba([255, 0, 255, 255]),
        Rgba([0, 255, 255, 255]),
    ];

    const BACKGROUND: Rgba<u8> = Rgba([16, 16, 16, 255]);

    pub fn marker_color(index: usize) -> Rgba<u8> {
        MARKER_PALETTE[index % MARKER_PALETTE.len()]
    }

    pub fn save(path: impl AsRef<Path>, image: &RgbaImage) -> Result<(), image::error::ImageError> {
        let output = std::fs::File::create(path)?;
        let encoder = image::codecs::png::PngEncoder::new(output);

        encoder.write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgba8,
        )?;

        Ok(())
    }

    /// Paints a 3x3 marker centred on `at`, clipped to the image.
    pub fn stamp_marker(image: &mut RgbaImage, at: Point, color: Rgba<u8>) {
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                let x = at.x as i64 + dx;
                let y = at.y as i64 + dy;
                if x >= 0 && y >= 0 && x < image.width() as i64 && y < image.height() as i64 {
                    image.put_pixel(x as u32, y as u32, color);
                }
            }
        }
    }

    /// The original on the left, the original with every category's centroids
    /// stamped on the right.
    pub fn compose_both(original: &RgbaImage, centroids: &BTreeMap<String, Vec<Point>>) -> RgbaImage {
        let width = original.width();
        let mut both = RgbaImage::new(width * 2, original.height());
        image::imageops::replace(&mut both, original, 0, 0);

        let mut annotated = original.clone();
        for (index, points) in centroids.values().enumerate() {
            let color = marker_color(index);
            for point in points {
                stamp_marker(&mut annotated, *point, color);
            }
        }
        image::imageops::replace(&mut both, &annotated, width as i64, 0);
        both
    }

    /// Renders classified masks as a false-colour image, one dimmed palette colour
    /// per category. Returns `None` when there are no masks.
    pub fn render_masks(masks: &BTreeMap<String, BinaryMask>) -> Option<RgbaImage> {
        let first = masks.values().next()?;
        let mut image = RgbaImage::from_pixel(first.width(), first.height(), BACKGROUND);
        for (index, mask) in masks.values().enumerate() {
            let Rgba([r, g, b, _]) = marker_color(index);
            let dimmed = Rgba([r / 2, g / 2, b / 2, 255]);
            for point in mask.positives() {
                if point.x < image.width() && point.y < image.height() {
                    image.put_pixel(point.x, point.y, dimmed);
                }
            }
        }
        Some(image)
    }
}

#[cfg(test)]
mod tests {

    use super::image_helper::*;
    use crate::core_modules::binary_mask::{BinaryMask, Point};
    use image::{Rgba, RgbaImage};
    use std::collections::BTreeMap;

    fn temp_png(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("phenotype_vision_{}_{name}", std::process::id()))
    }

    #[test]
    fn save_gradient_file() {
        let mut image = RgbaImage::new(64, 32);
        for (x, _, pixel) in image.enumerate_pixels_mut() {
            let intensity = (x * 4) as u8;
            *pixel = Rgba([intensity, intensity, intensity, 255]);
        }
        let path = temp_png("gradient.png");

        save(&path, &image).expect("Error Saving File.");

        let loaded = image::open(&path).expect("Error Loading File.").to_rgba8();
        assert_eq!(loaded.dimensions(), (64, 32));
        assert_eq!(loaded.get_pixel(10, 5), &Rgba([40, 40, 40, 255]));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn markers_are_clipped_at_the_corner() {
        let mut image = RgbaImage::new(4, 4);
        stamp_marker(&mut image, Point::new(0, 0), marker_color(0));
        let stamped = image.pixels().filter(|p| **p == marker_color(0)).count();
        assert_eq!(stamped, 4);
    }

    #[test]
    fn both_image_keeps_original_left_and_marks_right() {
        let original = RgbaImage::from_pixel(10, 8, Rgba([1, 2, 3, 255]));
        let centroids = BTreeMap::from([
            ("dead".to_string(), vec![Point::new(2, 2)]),
            ("live".to_string(), vec![Point::new(7, 5)]),
        ]);

        let both = compose_both(&original, &centroids);

        assert_eq!(both.dimensions(), (20, 8));
        assert!(both.enumerate_pixels().filter(|(x, _, _)| *x < 10).all(|(_, _, p)| *p == Rgba([1, 2, 3, 255])));
        assert_eq!(both.get_pixel(10 + 2, 2), &marker_color(0));
        assert_eq!(both.get_pixel(10 + 3, 3), &marker_color(0));
        assert_eq!(both.get_pixel(10 + 7, 5), &marker_color(1));
        assert_eq!(both.get_pixel(10 + 5, 0), &Rgba([1, 2, 3, 255]));
    }

    #[test]
    fn masks_render_in_category_colours() {
        let masks = BTreeMap::from([
            ("a".to_string(), BinaryMask::from_points(6, 6, &[Point::new(1, 1)])),
            ("b".to_string(), BinaryMask::from_points(6, 6, &[Point::new(4, 4)])),
        ]);
        let image = render_masks(&masks).unwrap();
        assert_eq!(image.dimensions(), (6, 6));
        assert_eq!(image.get_pixel(1, 1), &Rgba([127, 0, 0, 255]));
        assert_eq!(image.get_pixel(4, 4), &Rgba([0, 127, 0, 255]));
        assert!(render_masks(&BTreeMap::new()).is_none());
    }
}
