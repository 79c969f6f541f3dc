// THEORY:
// Some categories cannot coexist at the same spot: a dead cell detected at a pixel
// means the live-cell detection right next to it is the same object seen wrongly.
// An `ExclusionRule` encodes that as "centroids of `trigger` clear centroids of
// `suppressed` within `radius` pixels".
//
// Rules read their triggers from a snapshot taken before any rule is applied. A
// centroid cleared by one rule still triggers every other rule, so the outcome does
// not depend on rule order, and applying a rule set twice is the same as applying
// it once. Distances are Euclidean: a suppressed centroid is cleared when
// `dx^2 + dy^2 <= radius^2`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core_modules::binary_mask::{BinaryMask, Point};

/// "If `trigger` has a centroid within `radius` of a pixel, suppress `suppressed` there."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRule {
    pub trigger: String,
    pub suppressed: String,
    pub radius: u32,
}

impl ExclusionRule {
    pub fn new(trigger: impl Into<String>, suppressed: impl Into<String>, radius: u32) -> Self {
        Self {
            trigger: trigger.into(),
            suppressed: suppressed.into(),
            radius,
        }
    }
}

/// Applies every rule in place and returns how many centroids each rule cleared,
/// in rule order. Rules naming a category absent from `masks` clear nothing.
pub fn apply(masks: &mut BTreeMap<String, BinaryMask>, rules: &[ExclusionRule]) -> Vec<usize> {
    let triggers: BTreeMap<&str, Vec<_>> = rules
        .iter()
        .filter_map(|rule| {
            masks
                .get(&rule.trigger)
                .map(|mask| (rule.trigger.as_str(), mask.positives()))
        })
        .collect();

    let mut cleared_per_rule = Vec::with_capacity(rules.len());
    for rule in rules {
        let (Some(trigger_points), Some(target)) =
            (triggers.get(rule.trigger.as_str()), masks.get_mut(&rule.suppressed))
        else {
            debug!(trigger = %rule.trigger, suppressed = %rule.suppressed, "exclusion rule skipped");
            cleared_per_rule.push(0);
            continue;
        };

        // Scan whichever is smaller: the disc around each trigger or the suppressed
        // centroids themselves.
        let side = 2 * rule.radius as u64 + 1;
        let suppressed_points = target.positives();
        let cleared = if side.saturating_mul(side) <= suppressed_points.len() as u64 {
            clear_discs(target, trigger_points, rule.radius)
        } else {
            clear_points(target, &suppressed_points, trigger_points, rule.radius)
        };
        cleared_per_rule.push(cleared);
    }
    cleared_per_rule
}

fn within(a: &Point, b: &Point, radius: u32) -> bool {
    let dx = a.x as i128 - b.x as i128;
    let dy = a.y as i128 - b.y as i128;
    dx * dx + dy * dy <= radius as i128 * radius as i128
}

fn clear_discs(target: &mut BinaryMask, triggers: &[Point], radius: u32) -> usize {
    let r = radius as i64;
    let mut cleared = 0;
    for point in triggers {
        for dy in -r..=r {
            for dx in -r..=r {
                if dx * dx + dy * dy > r * r {
                    continue;
                }
                let x = point.x as i64 + dx;
                let y = point.y as i64 + dy;
                if !target.in_bounds(x, y) {
                    continue;
                }
                if target.get(x as u32, y as u32) {
                    target.set(x as u32, y as u32, false);
                    cleared += 1;
                }
            }
        }
    }
    cleared
}

fn clear_points(target: &mut BinaryMask, suppressed: &[Point], triggers: &[Point], radius: u32) -> usize {
    let mut cleared = 0;
    for point in suppressed {
        if triggers.iter().any(|trigger| within(trigger, point, radius)) {
            target.set(point.x, point.y, false);
            cleared += 1;
        }
    }
    cleared
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masks(entries: &[(&str, Vec<Point>)]) -> BTreeMap<String, BinaryMask> {
        entries
            .iter()
            .map(|(name, points)| (name.to_string(), BinaryMask::from_points(30, 30, points)))
            .collect()
    }

    #[test]
    fn clears_within_euclidean_radius_only() {
        let mut m = masks(&[
            ("dead", vec![Point::new(10, 10)]),
            ("live", vec![Point::new(13, 10), Point::new(12, 12), Point::new(13, 13)]),
        ]);
        let cleared = apply(&mut m, &[ExclusionRule::new("dead", "live", 3)]);

        // (13,10) is at 3, (12,12) at ~2.83, (13,13) at ~4.24.
        assert_eq!(cleared, vec![2]);
        assert_eq!(m["live"].positives(), vec![Point::new(13, 13)]);
        assert_eq!(m["dead"].count_positive(), 1);
    }

    #[test]
    fn applying_twice_equals_applying_once() {
        let original = masks(&[
            ("a", vec![Point::new(5, 5), Point::new(20, 20)]),
            ("b", vec![Point::new(6, 6), Point::new(15, 15), Point::new(25, 25)]),
            ("c", vec![Point::new(16, 16), Point::new(5, 6), Point::new(1, 28)]),
        ]);
        let rules = vec![
            ExclusionRule::new("a", "b", 2),
            ExclusionRule::new("b", "c", 2),
            ExclusionRule::new("c", "a", 2),
        ];

        let mut once = original.clone();
        apply(&mut once, &rules);
        let mut twice = once.clone();
        apply(&mut twice, &rules);
        assert_eq!(once, twice);
    }

    #[test]
    fn chained_rules_read_the_pre_exclusion_snapshot() {
        let mut m = masks(&[
            ("a", vec![Point::new(5, 5)]),
            ("b", vec![Point::new(6, 5)]),
            ("c", vec![Point::new(7, 5)]),
        ]);
        // b is cleared by a, yet still clears c.
        apply(
            &mut m,
            &[ExclusionRule::new("a", "b", 1), ExclusionRule::new("b", "c", 1)],
        );
        assert!(m["b"].is_empty());
        assert!(m["c"].is_empty());

        // Rule order does not matter.
        let mut reversed = masks(&[
            ("a", vec![Point::new(5, 5)]),
            ("b", vec![Point::new(6, 5)]),
            ("c", vec![Point::new(7, 5)]),
        ]);
        apply(
            &mut reversed,
            &[ExclusionRule::new("b", "c", 1), ExclusionRule::new("a", "b", 1)],
        );
        assert_eq!(m, reversed);
    }

    #[test]
    fn missing_categories_are_ignored() {
        let mut m = masks(&[("a", vec![Point::new(1, 1)])]);
        let cleared = apply(&mut m, &[ExclusionRule::new("a", "ghost", 5)]);
        assert_eq!(cleared, vec![0]);
        assert_eq!(m["a"].count_positive(), 1);
    }

    #[test]
    fn radius_zero_clears_only_the_same_pixel() {
        let mut m = masks(&[
            ("a", vec![Point::new(3, 3)]),
            ("b", vec![Point::new(3, 3), Point::new(4, 3)]),
        ]);
        apply(&mut m, &[ExclusionRule::new("a", "b", 0)]);
        assert_eq!(m["b"].positives(), vec![Point::new(4, 3)]);
    }

    #[test]
    fn huge_radius_clears_every_suppressed_centroid() {
        let mut m = masks(&[
            ("a", vec![Point::new(0, 0)]),
            ("b", vec![Point::new(29, 29), Point::new(15, 2), Point::new(0, 0)]),
        ]);
        let cleared = apply(&mut m, &[ExclusionRule::new("a", "b", u32::MAX)]);
        assert_eq!(cleared, vec![3]);
        assert!(m["b"].is_empty());
    }

    #[test]
    fn disc_and_point_scans_agree() {
        // Dense enough that radius 1 takes the disc path and radius 40 the point path.
        let dense: Vec<Point> = (0..30).flat_map(|y| (0..30).map(move |x| Point::new(x, y))).collect();
        for radius in [1, 40] {
            let mut m = masks(&[("a", vec![Point::new(10, 10)]), ("b", dense.clone())]);
            let mut expected = m["b"].clone();
            for p in &dense {
                if within(&Point::new(10, 10), p, radius) {
                    expected.set(p.x, p.y, false);
                }
            }
            apply(&mut m, &[ExclusionRule::new("a", "b", radius)]);
            assert_eq!(m["b"], expected, "radius {radius}");
        }
    }
}
