// THEORY:
// The `DistributionModel` turns a sample of pure-blob sizes into the three cutoffs
// the classifier lives by. It deliberately avoids parametric fits: the cutoffs are
// order statistics of the sample itself, so whatever shape the size distribution
// has (skewed, bimodal, clipped at the image border) is respected as observed.

use crate::error::DistributionError;

/// Bottom cutoff: smaller blobs are noise.
pub const BOTTOM_PERCENTILE: f64 = 0.02;
/// Mid cutoff, reported for diagnostics and downstream heuristics.
pub const MID_PERCENTILE: f64 = 0.40;
/// Top cutoff: larger blobs are several merged objects.
pub const TOP_PERCENTILE: f64 = 0.95;

/// Percentile summary of one sample of blob pixel counts.
///
/// Invariant: `min <= bottom <= mid <= top <= max`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UnivariateDistribution {
    pub count: usize,
    pub min: usize,
    pub max: usize,
    pub mean: f64,
    pub median: f64,
    pub bottom: usize,
    pub mid: usize,
    pub top: usize,
}

/// Fits a distribution to a non-empty sample of blob sizes.
pub fn fit(sizes: &[usize]) -> Result<UnivariateDistribution, DistributionError> {
    if sizes.is_empty() {
        return Err(DistributionError::EmptySample);
    }

    let mut sorted = sizes.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();

    let median = if n % 2 == 1 {
        sorted[n / 2] as f64
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) as f64 / 2.0
    };
    let mean = sorted.iter().sum::<usize>() as f64 / n as f64;

    Ok(UnivariateDistribution {
        count: n,
        min: sorted[0],
        max: sorted[n - 1],
        mean,
        median,
        bottom: order_statistic(&sorted, BOTTOM_PERCENTILE),
        mid: order_statistic(&sorted, MID_PERCENTILE),
        top: order_statistic(&sorted, TOP_PERCENTILE),
    })
}

/// Nearest-rank percentile of a sorted, non-empty sample.
fn order_statistic(sorted: &[usize], percentile: f64) -> usize {
    let rank = (percentile * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sample_is_an_error() {
        assert_eq!(fit(&[]), Err(DistributionError::EmptySample));
    }

    #[test]
    fn single_value_collapses_every_cutoff() {
        let d = fit(&[17]).unwrap();
        assert_eq!((d.bottom, d.mid, d.top), (17, 17, 17));
        assert_eq!(d.median, 17.0);
    }

    #[test]
    fn small_samples_span_min_to_max() {
        let d = fit(&[30, 21, 25, 22, 28, 24, 26, 23, 29, 27]).unwrap();
        assert_eq!(d.bottom, 21);
        assert_eq!(d.mid, 24);
        assert_eq!(d.top, 30);
        assert_eq!(d.median, 25.5);
        assert_eq!(d.mean, 25.5);
    }

    #[test]
    fn cutoffs_are_ordered_for_many_samples() {
        let mut seed = 12345u64;
        for len in 1..200 {
            let sample: Vec<usize> = (0..len)
                .map(|_| {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    (seed >> 40) as usize % 500
                })
                .collect();
            let d = fit(&sample).unwrap();
            assert!(d.min <= d.bottom);
            assert!(d.bottom <= d.mid);
            assert!(d.mid <= d.top);
            assert!(d.top <= d.max);
        }
    }

    #[test]
    fn large_sample_reads_the_expected_ranks() {
        let sample: Vec<usize> = (1..=100).collect();
        let d = fit(&sample).unwrap();
        assert_eq!(d.bottom, 2);
        assert_eq!(d.mid, 40);
        assert_eq!(d.top, 95);
    }
}
