//! Percentile Computation
//!
//! Linear interpolation between closest ranks, the same definition spreadsheet
//! tools and numpy use by default.

/// Percentile (0-100) of an already sorted, non-empty slice
pub(crate) fn interpolate(sorted: &[f64], percentile: f64) -> f64 {
    let last = sorted.len() - 1;
    let rank = (percentile.clamp(0.0, 100.0) / 100.0) * last as f64;
    let lower = rank.floor() as usize;
    let upper = (lower + 1).min(last);
    let fraction = rank - lower as f64;

    sorted[lower] + fraction * (sorted[upper] - sorted[lower])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_of_odd_count() {
        let samples = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(interpolate(&samples, 50.0), 3.0);
    }

    #[test]
    fn test_interpolates_between_ranks() {
        // rank = 0.25 * 3 = 0.75 -> 1 + 0.75 * (2 - 1)
        let samples = vec![1.0, 2.0, 3.0, 4.0];
        assert!((interpolate(&samples, 25.0) - 1.75).abs() < 1e-12);
    }

    #[test]
    fn test_quartiles_of_one_to_hundred() {
        let samples: Vec<f64> = (1..=100).map(f64::from).collect();
        assert!((interpolate(&samples, 25.0) - 25.75).abs() < 1e-9);
        assert!((interpolate(&samples, 75.0) - 75.25).abs() < 1e-9);
        assert!((interpolate(&samples, 99.0) - 99.01).abs() < 1e-9);
    }

    #[test]
    fn test_single_sample() {
        assert_eq!(interpolate(&[42.0], 99.0), 42.0);
    }

    #[test]
    fn test_bounds() {
        let samples = vec![1.0, 3.0, 9.0];
        assert_eq!(interpolate(&samples, 0.0), 1.0);
        assert_eq!(interpolate(&samples, 100.0), 9.0);
        assert_eq!(interpolate(&samples, 150.0), 9.0);
    }
}
