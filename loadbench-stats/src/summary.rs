//! Summary Statistics
//!
//! One [`Stats`] block describes one flat list of samples. The serialized form is a
//! flat map, `{"max", "mean", "stddev", "25", "50", ...}`, with percentile keys in
//! the order they were requested.

use crate::aggregate::StatsError;
use crate::percentiles::interpolate;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Descriptive statistics of one sample list, rounded to a fixed precision
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    /// Largest sample
    pub max: f64,
    /// Arithmetic mean
    pub mean: f64,
    /// Population standard deviation
    pub stddev: f64,
    /// `(percentile, value)` pairs in request order
    pub percentiles: Vec<(u32, f64)>,
}

impl Stats {
    /// Value of a requested percentile
    pub fn percentile(&self, p: u32) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|(requested, _)| *requested == p)
            .map(|(_, value)| *value)
    }

    /// Key names in serialized order
    pub fn keys(&self) -> Vec<String> {
        let mut keys = vec!["max".to_string(), "mean".to_string(), "stddev".to_string()];
        keys.extend(self.percentiles.iter().map(|(p, _)| p.to_string()));
        keys
    }

    /// Values in serialized order (same order as [`Stats::keys`])
    pub fn values(&self) -> Vec<f64> {
        let mut values = vec![self.max, self.mean, self.stddev];
        values.extend(self.percentiles.iter().map(|(_, v)| *v));
        values
    }
}

/// Round to `precision` decimal places (half away from zero)
pub fn round_to(value: f64, precision: u32) -> f64 {
    let scale = 10f64.powi(i32::try_from(precision).unwrap_or(i32::MAX));
    let rounded = (value * scale).round() / scale;
    if rounded.is_finite() { rounded } else { value }
}

/// Describe a flat, non-empty list of samples
pub fn describe(samples: &[f64], percentiles: &[u32], precision: u32) -> Result<Stats, StatsError> {
    if samples.is_empty() {
        return Err(StatsError::NoDataPoints);
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len() as f64;
    let mean = sorted.iter().sum::<f64>() / n;
    let variance = sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let max = sorted[sorted.len() - 1];

    Ok(Stats {
        max: round_to(max, precision),
        mean: round_to(mean, precision),
        stddev: round_to(variance.sqrt(), precision),
        percentiles: percentiles
            .iter()
            .map(|&p| (p, round_to(interpolate(&sorted, f64::from(p)), precision)))
            .collect(),
    })
}

impl Serialize for Stats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3 + self.percentiles.len()))?;
        map.serialize_entry("max", &self.max)?;
        map.serialize_entry("mean", &self.mean)?;
        map.serialize_entry("stddev", &self.stddev)?;
        for (p, value) in &self.percentiles {
            map.serialize_entry(&p.to_string(), value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Stats {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut raw = BTreeMap::<String, f64>::deserialize(deserializer)?;
        let max = raw.remove("max").ok_or_else(|| D::Error::missing_field("max"))?;
        let mean = raw.remove("mean").ok_or_else(|| D::Error::missing_field("mean"))?;
        let stddev = raw
            .remove("stddev")
            .ok_or_else(|| D::Error::missing_field("stddev"))?;

        let mut percentiles = raw
            .into_iter()
            .map(|(key, value)| {
                key.parse::<u32>()
                    .map(|p| (p, value))
                    .map_err(|_| D::Error::custom(format!("unexpected statistics key `{key}`")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        percentiles.sort_by_key(|(p, _)| *p);

        Ok(Stats {
            max,
            mean,
            stddev,
            percentiles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_PERCENTILES;

    #[test]
    fn test_basic_description() {
        let stats = describe(&[1.0, 2.0, 3.0, 4.0, 5.0], &DEFAULT_PERCENTILES, 2).unwrap();

        assert_eq!(stats.max, 5.0);
        assert_eq!(stats.mean, 3.0);
        // population stddev of 1..=5 is sqrt(2)
        assert_eq!(stats.stddev, 1.41);
        assert_eq!(stats.percentile(50), Some(3.0));
        assert_eq!(stats.percentile(25), Some(2.0));
        assert_eq!(stats.percentile(99), Some(4.96));
    }

    #[test]
    fn test_single_sample_has_zero_spread() {
        let stats = describe(&[7.5], &DEFAULT_PERCENTILES, 2).unwrap();
        assert_eq!(stats.max, 7.5);
        assert_eq!(stats.mean, 7.5);
        assert_eq!(stats.stddev, 0.0);
        assert!(stats.percentiles.iter().all(|(_, v)| *v == 7.5));
    }

    #[test]
    fn test_empty_is_rejected() {
        assert!(matches!(
            describe(&[], &DEFAULT_PERCENTILES, 2),
            Err(StatsError::NoDataPoints)
        ));
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_to(1.23456, 4), 1.2346);
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(-2.5, 0), -3.0);
        assert_eq!(round_to(123_456_789.0, 2), 123_456_789.0);
    }

    #[test]
    fn test_serialized_key_order() {
        let stats = describe(&[1.0, 2.0], &DEFAULT_PERCENTILES, 2).unwrap();
        let json = serde_json::to_string(&stats).unwrap();
        let positions: Vec<usize> = stats
            .keys()
            .iter()
            .map(|k| json.find(&format!("\"{k}\"")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(
            stats.keys(),
            ["max", "mean", "stddev", "25", "50", "75", "90", "95", "99"]
        );
    }

    #[test]
    fn test_deserialize_restores_numeric_order() {
        let json = r#"{"max": 3.0, "mean": 2.0, "stddev": 0.5, "100": 3.0, "5": 1.0, "50": 2.0}"#;
        let stats: Stats = serde_json::from_str(json).unwrap();
        assert_eq!(stats.percentiles, vec![(5, 1.0), (50, 2.0), (100, 3.0)]);
    }

    #[test]
    fn test_deserialize_rejects_unknown_key() {
        let json = r#"{"max": 3.0, "mean": 2.0, "stddev": 0.5, "median": 2.0}"#;
        assert!(serde_json::from_str::<Stats>(json).is_err());
    }
}
