use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PipelineError, Result};

pub const MAX_EDGE_POINTS: f64 = 50.0;

/// Distance from a coin flip in percentage points: `|p - 0.5| * 100`, in `[0, 50]`.
pub fn edge_points(p: f64) -> f64 {
    ((p - 0.5).abs() * 100.0).min(MAX_EDGE_POINTS)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBucket {
    pub lower: f64,
    pub upper: f64,
    pub grade: String,
    /// Share of favourites that won, filled in by [`BucketTable::evaluate`].
    pub accuracy: Option<f64>,
    pub count: usize,
}

impl ConfidenceBucket {
    fn contains(&self, edge: f64, last: bool) -> bool {
        edge >= self.lower && (edge < self.upper || (last && edge <= self.upper))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonotonicityViolation {
    pub lower_grade: String,
    pub higher_grade: String,
    pub lower_accuracy: f64,
    pub higher_accuracy: f64,
}

/// Contiguous edge buckets over `[0, 50]`, lowest edge first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketTable {
    pub buckets: Vec<ConfidenceBucket>,
}

impl BucketTable {
    /// `thresholds` are the interior cut points; `grades` has one more entry.
    pub fn from_thresholds(thresholds: &[f64], grades: &[String]) -> Result<Self> {
        if grades.len() != thresholds.len() + 1 {
            return Err(PipelineError::Configuration(format!(
                "{} thresholds need {} grades, got {}",
                thresholds.len(),
                thresholds.len() + 1,
                grades.len()
            )));
        }
        let mut bounds = Vec::with_capacity(thresholds.len() + 2);
        bounds.push(0.0);
        bounds.extend_from_slice(thresholds);
        bounds.push(MAX_EDGE_POINTS);

        let buckets = bounds
            .windows(2)
            .zip(grades)
            .map(|(w, grade)| ConfidenceBucket {
                lower: w[0],
                upper: w[1],
                grade: grade.clone(),
                accuracy: None,
                count: 0,
            })
            .collect();
        let table = Self { buckets };
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(PipelineError::Configuration(msg));
        let (Some(first), Some(last)) = (self.buckets.first(), self.buckets.last()) else {
            return err("bucket table is empty".to_string());
        };
        if first.lower != 0.0 || last.upper != MAX_EDGE_POINTS {
            return err(format!(
                "buckets must span [0, {MAX_EDGE_POINTS}], got [{}, {}]",
                first.lower, last.upper
            ));
        }
        for b in &self.buckets {
            if !(b.lower < b.upper) {
                return err(format!("bucket {} is empty: [{}, {})", b.grade, b.lower, b.upper));
            }
        }
        for w in self.buckets.windows(2) {
            if w[0].upper != w[1].lower {
                return err(format!(
                    "buckets {} and {} are not contiguous ({} vs {})",
                    w[0].grade, w[1].grade, w[0].upper, w[1].lower
                ));
            }
        }
        Ok(())
    }

    pub fn index_for(&self, p: f64) -> usize {
        let edge = edge_points(p);
        let last = self.buckets.len().saturating_sub(1);
        self.buckets
            .iter()
            .enumerate()
            .position(|(i, b)| b.contains(edge, i == last))
            .unwrap_or(last)
    }

    pub fn bucket_for(&self, p: f64) -> &ConfidenceBucket {
        &self.buckets[self.index_for(p)]
    }

    pub fn grade_for(&self, p: f64) -> &str {
        &self.bucket_for(p).grade
    }

    /// Copy of the table annotated with the favourite's hit rate per bucket. The
    /// home side is the favourite when `p >= 0.5`.
    pub fn evaluate(&self, probs: &[f64], outcomes: &[f64]) -> Self {
        let mut hits = vec![0usize; self.buckets.len()];
        let mut counts = vec![0usize; self.buckets.len()];
        for (p, y) in probs.iter().zip(outcomes) {
            let i = self.index_for(*p);
            counts[i] += 1;
            if (*p >= 0.5) == (*y >= 0.5) {
                hits[i] += 1;
            }
        }
        let buckets = self
            .buckets
            .iter()
            .enumerate()
            .map(|(i, b)| ConfidenceBucket {
                accuracy: (counts[i] > 0).then(|| hits[i] as f64 / counts[i] as f64),
                count: counts[i],
                ..b.clone()
            })
            .collect();
        Self { buckets }
    }

    /// Pairs where a higher-edge bucket is less accurate than the nearest populated
    /// lower one. Buckets under `min_samples` are ignored. Reported, never fixed.
    pub fn monotonicity_violations(&self, min_samples: usize) -> Vec<MonotonicityViolation> {
        let mut out = Vec::new();
        let mut prev: Option<(&ConfidenceBucket, f64)> = None;
        for b in &self.buckets {
            let Some(acc) = b.accuracy else {
                continue;
            };
            if b.count < min_samples {
                continue;
            }
            if let Some((lower, lower_acc)) = prev
                && acc < lower_acc
            {
                warn!(
                    lower = %lower.grade,
                    higher = %b.grade,
                    lower_accuracy = lower_acc,
                    higher_accuracy = acc,
                    "confidence grades are not monotone"
                );
                out.push(MonotonicityViolation {
                    lower_grade: lower.grade.clone(),
                    higher_grade: b.grade.clone(),
                    lower_accuracy: lower_acc,
                    higher_accuracy: acc,
                });
            }
            prev = Some((b, acc));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_BUCKET_THRESHOLDS, DEFAULT_GRADES};

    fn default_table() -> BucketTable {
        let grades: Vec<String> = DEFAULT_GRADES.iter().map(|g| g.to_string()).collect();
        BucketTable::from_thresholds(&DEFAULT_BUCKET_THRESHOLDS, &grades).unwrap()
    }

    #[test]
    fn every_probability_gets_exactly_one_grade() {
        let table = default_table();
        for i in 0..=1000 {
            let p = i as f64 / 1000.0;
            let edge = edge_points(p);
            let last = table.buckets.len() - 1;
            let matching = table
                .buckets
                .iter()
                .enumerate()
                .filter(|(j, b)| b.contains(edge, *j == last))
                .count();
            assert_eq!(matching, 1, "p={p}");
        }
    }

    #[test]
    fn boundaries_belong_to_the_upper_bucket() {
        let table = default_table();
        assert_eq!(table.grade_for(0.5), "C");
        assert_eq!(table.grade_for(0.55), "C+");
        assert_eq!(table.grade_for(0.33), "B+");
        assert_eq!(table.grade_for(1.0), "A+");
        assert_eq!(table.grade_for(0.0), "A+");
    }

    #[test]
    fn gaps_are_rejected() {
        let mut table = default_table();
        table.buckets[2].lower += 1.0;
        assert!(table.validate().is_err());
        let grades = vec!["C".to_string()];
        assert!(BucketTable::from_thresholds(&[10.0], &grades).is_err());
    }

    #[test]
    fn evaluate_counts_favourite_hits() {
        let table = default_table();
        let probs = [0.52, 0.48, 0.9, 0.1];
        let outcomes = [1.0, 1.0, 1.0, 1.0];
        let eval = table.evaluate(&probs, &outcomes);
        assert_eq!(eval.buckets[0].count, 2);
        assert_eq!(eval.buckets[0].accuracy, Some(0.5));
        assert_eq!(eval.buckets[5].count, 2);
        assert_eq!(eval.buckets[5].accuracy, Some(0.5));
        assert_eq!(eval.buckets[1].accuracy, None);
    }

    #[test]
    fn inverted_accuracy_is_reported() {
        let mut table = default_table();
        table.buckets[0].accuracy = Some(0.6);
        table.buckets[0].count = 40;
        table.buckets[1].accuracy = Some(0.55);
        table.buckets[1].count = 40;
        table.buckets[2].accuracy = Some(0.9);
        table.buckets[2].count = 3;
        let v = table.monotonicity_violations(20);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].lower_grade, "C");
        assert_eq!(v[0].higher_grade, "C+");
    }
}
