use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::calibration::{
    CalibrationBin, CalibrationMap, CalibrationStatus, Metrics, base_rate, calibration_bins,
    evaluate_probs,
};
use crate::error::Result;
use crate::grading::{BucketTable, MonotonicityViolation};
use crate::model::{read_json, write_json_atomic};
use crate::trainer::CandidateReport;

const RELIABILITY_BINS: usize = 10;

/// Holdout-only evaluation of a trained, calibrated model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub model_version: String,
    pub holdout_season: String,
    /// Calibrated probabilities.
    pub overall: Metrics,
    /// Raw model scores before calibration.
    pub uncalibrated: Metrics,
    /// Constant forecast at the training partition's home-win rate.
    pub baseline: Metrics,
    pub baseline_rate: f64,
    pub buckets: BucketTable,
    pub monotonic_violations: Vec<MonotonicityViolation>,
    pub candidates: Vec<CandidateReport>,
    pub ensemble_underperformed: bool,
    pub calibration_status: CalibrationStatus,
    pub reliability: Vec<CalibrationBin>,
}

pub struct ReportInputs<'a> {
    pub model_version: &'a str,
    pub holdout_season: &'a str,
    pub raw_scores: &'a [f64],
    pub outcomes: &'a [f64],
    pub train_outcomes: &'a [f64],
    pub calibration: &'a CalibrationMap,
    pub calibration_status: &'a CalibrationStatus,
    pub buckets: &'a BucketTable,
    pub min_bucket_samples: usize,
    pub candidates: &'a [CandidateReport],
    pub ensemble_underperformed: bool,
}

impl EvaluationReport {
    pub fn build(inputs: ReportInputs<'_>) -> Self {
        let calibrated: Vec<f64> = inputs
            .raw_scores
            .iter()
            .map(|r| inputs.calibration.apply(*r))
            .collect();
        let rate = base_rate(inputs.train_outcomes);
        let constant = vec![rate; inputs.outcomes.len()];
        let buckets = inputs.buckets.evaluate(&calibrated, inputs.outcomes);
        let monotonic_violations = buckets.monotonicity_violations(inputs.min_bucket_samples);

        Self {
            model_version: inputs.model_version.to_string(),
            holdout_season: inputs.holdout_season.to_string(),
            overall: evaluate_probs(&calibrated, inputs.outcomes),
            uncalibrated: evaluate_probs(inputs.raw_scores, inputs.outcomes),
            baseline: evaluate_probs(&constant, inputs.outcomes),
            baseline_rate: rate,
            buckets,
            monotonic_violations,
            candidates: inputs.candidates.to_vec(),
            ensemble_underperformed: inputs.ensemble_underperformed,
            calibration_status: inputs.calibration_status.clone(),
            reliability: calibration_bins(&calibrated, inputs.outcomes, RELIABILITY_BINS),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Holdout evaluation ({})", self.holdout_season);
        let _ = writeln!(out, "Model: {}", self.model_version);
        let _ = writeln!(out);
        for (label, m) in [
            ("Calibrated", &self.overall),
            ("Raw", &self.uncalibrated),
            ("Baseline", &self.baseline),
        ] {
            let _ = writeln!(
                out,
                "{label:<11} samples={} brier={:.4} log_loss={:.4} accuracy={:.3}",
                m.samples, m.brier, m.log_loss, m.accuracy
            );
        }
        let _ = writeln!(out, "Baseline home-win rate: {:.3}", self.baseline_rate);
        match &self.calibration_status {
            CalibrationStatus::Fitted {
                samples,
                blocks,
                raw_brier,
                calibrated_brier,
            } => {
                let _ = writeln!(
                    out,
                    "Calibration: isotonic, {samples} samples, {blocks} blocks (cv brier {calibrated_brier:.4} vs raw {raw_brier:.4})"
                );
            }
            CalibrationStatus::Degenerate { samples, positives } => {
                let _ = writeln!(
                    out,
                    "Calibration: skipped ({samples} samples, {positives} positives)"
                );
            }
            CalibrationStatus::Rejected {
                samples,
                raw_brier,
                calibrated_brier,
            } => {
                let _ = writeln!(
                    out,
                    "Calibration: rejected, {samples} samples (cv brier {calibrated_brier:.4} vs raw {raw_brier:.4})"
                );
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "Candidates (validation):");
        for c in &self.candidates {
            let _ = writeln!(
                out,
                "  {} {:<40} brier={:.4} log_loss={:.4} accuracy={:.3}",
                if c.selected { "*" } else { " " },
                c.label,
                c.validation.brier,
                c.validation.log_loss,
                c.validation.accuracy
            );
        }
        if self.ensemble_underperformed {
            let _ = writeln!(out, "  note: averaging ensemble underperformed its best member");
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "Confidence grades:");
        for b in &self.buckets.buckets {
            let acc = b
                .accuracy
                .map_or_else(|| "-".to_string(), |a| format!("{:.3}", a));
            let _ = writeln!(
                out,
                "  {:<3} [{:>4.1},{:>4.1}) n={:<5} accuracy={acc}",
                b.grade, b.lower, b.upper, b.count
            );
        }
        for v in &self.monotonic_violations {
            let _ = writeln!(
                out,
                "  warning: {} ({:.3}) is less accurate than {} ({:.3})",
                v.higher_grade, v.higher_accuracy, v.lower_grade, v.lower_accuracy
            );
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "Home-win calibration bins:");
        for bin in self.reliability.iter().filter(|b| b.count > 0) {
            let _ = writeln!(
                out,
                "  [{:.1},{:.1}) n={:<4} pred={:.3} actual={:.3}",
                bin.bucket_start, bin.bucket_end, bin.count, bin.avg_pred, bin.actual_rate
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_scores_holdout_and_renders() {
        let grades: Vec<String> = ["C", "B", "A"].iter().map(|g| g.to_string()).collect();
        let buckets = BucketTable::from_thresholds(&[10.0, 25.0], &grades).unwrap();
        let raw = [0.8, 0.7, 0.3, 0.2, 0.55, 0.45];
        let outcomes = [1.0, 1.0, 0.0, 0.0, 1.0, 0.0];
        let status = CalibrationStatus::Degenerate {
            samples: 6,
            positives: 3,
        };
        let report = EvaluationReport::build(ReportInputs {
            model_version: "logistic-abc",
            holdout_season: "2024",
            raw_scores: &raw,
            outcomes: &outcomes,
            train_outcomes: &[1.0, 0.0],
            calibration: &CalibrationMap::Identity,
            calibration_status: &status,
            buckets: &buckets,
            min_bucket_samples: 1,
            candidates: &[],
            ensemble_underperformed: false,
        });
        assert_eq!(report.overall.samples, 6);
        assert!((report.overall.accuracy - 1.0).abs() < 1e-12);
        assert!(report.overall.brier < report.baseline.brier);
        assert_eq!(report.buckets.buckets.iter().map(|b| b.count).sum::<usize>(), 6);
        let text = report.render_text();
        assert!(text.contains("Holdout evaluation (2024)"));
        assert!(text.contains("Confidence grades:"));
    }
}
