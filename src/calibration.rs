use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::model::clamp_prob;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub samples: usize,
    pub brier: f64,
    pub log_loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub bucket_start: f64,
    pub bucket_end: f64,
    pub count: usize,
    pub avg_pred: f64,
    pub actual_rate: f64,
}

impl Metrics {
    pub fn empty() -> Self {
        Self {
            samples: 0,
            brier: 0.0,
            log_loss: 0.0,
            accuracy: 0.0,
        }
    }
}

/// `outcomes` are 1.0 for a home win and 0.0 otherwise. A probability of exactly
/// 0.5 counts as a home pick.
pub fn evaluate_probs(predictions: &[f64], outcomes: &[f64]) -> Metrics {
    let weights = vec![1.0; predictions.len()];
    evaluate_probs_weighted(predictions, outcomes, &weights)
}

pub fn evaluate_probs_weighted(predictions: &[f64], outcomes: &[f64], weights: &[f64]) -> Metrics {
    if predictions.is_empty()
        || predictions.len() != outcomes.len()
        || predictions.len() != weights.len()
    {
        return Metrics::empty();
    }

    let mut brier_sum = 0.0_f64;
    let mut log_loss_sum = 0.0_f64;
    let mut correct = 0.0_f64;
    let mut weight_sum = 0.0_f64;

    for ((p, y), w_raw) in predictions.iter().zip(outcomes).zip(weights) {
        let w = (*w_raw).max(1e-9);
        weight_sum += w;
        brier_sum += w * (p - y).powi(2);

        let actual_prob = if *y >= 0.5 { *p } else { 1.0 - p }.clamp(1e-12, 1.0);
        log_loss_sum += -w * actual_prob.ln();

        if (*p >= 0.5) == (*y >= 0.5) {
            correct += w;
        }
    }

    let n = weight_sum.max(1e-9);
    Metrics {
        samples: predictions.len(),
        brier: brier_sum / n,
        log_loss: log_loss_sum / n,
        accuracy: correct / n,
    }
}

/// Share of home wins; 0.5 when there are no outcomes.
pub fn base_rate(outcomes: &[f64]) -> f64 {
    if outcomes.is_empty() {
        return 0.5;
    }
    outcomes.iter().sum::<f64>() / outcomes.len() as f64
}

/// Reliability table over `bins` equal-width probability buckets.
pub fn calibration_bins(predictions: &[f64], outcomes: &[f64], bins: usize) -> Vec<CalibrationBin> {
    let bins = bins.max(2);
    let mut counts = vec![0usize; bins];
    let mut pred_sum = vec![0.0_f64; bins];
    let mut actual_sum = vec![0.0_f64; bins];

    for (p, y) in predictions.iter().zip(outcomes) {
        let p = p.clamp(0.0, 1.0);
        let idx = ((p * bins as f64).floor() as usize).min(bins - 1);
        counts[idx] += 1;
        pred_sum[idx] += p;
        actual_sum[idx] += y;
    }

    (0..bins)
        .map(|i| {
            let count = counts[i];
            let (avg_pred, actual_rate) = if count > 0 {
                (pred_sum[i] / count as f64, actual_sum[i] / count as f64)
            } else {
                (0.0, 0.0)
            };
            CalibrationBin {
                bucket_start: i as f64 / bins as f64,
                bucket_end: (i + 1) as f64 / bins as f64,
                count,
                avg_pred,
                actual_rate,
            }
        })
        .collect()
}

/// Monotone map from raw model score to calibrated probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationMap {
    /// Block centres (ascending raw scores) and pooled outcome rates
    /// (non-decreasing). Linear between centres, flat outside them.
    Isotonic {
        breakpoints: Vec<f64>,
        values: Vec<f64>,
    },
    Identity,
}

impl CalibrationMap {
    pub fn apply(&self, raw: f64) -> f64 {
        let raw = if raw.is_finite() { raw } else { 0.5 };
        match self {
            Self::Identity => clamp_prob(raw),
            Self::Isotonic {
                breakpoints,
                values,
            } => {
                let (Some(first), Some(last)) = (breakpoints.first(), breakpoints.last()) else {
                    return clamp_prob(raw);
                };
                if raw <= *first {
                    return clamp_prob(values[0]);
                }
                if raw >= *last {
                    return clamp_prob(values[values.len() - 1]);
                }
                let hi = breakpoints.partition_point(|b| *b <= raw);
                let lo = hi - 1;
                let span = breakpoints[hi] - breakpoints[lo];
                let t = if span > 0.0 {
                    (raw - breakpoints[lo]) / span
                } else {
                    0.0
                };
                clamp_prob(values[lo] + t * (values[hi] - values[lo]))
            }
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CalibrationStatus {
    Fitted {
        samples: usize,
        blocks: usize,
        raw_brier: f64,
        calibrated_brier: f64,
    },
    /// Too little or one-sided validation data; raw scores pass through.
    Degenerate { samples: usize, positives: usize },
    /// Cross-validated isotonic scores did not beat the raw scores; raw scores
    /// pass through.
    Rejected {
        samples: usize,
        raw_brier: f64,
        calibrated_brier: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFit {
    pub map: CalibrationMap,
    pub status: CalibrationStatus,
}

pub const DEFAULT_MIN_BLOCK: usize = 10;
pub const DEFAULT_FOLDS: usize = 5;
/// Out-of-fold Brier gain required before an isotonic map replaces raw scores.
pub const DEFAULT_MIN_GAIN: f64 = 1e-3;

#[derive(Debug, Clone, Copy)]
pub struct Calibrator {
    min_samples: usize,
    min_block: usize,
    folds: usize,
    min_gain: f64,
}

impl Calibrator {
    pub fn new(min_samples: usize) -> Self {
        Self {
            min_samples: min_samples.max(2),
            min_block: DEFAULT_MIN_BLOCK,
            folds: DEFAULT_FOLDS,
            min_gain: DEFAULT_MIN_GAIN,
        }
    }

    /// Smallest number of samples an isotonic block may hold.
    pub fn with_min_block(mut self, min_block: usize) -> Self {
        self.min_block = min_block.max(1);
        self
    }

    /// Errors with `CalibrationDegenerate` when the data cannot support a fit.
    pub fn check(&self, raw_scores: &[f64], outcomes: &[f64]) -> Result<()> {
        let samples = raw_scores.len().min(outcomes.len());
        let positives = outcomes.iter().filter(|y| **y >= 0.5).count();
        if samples < self.min_samples || positives == 0 || positives == samples {
            return Err(PipelineError::CalibrationDegenerate { samples, positives });
        }
        Ok(())
    }

    /// Fits an isotonic map on held-out raw scores. Degenerate input falls back to
    /// the identity map with a warning instead of failing the run. The map is kept
    /// only if its out-of-fold Brier score beats the raw scores by `min_gain`.
    pub fn fit(&self, raw_scores: &[f64], outcomes: &[f64]) -> CalibrationFit {
        let samples = raw_scores.len().min(outcomes.len());
        if let Err(err) = self.check(raw_scores, outcomes) {
            warn!(error = %err, "calibration skipped; using raw scores");
            let positives = outcomes.iter().filter(|y| **y >= 0.5).count();
            return CalibrationFit {
                map: CalibrationMap::Identity,
                status: CalibrationStatus::Degenerate { samples, positives },
            };
        }
        let raw_scores = &raw_scores[..samples];
        let outcomes = &outcomes[..samples];

        let raw_probs: Vec<f64> = raw_scores.iter().map(|r| clamp_prob(*r)).collect();
        let raw_brier = evaluate_probs(&raw_probs, outcomes).brier;
        let oof = self.out_of_fold(raw_scores, outcomes);
        let calibrated_brier = evaluate_probs(&oof, outcomes).brier;

        if calibrated_brier + self.min_gain > raw_brier {
            warn!(
                samples,
                raw_brier,
                calibrated_brier,
                "isotonic map does not beat raw scores; using raw scores"
            );
            return CalibrationFit {
                map: CalibrationMap::Identity,
                status: CalibrationStatus::Rejected {
                    samples,
                    raw_brier,
                    calibrated_brier,
                },
            };
        }

        let map = CalibrationMap::isotonic(raw_scores, outcomes, self.min_block);
        let blocks = match &map {
            CalibrationMap::Isotonic { breakpoints, .. } => breakpoints.len(),
            CalibrationMap::Identity => 0,
        };
        info!(samples, blocks, raw_brier, calibrated_brier, "isotonic calibration fitted");
        CalibrationFit {
            map,
            status: CalibrationStatus::Fitted {
                samples,
                blocks,
                raw_brier,
                calibrated_brier,
            },
        }
    }

    /// Each sample is scored by a map fitted without its fold. Folds interleave so
    /// every fold spans the whole date range.
    fn out_of_fold(&self, raw_scores: &[f64], outcomes: &[f64]) -> Vec<f64> {
        let folds = self.folds.min(raw_scores.len()).max(2);
        let mut preds = vec![0.5; raw_scores.len()];
        for fold in 0..folds {
            let (train_x, train_y): (Vec<f64>, Vec<f64>) = raw_scores
                .iter()
                .zip(outcomes)
                .enumerate()
                .filter(|(i, _)| i % folds != fold)
                .map(|(_, (x, y))| (*x, *y))
                .unzip();
            let map = CalibrationMap::isotonic(&train_x, &train_y, self.min_block);
            for (i, raw) in raw_scores.iter().enumerate().skip(fold).step_by(folds) {
                preds[i] = map.apply(*raw);
            }
        }
        preds
    }
}

impl CalibrationMap {
    /// PAVA fit with blocks coarsened to hold at least `min_block` samples.
    pub fn isotonic(raw_scores: &[f64], outcomes: &[f64], min_block: usize) -> Self {
        let blocks = coarsen(pava_blocks(raw_scores, outcomes), min_block as f64);
        if blocks.is_empty() {
            return Self::Identity;
        }
        let (breakpoints, values) = split_blocks(&blocks);
        Self::Isotonic {
            breakpoints,
            values,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Block {
    score_sum: f64,
    label_sum: f64,
    count: f64,
}

impl Block {
    fn mean(&self) -> f64 {
        self.label_sum / self.count
    }

    fn centre(&self) -> f64 {
        self.score_sum / self.count
    }

    fn merge(&mut self, other: Block) {
        self.score_sum += other.score_sum;
        self.label_sum += other.label_sum;
        self.count += other.count;
    }
}

/// Stack-based PAVA. Equal raw scores are pooled first so every breakpoint is
/// distinct.
fn pava_blocks(scores: &[f64], labels: &[f64]) -> Vec<Block> {
    let mut pairs: Vec<(f64, f64)> = scores
        .iter()
        .copied()
        .zip(labels.iter().copied())
        .filter(|(s, _)| s.is_finite())
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut stack: Vec<Block> = Vec::with_capacity(pairs.len());
    for (score, label) in pairs {
        let mut block = Block {
            score_sum: score,
            label_sum: label,
            count: 1.0,
        };
        if let Some(top) = stack.last_mut()
            && top.centre() == score
        {
            top.merge(block);
            block = *top;
            stack.pop();
        }
        while let Some(top) = stack.last()
            && top.mean() >= block.mean()
        {
            let mut merged = *top;
            merged.merge(block);
            block = merged;
            stack.pop();
        }
        stack.push(block);
    }
    stack
}

/// Merges runs of adjacent blocks until each holds `min_count` samples; a short
/// tail joins the last full block. Merged means stay non-decreasing.
fn coarsen(blocks: Vec<Block>, min_count: f64) -> Vec<Block> {
    let mut out: Vec<Block> = Vec::with_capacity(blocks.len());
    let mut pending: Option<Block> = None;
    for block in blocks {
        let acc = match pending.as_mut() {
            Some(acc) => {
                acc.merge(block);
                *acc
            }
            None => block,
        };
        if acc.count >= min_count {
            out.push(acc);
            pending = None;
        } else {
            pending = Some(acc);
        }
    }
    if let Some(rest) = pending {
        match out.last_mut() {
            Some(last) => last.merge(rest),
            None => out.push(rest),
        }
    }
    out
}

fn split_blocks(blocks: &[Block]) -> (Vec<f64>, Vec<f64>) {
    let breakpoints = blocks.iter().map(Block::centre).collect();
    let values = blocks.iter().map(|b| b.mean().clamp(0.0, 1.0)).collect();
    (breakpoints, values)
}
