//! Win-probability models and the persisted trained-model artifact.
//!
//! Every model maps a feature row to `P(home win)`. Inputs are standardized with
//! statistics from the training partition only; the standardizer travels with the
//! model so prediction never recomputes it.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::features::FeatureVector;

pub const PROB_EPS: f64 = 1e-6;

const LR_START: f64 = 0.08;
const LR_DECAY: f64 = 0.003;
const MAX_ITERS: usize = 2200;
const CHECK_EVERY: usize = 20;
const PATIENCE: usize = 20;
const IMPROVEMENT_EPS: f64 = 1e-4;

const STUMP_QUANTILES: usize = 16;
const STUMP_LAMBDA: f64 = 1.0;
const MIN_LEAF_WEIGHT: f64 = 1e-3;

/// One training row: standardized or raw features, 0/1 label, sample weight.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub x: Vec<f64>,
    pub y: f64,
    pub w: f64,
}

pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

pub fn clamp_prob(p: f64) -> f64 {
    p.clamp(PROB_EPS, 1.0 - PROB_EPS)
}

/// Weighted mean log loss; `f64::INFINITY` on an empty set.
pub fn weighted_log_loss(probs: &[f64], samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return f64::INFINITY;
    }
    let mut sum = 0.0;
    let mut wsum = 0.0;
    for (p, s) in probs.iter().zip(samples) {
        let p = clamp_prob(*p);
        let w = s.w.max(1e-6);
        sum += -w * (s.y * p.ln() + (1.0 - s.y) * (1.0 - p).ln());
        wsum += w;
    }
    sum / wsum.max(1e-6)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl Standardizer {
    /// Weighted mean and standard deviation per column; a constant column gets a
    /// floor std so it standardizes to zero.
    pub fn fit(samples: &[Sample]) -> Self {
        let dim = samples.first().map_or(0, |s| s.x.len());
        let mut means = vec![0.0; dim];
        let mut var = vec![0.0; dim];
        let mut wsum = 0.0;

        for s in samples {
            let w = s.w.max(1e-6);
            wsum += w;
            for (m, x) in means.iter_mut().zip(&s.x) {
                *m += w * x;
            }
        }
        if wsum > 0.0 {
            for m in &mut means {
                *m /= wsum;
            }
        }

        for s in samples {
            let w = s.w.max(1e-6);
            for ((v, m), x) in var.iter_mut().zip(&means).zip(&s.x) {
                let d = x - m;
                *v += w * d * d;
            }
        }
        let stds = if wsum > 0.0 {
            var.iter().map(|v| (v / wsum).sqrt().max(1e-6)).collect()
        } else {
            vec![1.0; dim]
        };

        Self { means, stds }
    }

    pub fn transform(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(self.means.iter().zip(&self.stds))
            .map(|(x, (m, s))| (x - m) / s.max(1e-6))
            .collect()
    }

    pub fn transform_samples(&self, samples: &[Sample]) -> Vec<Sample> {
        samples
            .iter()
            .map(|s| Sample {
                x: self.transform(&s.x),
                y: s.y,
                w: s.w,
            })
            .collect()
    }
}

/// L2-regularized logistic regression fitted by weighted gradient descent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub l2: f64,
    pub standardizer: Standardizer,
    pub intercept: f64,
    pub coeffs: Vec<f64>,
}

impl LogisticModel {
    /// Learning rate decays with the iteration count; the validation loss is checked
    /// every few steps and the best coefficients seen are kept.
    pub fn fit(train: &[Sample], validation: &[Sample], l2: f64) -> Self {
        let standardizer = Standardizer::fit(train);
        let train = standardizer.transform_samples(train);
        let val = if validation.is_empty() {
            train.clone()
        } else {
            standardizer.transform_samples(validation)
        };
        let dim = standardizer.means.len();

        let mut intercept = 0.0;
        let mut coeffs = vec![0.0; dim];
        let mut best = (intercept, coeffs.clone());
        let mut best_val = log_loss_for(intercept, &coeffs, &val);
        let mut no_improve = 0usize;
        let mut iters = 0usize;

        for iter in 0..MAX_ITERS {
            iters = iter + 1;
            let mut grad = vec![0.0; dim];
            let mut grad_b = 0.0;
            let mut wsum = 0.0;
            for s in &train {
                let p = sigmoid(intercept + dot(&coeffs, &s.x));
                let w = s.w.max(1e-6);
                let dz = p - s.y;
                wsum += w;
                grad_b += w * dz;
                for (g, x) in grad.iter_mut().zip(&s.x) {
                    *g += w * dz * x;
                }
            }

            let lr = LR_START / (1.0 + iter as f64 * LR_DECAY);
            let wsum = wsum.max(1e-6);
            intercept -= lr * grad_b / wsum;
            for (c, g) in coeffs.iter_mut().zip(&grad) {
                *c -= lr * (g / wsum + l2 * *c);
            }

            if iter % CHECK_EVERY == 0 || iter + 1 == MAX_ITERS {
                let val_ll = log_loss_for(intercept, &coeffs, &val);
                if val_ll + IMPROVEMENT_EPS < best_val {
                    best_val = val_ll;
                    best = (intercept, coeffs.clone());
                    no_improve = 0;
                } else {
                    no_improve += 1;
                    if no_improve >= PATIENCE {
                        break;
                    }
                }
            }
        }
        debug!(l2, iters, val_log_loss = best_val, "logistic fit");

        let (intercept, coeffs) = best;
        Self {
            l2,
            standardizer,
            intercept,
            coeffs,
        }
    }

    pub fn predict(&self, x: &[f64]) -> f64 {
        let z = self.standardizer.transform(x);
        sigmoid(self.intercept + dot(&self.coeffs, &z))
    }
}

fn log_loss_for(intercept: f64, coeffs: &[f64], samples: &[Sample]) -> f64 {
    let probs: Vec<f64> = samples
        .iter()
        .map(|s| sigmoid(intercept + dot(coeffs, &s.x)))
        .collect();
    weighted_log_loss(&probs, samples)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stump {
    pub feature: usize,
    pub threshold: f64,
    /// Log-odds increment (already scaled by the learning rate) for `x <= threshold`.
    pub left: f64,
    pub right: f64,
}

impl Stump {
    fn score(&self, x: &[f64]) -> f64 {
        match x.get(self.feature) {
            Some(v) if *v <= self.threshold => self.left,
            Some(_) => self.right,
            None => 0.0,
        }
    }
}

/// Gradient-boosted depth-1 trees on the logistic loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedStumps {
    pub learning_rate: f64,
    pub base_score: f64,
    pub stumps: Vec<Stump>,
}

impl BoostedStumps {
    pub fn fit(train: &[Sample], rounds: usize, learning_rate: f64) -> Self {
        let wsum: f64 = train.iter().map(|s| s.w.max(1e-6)).sum();
        let pos: f64 = train.iter().map(|s| s.w.max(1e-6) * s.y).sum();
        let base_rate = clamp_prob(if wsum > 0.0 { pos / wsum } else { 0.5 });
        let base_score = (base_rate / (1.0 - base_rate)).ln();

        let dim = train.first().map_or(0, |s| s.x.len());
        let thresholds: Vec<Vec<f64>> = (0..dim)
            .map(|j| quantile_thresholds(train.iter().map(|s| s.x[j]).collect()))
            .collect();

        let mut scores = vec![base_score; train.len()];
        let mut stumps = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            let grads: Vec<(f64, f64)> = train
                .iter()
                .zip(&scores)
                .map(|(s, f)| {
                    let p = sigmoid(*f);
                    let w = s.w.max(1e-6);
                    (w * (s.y - p), w * (p * (1.0 - p)).max(1e-6))
                })
                .collect();

            let best = (0..dim)
                .into_par_iter()
                .filter_map(|j| best_split(train, &grads, j, &thresholds[j]))
                .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.feature.cmp(&a.1.feature)));
            let Some((_, mut stump)) = best else {
                break;
            };
            stump.left *= learning_rate;
            stump.right *= learning_rate;
            for (f, s) in scores.iter_mut().zip(train) {
                *f += stump.score(&s.x);
            }
            stumps.push(stump);
        }
        debug!(rounds = stumps.len(), learning_rate, "boosted stumps fit");

        Self {
            learning_rate,
            base_score,
            stumps,
        }
    }

    pub fn predict(&self, x: &[f64]) -> f64 {
        let z = self.base_score + self.stumps.iter().map(|s| s.score(x)).sum::<f64>();
        sigmoid(z)
    }
}

fn quantile_thresholds(mut values: Vec<f64>) -> Vec<f64> {
    values.retain(|v| v.is_finite());
    values.sort_by(f64::total_cmp);
    if values.len() < 2 {
        return Vec::new();
    }
    let mut out: Vec<f64> = (1..STUMP_QUANTILES)
        .map(|q| values[q * (values.len() - 1) / STUMP_QUANTILES])
        .collect();
    out.dedup();
    out
}

/// Best Newton-step split on feature `j`: `(gain, stump)` with unscaled leaf values.
fn best_split(
    train: &[Sample],
    grads: &[(f64, f64)],
    j: usize,
    thresholds: &[f64],
) -> Option<(f64, Stump)> {
    let (g_total, h_total) = grads
        .iter()
        .fold((0.0, 0.0), |(g, h), (gi, hi)| (g + gi, h + hi));
    let parent = g_total * g_total / (h_total + STUMP_LAMBDA);

    let mut best: Option<(f64, Stump)> = None;
    for t in thresholds {
        let (mut gl, mut hl) = (0.0, 0.0);
        for (s, (g, h)) in train.iter().zip(grads) {
            if s.x[j] <= *t {
                gl += g;
                hl += h;
            }
        }
        let (gr, hr) = (g_total - gl, h_total - hl);
        if hl < MIN_LEAF_WEIGHT || hr < MIN_LEAF_WEIGHT {
            continue;
        }
        let gain = gl * gl / (hl + STUMP_LAMBDA) + gr * gr / (hr + STUMP_LAMBDA) - parent;
        if best.as_ref().is_none_or(|(b, _)| gain > *b) {
            best = Some((
                gain,
                Stump {
                    feature: j,
                    threshold: *t,
                    left: gl / (hl + STUMP_LAMBDA),
                    right: gr / (hr + STUMP_LAMBDA),
                },
            ));
        }
    }
    best
}

/// Fitted parameters of any candidate. `Average` holds its constituents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelParams {
    Logistic(LogisticModel),
    BoostedStumps(BoostedStumps),
    Average { members: Vec<ModelParams> },
}

impl ModelParams {
    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::Logistic(_) => "logistic",
            Self::BoostedStumps(_) => "boosted_stumps",
            Self::Average { .. } => "average",
        }
    }

    pub fn predict(&self, x: &[f64]) -> f64 {
        match self {
            Self::Logistic(m) => m.predict(x),
            Self::BoostedStumps(m) => m.predict(x),
            Self::Average { members } => {
                if members.is_empty() {
                    return 0.5;
                }
                members.iter().map(|m| m.predict(x)).sum::<f64>() / members.len() as f64
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub version: String,
    pub algorithm: String,
    pub train_seasons: Vec<String>,
    pub feature_names: Vec<String>,
    pub params: ModelParams,
    pub trained_at: DateTime<Utc>,
}

impl TrainedModel {
    pub fn new(params: ModelParams, feature_names: Vec<String>, train_seasons: Vec<String>) -> Result<Self> {
        let algorithm = params.algorithm().to_string();
        let version = version_tag(&algorithm, &params, &feature_names, &train_seasons)?;
        Ok(Self {
            version,
            algorithm,
            train_seasons,
            feature_names,
            params,
            trained_at: Utc::now(),
        })
    }

    /// Uncalibrated `P(home win)`, clamped away from 0 and 1. The vector's names
    /// must match the names the model was trained on, in order.
    pub fn raw_score(&self, fv: &FeatureVector) -> Result<f64> {
        if fv.names() != self.feature_names.as_slice() {
            let feature = self
                .feature_names
                .iter()
                .find(|n| !fv.names().contains(n))
                .or_else(|| fv.names().iter().find(|n| !self.feature_names.contains(n)))
                .cloned()
                .unwrap_or_else(|| "feature order".to_string());
            return Err(PipelineError::MissingFeature {
                game_id: fv.game_id.clone(),
                team: "*".to_string(),
                feature,
            });
        }
        Ok(clamp_prob(self.params.predict(fv.values())))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }
}

/// `{algorithm}-{12 hex chars}` over the serialized parameters and feature contract.
fn version_tag(
    algorithm: &str,
    params: &ModelParams,
    feature_names: &[String],
    train_seasons: &[String],
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(params)?);
    hasher.update(feature_names.join(",").as_bytes());
    hasher.update(train_seasons.join(",").as_bytes());
    let digest = hasher.finalize();
    let short: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    Ok(format!("{algorithm}-{short}"))
}

/// Writes pretty JSON to a sibling temp file and renames it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    let raw = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, raw)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
