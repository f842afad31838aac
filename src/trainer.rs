use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::calibration::{Metrics, evaluate_probs};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::features::LabeledExample;
use crate::model::{BoostedStumps, LogisticModel, ModelParams, Sample, TrainedModel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateSpec {
    Logistic { l2: f64 },
    BoostedStumps { rounds: usize, learning_rate: f64 },
    /// Mean probability of every other fitted candidate.
    Average,
}

impl CandidateSpec {
    pub fn default_list() -> Vec<Self> {
        vec![
            Self::Logistic { l2: 0.06 },
            Self::BoostedStumps {
                rounds: 120,
                learning_rate: 0.1,
            },
            Self::Average,
        ]
    }

    pub fn label(&self) -> String {
        match self {
            Self::Logistic { l2 } => format!("logistic(l2={l2})"),
            Self::BoostedStumps {
                rounds,
                learning_rate,
            } => format!("boosted_stumps(rounds={rounds}, lr={learning_rate})"),
            Self::Average => "average".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateReport {
    pub label: String,
    pub algorithm: String,
    pub validation: Metrics,
    pub selected: bool,
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub model: TrainedModel,
    pub candidates: Vec<CandidateReport>,
    /// The averaging ensemble scored a worse validation log loss than its best member.
    pub ensemble_underperformed: bool,
}

#[derive(Debug, Clone)]
pub struct ModelTrainer {
    candidates: Vec<CandidateSpec>,
    train_seasons: Vec<String>,
}

impl ModelTrainer {
    pub fn new(candidates: Vec<CandidateSpec>, train_seasons: Vec<String>) -> Self {
        Self {
            candidates,
            train_seasons,
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(cfg.candidates.clone(), cfg.train_seasons.clone())
    }

    /// Fits every candidate on `train`, scores each on `validation` and keeps the one
    /// with the lowest validation log loss (earlier candidates win ties).
    pub fn train(
        &self,
        train: &[LabeledExample],
        weights: &[f64],
        validation: &[LabeledExample],
    ) -> Result<TrainingOutcome> {
        if train.is_empty() || validation.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "training needs both partitions: train={} validation={}",
                train.len(),
                validation.len()
            )));
        }
        if weights.len() != train.len() {
            return Err(PipelineError::Configuration(format!(
                "{} weights for {} training examples",
                weights.len(),
                train.len()
            )));
        }
        if self.candidates.is_empty() {
            return Err(PipelineError::Configuration("no model candidates configured".to_string()));
        }

        let feature_names = train[0].features.names().to_vec();
        let train_samples = to_samples(train, Some(weights));
        let val_samples = to_samples(validation, None);

        let fitted: Vec<Option<ModelParams>> = self
            .candidates
            .par_iter()
            .map(|spec| match spec {
                CandidateSpec::Logistic { l2 } => Some(ModelParams::Logistic(LogisticModel::fit(
                    &train_samples,
                    &val_samples,
                    *l2,
                ))),
                CandidateSpec::BoostedStumps {
                    rounds,
                    learning_rate,
                } => Some(ModelParams::BoostedStumps(BoostedStumps::fit(
                    &train_samples,
                    *rounds,
                    *learning_rate,
                ))),
                CandidateSpec::Average => None,
            })
            .collect();

        let members: Vec<ModelParams> = fitted.iter().flatten().cloned().collect();
        let mut models: Vec<(String, ModelParams)> = Vec::with_capacity(self.candidates.len());
        for (spec, params) in self.candidates.iter().zip(fitted) {
            match params {
                Some(p) => models.push((spec.label(), p)),
                None if members.len() >= 2 => models.push((
                    spec.label(),
                    ModelParams::Average {
                        members: members.clone(),
                    },
                )),
                None => warn!("average candidate needs at least two other candidates; skipped"),
            }
        }

        let outcomes: Vec<f64> = validation.iter().map(LabeledExample::label).collect();
        let mut reports: Vec<CandidateReport> = models
            .iter()
            .map(|(label, params)| {
                let probs: Vec<f64> = val_samples.iter().map(|s| params.predict(&s.x)).collect();
                let metrics = evaluate_probs(&probs, &outcomes);
                info!(
                    candidate = %label,
                    accuracy = metrics.accuracy,
                    log_loss = metrics.log_loss,
                    brier = metrics.brier,
                    "validation"
                );
                CandidateReport {
                    label: label.clone(),
                    algorithm: params.algorithm().to_string(),
                    validation: metrics,
                    selected: false,
                }
            })
            .collect();

        let mut best = 0usize;
        for (i, r) in reports.iter().enumerate() {
            if r.validation.log_loss < reports[best].validation.log_loss {
                best = i;
            }
        }
        reports[best].selected = true;

        let best_member = reports
            .iter()
            .filter(|r| r.algorithm != "average")
            .map(|r| r.validation.log_loss)
            .fold(f64::INFINITY, f64::min);
        let mut ensemble_underperformed = false;
        for r in reports.iter().filter(|r| r.algorithm == "average") {
            if r.validation.log_loss > best_member {
                ensemble_underperformed = true;
                warn!(
                    ensemble_log_loss = r.validation.log_loss,
                    best_member_log_loss = best_member,
                    "averaging ensemble underperformed its best member"
                );
            }
        }

        let (label, params) = models.swap_remove(best);
        info!(selected = %label, "model selected");
        let model = TrainedModel::new(params, feature_names, self.train_seasons.clone())?;
        Ok(TrainingOutcome {
            model,
            candidates: reports,
            ensemble_underperformed,
        })
    }
}

fn to_samples(examples: &[LabeledExample], weights: Option<&[f64]>) -> Vec<Sample> {
    examples
        .iter()
        .enumerate()
        .map(|(i, ex)| Sample {
            x: ex.features.values().to_vec(),
            y: ex.label(),
            w: weights.and_then(|w| w.get(i)).copied().unwrap_or(1.0),
        })
        .collect()
}
