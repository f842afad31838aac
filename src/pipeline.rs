use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregator::TeamSeasonAggregator;
use crate::calibration::{CalibrationFit, Calibrator};
use crate::config::PipelineConfig;
use crate::emitter::{EmitSummary, PredictionEmitter};
use crate::error::Result;
use crate::features::{FeatureBuilder, FeatureSchema, LabeledExample};
use crate::game_log::GameLog;
use crate::grading::BucketTable;
use crate::model::{TrainedModel, read_json, write_json_atomic};
use crate::report::{EvaluationReport, ReportInputs};
use crate::source::{FallbackSource, FetchReport};
use crate::split::TemporalSplitter;
use crate::trainer::ModelTrainer;
use crate::weighting::SampleWeighter;

/// Everything needed to score new fixtures without retraining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineArtifacts {
    pub model: TrainedModel,
    pub calibration: CalibrationFit,
    /// Grade table annotated with holdout accuracy.
    pub buckets: BucketTable,
    pub stats: Vec<String>,
    pub windows: Vec<usize>,
}

impl PipelineArtifacts {
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }
}

#[derive(Debug, Clone)]
pub struct BacktestOutcome {
    pub artifacts: PipelineArtifacts,
    pub report: EvaluationReport,
    pub train_examples: usize,
    pub validation_examples: usize,
    pub holdout_examples: usize,
    /// Games left out of every partition for lack of team history.
    pub skipped_games: usize,
}

pub struct Pipeline {
    config: PipelineConfig,
    aggregator: TeamSeasonAggregator,
    builder: FeatureBuilder,
    splitter: TemporalSplitter,
    weighter: SampleWeighter,
    trainer: ModelTrainer,
    calibrator: Calibrator,
    buckets: BucketTable,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let aggregator = TeamSeasonAggregator::from_config(&config);
        let builder = FeatureBuilder::new(FeatureSchema::from_aggregator(&aggregator));
        let splitter = TemporalSplitter::from_config(&config);
        let weighter = SampleWeighter::new(config.recency_decay)?;
        let trainer = ModelTrainer::from_config(&config);
        let calibrator = Calibrator::new(config.min_calibration_samples)
            .with_min_block(config.calibration_min_block);
        let buckets = BucketTable::from_thresholds(&config.bucket_thresholds, &config.bucket_grades)?;
        Ok(Self {
            config,
            aggregator,
            builder,
            splitter,
            weighter,
            trainer,
            calibrator,
            buckets,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Fetches every configured season and normalizes the rows into a log.
    pub fn load_log(&self, source: &FallbackSource) -> Result<(GameLog, FetchReport)> {
        let (rows, report) = source.fetch_seasons(&self.config.all_seasons())?;
        let (log, summary) = GameLog::from_rows(rows);
        info!(
            rows = summary.rows,
            games = summary.records,
            fixtures = summary.fixtures,
            rejected = summary.rejected.len(),
            "game log normalized"
        );
        Ok((log, report))
    }

    /// Aggregate, build features, split, weight, train, calibrate on validation and
    /// evaluate on the holdout season.
    pub fn run_backtest(&self, log: &GameLog) -> Result<BacktestOutcome> {
        self.aggregator.check_coverage(log)?;
        let index = self.aggregator.build(log);
        let set = self.builder.build_training_set(log, &index)?;
        let split = self.splitter.split(&set.examples)?;
        let weights = self.weighter.weights(&split.train, self.splitter.train_seasons())?;
        let trained = self.trainer.train(&split.train, &weights, &split.validation)?;
        let model = trained.model;

        let val_raw = raw_scores(&model, &split.validation)?;
        let val_y = labels(&split.validation);
        let calibration = self.calibrator.fit(&val_raw, &val_y);

        let hold_raw = raw_scores(&model, &split.holdout)?;
        let hold_y = labels(&split.holdout);
        let train_y = labels(&split.train);
        let report = EvaluationReport::build(ReportInputs {
            model_version: &model.version,
            holdout_season: &self.config.holdout_season,
            raw_scores: &hold_raw,
            outcomes: &hold_y,
            train_outcomes: &train_y,
            calibration: &calibration.map,
            calibration_status: &calibration.status,
            buckets: &self.buckets,
            min_bucket_samples: self.config.min_bucket_samples,
            candidates: &trained.candidates,
            ensemble_underperformed: trained.ensemble_underperformed,
        });
        info!(
            model = %model.version,
            accuracy = report.overall.accuracy,
            brier = report.overall.brier,
            raw_brier = report.uncalibrated.brier,
            baseline_brier = report.baseline.brier,
            "backtest complete"
        );

        Ok(BacktestOutcome {
            train_examples: split.train.len(),
            validation_examples: split.validation.len(),
            holdout_examples: split.holdout.len(),
            skipped_games: set.skipped.len(),
            artifacts: PipelineArtifacts {
                model,
                calibration,
                buckets: report.buckets.clone(),
                stats: self.aggregator.stats().to_vec(),
                windows: self.aggregator.window_sizes().to_vec(),
            },
            report,
        })
    }

    /// Predictions for every unplayed fixture in `log`, using only finished games
    /// dated before each fixture.
    pub fn predict(&self, log: &GameLog, artifacts: &PipelineArtifacts) -> Result<EmitSummary> {
        let aggregator = TeamSeasonAggregator::new(&artifacts.windows, &artifacts.stats);
        aggregator.check_coverage(log)?;
        let builder = FeatureBuilder::new(FeatureSchema::from_aggregator(&aggregator));
        let index = aggregator.build(log);
        let emitter = PredictionEmitter::new(
            &builder,
            &artifacts.model,
            &artifacts.calibration.map,
            &artifacts.buckets,
        );
        emitter.emit_batch(log.fixtures(), &index)
    }
}

fn raw_scores(model: &TrainedModel, examples: &[LabeledExample]) -> Result<Vec<f64>> {
    examples.iter().map(|e| model.raw_score(&e.features)).collect()
}

fn labels(examples: &[LabeledExample]) -> Vec<f64> {
    examples.iter().map(LabeledExample::label).collect()
}
