use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregator::SnapshotIndex;
use crate::calibration::CalibrationMap;
use crate::error::Result;
use crate::features::{FeatureBuilder, FeatureVector};
use crate::game_log::Fixture;
use crate::grading::{BucketTable, edge_points};
use crate::model::{TrainedModel, read_json, write_json_atomic};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub game_id: String,
    pub date: NaiveDate,
    pub home: String,
    pub away: String,
    pub home_prob: f64,
    pub away_prob: f64,
    /// `home_prob - 0.5`; positive when the home side is favoured.
    pub edge: f64,
    pub edge_points: f64,
    pub grade: String,
    pub model_version: String,
    /// Some rolling window behind this prediction was not yet full.
    pub low_confidence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFixture {
    pub game_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmitSummary {
    pub predictions: Vec<Prediction>,
    pub skipped: Vec<SkippedFixture>,
}

pub struct PredictionEmitter<'a> {
    builder: &'a FeatureBuilder,
    model: &'a TrainedModel,
    calibration: &'a CalibrationMap,
    buckets: &'a BucketTable,
}

impl<'a> PredictionEmitter<'a> {
    pub fn new(
        builder: &'a FeatureBuilder,
        model: &'a TrainedModel,
        calibration: &'a CalibrationMap,
        buckets: &'a BucketTable,
    ) -> Self {
        Self {
            builder,
            model,
            calibration,
            buckets,
        }
    }

    /// Calibrated prediction for a fixture whose features are already built.
    pub fn emit(&self, fixture: &Fixture, features: &FeatureVector) -> Result<Prediction> {
        let raw = self.model.raw_score(features)?;
        let home_prob = self.calibration.apply(raw);
        let away_prob = 1.0 - home_prob;
        Ok(Prediction {
            game_id: fixture.game_id.clone(),
            date: fixture.date,
            home: fixture.home.clone(),
            away: fixture.away.clone(),
            home_prob,
            away_prob,
            edge: home_prob - 0.5,
            edge_points: edge_points(home_prob),
            grade: self.buckets.grade_for(home_prob).to_string(),
            model_version: self.model.version.clone(),
            low_confidence: features.low_confidence,
        })
    }

    pub fn emit_for_fixture(&self, fixture: &Fixture, index: &SnapshotIndex) -> Result<Prediction> {
        let features = self.builder.build_for_fixture(fixture, index)?;
        self.emit(fixture, &features)
    }

    /// One prediction per game id; a repeated id replaces the earlier entry in place.
    /// Fixtures without enough history are listed in `skipped`. Leakage or any other
    /// fatal error aborts the batch.
    pub fn emit_batch(&self, fixtures: &[Fixture], index: &SnapshotIndex) -> Result<EmitSummary> {
        let results: Vec<(&Fixture, Result<Prediction>)> = fixtures
            .par_iter()
            .map(|f| (f, self.emit_for_fixture(f, index)))
            .collect();

        let mut summary = EmitSummary::default();
        let mut slots: HashMap<String, usize> = HashMap::new();
        for (fixture, result) in results {
            match result {
                Ok(pred) => match slots.get(&pred.game_id) {
                    Some(&slot) => {
                        debug!(game_id = %pred.game_id, "duplicate fixture; keeping the later one");
                        summary.predictions[slot] = pred;
                    }
                    None => {
                        slots.insert(pred.game_id.clone(), summary.predictions.len());
                        summary.predictions.push(pred);
                    }
                },
                Err(err) if !err.is_fatal() => {
                    warn!(game_id = %fixture.game_id, error = %err, "fixture skipped");
                    summary.skipped.push(SkippedFixture {
                        game_id: fixture.game_id.clone(),
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        info!(
            predictions = summary.predictions.len(),
            skipped = summary.skipped.len(),
            "predictions emitted"
        );
        Ok(summary)
    }
}

pub fn write_predictions(path: &Path, predictions: &[Prediction]) -> Result<()> {
    write_json_atomic(path, &predictions)
}

pub fn read_predictions(path: &Path) -> Result<Vec<Prediction>> {
    read_json(path)
}
