use std::sync::Arc;

use chrono::NaiveDate;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::aggregator::{SnapshotIndex, TeamSeasonAggregator, TeamSnapshot, WIN_KEY, against_key};
use crate::error::{PipelineError, Result};
use crate::game_log::{Fixture, GameLog, GameRecord};

/// Ordered feature names. The order is part of a trained model's contract.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSchema {
    keys: Vec<String>,
    windows: Vec<usize>,
    names: Arc<[String]>,
}

impl FeatureSchema {
    pub fn new(stats: &[String], windows: &[usize]) -> Self {
        let mut keys = Vec::with_capacity(stats.len() * 2 + 1);
        for s in stats {
            keys.push(s.clone());
            keys.push(against_key(s));
        }
        keys.push(WIN_KEY.to_string());

        let mut windows = windows.to_vec();
        windows.sort_unstable();
        windows.dedup();

        let mut names = Vec::new();
        for key in &keys {
            for w in &windows {
                names.push(format!("home_{key}_r{w}"));
                names.push(format!("away_{key}_r{w}"));
                names.push(format!("diff_{key}_r{w}"));
            }
            names.push(format!("diff_{key}_std"));
        }
        names.push("home_games_played".to_string());
        names.push("away_games_played".to_string());

        Self {
            keys,
            windows,
            names: names.into(),
        }
    }

    pub fn from_aggregator(agg: &TeamSeasonAggregator) -> Self {
        Self::new(agg.stats(), agg.window_sizes())
    }

    pub fn names(&self) -> &Arc<[String]> {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub game_id: String,
    pub date: NaiveDate,
    pub season: String,
    names: Arc<[String]>,
    values: Vec<f64>,
    /// Set when some rolling window had fewer games than its length.
    pub low_confidence: bool,
}

impl FeatureVector {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledExample {
    pub features: FeatureVector,
    pub home_win: bool,
}

impl LabeledExample {
    pub fn label(&self) -> f64 {
        if self.home_win { 1.0 } else { 0.0 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainingSet {
    pub examples: Vec<LabeledExample>,
    /// Games left out because a team had no usable history yet.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    schema: FeatureSchema,
}

impl FeatureBuilder {
    pub fn new(schema: FeatureSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Pure: the same snapshots always give the same vector. Both snapshots must
    /// predate `date`.
    pub fn build(
        &self,
        game_id: &str,
        date: NaiveDate,
        season: &str,
        home: &TeamSnapshot,
        away: &TeamSnapshot,
    ) -> Result<FeatureVector> {
        for snap in [home, away] {
            if let Some(as_of) = snap.as_of
                && as_of >= date
            {
                return Err(PipelineError::LeakageViolation {
                    game_id: game_id.to_string(),
                    team: snap.team.clone(),
                    snapshot_date: as_of,
                    game_date: date,
                });
            }
            if snap.games_played == 0 {
                return Err(missing(game_id, &snap.team, "games_played"));
            }
        }

        let mut values = Vec::with_capacity(self.schema.len());
        let mut low_confidence = false;
        for key in &self.schema.keys {
            for w in &self.schema.windows {
                let h = home.window(key, *w);
                let a = away.window(key, *w);
                low_confidence |= h.is_none_or(|v| v.is_partial()) || a.is_none_or(|v| v.is_partial());
                let (h, a, imputed) = paired(h.map(|v| v.mean), a.map(|v| v.mean));
                low_confidence |= imputed;
                values.push(h);
                values.push(a);
                values.push(h - a);
            }
            let (h, a, imputed) = paired(home.season_mean(key), away.season_mean(key));
            low_confidence |= imputed;
            values.push(h - a);
        }
        values.push(home.games_played as f64);
        values.push(away.games_played as f64);

        Ok(FeatureVector {
            game_id: game_id.to_string(),
            date,
            season: season.to_string(),
            names: Arc::clone(self.schema.names()),
            values,
            low_confidence,
        })
    }

    pub fn build_for_record(&self, record: &GameRecord, index: &SnapshotIndex) -> Result<FeatureVector> {
        let home = index.as_of(&record.home, &record.season, record.date);
        let away = index.as_of(&record.away, &record.season, record.date);
        self.build(&record.game_id, record.date, &record.season, &home, &away)
    }

    pub fn build_for_fixture(&self, fixture: &Fixture, index: &SnapshotIndex) -> Result<FeatureVector> {
        let home = index.as_of(&fixture.home, &fixture.season, fixture.date);
        let away = index.as_of(&fixture.away, &fixture.season, fixture.date);
        self.build(&fixture.game_id, fixture.date, &fixture.season, &home, &away)
    }

    /// Labeled examples for every finished game. Games whose teams lack history are
    /// skipped and listed; any other error (leakage above all) aborts.
    pub fn build_training_set(&self, log: &GameLog, index: &SnapshotIndex) -> Result<TrainingSet> {
        let built: Vec<(String, Option<bool>, Result<FeatureVector>)> = log
            .records()
            .par_iter()
            .map(|r| (r.game_id.clone(), r.home_win(), self.build_for_record(r, index)))
            .collect();

        let mut set = TrainingSet::default();
        for (game_id, home_win, result) in built {
            let Some(home_win) = home_win else {
                continue;
            };
            match result {
                Ok(features) => set.examples.push(LabeledExample { features, home_win }),
                Err(PipelineError::MissingFeature { team, feature, .. }) => {
                    debug!(game_id = %game_id, %team, %feature, "skipping game without history");
                    set.skipped.push(game_id);
                }
                Err(err) => return Err(err),
            }
        }
        if !set.skipped.is_empty() {
            warn!(
                skipped = set.skipped.len(),
                "games skipped because a team had not played yet this season"
            );
        }
        info!(
            examples = set.examples.len(),
            skipped = set.skipped.len(),
            features = self.schema.len(),
            "built training set"
        );
        Ok(set)
    }
}

/// A side with no recorded values for a stat borrows the other side's value, so
/// its differential is zero.
fn paired(home: Option<f64>, away: Option<f64>) -> (f64, f64, bool) {
    match (home, away) {
        (Some(h), Some(a)) => (h, a, false),
        (Some(h), None) => (h, h, true),
        (None, Some(a)) => (a, a, true),
        (None, None) => (0.0, 0.0, true),
    }
}

fn missing(game_id: &str, team: &str, feature: &str) -> PipelineError {
    PipelineError::MissingFeature {
        game_id: game_id.to_string(),
        team: team.to_string(),
        feature: feature.to_string(),
    }
}
