use chrono::NaiveDate;
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::features::LabeledExample;

/// Assigns examples to partitions by season membership only.
#[derive(Debug, Clone)]
pub struct TemporalSplitter {
    train_seasons: Vec<String>,
    validation_season: String,
    holdout_season: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemporalSplit {
    pub train: Vec<LabeledExample>,
    pub validation: Vec<LabeledExample>,
    pub holdout: Vec<LabeledExample>,
    /// Examples from seasons outside every partition.
    pub unassigned: usize,
}

impl TemporalSplit {
    pub fn date_range(part: &[LabeledExample]) -> Option<(NaiveDate, NaiveDate)> {
        let first = part.iter().map(|e| e.features.date).min()?;
        let last = part.iter().map(|e| e.features.date).max()?;
        Some((first, last))
    }
}

impl TemporalSplitter {
    pub fn new(train_seasons: Vec<String>, validation_season: String, holdout_season: String) -> Self {
        Self {
            train_seasons,
            validation_season,
            holdout_season,
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(
            cfg.train_seasons.clone(),
            cfg.validation_season.clone(),
            cfg.holdout_season.clone(),
        )
    }

    pub fn train_seasons(&self) -> &[String] {
        &self.train_seasons
    }

    /// Partitions are sorted by `(date, game_id)`, so identical input always gives
    /// identical output. Overlapping date ranges are a configuration error.
    pub fn split(&self, examples: &[LabeledExample]) -> Result<TemporalSplit> {
        let mut out = TemporalSplit::default();
        for ex in examples {
            let season = &ex.features.season;
            if self.train_seasons.iter().any(|s| s == season) {
                out.train.push(ex.clone());
            } else if *season == self.validation_season {
                out.validation.push(ex.clone());
            } else if *season == self.holdout_season {
                out.holdout.push(ex.clone());
            } else {
                out.unassigned += 1;
            }
        }
        for part in [&mut out.train, &mut out.validation, &mut out.holdout] {
            part.sort_by(|a, b| {
                a.features
                    .date
                    .cmp(&b.features.date)
                    .then_with(|| a.features.game_id.cmp(&b.features.game_id))
            });
        }

        if out.train.is_empty() || out.validation.is_empty() || out.holdout.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "empty partition: train={} validation={} holdout={}",
                out.train.len(),
                out.validation.len(),
                out.holdout.len()
            )));
        }

        let train = TemporalSplit::date_range(&out.train);
        let val = TemporalSplit::date_range(&out.validation);
        let hold = TemporalSplit::date_range(&out.holdout);
        if let (Some((_, train_max)), Some((val_min, val_max)), Some((hold_min, _))) = (train, val, hold)
            && !(train_max < val_min && val_max < hold_min)
        {
            return Err(PipelineError::Configuration(format!(
                "season boundaries overlap: train ends {train_max}, validation spans {val_min}..{val_max}, holdout starts {hold_min}"
            )));
        }

        info!(
            train = out.train.len(),
            validation = out.validation.len(),
            holdout = out.holdout.len(),
            unassigned = out.unassigned,
            "temporal split"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{TeamSnapshot, WindowValue};
    use crate::features::{FeatureBuilder, FeatureSchema};

    fn example(id: &str, season: &str, y: i32, m: u32, d: u32) -> LabeledExample {
        let schema = FeatureSchema::new(&[], &[1]);
        let builder = FeatureBuilder::new(schema);
        let date = NaiveDate::from_ymd_opt(y, m, d).unwrap();
        let mut snap = TeamSnapshot::empty("A", season);
        snap.games_played = 1;
        snap.as_of = date.pred_opt();
        snap.season_means.insert("win".to_string(), 1.0);
        snap.windows.insert(
            "win".to_string(),
            vec![WindowValue {
                size: 1,
                count: 1,
                mean: 1.0,
            }],
        );
        let fv = builder.build(id, date, season, &snap, &snap).unwrap();
        LabeledExample {
            features: fv,
            home_win: true,
        }
    }

    fn splitter() -> TemporalSplitter {
        TemporalSplitter::new(
            vec!["s1".to_string(), "s2".to_string()],
            "s3".to_string(),
            "s4".to_string(),
        )
    }

    #[test]
    fn split_by_season_and_sorted() {
        let examples = vec![
            example("b", "s1", 2020, 3, 1),
            example("a", "s1", 2020, 2, 1),
            example("c", "s3", 2022, 2, 1),
            example("d", "s4", 2023, 2, 1),
            example("e", "s9", 2019, 2, 1),
        ];
        let split = splitter().split(&examples).unwrap();
        assert_eq!(split.train[0].features.game_id, "a");
        assert_eq!(split.validation.len(), 1);
        assert_eq!(split.holdout.len(), 1);
        assert_eq!(split.unassigned, 1);
    }

    #[test]
    fn overlapping_dates_are_fatal() {
        let examples = vec![
            example("a", "s1", 2022, 6, 1),
            example("c", "s3", 2022, 2, 1),
            example("d", "s4", 2023, 2, 1),
        ];
        let err = splitter().split(&examples).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn split_is_deterministic() {
        let examples = vec![
            example("x", "s2", 2021, 3, 1),
            example("y", "s2", 2021, 3, 1),
            example("c", "s3", 2022, 2, 1),
            example("d", "s4", 2023, 2, 1),
        ];
        let mut reversed = examples.clone();
        reversed.reverse();
        assert_eq!(
            splitter().split(&examples).unwrap(),
            splitter().split(&reversed).unwrap()
        );
    }
}
