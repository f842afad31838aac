use std::collections::HashMap;

use chrono::NaiveDate;
use matchcast::aggregator::TeamSeasonAggregator;
use matchcast::config::PipelineConfig;
use matchcast::features::{FeatureBuilder, FeatureSchema, FeatureVector};
use matchcast::game_log::GameLog;
use matchcast::synthetic::SyntheticLeague;

fn build(log: &GameLog) -> HashMap<String, FeatureVector> {
    let cfg = PipelineConfig::default();
    let agg = TeamSeasonAggregator::from_config(&cfg);
    let builder = FeatureBuilder::new(FeatureSchema::from_aggregator(&agg));
    let index = agg.build(log);
    builder
        .build_training_set(log, &index)
        .expect("no leakage in a clean log")
        .examples
        .into_iter()
        .map(|e| (e.features.game_id.clone(), e.features))
        .collect()
}

#[test]
fn removing_future_games_leaves_past_features_unchanged() {
    let league = SyntheticLeague {
        seasons: vec!["a".to_string(), "b".to_string()],
        games_per_season: 80,
        ..SyntheticLeague::default()
    };
    let (full, _) = GameLog::from_rows(league.generate());
    let dates: Vec<NaiveDate> = full.records().iter().map(|r| r.date).collect();
    let cutoff = dates[dates.len() * 3 / 4];
    let truncated = full.truncated_before(cutoff);
    assert!(truncated.records().len() < full.records().len());

    let with_future = build(&full);
    let without_future = build(&truncated);
    assert!(!without_future.is_empty());
    for (game_id, fv) in &without_future {
        assert_eq!(with_future.get(game_id), Some(fv), "game {game_id} changed");
    }
}

#[test]
fn same_day_games_never_feed_each_other() {
    let league = SyntheticLeague {
        seasons: vec!["a".to_string()],
        games_per_season: 40,
        ..SyntheticLeague::default()
    };
    let (log, _) = GameLog::from_rows(league.generate());
    let cfg = PipelineConfig::default();
    let agg = TeamSeasonAggregator::from_config(&cfg);
    let index = agg.build(&log);
    for r in log.records() {
        for team in [&r.home, &r.away] {
            let snap = index.as_of(team, &r.season, r.date);
            if let Some(as_of) = snap.as_of {
                assert!(as_of < r.date);
            }
        }
    }
}
