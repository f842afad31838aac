use matchcast::calibration::CalibrationStatus;
use matchcast::config::PipelineConfig;
use matchcast::game_log::{GameLog, GameLogRow};
use matchcast::grading::edge_points;
use matchcast::pipeline::{Pipeline, PipelineArtifacts};
use matchcast::synthetic::SyntheticLeague;

fn seasons() -> Vec<String> {
    vec!["s1".to_string(), "s2".to_string(), "s3".to_string()]
}

fn config() -> PipelineConfig {
    PipelineConfig {
        train_seasons: vec!["s1".to_string()],
        validation_season: "s2".to_string(),
        holdout_season: "s3".to_string(),
        ..PipelineConfig::default()
    }
}

fn league_rows(upcoming_rounds: usize) -> Vec<GameLogRow> {
    SyntheticLeague {
        seasons: seasons(),
        games_per_season: 100,
        upcoming_rounds,
        ..SyntheticLeague::default()
    }
    .generate()
}

fn league_log(upcoming_rounds: usize) -> GameLog {
    let (log, summary) = GameLog::from_rows(league_rows(upcoming_rounds));
    assert!(summary.rejected.is_empty());
    log
}

#[test]
fn synthetic_backtest_beats_the_constant_forecast() {
    let pipeline = Pipeline::new(config()).expect("config should validate");
    let outcome = pipeline.run_backtest(&league_log(0)).expect("backtest should run");
    let report = &outcome.report;

    assert_eq!(report.holdout_season, "s3");
    assert_eq!(report.overall.samples, outcome.holdout_examples);
    assert!(outcome.holdout_examples > 80);
    assert!(
        report.overall.accuracy > 0.55,
        "holdout accuracy {:.3}",
        report.overall.accuracy
    );
    assert!(
        report.overall.brier < report.baseline.brier,
        "calibrated brier {:.4} vs baseline {:.4}",
        report.overall.brier,
        report.baseline.brier
    );
    assert!(
        report.overall.brier <= report.uncalibrated.brier,
        "calibrated brier {:.4} vs raw {:.4}",
        report.overall.brier,
        report.uncalibrated.brier
    );
    assert!(!matches!(
        report.calibration_status,
        CalibrationStatus::Degenerate { .. }
    ));
    assert_eq!(
        report.buckets.buckets.iter().map(|b| b.count).sum::<usize>(),
        outcome.holdout_examples
    );
    assert_eq!(report.candidates.iter().filter(|c| c.selected).count(), 1);
}

#[test]
fn backtest_is_reproducible() {
    let pipeline = Pipeline::new(config()).expect("config should validate");
    let log = league_log(0);
    let a = pipeline.run_backtest(&log).expect("first run");
    let b = pipeline.run_backtest(&log).expect("second run");
    assert_eq!(a.artifacts.model.version, b.artifacts.model.version);
    assert_eq!(a.report.overall, b.report.overall);
}

#[test]
fn predictions_are_consistent_and_graded() {
    let pipeline = Pipeline::new(config()).expect("config should validate");
    let log = league_log(1);
    assert_eq!(log.fixtures().len(), 5);
    let outcome = pipeline.run_backtest(&log).expect("backtest should run");

    let path = std::env::temp_dir().join(format!("matchcast_artifacts_{}.json", std::process::id()));
    outcome.artifacts.save(&path).expect("artifacts should save");
    let artifacts = PipelineArtifacts::load(&path).expect("artifacts should load");
    let _ = std::fs::remove_file(&path);

    let summary = pipeline.predict(&log, &artifacts).expect("predict should run");
    assert_eq!(summary.predictions.len(), 5);
    assert!(summary.skipped.is_empty());

    let grades: Vec<&str> = artifacts.buckets.buckets.iter().map(|b| b.grade.as_str()).collect();
    for p in &summary.predictions {
        assert!((p.home_prob + p.away_prob - 1.0).abs() < 1e-12);
        assert!(p.home_prob > 0.0 && p.home_prob < 1.0);
        assert_eq!(p.edge > 0.0, p.home_prob > 0.5);
        assert!((p.edge_points - edge_points(p.home_prob)).abs() < 1e-12);
        assert!(grades.contains(&p.grade.as_str()));
        assert_eq!(p.model_version, artifacts.model.version);
    }
}

#[test]
fn missing_holdout_season_is_a_configuration_error() {
    let cfg = PipelineConfig {
        holdout_season: "s9".to_string(),
        ..config()
    };
    let pipeline = Pipeline::new(cfg).expect("config should validate");
    let err = pipeline.run_backtest(&league_log(0)).unwrap_err();
    assert!(matches!(err, matchcast::PipelineError::Configuration(_)));
}

#[test]
fn stat_missing_from_the_feed_is_named() {
    let mut rows = league_rows(0);
    for row in &mut rows {
        row.stats.remove("save_pct");
    }
    let (log, _) = GameLog::from_rows(rows);
    let pipeline = Pipeline::new(config()).expect("config should validate");
    let err = pipeline.run_backtest(&log).unwrap_err();
    let matchcast::PipelineError::Configuration(msg) = err else {
        panic!("expected a configuration error, got {err:?}");
    };
    assert!(msg.contains("save_pct"), "{msg}");
}
