use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use matchcast::aggregator::TeamSeasonAggregator;
use matchcast::calibration::Calibrator;
use matchcast::config::PipelineConfig;
use matchcast::features::{FeatureBuilder, FeatureSchema};
use matchcast::game_log::{GameLog, GameLogRow};
use matchcast::synthetic::SyntheticLeague;

fn sample_rows() -> Vec<GameLogRow> {
    SyntheticLeague {
        teams: 20,
        games_per_season: 380,
        ..SyntheticLeague::default()
    }
    .generate()
}

fn bench_game_log_normalize(c: &mut Criterion) {
    let rows = sample_rows();
    c.bench_function("game_log_normalize", |b| {
        b.iter(|| {
            let (log, _) = GameLog::from_rows(black_box(rows.clone()));
            black_box(log.records().len());
        })
    });
}

fn bench_aggregate(c: &mut Criterion) {
    let (log, _) = GameLog::from_rows(sample_rows());
    let agg = TeamSeasonAggregator::from_config(&PipelineConfig::default());
    c.bench_function("aggregate_snapshots", |b| {
        b.iter(|| {
            let index = agg.build(black_box(&log));
            black_box(index.teams());
        })
    });
}

fn bench_training_set(c: &mut Criterion) {
    let (log, _) = GameLog::from_rows(sample_rows());
    let agg = TeamSeasonAggregator::from_config(&PipelineConfig::default());
    let index = agg.build(&log);
    let builder = FeatureBuilder::new(FeatureSchema::from_aggregator(&agg));
    c.bench_function("build_training_set", |b| {
        b.iter(|| {
            let set = builder.build_training_set(black_box(&log), &index).unwrap();
            black_box(set.examples.len());
        })
    });
}

fn bench_isotonic_fit(c: &mut Criterion) {
    let raw: Vec<f64> = (0..2000).map(|i| ((i * 7919) % 2000) as f64 / 2000.0).collect();
    let outcomes: Vec<f64> = raw
        .iter()
        .enumerate()
        .map(|(i, p)| if (i % 10) as f64 / 10.0 < *p { 1.0 } else { 0.0 })
        .collect();
    let calibrator = Calibrator::new(30);
    c.bench_function("isotonic_fit", |b| {
        b.iter(|| {
            let fit = calibrator.fit(black_box(&raw), black_box(&outcomes));
            black_box(fit.map.apply(0.61));
        })
    });
}

criterion_group!(
    perf,
    bench_game_log_normalize,
    bench_aggregate,
    bench_training_set,
    bench_isotonic_fit
);
criterion_main!(perf);
