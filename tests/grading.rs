use matchcast::config::PipelineConfig;
use matchcast::grading::{BucketTable, edge_points};

#[test]
fn configured_buckets_cover_every_edge() {
    let cfg = PipelineConfig::default();
    let table = BucketTable::from_thresholds(&cfg.bucket_thresholds, &cfg.bucket_grades)
        .expect("default buckets are valid");
    table.validate().expect("contiguous");

    let mut last_index = 0;
    for i in 0..=500 {
        let p = 0.5 + i as f64 / 1000.0;
        let idx = table.index_for(p);
        assert!(idx >= last_index, "grade went down at p={p}");
        last_index = idx;
        let b = &table.buckets[idx];
        let e = edge_points(p);
        assert!(e >= b.lower && e <= b.upper);
    }
    assert_eq!(last_index, table.buckets.len() - 1);
}

#[test]
fn grades_are_symmetric_around_a_coin_flip() {
    let cfg = PipelineConfig::default();
    let table = BucketTable::from_thresholds(&cfg.bucket_thresholds, &cfg.bucket_grades)
        .expect("default buckets are valid");
    for p in [0.51, 0.58, 0.64, 0.77, 0.93] {
        assert_eq!(table.grade_for(p), table.grade_for(1.0 - p));
    }
}
