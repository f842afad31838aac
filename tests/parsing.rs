use std::fs;
use std::path::PathBuf;

use matchcast::game_log::{GameLog, parse_csv_rows, parse_json_rows};
use matchcast::source::{FallbackSource, FileSource, GameSource, SqliteSource};
use matchcast::store;

fn fixture_dir() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path
}

fn read_fixture(name: &str) -> String {
    fs::read_to_string(fixture_dir().join(name)).expect("fixture file should be readable")
}

#[test]
fn parses_csv_season_fixture() {
    let file = fs::File::open(fixture_dir().join("2023.csv")).expect("fixture should open");
    let rows = parse_csv_rows(file).expect("fixture should parse");
    assert_eq!(rows.len(), 6);
    assert_eq!(rows[0].team, "Rovers");
    assert!(rows[0].is_home);
    assert_eq!(rows[0].score, Some(2));
    assert_eq!(rows[0].stats.get("possession"), Some(&55.0));
    assert!(!rows[1].is_home);
    assert_eq!(rows[2].stats.get("save_pct"), None);
    assert_eq!(rows[4].score, None);
    assert!(rows[4].stats.is_empty());
}

#[test]
fn csv_rows_pair_into_games_and_fixtures() {
    let file = fs::File::open(fixture_dir().join("2023.csv")).expect("fixture should open");
    let (log, summary) = GameLog::from_rows(parse_csv_rows(file).expect("fixture should parse"));
    assert!(summary.rejected.is_empty());
    assert_eq!(log.records().len(), 2);
    assert_eq!(log.fixtures().len(), 1);

    let first = &log.records()[0];
    assert_eq!(first.home, "Rovers");
    assert_eq!(first.away, "Albion");
    assert_eq!(first.home_win(), Some(true));
    let draw = &log.records()[1];
    assert_eq!(draw.home, "Albion");
    assert_eq!(draw.home_win(), Some(false));
}

#[test]
fn parses_json_season_fixture() {
    let raw = read_fixture("2024.json");
    let rows = parse_json_rows(&raw).expect("fixture should parse");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].score, None);
    let (log, summary) = GameLog::from_rows(rows);
    assert!(summary.rejected.is_empty());
    assert_eq!(log.records().len(), 1);
    assert_eq!(log.fixtures().len(), 1);
    assert_eq!(log.fixtures()[0].home, "Albion");
}

#[test]
fn file_source_reads_csv_or_json() {
    let src = FileSource::new(fixture_dir());
    assert_eq!(src.fetch_season("2023").expect("csv season").len(), 6);
    assert_eq!(src.fetch_season("2024").expect("json season").len(), 3);
    assert!(src.fetch_season("2019").is_err());
}

#[test]
fn sqlite_store_backs_up_the_file_source() {
    let db = std::env::temp_dir().join(format!("matchcast_parsing_{}.sqlite", std::process::id()));
    let _ = fs::remove_file(&db);
    {
        let mut conn = store::open_db(&db).expect("open db");
        let rows = FileSource::new(fixture_dir()).fetch_season("2023").expect("csv season");
        assert_eq!(store::upsert_rows(&mut conn, &rows).expect("upsert"), 6);
        // Re-ingesting the same season does not duplicate rows.
        store::upsert_rows(&mut conn, &rows).expect("upsert again");
        assert_eq!(store::load_rows(&conn, None).expect("load").len(), 6);
    }

    let src = FallbackSource::new(
        Box::new(FileSource::new(std::env::temp_dir().join("matchcast_missing_dir"))),
        Some(Box::new(SqliteSource::new(db.clone()))),
    );
    let (rows, fetch) = src.fetch_season_logged("2023").expect("fallback should serve");
    assert_eq!(rows.len(), 6);
    assert!(fetch.fell_back);
    assert_eq!(fetch.source, "sqlite");
    let _ = fs::remove_file(&db);
}
