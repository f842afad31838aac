use std::collections::BTreeMap;
use std::path::Path;

use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, params};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::game_log::GameLogRow;

#[derive(Debug, Clone)]
pub struct IngestRun {
    pub source: String,
    pub seasons_total: usize,
    pub seasons_succeeded: usize,
    pub rows_upserted: usize,
    pub errors: Vec<String>,
}

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let conn = Connection::open(path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS games (
            game_id TEXT NOT NULL,
            team TEXT NOT NULL,
            date TEXT NOT NULL,
            season TEXT NOT NULL,
            opponent TEXT NOT NULL,
            is_home INTEGER NOT NULL,
            score INTEGER NULL,
            stats_json TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (game_id, team)
        );
        CREATE INDEX IF NOT EXISTS idx_games_season ON games(season);
        CREATE INDEX IF NOT EXISTS idx_games_date ON games(date);

        CREATE TABLE IF NOT EXISTS ingest_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            finished_at TEXT NOT NULL,
            source TEXT NOT NULL,
            seasons_total INTEGER NOT NULL,
            seasons_succeeded INTEGER NOT NULL,
            rows_upserted INTEGER NOT NULL,
            errors_json TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

/// Upserts inside one transaction; returns the number of rows written.
pub fn upsert_rows(conn: &mut Connection, rows: &[GameLogRow]) -> Result<usize> {
    let tx = conn.transaction()?;
    let now = Utc::now().to_rfc3339();
    let mut written = 0usize;
    {
        let mut stmt = tx.prepare(
            r#"
            INSERT INTO games (
                game_id, team, date, season, opponent, is_home, score, stats_json, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(game_id, team) DO UPDATE SET
                date = excluded.date,
                season = excluded.season,
                opponent = excluded.opponent,
                is_home = excluded.is_home,
                score = excluded.score,
                stats_json = excluded.stats_json,
                updated_at = excluded.updated_at
            "#,
        )?;
        for row in rows {
            let stats_json = serde_json::to_string(&row.stats)?;
            stmt.execute(params![
                row.game_id,
                row.team,
                row.date.format("%Y-%m-%d").to_string(),
                row.season,
                row.opponent,
                bool_to_i64(row.is_home),
                row.score.map(i64::from),
                stats_json,
                now,
            ])?;
            written += 1;
        }
    }
    tx.commit()?;
    debug!(rows = written, "upserted game log rows");
    Ok(written)
}

/// Loads rows ordered by date then game id, optionally restricted to some seasons.
pub fn load_rows(conn: &Connection, seasons: Option<&[String]>) -> Result<Vec<GameLogRow>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT game_id, team, date, season, opponent, is_home, score, stats_json
        FROM games
        ORDER BY date ASC, game_id ASC, is_home DESC
        "#,
    )?;
    let raw = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, i64>(5)?,
            row.get::<_, Option<i64>>(6)?,
            row.get::<_, String>(7)?,
        ))
    })?;

    let mut out = Vec::new();
    for item in raw {
        let (game_id, team, date, season, opponent, is_home, score, stats_json) = item?;
        if let Some(wanted) = seasons
            && !wanted.iter().any(|s| *s == season)
        {
            continue;
        }
        let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|_| PipelineError::InvalidRow(format!("stored date {date:?}")))?;
        let stats: BTreeMap<String, f64> = serde_json::from_str(&stats_json)?;
        let score = match score {
            Some(s) => Some(
                u32::try_from(s)
                    .map_err(|_| PipelineError::InvalidRow(format!("stored score {s}")))?,
            ),
            None => None,
        };
        out.push(GameLogRow {
            game_id,
            date,
            season,
            team,
            opponent,
            is_home: is_home != 0,
            score,
            stats,
        });
    }
    Ok(out)
}

pub fn record_ingest_run(conn: &Connection, run: &IngestRun) -> Result<i64> {
    let errors_json = serde_json::to_string(&run.errors)?;
    conn.execute(
        "INSERT INTO ingest_runs(finished_at, source, seasons_total, seasons_succeeded, rows_upserted, errors_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            Utc::now().to_rfc3339(),
            run.source,
            run.seasons_total as i64,
            run.seasons_succeeded as i64,
            run.rows_upserted as i64,
            errors_json
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn latest_game_date(conn: &Connection) -> Result<Option<NaiveDate>> {
    let raw = conn.query_row("SELECT MAX(date) FROM games WHERE score IS NOT NULL", [], |row| {
        row.get::<_, Option<String>>(0)
    })?;
    Ok(raw.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()))
}

fn bool_to_i64(v: bool) -> i64 {
    if v { 1 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(game: &str, team: &str, home: bool, score: Option<u32>) -> GameLogRow {
        let mut stats = BTreeMap::new();
        stats.insert("shots".to_string(), 31.0);
        GameLogRow {
            game_id: game.to_string(),
            date: NaiveDate::from_ymd_opt(2023, 10, 12).unwrap(),
            season: "2023".to_string(),
            team: team.to_string(),
            opponent: if team == "A" { "B" } else { "A" }.to_string(),
            is_home: home,
            score,
            stats,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut conn = open_in_memory().unwrap();
        let rows = vec![
            sample_row("g1", "A", true, Some(2)),
            sample_row("g1", "B", false, Some(1)),
        ];
        upsert_rows(&mut conn, &rows).unwrap();
        upsert_rows(&mut conn, &rows).unwrap();
        let loaded = load_rows(&conn, None).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].stats.get("shots"), Some(&31.0));
        assert!(loaded[0].is_home);
    }

    #[test]
    fn load_filters_by_season() {
        let mut conn = open_in_memory().unwrap();
        upsert_rows(&mut conn, &[sample_row("g1", "A", true, None)]).unwrap();
        let other = vec!["2019".to_string()];
        assert!(load_rows(&conn, Some(&other)).unwrap().is_empty());
        assert_eq!(latest_game_date(&conn).unwrap(), None);
    }

    #[test]
    fn ingest_run_is_recorded() {
        let conn = open_in_memory().unwrap();
        let id = record_ingest_run(
            &conn,
            &IngestRun {
                source: "files".to_string(),
                seasons_total: 2,
                seasons_succeeded: 1,
                rows_upserted: 10,
                errors: vec!["season 2020: missing".to_string()],
            },
        )
        .unwrap();
        assert!(id > 0);
    }
}
