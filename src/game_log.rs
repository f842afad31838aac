use std::collections::{BTreeMap, HashMap};
use std::io::Read;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PipelineError, Result};

const KNOWN_COLUMNS: [&str; 8] = [
    "game_id", "date", "season", "team", "opponent", "is_home", "home_away", "score",
];

/// One team's view of one game, as delivered by a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameLogRow {
    pub game_id: String,
    pub date: NaiveDate,
    pub season: String,
    pub team: String,
    pub opponent: String,
    pub is_home: bool,
    #[serde(default)]
    pub score: Option<u32>,
    #[serde(default)]
    pub stats: BTreeMap<String, f64>,
}

/// A finalized game. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub game_id: String,
    pub date: NaiveDate,
    pub season: String,
    pub home: String,
    pub away: String,
    pub home_score: Option<u32>,
    pub away_score: Option<u32>,
    pub home_stats: BTreeMap<String, f64>,
    pub away_stats: BTreeMap<String, f64>,
}

impl GameRecord {
    pub fn is_final(&self) -> bool {
        self.home_score.is_some() && self.away_score.is_some()
    }

    /// Ties count as "home did not win".
    pub fn home_win(&self) -> Option<bool> {
        let (Some(h), Some(a)) = (self.home_score, self.away_score) else {
            return None;
        };
        Some(h > a)
    }

    pub fn side(&self, team: &str) -> Option<Side> {
        if self.home == team {
            Some(Side::Home)
        } else if self.away == team {
            Some(Side::Away)
        } else {
            None
        }
    }

    pub fn stats_for(&self, side: Side) -> &BTreeMap<String, f64> {
        match side {
            Side::Home => &self.home_stats,
            Side::Away => &self.away_stats,
        }
    }

    pub fn score_for(&self, side: Side) -> Option<u32> {
        match side {
            Side::Home => self.home_score,
            Side::Away => self.away_score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Home,
    Away,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Home => Side::Away,
            Side::Away => Side::Home,
        }
    }
}

/// An unplayed game: teams and date only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fixture {
    pub game_id: String,
    pub date: NaiveDate,
    pub season: String,
    pub home: String,
    pub away: String,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeSummary {
    pub rows: usize,
    pub records: usize,
    pub fixtures: usize,
    pub rejected: Vec<String>,
}

/// Normalized historical table: played games sorted by `(date, game_id)` plus fixtures.
#[derive(Debug, Clone, Default)]
pub struct GameLog {
    records: Vec<GameRecord>,
    fixtures: Vec<Fixture>,
}

impl GameLog {
    pub fn new(mut records: Vec<GameRecord>, mut fixtures: Vec<Fixture>) -> Self {
        records.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.game_id.cmp(&b.game_id)));
        fixtures.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.game_id.cmp(&b.game_id)));
        Self { records, fixtures }
    }

    /// Pairs team-game rows into games. A later row for the same `(game_id, team)`
    /// replaces an earlier one, so re-ingesting a season is idempotent.
    pub fn from_rows(rows: Vec<GameLogRow>) -> (Self, NormalizeSummary) {
        let mut summary = NormalizeSummary {
            rows: rows.len(),
            ..NormalizeSummary::default()
        };

        let mut order: Vec<String> = Vec::new();
        let mut by_game: HashMap<String, Vec<GameLogRow>> = HashMap::new();
        for row in rows {
            let entry = by_game.entry(row.game_id.clone()).or_insert_with(|| {
                order.push(row.game_id.clone());
                Vec::new()
            });
            if let Some(existing) = entry.iter_mut().find(|r| r.team == row.team) {
                *existing = row;
            } else {
                entry.push(row);
            }
        }

        let mut records = Vec::new();
        let mut fixtures = Vec::new();
        for game_id in order {
            let Some(group) = by_game.remove(&game_id) else {
                continue;
            };
            match pair_rows(&game_id, group) {
                Ok(Paired::Record(r)) => records.push(r),
                Ok(Paired::Fixture(f)) => fixtures.push(f),
                Err(reason) => {
                    warn!(game_id = %game_id, %reason, "rejected game log rows");
                    summary.rejected.push(format!("{game_id}: {reason}"));
                }
            }
        }

        summary.records = records.len();
        summary.fixtures = fixtures.len();
        (Self::new(records, fixtures), summary)
    }

    pub fn records(&self) -> &[GameRecord] {
        &self.records
    }

    pub fn fixtures(&self) -> &[Fixture] {
        &self.fixtures
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.fixtures.is_empty()
    }

    /// Seasons ordered by their first game date, oldest first.
    pub fn seasons(&self) -> Vec<String> {
        let mut first: BTreeMap<String, NaiveDate> = BTreeMap::new();
        for r in &self.records {
            first
                .entry(r.season.clone())
                .and_modify(|d| *d = (*d).min(r.date))
                .or_insert(r.date);
        }
        for f in &self.fixtures {
            first
                .entry(f.season.clone())
                .and_modify(|d| *d = (*d).min(f.date))
                .or_insert(f.date);
        }
        let mut seasons: Vec<(String, NaiveDate)> = first.into_iter().collect();
        seasons.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        seasons.into_iter().map(|(s, _)| s).collect()
    }

    /// Copy of the log without any game dated on or after `cutoff`.
    pub fn truncated_before(&self, cutoff: NaiveDate) -> Self {
        Self {
            records: self
                .records
                .iter()
                .filter(|r| r.date < cutoff)
                .cloned()
                .collect(),
            fixtures: self
                .fixtures
                .iter()
                .filter(|f| f.date < cutoff)
                .cloned()
                .collect(),
        }
    }
}

enum Paired {
    Record(GameRecord),
    Fixture(Fixture),
}

fn pair_rows(game_id: &str, group: Vec<GameLogRow>) -> std::result::Result<Paired, String> {
    if group.len() > 2 {
        return Err(format!("{} teams reported for one game", group.len()));
    }
    let home = group.iter().find(|r| r.is_home);
    let away = group.iter().find(|r| !r.is_home);

    match (home, away) {
        (Some(h), Some(a)) => {
            if h.team != a.opponent || a.team != h.opponent {
                return Err(format!(
                    "team/opponent mismatch ({} vs {}, {} vs {})",
                    h.team, h.opponent, a.team, a.opponent
                ));
            }
            if h.date != a.date || h.season != a.season {
                return Err("home and away rows disagree on date or season".to_string());
            }
            match (h.score, a.score) {
                (Some(hs), Some(as_)) => Ok(Paired::Record(GameRecord {
                    game_id: game_id.to_string(),
                    date: h.date,
                    season: h.season.clone(),
                    home: h.team.clone(),
                    away: a.team.clone(),
                    home_score: Some(hs),
                    away_score: Some(as_),
                    home_stats: h.stats.clone(),
                    away_stats: a.stats.clone(),
                })),
                (None, None) => Ok(Paired::Fixture(fixture_from(game_id, h))),
                _ => Err("only one side reports a final score".to_string()),
            }
        }
        (Some(row), None) | (None, Some(row)) => {
            if row.score.is_some() {
                return Err("played game is missing the opponent's row".to_string());
            }
            let mut f = fixture_from(game_id, row);
            if !row.is_home {
                std::mem::swap(&mut f.home, &mut f.away);
            }
            Ok(Paired::Fixture(f))
        }
        (None, None) => Err("no rows".to_string()),
    }
}

fn fixture_from(game_id: &str, row: &GameLogRow) -> Fixture {
    Fixture {
        game_id: game_id.to_string(),
        date: row.date,
        season: row.season.clone(),
        home: row.team.clone(),
        away: row.opponent.clone(),
    }
}

/// Parses a JSON array of rows. `null` or an empty body yields no rows.
pub fn parse_json_rows(raw: &str) -> Result<Vec<GameLogRow>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str::<Vec<GameLogRow>>(trimmed)?)
}

/// Parses wide CSV: the fixed columns plus one numeric column per statistic.
/// Empty stat cells are left out of the row rather than recorded as zero.
pub fn parse_csv_rows<R: Read>(reader: R) -> Result<Vec<GameLogRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();
    let col = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));

    let required = |name: &str| {
        col(name).ok_or_else(|| PipelineError::InvalidRow(format!("missing column {name}")))
    };
    let i_game = required("game_id")?;
    let i_date = required("date")?;
    let i_season = required("season")?;
    let i_team = required("team")?;
    let i_opp = required("opponent")?;
    let i_home = col("is_home").or_else(|| col("home_away")).ok_or_else(|| {
        PipelineError::InvalidRow("missing column is_home or home_away".to_string())
    })?;
    let i_score = col("score");

    let stat_cols: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !KNOWN_COLUMNS.iter().any(|k| h.eq_ignore_ascii_case(k)))
        .map(|(i, h)| (i, h.to_ascii_lowercase()))
        .collect();

    let mut out = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("").trim();
        let date = parse_date(field(i_date)).ok_or_else(|| {
            PipelineError::InvalidRow(format!("line {}: bad date {:?}", line + 2, field(i_date)))
        })?;
        let is_home = parse_home_flag(field(i_home)).ok_or_else(|| {
            PipelineError::InvalidRow(format!(
                "line {}: bad home flag {:?}",
                line + 2,
                field(i_home)
            ))
        })?;
        let score = match i_score.map(field) {
            None | Some("") => None,
            Some(s) => Some(s.parse::<u32>().map_err(|_| {
                PipelineError::InvalidRow(format!("line {}: bad score {s:?}", line + 2))
            })?),
        };

        let mut stats = BTreeMap::new();
        for (i, name) in &stat_cols {
            if let Some(v) = parse_stat_cell(field(*i)) {
                stats.insert(name.clone(), v);
            }
        }

        out.push(GameLogRow {
            game_id: field(i_game).to_string(),
            date,
            season: field(i_season).to_string(),
            team: field(i_team).to_string(),
            opponent: field(i_opp).to_string(),
            is_home,
            score,
            stats,
        });
    }
    Ok(out)
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    let head = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

fn parse_home_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "h" | "home" => Some(true),
        "0" | "false" | "a" | "away" => Some(false),
        _ => None,
    }
}

fn parse_stat_cell(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.is_empty() || s == "-" {
        return None;
    }
    let s = s.trim_end_matches('%').replace(',', "");
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}
