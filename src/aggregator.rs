//! Season-to-date and rolling-window team statistics.
//!
//! Each team's games are folded strictly in date order, one season at a time.
//! After every game a [`TeamSnapshot`] is recorded; lookups "as of" a date return
//! the newest snapshot whose last folded game is strictly earlier than that date,
//! so a game never sees itself or anything played the same day.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::NaiveDate;
use rayon::prelude::*;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::game_log::{GameLog, GameRecord};

pub const WIN_KEY: &str = "win";
pub const GOALS_KEY: &str = "goals";
const AGAINST_SUFFIX: &str = "_against";

/// Fixed-capacity FIFO of the most recent values.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingWindow {
    capacity: usize,
    values: VecDeque<f64>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    /// Mean over whatever has been pushed so far; `None` when empty.
    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    pub fn values(&self) -> impl Iterator<Item = &f64> {
        self.values.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowValue {
    pub size: usize,
    pub count: usize,
    pub mean: f64,
}

impl WindowValue {
    pub fn is_partial(&self) -> bool {
        self.count < self.size
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct RunningTotal {
    sum: f64,
    count: usize,
}

/// Mutable aggregate for one team in one season. Only grows by folding games.
#[derive(Debug, Clone)]
pub struct TeamSeasonState {
    team: String,
    season: String,
    games_played: usize,
    last_game_date: Option<NaiveDate>,
    totals: BTreeMap<String, RunningTotal>,
    windows: BTreeMap<String, Vec<RollingWindow>>,
}

impl TeamSeasonState {
    pub fn new(team: &str, season: &str, keys: &[String], window_sizes: &[usize]) -> Self {
        let windows = keys
            .iter()
            .map(|k| {
                (
                    k.clone(),
                    window_sizes.iter().map(|w| RollingWindow::new(*w)).collect(),
                )
            })
            .collect();
        Self {
            team: team.to_string(),
            season: season.to_string(),
            games_played: 0,
            last_game_date: None,
            totals: BTreeMap::new(),
            windows,
        }
    }

    pub fn games_played(&self) -> usize {
        self.games_played
    }

    pub fn last_game_date(&self) -> Option<NaiveDate> {
        self.last_game_date
    }

    pub fn window(&self, key: &str, idx: usize) -> Option<&RollingWindow> {
        self.windows.get(key).and_then(|w| w.get(idx))
    }

    /// Folds one finished game for this team. Values missing from the game's stat
    /// line are skipped rather than recorded as zero.
    pub fn apply(&mut self, record: &GameRecord, stats: &[String]) {
        let Some(side) = record.side(&self.team) else {
            return;
        };
        let own = record.stats_for(side);
        let opp = record.stats_for(side.opposite());

        let mut observed: Vec<(String, f64)> = Vec::with_capacity(stats.len() * 2 + 1);
        for stat in stats {
            let own_v = own.get(stat).copied().or_else(|| {
                (stat == GOALS_KEY)
                    .then(|| record.score_for(side).map(f64::from))
                    .flatten()
            });
            let opp_v = opp.get(stat).copied().or_else(|| {
                (stat == GOALS_KEY)
                    .then(|| record.score_for(side.opposite()).map(f64::from))
                    .flatten()
            });
            if let Some(v) = own_v {
                observed.push((stat.clone(), v));
            }
            if let Some(v) = opp_v {
                observed.push((against_key(stat), v));
            }
        }
        if let (Some(f), Some(a)) = (record.score_for(side), record.score_for(side.opposite())) {
            observed.push((WIN_KEY.to_string(), if f > a { 1.0 } else { 0.0 }));
        }

        for (key, value) in observed {
            let total = self.totals.entry(key.clone()).or_default();
            total.sum += value;
            total.count += 1;
            if let Some(ws) = self.windows.get_mut(&key) {
                for w in ws.iter_mut() {
                    w.push(value);
                }
            }
        }

        self.games_played += 1;
        self.last_game_date = Some(
            self.last_game_date
                .map_or(record.date, |d| d.max(record.date)),
        );
    }

    pub fn snapshot(&self) -> TeamSnapshot {
        let season_means = self
            .totals
            .iter()
            .filter(|(_, t)| t.count > 0)
            .map(|(k, t)| (k.clone(), t.sum / t.count as f64))
            .collect();
        let windows = self
            .windows
            .iter()
            .map(|(k, ws)| {
                let values = ws
                    .iter()
                    .filter_map(|w| {
                        w.mean().map(|mean| WindowValue {
                            size: w.capacity(),
                            count: w.len(),
                            mean,
                        })
                    })
                    .collect::<Vec<_>>();
                (k.clone(), values)
            })
            .collect();
        TeamSnapshot {
            team: self.team.clone(),
            season: self.season.clone(),
            as_of: self.last_game_date,
            games_played: self.games_played,
            season_means,
            windows,
        }
    }
}

/// Immutable copy of a [`TeamSeasonState`] at one point in the season.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamSnapshot {
    pub team: String,
    pub season: String,
    /// Date of the newest game folded in; `None` before the first game.
    pub as_of: Option<NaiveDate>,
    pub games_played: usize,
    pub season_means: BTreeMap<String, f64>,
    pub windows: BTreeMap<String, Vec<WindowValue>>,
}

impl TeamSnapshot {
    pub fn empty(team: &str, season: &str) -> Self {
        Self {
            team: team.to_string(),
            season: season.to_string(),
            as_of: None,
            games_played: 0,
            season_means: BTreeMap::new(),
            windows: BTreeMap::new(),
        }
    }

    pub fn window(&self, key: &str, size: usize) -> Option<WindowValue> {
        self.windows
            .get(key)
            .and_then(|ws| ws.iter().find(|w| w.size == size).copied())
    }

    pub fn season_mean(&self, key: &str) -> Option<f64> {
        self.season_means.get(key).copied()
    }
}

/// Per (team, season) history of snapshots, one after each folded game.
#[derive(Debug, Clone, Default)]
pub struct SnapshotIndex {
    histories: HashMap<(String, String), Vec<TeamSnapshot>>,
}

impl SnapshotIndex {
    /// State of `team` in `season` using only games dated strictly before `date`.
    /// A team with no earlier games gets an empty snapshot.
    pub fn as_of(&self, team: &str, season: &str, date: NaiveDate) -> TeamSnapshot {
        let Some(history) = self.histories.get(&(team.to_string(), season.to_string())) else {
            return TeamSnapshot::empty(team, season);
        };
        let n = history.partition_point(|s| s.as_of.is_some_and(|d| d < date));
        if n == 0 {
            TeamSnapshot::empty(team, season)
        } else {
            history[n - 1].clone()
        }
    }

    /// Latest state of `team` in `season`, after every folded game.
    pub fn latest(&self, team: &str, season: &str) -> TeamSnapshot {
        self.histories
            .get(&(team.to_string(), season.to_string()))
            .and_then(|h| h.last().cloned())
            .unwrap_or_else(|| TeamSnapshot::empty(team, season))
    }

    pub fn history(&self, team: &str, season: &str) -> &[TeamSnapshot] {
        self.histories
            .get(&(team.to_string(), season.to_string()))
            .map(|h| h.as_slice())
            .unwrap_or(&[])
    }

    pub fn teams(&self) -> usize {
        let mut teams: Vec<&String> = self.histories.keys().map(|(t, _)| t).collect();
        teams.sort();
        teams.dedup();
        teams.len()
    }
}

#[derive(Debug, Clone)]
pub struct TeamSeasonAggregator {
    window_sizes: Vec<usize>,
    stats: Vec<String>,
    keys: Vec<String>,
}

impl TeamSeasonAggregator {
    pub fn new(window_sizes: &[usize], stats: &[String]) -> Self {
        let mut window_sizes = window_sizes.to_vec();
        window_sizes.sort_unstable();
        window_sizes.dedup();
        let mut keys = Vec::with_capacity(stats.len() * 2 + 1);
        for s in stats {
            keys.push(s.clone());
            keys.push(against_key(s));
        }
        keys.push(WIN_KEY.to_string());
        Self {
            window_sizes,
            stats: stats.to_vec(),
            keys,
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(&cfg.windows(), &cfg.stats)
    }

    pub fn window_sizes(&self) -> &[usize] {
        &self.window_sizes
    }

    pub fn stats(&self) -> &[String] {
        &self.stats
    }

    /// Errors with `Configuration` naming every tracked stat that no finished game
    /// in `log` reports. Goals count as reported when scores are present.
    pub fn check_coverage(&self, log: &GameLog) -> Result<()> {
        let finished: Vec<&GameRecord> = log.records().iter().filter(|r| r.is_final()).collect();
        if finished.is_empty() {
            return Ok(());
        }
        let absent: Vec<&str> = self
            .stats
            .iter()
            .filter(|stat| {
                *stat != GOALS_KEY
                    && !finished.iter().any(|r| {
                        r.home_stats.contains_key(stat.as_str())
                            || r.away_stats.contains_key(stat.as_str())
                    })
            })
            .map(String::as_str)
            .collect();
        if absent.is_empty() {
            return Ok(());
        }
        Err(PipelineError::Configuration(format!(
            "tracked stats missing from every game in the log: {}",
            absent.join(", ")
        )))
    }

    /// Folds every team independently (in parallel across teams, sequentially
    /// within one team).
    pub fn build(&self, log: &GameLog) -> SnapshotIndex {
        let mut by_team: HashMap<&str, Vec<&GameRecord>> = HashMap::new();
        for r in log.records().iter().filter(|r| r.is_final()) {
            by_team.entry(r.home.as_str()).or_default().push(r);
            by_team.entry(r.away.as_str()).or_default().push(r);
        }

        let folded: Vec<Vec<((String, String), Vec<TeamSnapshot>)>> = by_team
            .par_iter()
            .map(|(team, games)| self.fold_team(team, games))
            .collect();

        let mut histories = HashMap::new();
        for team_histories in folded {
            histories.extend(team_histories);
        }
        debug!(team_seasons = histories.len(), "aggregated team seasons");
        SnapshotIndex { histories }
    }

    /// `games` must already be in chronological order (the log keeps them sorted).
    pub fn fold_team(
        &self,
        team: &str,
        games: &[&GameRecord],
    ) -> Vec<((String, String), Vec<TeamSnapshot>)> {
        let mut states: Vec<(TeamSeasonState, Vec<TeamSnapshot>)> = Vec::new();
        for game in games {
            let idx = match states.iter().position(|(s, _)| s.season == game.season) {
                Some(idx) => idx,
                None => {
                    states.push((
                        TeamSeasonState::new(team, &game.season, &self.keys, &self.window_sizes),
                        Vec::new(),
                    ));
                    states.len() - 1
                }
            };
            let (state, history) = &mut states[idx];
            state.apply(game, &self.stats);
            history.push(state.snapshot());
        }
        states
            .into_iter()
            .map(|(state, history)| ((state.team, state.season), history))
            .collect()
    }
}

pub fn against_key(stat: &str) -> String {
    format!("{stat}{AGAINST_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(id: &str, day: u32, season: &str, home: &str, away: &str, hs: u32, as_: u32) -> GameRecord {
        let mut home_stats = BTreeMap::new();
        home_stats.insert("shots".to_string(), 30.0 + day as f64);
        let mut away_stats = BTreeMap::new();
        away_stats.insert("shots".to_string(), 20.0);
        GameRecord {
            game_id: id.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            season: season.to_string(),
            home: home.to_string(),
            away: away.to_string(),
            home_score: Some(hs),
            away_score: Some(as_),
            home_stats,
            away_stats,
        }
    }

    #[test]
    fn stats_absent_from_the_log_are_named() {
        let stats = vec!["shots".to_string(), "goals".to_string(), "save_pct".to_string()];
        let agg = TeamSeasonAggregator::new(&[3], &stats);
        let log = GameLog::new(vec![game("g1", 1, "s", "A", "B", 1, 0)], Vec::new());
        let err = agg.check_coverage(&log).unwrap_err();
        let PipelineError::Configuration(msg) = err else {
            panic!("expected a configuration error, got {err:?}");
        };
        assert!(msg.contains("save_pct"));
        assert!(!msg.contains("shots"));
        assert!(!msg.contains("goals"));

        let covered = TeamSeasonAggregator::new(&[3], &stats[..2]);
        covered.check_coverage(&log).unwrap();
    }

    #[test]
    fn rolling_window_evicts_oldest() {
        let mut w = RollingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            w.push(v);
            assert!(w.len() <= 3);
        }
        assert_eq!(w.values().copied().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
        assert_eq!(w.mean(), Some(3.0));
    }

    #[test]
    fn partial_window_uses_available_games() {
        let stats = vec!["shots".to_string()];
        let agg = TeamSeasonAggregator::new(&[5], &stats);
        let g1 = game("g1", 1, "s", "A", "B", 1, 0);
        let g2 = game("g2", 2, "s", "A", "C", 2, 1);
        let games = vec![&g1, &g2];
        let out = agg.fold_team("A", &games);
        let last = out[0].1.last().unwrap();
        let w = last.window("shots", 5).unwrap();
        assert_eq!(w.count, 2);
        assert!(w.is_partial());
        assert!((w.mean - 31.5).abs() < 1e-12);
    }

    #[test]
    fn snapshot_before_game_excludes_that_game() {
        let stats = vec!["shots".to_string()];
        let agg = TeamSeasonAggregator::new(&[3], &stats);
        let log = GameLog::new(
            vec![
                game("g1", 1, "s", "A", "B", 1, 0),
                game("g2", 5, "s", "B", "A", 2, 1),
                game("g3", 9, "s", "A", "B", 0, 3),
            ],
            Vec::new(),
        );
        let index = agg.build(&log);
        let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        assert_eq!(index.as_of("A", "s", d(1)).games_played, 0);
        assert_eq!(index.as_of("A", "s", d(5)).games_played, 1);
        assert_eq!(index.as_of("A", "s", d(9)).games_played, 2);
        assert_eq!(index.latest("A", "s").games_played, 3);
        assert_eq!(index.as_of("A", "s", d(9)).as_of, Some(d(5)));
    }

    #[test]
    fn seasons_do_not_share_state() {
        let stats = vec!["shots".to_string()];
        let agg = TeamSeasonAggregator::new(&[3], &stats);
        let log = GameLog::new(
            vec![
                game("g1", 1, "s1", "A", "B", 1, 0),
                game("g2", 20, "s2", "A", "B", 2, 1),
            ],
            Vec::new(),
        );
        let index = agg.build(&log);
        let d20 = NaiveDate::from_ymd_opt(2024, 1, 20).unwrap();
        assert_eq!(index.as_of("A", "s2", d20).games_played, 0);
        assert_eq!(index.latest("A", "s2").games_played, 1);
        assert_eq!(index.teams(), 2);
    }

    #[test]
    fn goals_fall_back_to_score_and_win_is_tracked() {
        let stats = vec!["goals".to_string()];
        let mut state = TeamSeasonState::new(
            "B",
            "s",
            &["goals".to_string(), against_key("goals"), WIN_KEY.to_string()],
            &[3],
        );
        state.apply(&game("g1", 1, "s", "A", "B", 1, 4), &stats);
        let snap = state.snapshot();
        assert_eq!(snap.season_mean("goals"), Some(4.0));
        assert_eq!(snap.season_mean("goals_against"), Some(1.0));
        assert_eq!(snap.season_mean(WIN_KEY), Some(1.0));
    }
}
