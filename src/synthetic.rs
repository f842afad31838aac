//! Seeded synthetic league with a known relationship between team strength and
//! results. Used for backtests without a live feed.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::game_log::GameLogRow;

const DAYS_BETWEEN_ROUNDS: i64 = 3;
const BASE_GOAL_LOG_RATE: f64 = 0.15;

#[derive(Debug, Clone)]
pub struct SyntheticLeague {
    pub teams: usize,
    pub seasons: Vec<String>,
    pub games_per_season: usize,
    pub seed: u64,
    /// Log-rate effect of one unit of strength difference on goals.
    pub signal: f64,
    pub home_advantage: f64,
    /// Calendar year in which the first season starts.
    pub start_year: i32,
    /// Unplayed rounds appended to the last season.
    pub upcoming_rounds: usize,
}

impl Default for SyntheticLeague {
    fn default() -> Self {
        Self {
            teams: 10,
            seasons: vec![
                "2021".to_string(),
                "2022".to_string(),
                "2023".to_string(),
                "2024".to_string(),
            ],
            games_per_season: 100,
            seed: 7,
            signal: 0.5,
            home_advantage: 0.2,
            start_year: 2021,
            upcoming_rounds: 0,
        }
    }
}

impl SyntheticLeague {
    pub fn team_name(idx: usize) -> String {
        format!("T{:02}", idx + 1)
    }

    /// Two rows per game, in schedule order. Identical settings give identical rows.
    pub fn generate(&self) -> Vec<GameLogRow> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let teams = self.teams.max(2);
        let per_round = teams / 2;
        let mut strength: Vec<f64> = (0..teams).map(|_| rng.gen_range(-1.5..1.5)).collect();

        let mut rows = Vec::new();
        for (s_idx, season) in self.seasons.iter().enumerate() {
            if s_idx > 0 {
                for s in &mut strength {
                    *s = 0.8 * *s + 0.2 * rng.gen_range(-1.5..1.5);
                }
            }
            let Some(start) = NaiveDate::from_ymd_opt(self.start_year + s_idx as i32, 8, 1) else {
                continue;
            };
            let last_season = s_idx + 1 == self.seasons.len();
            let played_rounds = self.games_per_season.div_ceil(per_round);
            let total_rounds = played_rounds + if last_season { self.upcoming_rounds } else { 0 };

            let mut order: Vec<usize> = (0..teams).collect();
            let mut played = 0usize;
            for round in 0..total_rounds {
                order.shuffle(&mut rng);
                let date = start + Duration::days(round as i64 * DAYS_BETWEEN_ROUNDS);
                for (k, pair) in order.chunks_exact(2).enumerate() {
                    let upcoming = round >= played_rounds;
                    if !upcoming && played >= self.games_per_season {
                        break;
                    }
                    let (h, a) = (pair[0], pair[1]);
                    let game_id = format!("{season}-{round:03}-{k}");
                    if upcoming {
                        rows.extend(self.fixture_rows(&game_id, date, season, h, a));
                    } else {
                        rows.extend(self.game_rows(&mut rng, &game_id, date, season, h, a, &strength));
                        played += 1;
                    }
                }
            }
        }
        rows
    }

    #[allow(clippy::too_many_arguments)]
    fn game_rows(
        &self,
        rng: &mut StdRng,
        game_id: &str,
        date: NaiveDate,
        season: &str,
        home: usize,
        away: usize,
        strength: &[f64],
    ) -> [GameLogRow; 2] {
        let diff = strength[home] - strength[away];
        let lambda_h = (BASE_GOAL_LOG_RATE + self.home_advantage / 2.0 + self.signal * diff).exp();
        let lambda_a = (BASE_GOAL_LOG_RATE - self.home_advantage / 2.0 - self.signal * diff).exp();
        let goals_h = poisson(rng, lambda_h);
        let goals_a = poisson(rng, lambda_a);

        let home_stats = side_stats(rng, lambda_h, diff, goals_a);
        let away_stats = side_stats(rng, lambda_a, -diff, goals_h);
        let row = |team: usize, opp: usize, is_home: bool, score: u32, stats: BTreeMap<String, f64>| {
            GameLogRow {
                game_id: game_id.to_string(),
                date,
                season: season.to_string(),
                team: Self::team_name(team),
                opponent: Self::team_name(opp),
                is_home,
                score: Some(score),
                stats,
            }
        };
        [
            row(home, away, true, goals_h, home_stats),
            row(away, home, false, goals_a, away_stats),
        ]
    }

    fn fixture_rows(&self, game_id: &str, date: NaiveDate, season: &str, home: usize, away: usize) -> [GameLogRow; 2] {
        let row = |team: usize, opp: usize, is_home: bool| GameLogRow {
            game_id: game_id.to_string(),
            date,
            season: season.to_string(),
            team: Self::team_name(team),
            opponent: Self::team_name(opp),
            is_home,
            score: None,
            stats: BTreeMap::new(),
        };
        [row(home, away, true), row(away, home, false)]
    }
}

fn side_stats(rng: &mut StdRng, lambda: f64, diff: f64, conceded: u32) -> BTreeMap<String, f64> {
    let xg = (lambda + rng.gen_range(-0.3..0.3)).max(0.05);
    let shots = (lambda * 8.0 + rng.gen_range(-3.0..3.0)).round().max(1.0);
    let possession = (50.0 + 8.0 * diff + rng.gen_range(-5.0..5.0)).clamp(20.0, 80.0);
    let faced = (conceded as f64 * 3.0 + rng.gen_range(1.0..5.0)).round();
    let save_pct = ((faced - conceded as f64) / faced.max(1.0)).clamp(0.0, 1.0);

    let mut stats = BTreeMap::new();
    stats.insert("expected_goals".to_string(), xg);
    stats.insert("shots".to_string(), shots);
    stats.insert("possession".to_string(), possession);
    stats.insert("save_pct".to_string(), save_pct);
    stats
}

/// Knuth's multiplication method; fine for the small rates used here.
fn poisson(rng: &mut StdRng, lambda: f64) -> u32 {
    let limit = (-lambda.clamp(0.01, 12.0)).exp();
    let mut k = 0u32;
    let mut p = 1.0;
    loop {
        p *= rng.r#gen::<f64>();
        if p <= limit {
            return k;
        }
        k += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game_log::GameLog;

    #[test]
    fn same_seed_same_league() {
        let league = SyntheticLeague::default();
        assert_eq!(league.generate(), league.generate());
        let other = SyntheticLeague {
            seed: 99,
            ..SyntheticLeague::default()
        };
        assert_ne!(league.generate(), other.generate());
    }

    #[test]
    fn produces_requested_games_per_season() {
        let league = SyntheticLeague {
            seasons: vec!["a".to_string(), "b".to_string()],
            games_per_season: 37,
            upcoming_rounds: 1,
            ..SyntheticLeague::default()
        };
        let (log, summary) = GameLog::from_rows(league.generate());
        assert!(summary.rejected.is_empty());
        assert_eq!(log.records().len(), 74);
        assert_eq!(log.fixtures().len(), 5);
        assert_eq!(log.seasons(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn stronger_home_teams_win_more() {
        let league = SyntheticLeague {
            games_per_season: 400,
            seasons: vec!["x".to_string()],
            ..SyntheticLeague::default()
        };
        let (log, _) = GameLog::from_rows(league.generate());
        let home_wins = log.records().iter().filter(|r| r.home_win() == Some(true)).count();
        let rate = home_wins as f64 / log.records().len() as f64;
        assert!(rate > 0.3 && rate < 0.7);
    }
}
