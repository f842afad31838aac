use std::collections::HashMap;

use chrono::NaiveDate;
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::features::LabeledExample;

/// Exponential season-recency weights: `decay^(N-1-i)` for the season ranked `i`
/// (0 = oldest) among `N` training seasons.
#[derive(Debug, Clone, Copy)]
pub struct SampleWeighter {
    decay: f64,
}

impl SampleWeighter {
    pub fn new(decay: f64) -> Result<Self> {
        if !(decay > 0.0 && decay < 1.0) {
            return Err(PipelineError::Configuration(format!(
                "recency decay must be in (0, 1), got {decay}"
            )));
        }
        Ok(Self { decay })
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn season_weight(&self, rank: usize, seasons: usize) -> f64 {
        let age = seasons.saturating_sub(1).saturating_sub(rank);
        self.decay.powi(age as i32)
    }

    /// One weight per example, aligned by index. Seasons are ranked by their
    /// earliest example date, so the newest season present gets weight 1.0 whatever
    /// order `seasons` lists them in. Seasons without examples are not ranked.
    pub fn weights(&self, examples: &[LabeledExample], seasons: &[String]) -> Result<Vec<f64>> {
        let ranks = chronological_ranks(examples, seasons)?;
        let n = ranks.len();
        Ok(examples
            .iter()
            .map(|ex| {
                let rank = ranks.get(ex.features.season.as_str()).copied().unwrap_or(0);
                self.season_weight(rank, n)
            })
            .collect())
    }
}

fn chronological_ranks<'a>(
    examples: &'a [LabeledExample],
    seasons: &[String],
) -> Result<HashMap<&'a str, usize>> {
    let mut first: HashMap<&str, NaiveDate> = HashMap::new();
    for ex in examples {
        let season = ex.features.season.as_str();
        if !seasons.iter().any(|s| s == season) {
            return Err(PipelineError::Configuration(format!(
                "example {} belongs to season {season}, which is not a training season",
                ex.features.game_id
            )));
        }
        first
            .entry(season)
            .and_modify(|d| *d = (*d).min(ex.features.date))
            .or_insert(ex.features.date);
    }

    let listed = |name: &str| seasons.iter().position(|s| s == name).unwrap_or(usize::MAX);
    let mut ordered: Vec<(&str, NaiveDate)> = first.into_iter().collect();
    ordered.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| listed(a.0).cmp(&listed(b.0))));

    let in_list_order = ordered.windows(2).all(|w| listed(w[0].0) < listed(w[1].0));
    if !in_list_order {
        warn!(
            configured = ?seasons,
            chronological = ?ordered.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
            "training seasons are not listed oldest first; ranking by date"
        );
    }
    Ok(ordered
        .into_iter()
        .enumerate()
        .map(|(rank, (season, _))| (season, rank))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::TeamSnapshot;
    use crate::features::{FeatureBuilder, FeatureSchema};

    fn example(id: &str, season: &str, year: i32) -> LabeledExample {
        let builder = FeatureBuilder::new(FeatureSchema::new(&[], &[1]));
        let date = NaiveDate::from_ymd_opt(year, 3, 1).unwrap();
        let mut snap = TeamSnapshot::empty("A", season);
        snap.games_played = 1;
        snap.as_of = date.pred_opt();
        LabeledExample {
            features: builder.build(id, date, season, &snap, &snap).unwrap(),
            home_win: true,
        }
    }

    #[test]
    fn newest_season_has_unit_weight() {
        let w = SampleWeighter::new(0.85).unwrap();
        assert!((w.season_weight(2, 3) - 1.0).abs() < 1e-12);
        assert!((w.season_weight(1, 3) - 0.85).abs() < 1e-12);
        assert!((w.season_weight(0, 3) - 0.7225).abs() < 1e-12);
    }

    #[test]
    fn decay_must_be_a_fraction() {
        assert!(SampleWeighter::new(0.0).is_err());
        assert!(SampleWeighter::new(1.0).is_err());
        assert!(SampleWeighter::new(1.2).is_err());
    }

    #[test]
    fn weights_are_monotone_in_recency() {
        let w = SampleWeighter::new(0.8).unwrap();
        let ws: Vec<f64> = (0..5).map(|i| w.season_weight(i, 5)).collect();
        for pair in ws.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn seasons_rank_by_date_not_list_order() {
        let w = SampleWeighter::new(0.85).unwrap();
        let examples = vec![example("a", "2021", 2021), example("b", "2022", 2022)];
        let seasons = vec!["2022".to_string(), "2021".to_string()];
        let ws = w.weights(&examples, &seasons).unwrap();
        assert!((ws[1] - 1.0).abs() < 1e-12);
        assert!((ws[0] - 0.85).abs() < 1e-12);
    }

    #[test]
    fn unknown_season_is_a_configuration_error() {
        let w = SampleWeighter::new(0.85).unwrap();
        let examples = vec![example("a", "2019", 2019)];
        let err = w.weights(&examples, &["2021".to_string()]).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
