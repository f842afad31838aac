use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::calibration::DEFAULT_MIN_BLOCK;
use crate::error::{PipelineError, Result};
use crate::trainer::CandidateSpec;

const ENV_PREFIX: &str = "MATCHCAST_";

pub const DEFAULT_WINDOWS: [usize; 3] = [3, 5, 10];
pub const DEFAULT_DECAY: f64 = 0.85;
pub const DEFAULT_BUCKET_THRESHOLDS: [f64; 5] = [5.0, 10.0, 15.0, 20.0, 25.0];
pub const DEFAULT_GRADES: [&str; 6] = ["C", "C+", "B", "B+", "A", "A+"];
pub const DEFAULT_STATS: [&str; 5] = ["goals", "shots", "expected_goals", "possession", "save_pct"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Http { base_url: String },
    Files { dir: PathBuf },
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub primary: SourceConfig,
    #[serde(default)]
    pub secondary: Option<SourceConfig>,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            primary: SourceConfig::Files {
                dir: PathBuf::from("data"),
            },
            secondary: None,
            cache_ttl_secs: default_cache_ttl(),
            cache_file: None,
        }
    }
}

fn default_cache_ttl() -> u64 {
    6 * 60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub train_seasons: Vec<String>,
    pub validation_season: String,
    pub holdout_season: String,
    pub rolling_windows: Vec<usize>,
    pub recency_decay: f64,
    pub bucket_thresholds: Vec<f64>,
    pub bucket_grades: Vec<String>,
    pub stats: Vec<String>,
    pub candidates: Vec<CandidateSpec>,
    pub min_calibration_samples: usize,
    /// Smallest sample count an isotonic calibration block may hold.
    pub calibration_min_block: usize,
    pub min_bucket_samples: usize,
    pub sources: SourcesConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            train_seasons: vec!["2021".to_string(), "2022".to_string()],
            validation_season: "2023".to_string(),
            holdout_season: "2024".to_string(),
            rolling_windows: DEFAULT_WINDOWS.to_vec(),
            recency_decay: DEFAULT_DECAY,
            bucket_thresholds: DEFAULT_BUCKET_THRESHOLDS.to_vec(),
            bucket_grades: DEFAULT_GRADES.iter().map(|g| g.to_string()).collect(),
            stats: DEFAULT_STATS.iter().map(|s| s.to_string()).collect(),
            candidates: CandidateSpec::default_list(),
            min_calibration_samples: 30,
            calibration_min_block: DEFAULT_MIN_BLOCK,
            min_bucket_samples: 20,
            sources: SourcesConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Reads an optional JSON file, then applies `MATCHCAST_*` overrides from the
    /// process environment (including a `.env` file when present).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut cfg = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)?;
                serde_json::from_str::<PipelineConfig>(&raw)?
            }
            None => PipelineConfig::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("TRAIN_SEASONS") {
            self.train_seasons = split_list(&v);
        }
        if let Some(v) = get("VALIDATION_SEASON") {
            self.validation_season = v;
        }
        if let Some(v) = get("HOLDOUT_SEASON") {
            self.holdout_season = v;
        }
        if let Some(v) = get("ROLLING_WINDOWS") {
            self.rolling_windows = parse_list(&v, "ROLLING_WINDOWS")?;
        }
        if let Some(v) = get("RECENCY_DECAY") {
            self.recency_decay = v.parse::<f64>().map_err(|_| {
                PipelineError::Configuration(format!("RECENCY_DECAY is not a number: {v}"))
            })?;
        }
        if let Some(v) = get("BUCKET_THRESHOLDS") {
            self.bucket_thresholds = parse_list(&v, "BUCKET_THRESHOLDS")?;
        }
        if let Some(v) = get("STATS") {
            self.stats = split_list(&v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.train_seasons.is_empty() {
            return Err(config_err("train_seasons must not be empty"));
        }
        if self.validation_season.trim().is_empty() || self.holdout_season.trim().is_empty() {
            return Err(config_err("validation and holdout seasons are required"));
        }
        if self.validation_season == self.holdout_season {
            return Err(config_err("validation and holdout seasons must differ"));
        }
        for s in &self.train_seasons {
            if *s == self.validation_season || *s == self.holdout_season {
                return Err(config_err(&format!(
                    "season {s} is both a training season and a validation/holdout season"
                )));
            }
        }
        if !(self.recency_decay > 0.0 && self.recency_decay < 1.0) {
            return Err(config_err(&format!(
                "recency_decay must be in (0, 1), got {}",
                self.recency_decay
            )));
        }
        if self.rolling_windows.is_empty() || self.rolling_windows.contains(&0) {
            return Err(config_err("rolling_windows must be non-empty and positive"));
        }
        if self.stats.is_empty() {
            return Err(config_err("at least one tracked statistic is required"));
        }
        if self.candidates.is_empty() {
            return Err(config_err("candidate list must not be empty"));
        }
        if self.calibration_min_block == 0 {
            return Err(config_err("calibration_min_block must be positive"));
        }
        if self.bucket_grades.len() != self.bucket_thresholds.len() + 1 {
            return Err(config_err(&format!(
                "{} bucket thresholds need {} grades, got {}",
                self.bucket_thresholds.len(),
                self.bucket_thresholds.len() + 1,
                self.bucket_grades.len()
            )));
        }
        let mut prev = 0.0;
        for t in &self.bucket_thresholds {
            if !(*t > prev && *t < 50.0) {
                return Err(config_err(&format!(
                    "bucket thresholds must be increasing within (0, 50), got {:?}",
                    self.bucket_thresholds
                )));
            }
            prev = *t;
        }
        Ok(())
    }

    /// Windows sorted ascending with duplicates removed.
    pub fn windows(&self) -> Vec<usize> {
        let mut w = self.rolling_windows.clone();
        w.sort_unstable();
        w.dedup();
        w
    }

    pub fn all_seasons(&self) -> Vec<String> {
        let mut out = self.train_seasons.clone();
        out.push(self.validation_season.clone());
        out.push(self.holdout_season.clone());
        out
    }
}

fn config_err(msg: &str) -> PipelineError {
    PipelineError::Configuration(msg.to_string())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_list<T: std::str::FromStr>(raw: &str, name: &str) -> Result<Vec<T>> {
    split_list(raw)
        .iter()
        .map(|s| {
            s.parse::<T>()
                .map_err(|_| PipelineError::Configuration(format!("{name}: cannot parse {s:?}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_validate() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn env_overrides_replace_lists() {
        let mut env = HashMap::new();
        env.insert("MATCHCAST_TRAIN_SEASONS", "2019, 2020,2021");
        env.insert("MATCHCAST_ROLLING_WINDOWS", "4,8");
        env.insert("MATCHCAST_RECENCY_DECAY", "0.9");
        let mut cfg = PipelineConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.train_seasons, vec!["2019", "2020", "2021"]);
        assert_eq!(cfg.rolling_windows, vec![4, 8]);
        assert!((cfg.recency_decay - 0.9).abs() < 1e-12);
    }

    #[test]
    fn overlapping_seasons_are_rejected() {
        let cfg = PipelineConfig {
            validation_season: "2022".to_string(),
            ..PipelineConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn decay_out_of_range_is_rejected() {
        let cfg = PipelineConfig {
            recency_decay: 1.0,
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn grade_count_must_match_thresholds() {
        let cfg = PipelineConfig {
            bucket_grades: vec!["C".to_string()],
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_file_fields_are_optional() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"train_seasons":["a"],"validation_season":"b","holdout_season":"c"}"#)
                .unwrap();
        assert_eq!(cfg.rolling_windows, vec![3, 5, 10]);
        cfg.validate().unwrap();
    }
}
