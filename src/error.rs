use chrono::NaiveDate;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("data source {source_name} unavailable: {message}")]
    DataSource {
        source_name: String,
        message: String,
    },

    #[error("all data sources failed (primary: {primary}; secondary: {secondary})")]
    AllSourcesFailed { primary: String, secondary: String },

    // Never recovered from: a leaked feature invalidates every downstream metric.
    #[error(
        "leakage in game {game_id}: snapshot for {team} is dated {snapshot_date}, not before game date {game_date}"
    )]
    LeakageViolation {
        game_id: String,
        team: String,
        snapshot_date: NaiveDate,
        game_date: NaiveDate,
    },

    #[error("missing feature {feature} for {team} in game {game_id}")]
    MissingFeature {
        game_id: String,
        team: String,
        feature: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("calibration degenerate: {samples} samples, {positives} positives")]
    CalibrationDegenerate { samples: usize, positives: usize },

    #[error("invalid game log row: {0}")]
    InvalidRow(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PipelineError {
    pub fn data_source(source_name: &str, message: impl Into<String>) -> Self {
        Self::DataSource {
            source_name: source_name.to_string(),
            message: message.into(),
        }
    }

    /// Errors that abort a whole batch rather than a single fixture. A source
    /// failure is fatal once it reaches the caller; `FallbackSource` retries the
    /// secondary before that happens.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::MissingFeature { .. } | Self::CalibrationDegenerate { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_feature_is_not_fatal() {
        let err = PipelineError::MissingFeature {
            game_id: "g1".to_string(),
            team: "HOM".to_string(),
            feature: "games_played".to_string(),
        };
        assert!(!err.is_fatal());
        assert!(PipelineError::Configuration("x".to_string()).is_fatal());
        assert!(PipelineError::data_source("http", "timed out").is_fatal());
    }

    #[test]
    fn leakage_message_names_dates() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let err = PipelineError::LeakageViolation {
            game_id: "g9".to_string(),
            team: "AWY".to_string(),
            snapshot_date: d,
            game_date: d,
        };
        let msg = err.to_string();
        assert!(msg.contains("g9"));
        assert!(msg.contains("2024-03-01"));
    }
}
