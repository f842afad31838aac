use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rayon::prelude::*;
use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use tracing::{info, warn};

use crate::cache::FetchCache;
use crate::config::{SourceConfig, SourcesConfig};
use crate::error::{PipelineError, Result};
use crate::game_log::{GameLogRow, parse_csv_rows, parse_json_rows};
use crate::store;

const REQUEST_TIMEOUT_SECS: u64 = 20;

/// Anything that can hand back the team-game rows of one season.
pub trait GameSource: Send + Sync {
    fn name(&self) -> &str;
    fn fetch_season(&self, season: &str) -> Result<Vec<GameLogRow>>;
}

/// JSON feed at `{base_url}/{season}.json`, read through the shared cache.
pub struct HttpSource {
    base_url: String,
    client: Client,
    cache: Arc<FetchCache>,
}

impl HttpSource {
    pub fn new(base_url: &str, cache: Arc<FetchCache>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            cache,
        })
    }

    fn season_url(&self, season: &str) -> String {
        format!("{}/{}.json", self.base_url, season.replace('/', "%2F"))
    }
}

impl GameSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch_season(&self, season: &str) -> Result<Vec<GameLogRow>> {
        let url = self.season_url(season);
        if let Some(body) = self.cache.get(&url) {
            return parse_json_rows(&body);
        }
        let resp = self
            .client
            .get(&url)
            .header(USER_AGENT, "matchcast/0.1")
            .send()
            .map_err(|e| PipelineError::data_source(self.name(), format!("{url}: {e}")))?;
        let status = resp.status();
        let body = resp
            .text()
            .map_err(|e| PipelineError::data_source(self.name(), format!("{url}: {e}")))?;
        if !status.is_success() {
            return Err(PipelineError::data_source(
                self.name(),
                format!("{url}: http {status}"),
            ));
        }
        let rows = parse_json_rows(&body)?;
        self.cache.put(&url, body);
        Ok(rows)
    }
}

/// Directory of `{season}.csv` or `{season}.json` files.
pub struct FileSource {
    dir: PathBuf,
}

impl FileSource {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl GameSource for FileSource {
    fn name(&self) -> &str {
        "files"
    }

    fn fetch_season(&self, season: &str) -> Result<Vec<GameLogRow>> {
        let csv_path = self.dir.join(format!("{season}.csv"));
        if csv_path.exists() {
            let file = fs::File::open(&csv_path)?;
            return parse_csv_rows(file);
        }
        let json_path = self.dir.join(format!("{season}.json"));
        if json_path.exists() {
            let raw = fs::read_to_string(&json_path)?;
            return parse_json_rows(&raw);
        }
        Err(PipelineError::data_source(
            self.name(),
            format!("no file for season {season} in {}", self.dir.display()),
        ))
    }
}

/// Rows previously ingested into the SQLite store.
pub struct SqliteSource {
    path: PathBuf,
    conn: Mutex<Option<rusqlite::Connection>>,
}

impl SqliteSource {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            conn: Mutex::new(None),
        }
    }
}

impl GameSource for SqliteSource {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn fetch_season(&self, season: &str) -> Result<Vec<GameLogRow>> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| PipelineError::data_source(self.name(), "connection lock poisoned"))?;
        if guard.is_none() {
            *guard = Some(store::open_db(&self.path)?);
        }
        let Some(conn) = guard.as_ref() else {
            return Err(PipelineError::data_source(self.name(), "no connection"));
        };
        let wanted = [season.to_string()];
        let rows = store::load_rows(conn, Some(&wanted))?;
        if rows.is_empty() {
            return Err(PipelineError::data_source(
                self.name(),
                format!("season {season} not ingested"),
            ));
        }
        Ok(rows)
    }
}

/// Primary feed with an optional stand-in of the same row shape.
pub struct FallbackSource {
    primary: Box<dyn GameSource>,
    secondary: Option<Box<dyn GameSource>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeasonFetch {
    pub season: String,
    pub source: String,
    pub rows: usize,
    pub fell_back: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub seasons: Vec<SeasonFetch>,
}

impl FetchReport {
    pub fn used_fallback(&self) -> bool {
        self.seasons.iter().any(|s| s.fell_back)
    }
}

impl FallbackSource {
    pub fn new(primary: Box<dyn GameSource>, secondary: Option<Box<dyn GameSource>>) -> Self {
        Self { primary, secondary }
    }

    /// Tries the primary source, then the secondary. Returns the rows and the name
    /// of whichever source served them.
    pub fn fetch_season_logged(&self, season: &str) -> Result<(Vec<GameLogRow>, SeasonFetch)> {
        let primary_err = match self.primary.fetch_season(season) {
            Ok(rows) => {
                info!(season, source = self.primary.name(), rows = rows.len(), "season loaded");
                let fetch = SeasonFetch {
                    season: season.to_string(),
                    source: self.primary.name().to_string(),
                    rows: rows.len(),
                    fell_back: false,
                };
                return Ok((rows, fetch));
            }
            Err(err) => err,
        };

        let Some(secondary) = self.secondary.as_ref() else {
            return Err(primary_err);
        };
        warn!(
            season,
            primary = self.primary.name(),
            secondary = secondary.name(),
            error = %primary_err,
            "primary source failed; falling back"
        );
        match secondary.fetch_season(season) {
            Ok(rows) => {
                info!(season, source = secondary.name(), rows = rows.len(), "season loaded");
                let fetch = SeasonFetch {
                    season: season.to_string(),
                    source: secondary.name().to_string(),
                    rows: rows.len(),
                    fell_back: true,
                };
                Ok((rows, fetch))
            }
            Err(secondary_err) => Err(PipelineError::AllSourcesFailed {
                primary: primary_err.to_string(),
                secondary: secondary_err.to_string(),
            }),
        }
    }

    /// Seasons are fetched concurrently; each fetch is idempotent so a failed batch
    /// can simply be re-run.
    pub fn fetch_seasons(&self, seasons: &[String]) -> Result<(Vec<GameLogRow>, FetchReport)> {
        let results: Vec<Result<(Vec<GameLogRow>, SeasonFetch)>> = seasons
            .par_iter()
            .map(|s| self.fetch_season_logged(s))
            .collect();

        let mut rows = Vec::new();
        let mut report = FetchReport::default();
        for result in results {
            let (season_rows, fetch) = result?;
            rows.extend(season_rows);
            report.seasons.push(fetch);
        }
        Ok((rows, report))
    }
}

impl GameSource for FallbackSource {
    fn name(&self) -> &str {
        self.primary.name()
    }

    fn fetch_season(&self, season: &str) -> Result<Vec<GameLogRow>> {
        self.fetch_season_logged(season).map(|(rows, _)| rows)
    }
}

pub fn build_source(cfg: &SourceConfig, cache: &Arc<FetchCache>) -> Result<Box<dyn GameSource>> {
    Ok(match cfg {
        SourceConfig::Http { base_url } => Box::new(HttpSource::new(base_url, Arc::clone(cache))?),
        SourceConfig::Files { dir } => Box::new(FileSource::new(dir.clone())),
        SourceConfig::Sqlite { path } => Box::new(SqliteSource::new(path.clone())),
    })
}

/// Builds the source pair named by configuration, sharing one cache between them.
pub fn build_fallback(cfg: &SourcesConfig, cache: &Arc<FetchCache>) -> Result<FallbackSource> {
    let primary = build_source(&cfg.primary, cache)?;
    let secondary = match cfg.secondary.as_ref() {
        Some(s) => Some(build_source(s, cache)?),
        None => None,
    };
    Ok(FallbackSource::new(primary, secondary))
}
