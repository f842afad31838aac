use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use matchcast::cache::FetchCache;
use matchcast::config::PipelineConfig;
use matchcast::emitter::write_predictions;
use matchcast::game_log::GameLog;
use matchcast::pipeline::{Pipeline, PipelineArtifacts};
use matchcast::source::{FallbackSource, GameSource, build_fallback};
use matchcast::store::{self, IngestRun};
use matchcast::synthetic::SyntheticLeague;

#[derive(Parser)]
#[command(name = "matchcast")]
#[command(about = "Pre-game win probabilities from team game logs", long_about = None)]
struct Cli {
    /// JSON config file; MATCHCAST_* variables override it
    #[arg(long, env = "MATCHCAST_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch configured seasons and upsert them into the SQLite store
    Ingest {
        #[arg(long, default_value = "data/matchcast.sqlite")]
        db: PathBuf,
    },

    /// Train, calibrate and evaluate on the holdout season
    Backtest {
        /// Generate a seeded synthetic league instead of reading sources
        #[arg(long)]
        synthetic: bool,

        #[arg(long, default_value_t = 7)]
        seed: u64,

        /// Write the evaluation report as JSON
        #[arg(long)]
        report: Option<PathBuf>,

        /// Write the trained model, calibration and grade table
        #[arg(long, default_value = "data/artifacts.json")]
        artifacts: PathBuf,
    },

    /// Score unplayed fixtures with saved artifacts
    Predict {
        #[arg(long, default_value = "data/artifacts.json")]
        artifacts: PathBuf,

        #[arg(long, default_value = "data/predictions.json")]
        out: PathBuf,

        #[arg(long)]
        synthetic: bool,

        #[arg(long, default_value_t = 7)]
        seed: u64,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let cfg = PipelineConfig::load(cli.config.as_deref()).context("load config")?;

    match cli.command {
        Commands::Ingest { db } => ingest(&cfg, db),
        Commands::Backtest {
            synthetic,
            seed,
            report,
            artifacts,
        } => backtest(cfg, synthetic, seed, report, artifacts),
        Commands::Predict {
            artifacts,
            out,
            synthetic,
            seed,
        } => predict(cfg, artifacts, out, synthetic, seed),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn open_sources(cfg: &PipelineConfig) -> Result<(Arc<FetchCache>, FallbackSource)> {
    let ttl = Duration::from_secs(cfg.sources.cache_ttl_secs);
    let cache = Arc::new(match cfg.sources.cache_file.clone() {
        Some(path) => FetchCache::with_file(path, ttl),
        None => FetchCache::new(ttl),
    });
    let source = build_fallback(&cfg.sources, &cache).context("build data sources")?;
    Ok((cache, source))
}

fn ingest(cfg: &PipelineConfig, db: PathBuf) -> Result<()> {
    let (cache, source) = open_sources(cfg)?;
    let mut conn = store::open_db(&db).with_context(|| format!("open {}", db.display()))?;

    let seasons = cfg.all_seasons();
    let mut run = IngestRun {
        source: source.name().to_string(),
        seasons_total: seasons.len(),
        seasons_succeeded: 0,
        rows_upserted: 0,
        errors: Vec::new(),
    };
    for season in &seasons {
        match source.fetch_season_logged(season) {
            Ok((rows, fetch)) => {
                let n = store::upsert_rows(&mut conn, &rows)?;
                run.seasons_succeeded += 1;
                run.rows_upserted += n;
                println!("{season}: {n} rows from {}", fetch.source);
            }
            Err(err) => {
                warn!(season = %season, error = %err, "season not ingested");
                run.errors.push(format!("{season}: {err}"));
            }
        }
    }
    store::record_ingest_run(&conn, &run)?;
    if let Err(err) = cache.persist() {
        warn!(error = %err, "fetch cache not persisted");
    }
    println!(
        "Ingest: seasons={}/{} rows={} db={}",
        run.seasons_succeeded,
        run.seasons_total,
        run.rows_upserted,
        db.display()
    );
    if run.seasons_succeeded == 0 {
        bail!("no season could be ingested");
    }
    Ok(())
}

fn load_log(pipeline: &Pipeline, synthetic: bool, seed: u64) -> Result<GameLog> {
    if synthetic {
        let cfg = pipeline.config();
        let league = SyntheticLeague {
            seasons: cfg.all_seasons(),
            seed,
            upcoming_rounds: 1,
            ..SyntheticLeague::default()
        };
        let (log, _) = GameLog::from_rows(league.generate());
        return Ok(log);
    }
    let (_, source) = open_sources(pipeline.config())?;
    let (log, report) = pipeline.load_log(&source)?;
    if report.used_fallback() {
        warn!("some seasons were served by the secondary source");
    }
    Ok(log)
}

fn backtest(
    cfg: PipelineConfig,
    synthetic: bool,
    seed: u64,
    report_path: Option<PathBuf>,
    artifacts_path: PathBuf,
) -> Result<()> {
    let pipeline = Pipeline::new(cfg)?;
    let log = load_log(&pipeline, synthetic, seed)?;
    let outcome = pipeline.run_backtest(&log)?;

    println!(
        "Examples: train={} validation={} holdout={} skipped={}",
        outcome.train_examples,
        outcome.validation_examples,
        outcome.holdout_examples,
        outcome.skipped_games
    );
    println!();
    print!("{}", outcome.report.render_text());

    if let Some(path) = report_path {
        outcome
            .report
            .save(&path)
            .with_context(|| format!("write {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }
    outcome
        .artifacts
        .save(&artifacts_path)
        .with_context(|| format!("write {}", artifacts_path.display()))?;
    info!(path = %artifacts_path.display(), "artifacts written");
    Ok(())
}

fn predict(
    cfg: PipelineConfig,
    artifacts_path: PathBuf,
    out: PathBuf,
    synthetic: bool,
    seed: u64,
) -> Result<()> {
    let artifacts = PipelineArtifacts::load(&artifacts_path)
        .with_context(|| format!("read {}", artifacts_path.display()))?;
    let pipeline = Pipeline::new(cfg)?;
    let log = load_log(&pipeline, synthetic, seed)?;
    let summary = pipeline.predict(&log, &artifacts)?;

    for p in &summary.predictions {
        println!(
            "{} {} {} vs {}: home={:.1}% away={:.1}% grade={}",
            p.date,
            p.game_id,
            p.home,
            p.away,
            p.home_prob * 100.0,
            p.away_prob * 100.0,
            p.grade
        );
    }
    for s in &summary.skipped {
        println!("skipped {}: {}", s.game_id, s.reason);
    }
    write_predictions(&out, &summary.predictions)
        .with_context(|| format!("write {}", out.display()))?;
    println!("Predictions: {} written to {}", summary.predictions.len(), out.display());
    Ok(())
}
