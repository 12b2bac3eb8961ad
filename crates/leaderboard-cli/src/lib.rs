//! Command surface for the classroom leaderboard.
//!
//! - [`run_cli`] executes a parsed [`Cli`]; the `lb` binary is a thin wrapper.
//! - [`run_command`] executes a single [`Command`] against an already loaded
//!   competition config, for hosts that manage their own config discovery.
//!
//! JSON payloads carry a `contract_version`; their shapes are pinned by the
//! schemas under `contracts/v1/`.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use leaderboard_core::{
    evaluate, format_display_timestamp, format_rfc3339, now_utc, rank_entries, CachedLeaderboard,
    CompetitionConfig, LeaderboardEntry, LeaderboardEntryInput, Metric, RankedEntry, ScoreResult,
    Solution, SolutionSource, SubmissionError, Table,
};
use leaderboard_store_sqlite::SqliteLeaderboardStore;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const EMPTY_LEADERBOARD_MESSAGE: &str =
    "The leaderboard is currently empty. Be the first to make a submission!";

#[derive(Debug, Parser)]
#[command(name = "lb")]
#[command(about = "Classroom competition leaderboard")]
pub struct Cli {
    /// `SQLite` file holding the append-only leaderboard.
    #[arg(long, global = true, default_value = "./leaderboard.sqlite3")]
    db: PathBuf,

    /// Competition config (YAML).
    #[arg(long, global = true, default_value = "./leaderboard.yaml")]
    config: PathBuf,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, global = true)]
    verbose: bool,

    /// Emit log lines as JSON on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Score a predictions file and record it on the leaderboard.
    Submit(SubmitArgs),
    /// Validate and score a predictions file without recording it.
    Check(CheckArgs),
    /// Show the ranked leaderboard.
    Leaderboard(LeaderboardArgs),
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    json: bool,
    #[arg(long)]
    show_leaderboard: bool,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct LeaderboardArgs {
    #[arg(long)]
    json: bool,
    #[arg(long)]
    limit: Option<usize>,
}

/// A loaded competition config plus where its relative paths resolve from.
#[derive(Debug, Clone)]
pub struct Competition {
    config: CompetitionConfig,
    base_dir: PathBuf,
}

impl Competition {
    /// # Errors
    /// Returns an error when the file cannot be read or the config is invalid.
    pub fn load(config_path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(config_path).with_context(|| {
            format!(
                "failed to read competition config at {}",
                config_path.display()
            )
        })?;
        let config = CompetitionConfig::from_yaml_str(&raw)
            .with_context(|| format!("invalid competition config {}", config_path.display()))?;

        let base_dir = config_path
            .parent()
            .map_or_else(PathBuf::new, Path::to_path_buf);
        Ok(Self::new(config, base_dir))
    }

    #[must_use]
    pub fn new(config: CompetitionConfig, base_dir: PathBuf) -> Self {
        Self { config, base_dir }
    }

    #[must_use]
    pub fn config(&self) -> &CompetitionConfig {
        &self.config
    }

    fn solution_path(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            self.base_dir.join(path)
        } else {
            path.to_path_buf()
        }
    }

    /// # Errors
    /// Returns an error when the solution cannot be read or is not a valid
    /// answer set.
    pub fn load_solution(&self) -> Result<Solution> {
        let raw = match self.config.solution_source()? {
            SolutionSource::Path(path) => {
                let resolved = self.solution_path(path);
                std::fs::read_to_string(&resolved).with_context(|| {
                    format!("failed to read solution file {}", resolved.display())
                })?
            }
            SolutionSource::Inline(csv) => csv.to_string(),
        };

        let solution = Solution::from_csv_str(&raw, &self.config.columns())?;
        tracing::debug!(rows = solution.len(), "loaded solution");
        Ok(solution)
    }
}

/// Configures the global tracing subscriber. `RUST_LOG` wins over `level`.
/// Later calls are ignored.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok();
    }
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when config loading, storage, or the command fails, and
/// when a submission is rejected.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(
        cli.log_json,
        if cli.verbose { Level::DEBUG } else { Level::WARN },
    );

    let competition = Competition::load(&cli.config)?;
    run_command(cli.command, &competition, &cli.db)
}

/// Executes one command against a loaded competition and a `SQLite` path.
/// `check` never opens the database.
///
/// # Errors
/// Returns an error when the command fails or a submission is rejected.
pub fn run_command(command: Command, competition: &Competition, db_path: &Path) -> Result<()> {
    match command {
        Command::Check(args) => run_check(&args, competition),
        Command::Submit(args) => {
            let store = open_store(db_path)?;
            run_submit(&args, competition, store)
        }
        Command::Leaderboard(args) => {
            let store = open_store(db_path)?;
            run_leaderboard(&args, competition, store)
        }
    }
}

fn open_store(db_path: &Path) -> Result<SqliteLeaderboardStore> {
    let store = SqliteLeaderboardStore::open(db_path)?;
    store.migrate()?;
    Ok(store)
}

fn run_submit(
    args: &SubmitArgs,
    competition: &Competition,
    store: SqliteLeaderboardStore,
) -> Result<()> {
    let name = args.name.trim();
    if name.is_empty() {
        return reject(
            args.json,
            &RejectionPayload::new("invalid_name", "Please enter your name.", json!({})),
        );
    }

    let config = competition.config();
    let result = match score_file(&args.file, competition)? {
        Ok(result) => result,
        Err(payload) => return reject(args.json, &payload),
    };

    let mut board = CachedLeaderboard::new(store, config.cache_ttl());
    let entry = board.append(&LeaderboardEntryInput {
        name: name.to_string(),
        metric: result.metric,
        score: result.value,
        submitted_at: now_utc(),
    })?;

    let leaderboard = if args.show_leaderboard {
        let entries = board.read_all()?;
        Some(build_leaderboard_payload(config, &entries, None))
    } else {
        None
    };

    if args.json {
        let receipt = build_receipt_payload(&entry, leaderboard)?;
        println!("{}", serde_json::to_string_pretty(&receipt)?);
    } else {
        println!(
            "Submission successful! Your {}: {:.5}",
            entry.metric.label(),
            entry.score
        );
        if let Some(payload) = leaderboard {
            println!();
            print!("{}", render_leaderboard(&payload));
        }
    }

    Ok(())
}

fn run_check(args: &CheckArgs, competition: &Competition) -> Result<()> {
    let result = match score_file(&args.file, competition)? {
        Ok(result) => result,
        Err(payload) => return reject(args.json, &payload),
    };

    if args.json {
        let payload = CheckPayload {
            contract_version: "submission_check.v1".to_string(),
            status: "valid".to_string(),
            metric: result.metric,
            metric_label: result.metric.label().to_string(),
            score: result.value,
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!(
            "Submission is valid (not recorded). {}: {:.5}",
            result.metric.label(),
            result.value
        );
    }

    Ok(())
}

fn run_leaderboard(
    args: &LeaderboardArgs,
    competition: &Competition,
    store: SqliteLeaderboardStore,
) -> Result<()> {
    let mut board = CachedLeaderboard::new(store, competition.config().cache_ttl());
    let entries = board.read_all()?;
    let payload = build_leaderboard_payload(competition.config(), &entries, args.limit);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print!("{}", render_leaderboard(&payload));
    }

    Ok(())
}

/// Decodes, validates and scores a submission file. The inner `Err` is a
/// student-facing rejection; the outer one is an operational failure.
fn score_file(
    path: &Path,
    competition: &Competition,
) -> Result<std::result::Result<ScoreResult, RejectionPayload>> {
    let config = competition.config();
    let solution = competition.load_solution()?;

    let file = File::open(path)
        .with_context(|| format!("failed to open submission file {}", path.display()))?;
    let submission = match Table::from_csv_reader(file) {
        Ok(table) => table,
        Err(err) => {
            tracing::info!(file = %path.display(), error = %err, "unreadable submission");
            return Ok(Err(RejectionPayload::new(
                "unreadable_file",
                &format!("Error reading file: {err}"),
                json!({}),
            )));
        }
    };

    match evaluate(&submission, &solution, &config.columns(), config.metric) {
        Ok(result) => {
            tracing::debug!(
                metric = result.metric_name(),
                score = result.value,
                "scored submission"
            );
            Ok(Ok(result))
        }
        Err(err) => {
            tracing::info!(code = err.code(), "submission rejected");
            Ok(Err(RejectionPayload::from_submission_error(&err)?))
        }
    }
}

fn reject(json: bool, payload: &RejectionPayload) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(payload)?);
    } else {
        eprintln!("{}", payload.message);
    }
    Err(anyhow!("submission rejected ({})", payload.code))
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RejectionPayload {
    status: String,
    code: String,
    message: String,
    details: Value,
}

impl RejectionPayload {
    fn new(code: &str, message: &str, details: Value) -> Self {
        Self {
            status: "rejected".to_string(),
            code: code.to_string(),
            message: message.to_string(),
            details,
        }
    }

    fn from_submission_error(err: &SubmissionError) -> Result<Self> {
        let mut details = match err {
            SubmissionError::Rejected(rejection) => serde_json::to_value(rejection)?,
            SubmissionError::Scoring(scoring) => serde_json::to_value(scoring)?,
        };
        if let Some(object) = details.as_object_mut() {
            object.remove("code");
        }

        Ok(Self::new(err.code(), &err.to_string(), details))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckPayload {
    contract_version: String,
    status: String,
    metric: Metric,
    metric_label: String,
    score: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LeaderboardPayload {
    contract_version: String,
    title: String,
    metric: Metric,
    metric_label: String,
    higher_is_better: bool,
    entries: Vec<RankedEntry>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReceiptPayload {
    contract_version: String,
    status: String,
    entry_seq: i64,
    entry_id: String,
    name: String,
    metric: Metric,
    metric_label: String,
    score: f64,
    submitted_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    leaderboard: Option<LeaderboardPayload>,
}

fn build_leaderboard_payload(
    config: &CompetitionConfig,
    entries: &[LeaderboardEntry],
    limit: Option<usize>,
) -> LeaderboardPayload {
    let mut ranked = rank_entries(entries, config.metric);
    if let Some(limit) = limit {
        ranked.truncate(limit);
    }

    LeaderboardPayload {
        contract_version: "leaderboard.v1".to_string(),
        title: config.title.clone(),
        metric: config.metric,
        metric_label: config.metric.label().to_string(),
        higher_is_better: config.metric.higher_is_better(),
        entries: ranked,
    }
}

fn build_receipt_payload(
    entry: &LeaderboardEntry,
    leaderboard: Option<LeaderboardPayload>,
) -> Result<ReceiptPayload> {
    Ok(ReceiptPayload {
        contract_version: "submission_receipt.v1".to_string(),
        status: "accepted".to_string(),
        entry_seq: entry.entry_seq,
        entry_id: entry.entry_id.to_string(),
        name: entry.name.clone(),
        metric: entry.metric,
        metric_label: entry.metric.label().to_string(),
        score: entry.score,
        submitted_at: format_rfc3339(entry.submitted_at)?,
        leaderboard,
    })
}

fn render_leaderboard(payload: &LeaderboardPayload) -> String {
    let direction = if payload.higher_is_better {
        "higher is better"
    } else {
        "lower is better"
    };
    let mut out = format!(
        "{} ({}, {direction})\n",
        payload.title, payload.metric_label
    );

    if payload.entries.is_empty() {
        out.push_str(EMPTY_LEADERBOARD_MESSAGE);
        out.push('\n');
        return out;
    }

    out.push_str(&format!(
        "{:<6} {:<24} {:<12} {}\n",
        "Rank", "Name", "Score", "Submission Time"
    ));
    out.push_str(&"-".repeat(70));
    out.push('\n');
    for entry in &payload.entries {
        out.push_str(&format!(
            "{:<6} {:<24} {:<12.5} {}\n",
            entry.rank,
            entry.name,
            entry.score,
            format_display_timestamp(entry.submitted_at)
        ));
    }
    out
}
