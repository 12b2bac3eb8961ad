use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const DEFAULT_TITLE: &str = "Class Competition Leaderboard";
pub const DEFAULT_KEY_COLUMN: &str = "ID";
pub const DEFAULT_VALUE_COLUMN: &str = "Target";
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;

/// Upper bound on keys echoed back in a rejection message.
const KEY_PREVIEW_LIMIT: usize = 10;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LeaderboardError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TableError {
    #[error("CSV input has no header row")]
    MissingHeader,
    #[error("duplicate column name in header: {0}")]
    DuplicateColumn(String),
    #[error("line {line} has {actual} fields, expected {expected}")]
    RaggedRow {
        line: u64,
        expected: usize,
        actual: usize,
    },
    #[error("malformed CSV: {0}")]
    Malformed(String),
}

/// A decoded CSV document: named columns and rows of trimmed string cells.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Builds a table from already-split cells.
    ///
    /// # Errors
    /// Returns [`TableError`] when the header is empty, repeats a name, or a
    /// row width differs from the header width.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, TableError> {
        if columns.is_empty() {
            return Err(TableError::MissingHeader);
        }

        let mut seen = BTreeSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(TableError::DuplicateColumn(column.clone()));
            }
        }

        for (index, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(TableError::RaggedRow {
                    // Line 1 is the header.
                    line: index as u64 + 2,
                    expected: columns.len(),
                    actual: row.len(),
                });
            }
        }

        Ok(Self { columns, rows })
    }

    /// Decodes comma-separated text with a header row.
    ///
    /// # Errors
    /// Returns [`TableError`] when the input is not well-formed CSV or does
    /// not form a rectangular table.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, TableError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv_reader
            .headers()
            .map_err(|err| TableError::Malformed(err.to_string()))?
            .clone();
        if headers.is_empty() {
            return Err(TableError::MissingHeader);
        }
        let columns: Vec<String> = headers.iter().map(str::to_string).collect();

        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record.map_err(|err| TableError::Malformed(err.to_string()))?;
            if record.len() != columns.len() {
                return Err(TableError::RaggedRow {
                    line: record.position().map_or(0, csv::Position::line),
                    expected: columns.len(),
                    actual: record.len(),
                });
            }
            rows.push(record.iter().map(str::to_string).collect());
        }

        Self::new(columns, rows)
    }

    /// # Errors
    /// See [`Table::from_csv_reader`].
    pub fn from_csv_str(input: &str) -> Result<Self, TableError> {
        Self::from_csv_reader(input.as_bytes())
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }
}

/// Names of the join-key column and the label column.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColumnSpec {
    pub key_column: String,
    pub value_column: String,
}

impl ColumnSpec {
    #[must_use]
    pub fn new(key_column: impl Into<String>, value_column: impl Into<String>) -> Self {
        Self {
            key_column: key_column.into(),
            value_column: value_column.into(),
        }
    }
}

impl Default for ColumnSpec {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_COLUMN, DEFAULT_VALUE_COLUMN)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    F1Weighted,
    Rmse,
}

impl Metric {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F1Weighted => "f1_weighted",
            Self::Rmse => "rmse",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "f1_weighted" => Some(Self::F1Weighted),
            "rmse" => Some(Self::Rmse),
            _ => None,
        }
    }

    /// Human-facing name used in submission receipts.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::F1Weighted => "F1 Score",
            Self::Rmse => "RMSE",
        }
    }

    #[must_use]
    pub fn higher_is_better(self) -> bool {
        matches!(self, Self::F1Weighted)
    }

    /// Orders two scores so that the better one sorts first.
    #[must_use]
    pub fn rank_order(self, lhs: f64, rhs: f64) -> Ordering {
        if self.higher_is_better() {
            rhs.total_cmp(&lhs)
        } else {
            lhs.total_cmp(&rhs)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LabeledRow {
    pub key: String,
    pub label: String,
}

/// The trusted answer set. Keys are unique and there is at least one row.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Solution {
    rows: Vec<LabeledRow>,
    index: BTreeMap<String, usize>,
}

impl Solution {
    /// # Errors
    /// Returns [`LeaderboardError::Configuration`] when `rows` is empty or
    /// repeats a join key.
    pub fn from_rows(rows: Vec<LabeledRow>) -> Result<Self, LeaderboardError> {
        if rows.is_empty() {
            return Err(LeaderboardError::Configuration(
                "solution MUST contain at least one row".to_string(),
            ));
        }

        let mut index = BTreeMap::new();
        let mut duplicates = BTreeSet::new();
        for (position, row) in rows.iter().enumerate() {
            if index.insert(row.key.clone(), position).is_some() {
                duplicates.insert(row.key.clone());
            }
        }

        if !duplicates.is_empty() {
            return Err(LeaderboardError::Configuration(format!(
                "solution repeats join key(s): {}",
                preview(&duplicates)
            )));
        }

        Ok(Self { rows, index })
    }

    /// Extracts the key and label columns named by `columns` from a decoded
    /// table.
    ///
    /// # Errors
    /// Returns [`LeaderboardError::Configuration`] when a column is missing,
    /// the table is empty, or a join key repeats.
    pub fn from_table(table: &Table, columns: &ColumnSpec) -> Result<Self, LeaderboardError> {
        let column = |name: &str| {
            table.column_index(name).ok_or_else(|| {
                LeaderboardError::Configuration(format!("solution is missing column {name}"))
            })
        };
        let key_index = column(columns.key_column.as_str())?;
        let value_index = column(columns.value_column.as_str())?;

        let rows = table
            .rows()
            .iter()
            .map(|row| LabeledRow {
                key: row[key_index].clone(),
                label: row[value_index].clone(),
            })
            .collect();

        Self::from_rows(rows)
    }

    /// # Errors
    /// Returns [`LeaderboardError::Configuration`] when the text is not a
    /// usable solution table.
    pub fn from_csv_str(input: &str, columns: &ColumnSpec) -> Result<Self, LeaderboardError> {
        let table = Table::from_csv_str(input).map_err(|err| {
            LeaderboardError::Configuration(format!("could not parse solution data: {err}"))
        })?;
        Self::from_table(&table, columns)
    }

    #[must_use]
    pub fn rows(&self) -> &[LabeledRow] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    #[must_use]
    pub fn label_for(&self, key: &str) -> Option<&str> {
        self.index
            .get(key)
            .map(|position| self.rows[*position].label.as_str())
    }
}

/// Reasons a submission is turned away before scoring.
#[derive(Debug, Clone, thiserror::Error, Serialize, Eq, PartialEq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Rejection {
    #[error("submission is missing required column(s): {}", preview(.missing))]
    MissingColumns { missing: Vec<String> },
    #[error(
        "submission has unexpected column(s): {}; only the key and prediction columns are allowed",
        preview(.unexpected)
    )]
    UnexpectedColumns { unexpected: Vec<String> },
    #[error("submission has {actual} rows but {expected} were expected")]
    RowCountMismatch { expected: usize, actual: usize },
    #[error("submission repeats join key(s): {}", preview(.keys))]
    DuplicateKeys { keys: BTreeSet<String> },
    #[error(
        "submission keys do not match the expected set; missing: {}; unexpected: {}",
        preview(.missing),
        preview(.extra)
    )]
    KeySetMismatch {
        missing: BTreeSet<String>,
        extra: BTreeSet<String>,
    },
}

impl Rejection {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingColumns { .. } => "missing_columns",
            Self::UnexpectedColumns { .. } => "unexpected_columns",
            Self::RowCountMismatch { .. } => "row_count_mismatch",
            Self::DuplicateKeys { .. } => "duplicate_keys",
            Self::KeySetMismatch { .. } => "key_set_mismatch",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Serialize, Eq, PartialEq)]
#[error("scoring failed: {reason}")]
pub struct ScoringError {
    pub reason: String,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SubmissionError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Scoring(#[from] ScoringError),
}

impl SubmissionError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Rejected(rejection) => rejection.code(),
            Self::Scoring(_) => "scoring_error",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct JoinedRow<'a> {
    pub key: &'a str,
    pub predicted: &'a str,
    pub truth: &'a str,
}

/// Proof that a submission passed [`validate`]; the only input [`score`]
/// accepts. Rows follow solution order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ValidatedSubmission<'a> {
    rows: Vec<JoinedRow<'a>>,
}

impl<'a> ValidatedSubmission<'a> {
    #[must_use]
    pub fn rows(&self) -> &[JoinedRow<'a>] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Checks a submission against the solution: required columns, no extra
/// columns, row count, unique keys, then exact key-set equality. Stops at
/// the first failure.
///
/// # Errors
/// Returns the first [`Rejection`] that applies.
pub fn validate<'a>(
    submission: &'a Table,
    solution: &'a Solution,
    columns: &ColumnSpec,
) -> Result<ValidatedSubmission<'a>, Rejection> {
    let key_index = submission.column_index(&columns.key_column);
    let value_index = submission.column_index(&columns.value_column);
    let (Some(key_index), Some(value_index)) = (key_index, value_index) else {
        let missing = [
            (&columns.key_column, key_index),
            (&columns.value_column, value_index),
        ]
        .into_iter()
        .filter(|(_, index)| index.is_none())
        .map(|(name, _)| name.clone())
        .collect();
        return Err(Rejection::MissingColumns { missing });
    };

    let unexpected: Vec<String> = submission
        .columns()
        .iter()
        .filter(|name| **name != columns.key_column && **name != columns.value_column)
        .cloned()
        .collect();
    if !unexpected.is_empty() {
        return Err(Rejection::UnexpectedColumns { unexpected });
    }

    if submission.len() != solution.len() {
        return Err(Rejection::RowCountMismatch {
            expected: solution.len(),
            actual: submission.len(),
        });
    }

    let mut predictions: BTreeMap<&'a str, &'a str> = BTreeMap::new();
    let mut duplicates = BTreeSet::new();
    for row in submission.rows() {
        let key = row[key_index].as_str();
        if predictions.insert(key, row[value_index].as_str()).is_some() {
            duplicates.insert(key.to_string());
        }
    }
    if !duplicates.is_empty() {
        return Err(Rejection::DuplicateKeys { keys: duplicates });
    }

    let missing: BTreeSet<String> = solution
        .rows()
        .iter()
        .filter(|row| !predictions.contains_key(row.key.as_str()))
        .map(|row| row.key.clone())
        .collect();
    let extra: BTreeSet<String> = predictions
        .keys()
        .filter(|key| !solution.contains_key(key))
        .map(|key| (*key).to_string())
        .collect();
    if !missing.is_empty() || !extra.is_empty() {
        return Err(Rejection::KeySetMismatch { missing, extra });
    }

    let rows = solution
        .rows()
        .iter()
        .filter_map(|truth| {
            predictions
                .get(truth.key.as_str())
                .copied()
                .map(|predicted| JoinedRow {
                    key: truth.key.as_str(),
                    predicted,
                    truth: truth.label.as_str(),
                })
        })
        .collect();

    Ok(ValidatedSubmission { rows })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoreResult {
    pub metric: Metric,
    pub value: f64,
}

impl ScoreResult {
    #[must_use]
    pub fn metric_name(&self) -> &'static str {
        self.metric.as_str()
    }
}

/// Computes `metric` over a validated submission.
///
/// # Errors
/// Returns [`ScoringError`] when a value cannot be read as the type the
/// metric needs, or the computation does not produce a finite number.
pub fn score(
    validated: &ValidatedSubmission<'_>,
    metric: Metric,
) -> Result<ScoreResult, ScoringError> {
    let value = match metric {
        Metric::F1Weighted => weighted_f1(validated.rows()),
        Metric::Rmse => root_mean_squared_error(validated.rows())?,
    };

    if !value.is_finite() {
        return Err(ScoringError {
            reason: format!("{} is not a finite number", metric.label()),
        });
    }

    Ok(ScoreResult { metric, value })
}

/// Runs [`validate`] and then [`score`].
///
/// # Errors
/// Returns [`SubmissionError::Rejected`] or [`SubmissionError::Scoring`].
pub fn evaluate(
    submission: &Table,
    solution: &Solution,
    columns: &ColumnSpec,
    metric: Metric,
) -> Result<ScoreResult, SubmissionError> {
    let validated = validate(submission, solution, columns)?;
    Ok(score(&validated, metric)?)
}

#[derive(Debug, Default, Clone, Copy)]
struct ClassCounts {
    true_positive: usize,
    false_positive: usize,
    false_negative: usize,
    support: usize,
}

#[allow(clippy::cast_precision_loss)]
fn weighted_f1(rows: &[JoinedRow<'_>]) -> f64 {
    let mut classes: BTreeMap<&str, ClassCounts> = BTreeMap::new();
    for row in rows {
        if row.predicted == row.truth {
            classes.entry(row.truth).or_default().true_positive += 1;
        } else {
            classes.entry(row.predicted).or_default().false_positive += 1;
            classes.entry(row.truth).or_default().false_negative += 1;
        }
        classes.entry(row.truth).or_default().support += 1;
    }

    let mut weighted_sum = 0.0;
    let mut total_support = 0_usize;
    for counts in classes.values() {
        if counts.support == 0 {
            continue;
        }
        let precision = ratio(
            counts.true_positive,
            counts.true_positive + counts.false_positive,
        );
        let recall = ratio(
            counts.true_positive,
            counts.true_positive + counts.false_negative,
        );
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        weighted_sum += f1 * counts.support as f64;
        total_support += counts.support;
    }

    if total_support == 0 {
        return 0.0;
    }
    weighted_sum / total_support as f64
}

#[allow(clippy::cast_precision_loss)]
fn root_mean_squared_error(rows: &[JoinedRow<'_>]) -> Result<f64, ScoringError> {
    // Halved differences stay finite for any pair of finite inputs.
    let mut half_errors = Vec::with_capacity(rows.len());
    for row in rows {
        let truth = parse_numeric(row.truth, row.key, "solution")?;
        let predicted = parse_numeric(row.predicted, row.key, "submission")?;
        half_errors.push(truth * 0.5 - predicted * 0.5);
    }

    let scale = half_errors.iter().fold(0.0_f64, |max, error| max.max(error.abs()));
    if scale == 0.0 {
        return Ok(0.0);
    }
    let sum_scaled: f64 = half_errors
        .iter()
        .map(|error| {
            let scaled = error / scale;
            scaled * scaled
        })
        .sum();
    Ok(2.0 * scale * (sum_scaled / half_errors.len() as f64).sqrt())
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn parse_numeric(raw: &str, key: &str, side: &str) -> Result<f64, ScoringError> {
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ScoringError {
            reason: format!("{side} value for key {key} is not a finite number: {raw:?}"),
        }),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntryInput {
    pub name: String,
    pub metric: Metric,
    pub score: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
}

impl LeaderboardEntryInput {
    /// Validates an entry before append.
    ///
    /// # Errors
    /// Returns [`LeaderboardError::Validation`] for a blank name, a
    /// non-finite score, or a non-UTC timestamp.
    pub fn validate(&self) -> Result<(), LeaderboardError> {
        if self.name.trim().is_empty() {
            return Err(LeaderboardError::Validation(
                "name MUST be provided for every submission".to_string(),
            ));
        }

        if !self.score.is_finite() {
            return Err(LeaderboardError::Validation(
                "score MUST be a finite number".to_string(),
            ));
        }

        if self.submitted_at.offset() != UtcOffset::UTC {
            return Err(LeaderboardError::Validation(
                "submitted_at MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub entry_seq: i64,
    pub entry_id: Ulid,
    pub name: String,
    pub metric: Metric,
    pub score: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedEntry {
    pub rank: usize,
    pub name: String,
    pub score: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
}

/// Ranks entries recorded for `metric`, best first. Ties go to the earlier
/// submission.
#[must_use]
pub fn rank_entries(entries: &[LeaderboardEntry], metric: Metric) -> Vec<RankedEntry> {
    let mut eligible: Vec<&LeaderboardEntry> = entries
        .iter()
        .filter(|entry| entry.metric == metric && entry.score.is_finite())
        .collect();

    eligible.sort_by(|lhs, rhs| {
        metric
            .rank_order(lhs.score, rhs.score)
            .then_with(|| lhs.submitted_at.cmp(&rhs.submitted_at))
            .then_with(|| lhs.entry_seq.cmp(&rhs.entry_seq))
    });

    eligible
        .into_iter()
        .enumerate()
        .map(|(position, entry)| RankedEntry {
            rank: position + 1,
            name: entry.name.clone(),
            score: entry.score,
            submitted_at: entry.submitted_at,
        })
        .collect()
}

/// Append-only log of scored submissions.
pub trait LeaderboardStore {
    type Error;

    /// # Errors
    /// Implementation-defined.
    fn append(&mut self, entry: &LeaderboardEntryInput) -> Result<LeaderboardEntry, Self::Error>;

    /// Returns every stored entry in insertion order.
    ///
    /// # Errors
    /// Implementation-defined.
    fn read_all(&self) -> Result<Vec<LeaderboardEntry>, Self::Error>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLeaderboardStore {
    entries: Vec<LeaderboardEntry>,
}

impl MemoryLeaderboardStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaderboardStore for MemoryLeaderboardStore {
    type Error = LeaderboardError;

    fn append(&mut self, entry: &LeaderboardEntryInput) -> Result<LeaderboardEntry, Self::Error> {
        entry.validate()?;

        let entry_seq = i64::try_from(self.entries.len() + 1).map_err(|_| {
            LeaderboardError::Validation("entry sequence overflowed".to_string())
        })?;
        let stored = LeaderboardEntry {
            entry_seq,
            entry_id: Ulid::new(),
            name: entry.name.clone(),
            metric: entry.metric,
            score: entry.score,
            submitted_at: entry.submitted_at,
        };
        self.entries.push(stored.clone());
        Ok(stored)
    }

    fn read_all(&self) -> Result<Vec<LeaderboardEntry>, Self::Error> {
        Ok(self.entries.clone())
    }
}

#[derive(Debug, Clone)]
struct CachedRead {
    fetched_at: Instant,
    entries: Vec<LeaderboardEntry>,
}

/// Memoises [`LeaderboardStore::read_all`] for a fixed time-to-live.
/// Appends through the wrapper drop the memo. A zero TTL disables caching.
#[derive(Debug)]
pub struct CachedLeaderboard<S> {
    store: S,
    ttl: Duration,
    cached: Option<CachedRead>,
}

impl<S: LeaderboardStore> CachedLeaderboard<S> {
    pub fn new(store: S, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cached: None,
        }
    }

    /// # Errors
    /// Propagates the store's append error; the memo is left intact then.
    pub fn append(&mut self, entry: &LeaderboardEntryInput) -> Result<LeaderboardEntry, S::Error> {
        let stored = self.store.append(entry)?;
        self.invalidate();
        Ok(stored)
    }

    /// # Errors
    /// Propagates the store's read error.
    pub fn read_all(&mut self) -> Result<Vec<LeaderboardEntry>, S::Error> {
        self.read_all_at(Instant::now())
    }

    /// Reads through the memo as if the current time were `now`.
    ///
    /// # Errors
    /// Propagates the store's read error.
    pub fn read_all_at(&mut self, now: Instant) -> Result<Vec<LeaderboardEntry>, S::Error> {
        if let Some(cached) = &self.cached {
            if now.saturating_duration_since(cached.fetched_at) < self.ttl {
                return Ok(cached.entries.clone());
            }
        }

        let entries = self.store.read_all()?;
        self.cached = if self.ttl.is_zero() {
            None
        } else {
            Some(CachedRead {
                fetched_at: now,
                entries: entries.clone(),
            })
        };
        Ok(entries)
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    #[must_use]
    pub fn is_warm(&self) -> bool {
        self.cached.is_some()
    }

    /// Drops the memo and hands back the wrapped store.
    pub fn into_inner(self) -> S {
        self.store
    }
}

fn default_title() -> String {
    DEFAULT_TITLE.to_string()
}

fn default_key_column() -> String {
    DEFAULT_KEY_COLUMN.to_string()
}

fn default_value_column() -> String {
    DEFAULT_VALUE_COLUMN.to_string()
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

/// Competition settings, normally read from a YAML file.
///
/// ```yaml
/// title: "Class Competition Leaderboard"
/// metric: f1_weighted
/// key_column: ID
/// value_column: Target
/// solution_path: solution.csv
/// cache_ttl_secs: 60
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CompetitionConfig {
    #[serde(default = "default_title")]
    pub title: String,

    pub metric: Metric,

    #[serde(default = "default_key_column")]
    pub key_column: String,

    #[serde(default = "default_value_column")]
    pub value_column: String,

    /// Path to the solution CSV; relative paths resolve against the
    /// directory holding the config file.
    #[serde(default)]
    pub solution_path: Option<PathBuf>,

    /// Inline solution CSV text.
    #[serde(default)]
    pub solution_csv: Option<String>,

    /// Lifetime of a [`CachedLeaderboard`] memo. Only long-lived hosts that
    /// embed the library keep a cache across reads; each `lb` invocation
    /// builds a fresh cache and reads through it at most once, so the value
    /// has no effect on the binary.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SolutionSource<'a> {
    Path(&'a Path),
    Inline(&'a str),
}

impl CompetitionConfig {
    /// Decodes and validates a config from YAML.
    ///
    /// # Errors
    /// Returns [`LeaderboardError::Configuration`] when YAML decoding fails
    /// or validation fails.
    pub fn from_yaml_str(raw: &str) -> Result<Self, LeaderboardError> {
        let config: Self = serde_yaml::from_str(raw).map_err(|err| {
            LeaderboardError::Configuration(format!("invalid competition config YAML: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`LeaderboardError::Configuration`] when a field is blank,
    /// the key and value columns coincide, or the solution source is not
    /// exactly one of `solution_path` / `solution_csv`.
    pub fn validate(&self) -> Result<(), LeaderboardError> {
        for (name, value) in [
            ("title", &self.title),
            ("key_column", &self.key_column),
            ("value_column", &self.value_column),
        ] {
            if value.trim().is_empty() {
                return Err(LeaderboardError::Configuration(format!(
                    "{name} MUST NOT be blank"
                )));
            }
        }

        if self.key_column == self.value_column {
            return Err(LeaderboardError::Configuration(
                "key_column and value_column MUST differ".to_string(),
            ));
        }

        match (&self.solution_path, &self.solution_csv) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err(LeaderboardError::Configuration(
                "set only one of solution_path or solution_csv".to_string(),
            )),
            (None, None) => Err(LeaderboardError::Configuration(
                "one of solution_path or solution_csv is required".to_string(),
            )),
        }
    }

    #[must_use]
    pub fn columns(&self) -> ColumnSpec {
        ColumnSpec::new(self.key_column.clone(), self.value_column.clone())
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Returns where the solution lives. Call after [`Self::validate`].
    ///
    /// # Errors
    /// Returns [`LeaderboardError::Configuration`] when no single source is
    /// configured.
    pub fn solution_source(&self) -> Result<SolutionSource<'_>, LeaderboardError> {
        self.validate()?;
        match (&self.solution_path, &self.solution_csv) {
            (Some(path), None) => Ok(SolutionSource::Path(path)),
            (None, Some(csv)) => Ok(SolutionSource::Inline(csv)),
            _ => Err(LeaderboardError::Configuration(
                "solution source is ambiguous".to_string(),
            )),
        }
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LeaderboardError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LeaderboardError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LeaderboardError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LeaderboardError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LeaderboardError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LeaderboardError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LeaderboardError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// `2026-02-07 12:00:00 UTC` style, as shown in the leaderboard table.
#[must_use]
pub fn format_display_timestamp(value: OffsetDateTime) -> String {
    let utc = value.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
        utc.year(),
        u8::from(utc.month()),
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second()
    )
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

fn preview<'a, I>(keys: I) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    let keys: Vec<&String> = keys.into_iter().collect();
    if keys.is_empty() {
        return "none".to_string();
    }

    let shown = keys
        .iter()
        .take(KEY_PREVIEW_LIMIT)
        .map(|key| key.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    if keys.len() > KEY_PREVIEW_LIMIT {
        format!("{shown} (and {} more)", keys.len() - KEY_PREVIEW_LIMIT)
    } else {
        shown
    }
}
