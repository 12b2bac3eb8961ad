#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use leaderboard_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, LeaderboardEntry, LeaderboardEntryInput,
    LeaderboardStore, Metric,
};
use rusqlite::{params, Connection, OptionalExtension};
use ulid::Ulid;

const LEADERBOARD_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEADERBOARD_V1: &str = r"
CREATE TABLE IF NOT EXISTS leaderboard_entries (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL CHECK (length(trim(name)) > 0),
  metric TEXT NOT NULL CHECK (metric IN ('f1_weighted', 'rmse')),
  score REAL NOT NULL,
  submitted_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_leaderboard_entries_no_update
BEFORE UPDATE ON leaderboard_entries
BEGIN
  SELECT RAISE(FAIL, 'leaderboard_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_leaderboard_entries_no_delete
BEFORE DELETE ON leaderboard_entries
BEGIN
  SELECT RAISE(FAIL, 'leaderboard_entries is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_leaderboard_entries_metric_score
  ON leaderboard_entries(metric, score);
";

const SELECT_ENTRY_COLUMNS: &str =
    "SELECT entry_seq, entry_id, name, metric, score, submitted_at FROM leaderboard_entries";

pub struct SqliteLeaderboardStore {
    conn: Connection,
}

impl SqliteLeaderboardStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        tracing::debug!(path = %path.display(), "opened leaderboard database");
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEADERBOARD_V1)
            .context("failed to apply leaderboard schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEADERBOARD_MIGRATION_VERSION, now],
            )
            .context("failed to register leaderboard schema migration")?;

        if inserted > 0 {
            tracing::info!(
                version = LEADERBOARD_MIGRATION_VERSION,
                "applied leaderboard schema migration"
            );
        }

        Ok(())
    }

    pub fn append_entry(&mut self, input: &LeaderboardEntryInput) -> Result<LeaderboardEntry> {
        input
            .validate()
            .map_err(|err| anyhow!("entry validation failed: {err}"))?;

        let entry_id = Ulid::new();
        let submitted_at =
            format_rfc3339(input.submitted_at).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start entry transaction")?;

        tx.execute(
            "INSERT INTO leaderboard_entries(entry_id, name, metric, score, submitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry_id.to_string(),
                input.name,
                input.metric.as_str(),
                input.score,
                submitted_at,
            ],
        )
        .context("failed to append leaderboard entry")?;

        let entry_seq = tx.last_insert_rowid();
        tx.commit().context("failed to commit entry transaction")?;

        tracing::info!(
            entry_seq,
            entry_id = %entry_id,
            metric = input.metric.as_str(),
            score = input.score,
            "appended leaderboard entry"
        );

        Ok(LeaderboardEntry {
            entry_seq,
            entry_id,
            name: input.name.clone(),
            metric: input.metric,
            score: input.score,
            submitted_at: input.submitted_at,
        })
    }

    pub fn list_entries(&self) -> Result<Vec<LeaderboardEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_ENTRY_COLUMNS} ORDER BY entry_seq ASC"))?;
        let rows = stmt.query_map([], parse_entry_row)?;
        let entries = collect_rows(rows)?;

        tracing::debug!(count = entries.len(), "read leaderboard entries");
        Ok(entries)
    }

    pub fn get_entry(&self, entry_id: Ulid) -> Result<Option<LeaderboardEntry>> {
        self.conn
            .query_row(
                &format!("{SELECT_ENTRY_COLUMNS} WHERE entry_id = ?1"),
                params![entry_id.to_string()],
                parse_entry_row,
            )
            .optional()
            .with_context(|| format!("failed to load leaderboard entry {entry_id}"))
    }

    pub fn count_entries(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM leaderboard_entries", [], |row| {
                row.get(0)
            })
            .context("failed to count leaderboard entries")?;

        usize::try_from(count).with_context(|| format!("invalid entry count: {count}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl LeaderboardStore for SqliteLeaderboardStore {
    type Error = anyhow::Error;

    fn append(&mut self, entry: &LeaderboardEntryInput) -> Result<LeaderboardEntry> {
        self.append_entry(entry)
    }

    fn read_all(&self) -> Result<Vec<LeaderboardEntry>> {
        self.list_entries()
    }
}

fn parse_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LeaderboardEntry> {
    let entry_id_raw: String = row.get(1)?;
    let metric_raw: String = row.get(3)?;
    let submitted_at_raw: String = row.get(5)?;

    let entry_id = Ulid::from_string(&entry_id_raw)
        .map_err(|_| conversion_error(1, format!("invalid entry_id ULID: {entry_id_raw}")))?;

    let metric = Metric::parse(&metric_raw)
        .ok_or_else(|| conversion_error(3, format!("invalid metric: {metric_raw}")))?;

    let submitted_at = parse_rfc3339_utc(&submitted_at_raw)
        .map_err(|err| conversion_error(5, format!("invalid submitted_at: {err}")))?;

    Ok(LeaderboardEntry {
        entry_seq: row.get(0)?,
        entry_id,
        name: row.get(2)?,
        metric,
        score: row.get(4)?,
        submitted_at,
    })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.context("failed to decode leaderboard row")?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use leaderboard_core::{rank_entries, MemoryLeaderboardStore};
    use proptest::prelude::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteLeaderboardStore {
        let store = must(SqliteLeaderboardStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_input(name: &str, score: f64, at: &str) -> LeaderboardEntryInput {
        LeaderboardEntryInput {
            name: name.to_string(),
            metric: Metric::F1Weighted,
            score,
            submitted_at: match parse_rfc3339_utc(at) {
                Ok(value) => value,
                Err(err) => panic!("invalid fixture timestamp: {err}"),
            },
        }
    }

    fn object_count(store: &SqliteLeaderboardStore, kind: &str, names: &[&str]) -> i64 {
        let placeholders = names
            .iter()
            .map(|name| format!("'{name}'"))
            .collect::<Vec<_>>()
            .join(", ");
        match store.connection().query_row(
            &format!(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name IN ({placeholders})"
            ),
            params![kind],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to query sqlite_master: {err}"),
        }
    }

    #[test]
    fn append_assigns_sequence_and_reads_back_in_order() {
        let mut store = fixture_store();
        let first = must(store.append_entry(&fixture_input("ada", 0.5, "2026-02-07T12:00:00Z")));
        let second =
            must(store.append_entry(&fixture_input("grace", 0.75, "2026-02-07T12:05:00Z")));
        assert!(second.entry_seq > first.entry_seq);

        let entries = must(store.list_entries());
        assert_eq!(entries, vec![first.clone(), second]);
        assert_eq!(must(store.count_entries()), 2);

        let loaded = must(store.get_entry(first.entry_id));
        assert_eq!(loaded, Some(first));
        assert_eq!(must(store.get_entry(Ulid::new())), None);
    }

    #[test]
    fn append_rejects_invalid_input_without_writing() {
        let mut store = fixture_store();
        let blank = fixture_input("  ", 0.5, "2026-02-07T12:00:00Z");
        let err = match store.append_entry(&blank) {
            Ok(value) => panic!("expected validation failure, got {value:?}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("entry validation failed"));

        let nan = fixture_input("ada", f64::NAN, "2026-02-07T12:00:00Z");
        assert!(store.append_entry(&nan).is_err());
        assert_eq!(must(store.count_entries()), 0);
    }

    #[test]
    fn append_only_trigger_blocks_updates_and_deletes() {
        let mut store = fixture_store();
        let entry = must(store.append_entry(&fixture_input("ada", 0.5, "2026-02-07T12:00:00Z")));

        let update_result = store.connection().execute(
            "UPDATE leaderboard_entries SET score = 1.0 WHERE entry_seq = ?1",
            params![entry.entry_seq],
        );
        assert!(update_result.is_err());

        let delete_result = store.connection().execute(
            "DELETE FROM leaderboard_entries WHERE entry_seq = ?1",
            params![entry.entry_seq],
        );
        assert!(delete_result.is_err());

        assert_eq!(must(store.list_entries()), vec![entry]);
    }

    #[test]
    fn schema_contract_contains_expected_table_and_triggers() {
        let store = fixture_store();
        assert_eq!(
            object_count(&store, "table", &["leaderboard_entries", "schema_migrations"]),
            2
        );
        assert_eq!(
            object_count(
                &store,
                "trigger",
                &[
                    "trg_leaderboard_entries_no_update",
                    "trg_leaderboard_entries_no_delete"
                ]
            ),
            2
        );
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let mut store = fixture_store();
        let entry = must(store.append_entry(&fixture_input("ada", 0.5, "2026-02-07T12:00:00Z")));

        must(store.migrate());
        must(store.migrate());

        assert_eq!(must(store.list_entries()), vec![entry]);
        let migrations: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to count migrations: {err}"),
        };
        assert_eq!(migrations, 1);
    }

    #[test]
    fn invalid_stored_timestamp_is_reported_clearly() {
        let store = fixture_store();
        if let Err(err) = store.connection().execute(
            "INSERT INTO leaderboard_entries(entry_id, name, metric, score, submitted_at)
             VALUES (?1, 'ada', 'rmse', 1.0, 'yesterday')",
            params![Ulid::new().to_string()],
        ) {
            panic!("failed to seed malformed row: {err}");
        }

        let err = match store.list_entries() {
            Ok(value) => panic!("expected decode failure, got {value:?}"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("invalid submitted_at"));
    }

    #[test]
    fn invalid_stored_ulid_is_reported_clearly() {
        let store = fixture_store();
        if let Err(err) = store.connection().execute(
            "INSERT INTO leaderboard_entries(entry_id, name, metric, score, submitted_at)
             VALUES ('not-a-ulid', 'ada', 'rmse', 1.0, '2026-02-07T12:00:00Z')",
            [],
        ) {
            panic!("failed to seed malformed row: {err}");
        }

        let err = match store.list_entries() {
            Ok(value) => panic!("expected decode failure, got {value:?}"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("invalid entry_id ULID"));
    }

    #[test]
    fn entries_survive_reopening_the_database_file() {
        let db_path =
            std::env::temp_dir().join(format!("leaderboard-reopen-test-{}.sqlite3", Ulid::new()));

        let mut writer = must(SqliteLeaderboardStore::open(&db_path));
        must(writer.migrate());
        let entry = must(writer.append(&fixture_input("ada", 0.5, "2026-02-07T12:00:00Z")));
        drop(writer);

        let reader = must(SqliteLeaderboardStore::open(&db_path));
        must(reader.migrate());
        assert_eq!(must(reader.read_all()), vec![entry]);

        drop(reader);
        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(db_path.with_extension("sqlite3-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("sqlite3-shm"));
    }

    #[test]
    fn sqlite_busy_timeout_allows_append_after_lock_release() {
        let db_path =
            std::env::temp_dir().join(format!("leaderboard-lock-test-{}.sqlite3", Ulid::new()));

        let setup_store = must(SqliteLeaderboardStore::open(&db_path));
        must(setup_store.migrate());
        drop(setup_store);

        let lock_conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let append_path = db_path.clone();
        let append_handle = std::thread::spawn(move || {
            let mut append_store = match SqliteLeaderboardStore::open(&append_path) {
                Ok(value) => value,
                Err(err) => panic!("failed to open append store: {err}"),
            };
            append_store.append_entry(&fixture_input("ada", 0.5, "2026-02-07T12:00:00Z"))
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }

        let append_result = match append_handle.join() {
            Ok(result) => result,
            Err(err) => panic!("append thread join failed: {err:?}"),
        };
        assert!(
            append_result.is_ok(),
            "append should succeed after lock release: {:?}",
            append_result.err()
        );

        let _ = std::fs::remove_file(&db_path);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_sqlite_and_memory_stores_rank_identically(
            stream in prop::collection::vec((0u32..1000, 0u8..60, any::<bool>()), 1..40)
        ) {
            let mut sqlite = fixture_store();
            let mut memory = MemoryLeaderboardStore::new();

            for (index, (score_millis, minute, rmse)) in stream.iter().enumerate() {
                let mut input = fixture_input(
                    &format!("student-{index}"),
                    f64::from(*score_millis) / 1000.0,
                    &format!("2026-02-07T12:{minute:02}:00Z"),
                );
                if *rmse {
                    input.metric = Metric::Rmse;
                }
                must(sqlite.append(&input));
                if let Err(err) = memory.append(&input) {
                    panic!("memory append failed: {err}");
                }
            }

            let from_sqlite = must(sqlite.read_all());
            let from_memory = match memory.read_all() {
                Ok(value) => value,
                Err(err) => panic!("memory read failed: {err}"),
            };
            prop_assert_eq!(from_sqlite.len(), stream.len());

            for metric in [Metric::F1Weighted, Metric::Rmse] {
                let lhs = rank_entries(&from_sqlite, metric);
                let rhs = rank_entries(&from_memory, metric);
                prop_assert_eq!(lhs, rhs);
            }
        }
    }
}
