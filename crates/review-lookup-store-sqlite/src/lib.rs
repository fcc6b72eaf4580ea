use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use review_lookup_core::{
    fold_case, ResponseValue, ReviewId, ReviewRecord, ReviewResponses, StoreFilter,
};
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 3;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS reviews (
  review_id TEXT PRIMARY KEY,
  submitter TEXT NOT NULL,
  college TEXT,
  submitted_at TEXT NOT NULL,
  tutor TEXT NOT NULL,
  subject TEXT NOT NULL,
  paper TEXT NOT NULL,
  paper_code TEXT NOT NULL,
  paper_name TEXT NOT NULL,
  paper_level TEXT NOT NULL,
  answers_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reviews_submitted_at ON reviews(submitted_at);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_reviews_paper_code_lower ON reviews(lower(paper_code));
CREATE INDEX IF NOT EXISTS idx_reviews_tutor ON reviews(tutor);
CREATE INDEX IF NOT EXISTS idx_reviews_submitter ON reviews(submitter);
";

// Folded copies of the filterable columns, filled with the matcher's own case folding.
const MIGRATION_003_SQL: &str = r"
ALTER TABLE reviews ADD COLUMN tutor_folded TEXT NOT NULL DEFAULT '';
ALTER TABLE reviews ADD COLUMN subject_folded TEXT NOT NULL DEFAULT '';
ALTER TABLE reviews ADD COLUMN paper_code_folded TEXT NOT NULL DEFAULT '';
DROP INDEX IF EXISTS idx_reviews_paper_code_lower;
";

type Backfill = fn(&Connection) -> Result<()>;

const SELECT_REVIEW_COLUMNS: &str = "SELECT
    review_id, college, submitted_at, tutor, subject, paper,
    paper_code, paper_name, paper_level, answers_json
 FROM reviews";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed review store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL, None)?;
            version = 1;
        }

        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL, None)?;
            version = 2;
        }

        if version < 3 {
            self.apply_migration(3, MIGRATION_003_SQL, Some(backfill_folded_columns))?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(
        &mut self,
        version: i64,
        sql: &str,
        backfill: Option<Backfill>,
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        if let Some(backfill) = backfill {
            backfill(&tx).with_context(|| format!("failed to backfill migration v{version}"))?;
        }
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        tracing::info!(version, "applied review store migration");
        Ok(())
    }

    /// Persist one review together with the submitter that wrote it.
    ///
    /// # Errors
    /// Returns an error when the record has no identifier or the insert fails.
    pub fn write_review(&mut self, record: &ReviewRecord, submitter: &str) -> Result<()> {
        let id = record.id.ok_or_else(|| anyhow!("review_id MUST be assigned before writing"))?;
        let responses = &record.responses;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO reviews(
                review_id, submitter, college, submitted_at, tutor, subject, paper,
                paper_code, paper_name, paper_level, answers_json,
                tutor_folded, subject_folded, paper_code_folded
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                id.to_string(),
                submitter,
                record.college,
                rfc3339(record.submitted_at)?,
                responses.tutor,
                responses.subject,
                responses.paper,
                responses.paper_code,
                responses.paper_name,
                responses.paper_level,
                serde_json::to_string(&responses.answers)
                    .context("failed to serialize review answers")?,
                fold_case(&responses.tutor),
                fold_case(&responses.subject),
                fold_case(&responses.paper_code),
            ],
        )
        .context("failed to insert review")?;
        tx.commit().context("failed to commit review transaction")?;
        Ok(())
    }

    /// Load every stored review in submission order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_reviews(&self) -> Result<Vec<ReviewRecord>> {
        self.fetch_candidates(&StoreFilter::default())
    }

    /// Load the reviews that may satisfy `filter`.
    ///
    /// The result is a superset of what the search matcher accepts. Needles are folded with
    /// [`fold_case`] and compared against the `*_folded` columns, which hold the same folding
    /// of the stored text, so `SQLite`'s own `lower()` never takes part. Blank needles are
    /// not pushed down. College is not part of [`StoreFilter`] and never reaches this query.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn fetch_candidates(&self, filter: &StoreFilter) -> Result<Vec<ReviewRecord>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        for (column, needle) in [("tutor", &filter.tutor), ("subject", &filter.subject)] {
            let Some(needle) = needle.as_deref().filter(|needle| pushable(needle)) else {
                continue;
            };
            values.push(fold_case(needle));
            clauses.push(format!("instr({column}_folded, ?{}) > 0", values.len()));
        }

        if !filter.papers.is_empty() && filter.papers.iter().all(|paper| pushable(paper)) {
            let mut alternatives = Vec::with_capacity(filter.papers.len());
            for paper in &filter.papers {
                values.push(fold_case(paper));
                alternatives.push(format!("instr(paper_code_folded, ?{}) > 0", values.len()));
            }
            clauses.push(format!("({})", alternatives.join(" OR ")));
        }

        let mut sql = SELECT_REVIEW_COLUMNS.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY submitted_at ASC, review_id ASC");

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare review query")?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            let review_id_raw: String = row.get(0)?;
            let answers_json: String = row.get(9)?;
            let answers: BTreeMap<String, ResponseValue> = serde_json::from_str(&answers_json)
                .context("failed to deserialize review answers")?;

            records.push(ReviewRecord {
                id: parse_review_id(&review_id_raw),
                college: row.get(1)?,
                submitted_at: parse_rfc3339(&row.get::<_, String>(2)?)?,
                responses: ReviewResponses {
                    tutor: row.get(3)?,
                    subject: row.get(4)?,
                    paper: row.get(5)?,
                    paper_code: row.get(6)?,
                    paper_name: row.get(7)?,
                    paper_level: row.get(8)?,
                    answers,
                },
            });
        }

        Ok(records)
    }

    /// Distinct tutor names, optionally narrowed to names containing `search`.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn tutor_names(&self, search: &str) -> Result<Vec<String>> {
        let mut sql = "SELECT DISTINCT tutor FROM reviews".to_string();
        let mut values: Vec<String> = Vec::new();
        if pushable(search) {
            values.push(fold_case(search));
            sql.push_str(" WHERE instr(tutor_folded, ?1) > 0");
        }
        sql.push_str(" ORDER BY tutor ASC");

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare tutor query")?;
        let names = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read tutor names")?;
        Ok(names)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_reviews(&self) -> Result<u64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM reviews", [], |row| row.get::<_, i64>(0))
            .context("failed to count reviews")?;
        u64::try_from(count).context("review count out of range")
    }
}

fn pushable(needle: &str) -> bool {
    !needle.trim().is_empty()
}

struct FoldSource {
    review_id: String,
    tutor: String,
    subject: String,
    paper_code: String,
}

fn backfill_folded_columns(conn: &Connection) -> Result<()> {
    let mut select = conn
        .prepare("SELECT review_id, tutor, subject, paper_code FROM reviews")
        .context("failed to prepare fold backfill query")?;
    let rows = select
        .query_map([], |row| {
            Ok(FoldSource {
                review_id: row.get(0)?,
                tutor: row.get(1)?,
                subject: row.get(2)?,
                paper_code: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to read rows for fold backfill")?;

    let mut update = conn
        .prepare(
            "UPDATE reviews
             SET tutor_folded = ?2, subject_folded = ?3, paper_code_folded = ?4
             WHERE review_id = ?1",
        )
        .context("failed to prepare fold backfill update")?;
    for row in &rows {
        update
            .execute(params![
                row.review_id,
                fold_case(&row.tutor),
                fold_case(&row.subject),
                fold_case(&row.paper_code),
            ])
            .with_context(|| format!("failed to backfill folded columns for {}", row.review_id))?;
    }
    tracing::debug!(rows = rows.len(), "backfilled folded review columns");
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

/// A row with an unreadable identifier is still delivered, without an id, so the engine
/// can withhold it.
fn parse_review_id(raw: &str) -> Option<ReviewId> {
    match Ulid::from_string(raw) {
        Ok(parsed) => Some(ReviewId(parsed)),
        Err(err) => {
            tracing::warn!(error = %err, "review row has an unreadable identifier");
            None
        }
    }
}
