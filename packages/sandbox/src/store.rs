// ABOUTME: Persistent per-user sandbox records in SQLite
// ABOUTME: Implements the record lock used as a cross-process mutex for sandbox operations

use crate::state::{SandboxRecord, SandboxState, StateError, VpnMaterial};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Another operation is in progress for user {user_id}, try again later")]
    Conflict { user_id: i64 },
    #[error("Sandbox record not found for user {0}")]
    NotFound(i64),
    #[error("Sandbox record for user {0} changed underneath the current operation")]
    StaleRecord(i64),
    #[error("VPN material already issued for user {0}")]
    VpnAlreadyIssued(i64),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const RECORD_COLUMNS: &str = "user_id, port, chapter, state, vpn, updated_at";

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_connections: u32,
    /// How long a locker waits for the current holder before giving up
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct SandboxStore {
    pool: SqlitePool,
}

impl SandboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database behind `url`.
    pub async fn connect(url: &str, options: &StoreOptions) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect_options)
            .await?;

        debug!("Connected to sandbox database: {}", url);
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Take the user's sandbox for one operation.
    ///
    /// The check-and-flip runs under the record lock and commits right away, so
    /// the lock is only held for a few statements. Whoever flips the record to
    /// `InProgress` owns the sandbox until `commit_state` moves it out again;
    /// everybody else gets `Conflict` instead of waiting for slow engine work.
    ///
    /// With `assert_chapter`, an existing record must be `Ready` on `chapter`.
    pub async fn acquire(
        &self,
        user_id: i64,
        chapter: Option<&str>,
        assert_chapter: bool,
    ) -> Result<SandboxRecord> {
        let mut tx = self.pool.begin().await?;

        // A write as the first statement takes SQLite's write lock before we read,
        // so concurrent lockers queue here until we commit or roll back.
        sqlx::query("UPDATE sandbox_records SET user_id = user_id WHERE user_id = ?1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM sandbox_records WHERE user_id = ?1",
            RECORD_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let now = Utc::now();

        let Some(row) = row else {
            let result = sqlx::query(
                "INSERT INTO sandbox_records (user_id, chapter, state, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(user_id)
            .bind(chapter)
            .bind(SandboxState::InProgress.as_str())
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            let record = SandboxRecord {
                user_id,
                port: result.last_insert_rowid(),
                chapter: chapter.map(str::to_string),
                state: SandboxState::InProgress,
                vpn: None,
                updated_at: now,
            };
            info!(
                "Created sandbox record for user {} with port {}",
                user_id, record.port
            );
            return Ok(record);
        };

        let mut record = row_to_record(row)?;

        let chapter_mismatch = assert_chapter
            && (record.chapter.as_deref() != chapter || record.state != SandboxState::Ready);

        if chapter_mismatch || record.is_locked() {
            tx.rollback().await?;
            debug!(
                "Refusing to lock sandbox for user {} (state: {}, chapter: {:?})",
                user_id, record.state, record.chapter
            );
            return Err(StoreError::Conflict { user_id });
        }

        record.transition(SandboxState::InProgress)?;
        record.chapter = chapter.map(str::to_string);
        record.updated_at = now;

        sqlx::query(
            "UPDATE sandbox_records SET state = ?1, chapter = ?2, updated_at = ?3 WHERE user_id = ?4",
        )
        .bind(record.state.as_str())
        .bind(&record.chapter)
        .bind(now.to_rfc3339())
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("Locked sandbox for user {}", user_id);
        Ok(record)
    }

    pub async fn get(&self, user_id: i64) -> Result<Option<SandboxRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sandbox_records WHERE user_id = ?1",
            RECORD_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_record).transpose()
    }

    /// Persist freshly issued VPN material. Existing material is never replaced,
    /// since that would invalidate client profiles users already downloaded.
    pub async fn save_vpn(&self, record: &mut SandboxRecord, material: VpnMaterial) -> Result<()> {
        let json = serde_json::to_string(&material)?;
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE sandbox_records SET vpn = ?1, updated_at = ?2 WHERE user_id = ?3 AND vpn IS NULL",
        )
        .bind(&json)
        .bind(now.to_rfc3339())
        .bind(record.user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(match self.get(record.user_id).await? {
                Some(_) => StoreError::VpnAlreadyIssued(record.user_id),
                None => StoreError::NotFound(record.user_id),
            });
        }

        record.vpn = Some(material);
        record.updated_at = now;
        Ok(())
    }

    /// Move a held record out of (or into) `InProgress` and persist it.
    ///
    /// The update only applies if the stored state still matches the in-memory
    /// one, so a record cannot be finished twice.
    pub async fn commit_state(&self, record: &mut SandboxRecord, next: SandboxState) -> Result<()> {
        let current = record.state;
        let next = current.transition(next)?;
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE sandbox_records SET state = ?1, updated_at = ?2 WHERE user_id = ?3 AND state = ?4",
        )
        .bind(next.as_str())
        .bind(now.to_rfc3339())
        .bind(record.user_id)
        .bind(current.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StaleRecord(record.user_id));
        }

        record.state = next;
        record.updated_at = now;
        debug!("Sandbox for user {} is now {}", record.user_id, next);
        Ok(())
    }

    /// Records in `Ready`, optionally limited to one chapter.
    pub async fn list_ready(&self, chapter: Option<&str>) -> Result<Vec<SandboxRecord>> {
        let mut query = format!(
            "SELECT {} FROM sandbox_records WHERE state = ?1",
            RECORD_COLUMNS
        );
        if chapter.is_some() {
            query.push_str(" AND chapter = ?2");
        }
        query.push_str(" ORDER BY user_id");

        let mut q = sqlx::query(&query).bind(SandboxState::Ready.as_str());
        if let Some(chapter) = chapter {
            q = q.bind(chapter);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: SqliteRow) -> Result<SandboxRecord> {
    let vpn = row
        .try_get::<Option<String>, _>("vpn")?
        .map(|json| serde_json::from_str::<VpnMaterial>(&json))
        .transpose()?;

    Ok(SandboxRecord {
        user_id: row.try_get("user_id")?,
        port: row.try_get("port")?,
        chapter: row.try_get("chapter")?,
        state: SandboxState::from_str(&row.try_get::<String, _>("state")?)?,
        vpn,
        updated_at: DateTime::parse_from_rfc3339(&row.try_get::<String, _>("updated_at")?)?
            .with_timezone(&Utc),
    })
}
