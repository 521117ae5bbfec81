//! SQLite implementation of [`Storage`].
//!
//! This provides persistent storage that survives service restarts.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.
//!
//! # Concurrency
//!
//! `rusqlite::Connection` is not `Sync`, so the connection lives behind a
//! mutex and every operation runs on the blocking thread pool via
//! `tokio::task::spawn_blocking`. Reviewer mutations additionally take the
//! per-pull-request lock before entering their transaction, mirroring the
//! in-memory backend, so validation inside the transaction always sees the
//! state the mutation will apply to.

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::thread_rng;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

use crate::entities::{
    DeactivationOutcome, PrStatus, PullRequest, PullRequestShort, Stats, Team, TeamMember, User,
};
use crate::error::{AppError, Result};
use crate::selection::plan_deactivation_reassignments;
use crate::storage::locks::PrLocks;
use crate::storage::Storage;

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Attempts to stabilize the affected pull-request set during a bulk
/// deactivation before giving up.
const MAX_DEACTIVATION_RETRIES: usize = 16;

/// SQLite-backed storage.
///
/// Stores teams, users and pull requests in a SQLite database for
/// persistence across restarts. Uses `tokio::task::spawn_blocking` to run
/// synchronous rusqlite operations without blocking the async runtime.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    locks: PrLocks,
}

impl SqliteStorage {
    /// Create a new SQLite storage at the given path.
    ///
    /// Creates the database file and schema if they don't exist, and runs
    /// any pending migrations if the database has an older schema.
    ///
    /// The database is configured with `journal_mode = WAL` for crash
    /// safety, `busy_timeout = 5000ms` for concurrent access, and enforced
    /// foreign keys.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        AppError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| AppError::storage("open database", e.to_string()))?;

        // WAL can be silently refused on filesystems without shared-memory
        // support, so check what SQLite actually selected. In-memory
        // databases report "memory", which is fine.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| AppError::storage("set journal_mode", e.to_string()))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(AppError::storage(
                "configure journal_mode",
                format!("SQLite returned '{journal_mode}' instead of 'wal'"),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| AppError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| AppError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AppError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            locks: PrLocks::new(),
        })
    }

    /// Create a new in-memory SQLite storage (for testing).
    pub fn new_in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<()> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(AppError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        // Migration from version 0 (fresh database) to version 1
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS teams (
                    team_name TEXT PRIMARY KEY,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS users (
                    user_id TEXT PRIMARY KEY,
                    username TEXT NOT NULL,
                    team_name TEXT NOT NULL REFERENCES teams(team_name),
                    is_active INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_users_team
                    ON users(team_name);

                CREATE TABLE IF NOT EXISTS pull_requests (
                    pull_request_id TEXT PRIMARY KEY,
                    pull_request_name TEXT NOT NULL,
                    author_id TEXT NOT NULL REFERENCES users(user_id),
                    status TEXT NOT NULL CHECK (status IN ('OPEN', 'MERGED')),
                    created_at TEXT NOT NULL,
                    merged_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_pull_requests_status
                    ON pull_requests(status);

                CREATE TABLE IF NOT EXISTS pr_reviewers (
                    pull_request_id TEXT NOT NULL REFERENCES pull_requests(pull_request_id),
                    user_id TEXT NOT NULL REFERENCES users(user_id),
                    PRIMARY KEY (pull_request_id, user_id)
                );

                CREATE INDEX IF NOT EXISTS idx_pr_reviewers_user
                    ON pr_reviewers(user_id);
                "#,
            )
            .map_err(|e| AppError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| AppError::storage("update schema version", e.to_string()))?;

        Ok(())
    }
}

// =============================================================================
// Row and query helpers
// =============================================================================

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        user_id: row.get(0)?,
        username: row.get(1)?,
        team_name: row.get(2)?,
        is_active: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

const USER_COLUMNS: &str = "user_id, username, team_name, is_active, created_at, updated_at";

fn parse_status(raw: String, op: &'static str) -> Result<PrStatus> {
    PrStatus::parse(&raw)
        .ok_or_else(|| AppError::storage(op, format!("invalid pull request status '{raw}'")))
}

/// Load a pull request with its reviewer list, `None` if the id is unknown.
fn load_pr(
    conn: &Connection,
    pull_request_id: &str,
    op: &'static str,
) -> Result<Option<PullRequest>> {
    let row: Option<(String, String, String, DateTime<Utc>, Option<DateTime<Utc>>)> = conn
        .query_row(
            "SELECT pull_request_name, author_id, status, created_at, merged_at
             FROM pull_requests WHERE pull_request_id = ?1",
            params![pull_request_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .optional()
        .map_err(|e| AppError::storage(op, e.to_string()))?;

    let Some((pull_request_name, author_id, raw_status, created_at, merged_at)) = row else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare("SELECT user_id FROM pr_reviewers WHERE pull_request_id = ?1 ORDER BY user_id")
        .map_err(|e| AppError::storage(op, e.to_string()))?;
    let reviewers = stmt
        .query_map(params![pull_request_id], |row| row.get::<_, String>(0))
        .map_err(|e| AppError::storage(op, e.to_string()))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| AppError::storage(op, e.to_string()))?;

    Ok(Some(PullRequest {
        pull_request_id: pull_request_id.to_string(),
        pull_request_name,
        author_id,
        status: parse_status(raw_status, op)?,
        assigned_reviewers: reviewers,
        created_at,
        merged_at,
    }))
}

fn load_team_roster(
    conn: &Connection,
    team_name: &str,
    active_only: bool,
    op: &'static str,
) -> Result<Vec<User>> {
    let sql = if active_only {
        format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE team_name = ?1 AND is_active = 1 ORDER BY user_id"
        )
    } else {
        format!("SELECT {USER_COLUMNS} FROM users WHERE team_name = ?1 ORDER BY user_id")
    };
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| AppError::storage(op, e.to_string()))?;
    let users = stmt
        .query_map(params![team_name], user_from_row)
        .map_err(|e| AppError::storage(op, e.to_string()))?
        .collect::<rusqlite::Result<Vec<User>>>()
        .map_err(|e| AppError::storage(op, e.to_string()))?;
    Ok(users)
}

fn team_exists_sync(conn: &Connection, team_name: &str, op: &'static str) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM teams WHERE team_name = ?1)",
        params![team_name],
        |row| row.get(0),
    )
    .map_err(|e| AppError::storage(op, e.to_string()))
}

/// Ids of open pull requests reviewed by any of the given users, sorted.
fn affected_open_prs(
    conn: &Connection,
    user_ids: &[String],
    op: &'static str,
) -> Result<Vec<String>> {
    if user_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; user_ids.len()].join(", ");
    let sql = format!(
        "SELECT DISTINCT r.pull_request_id
         FROM pr_reviewers r
         JOIN pull_requests p ON p.pull_request_id = r.pull_request_id
         WHERE p.status = 'OPEN' AND r.user_id IN ({placeholders})
         ORDER BY r.pull_request_id"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| AppError::storage(op, e.to_string()))?;
    let ids = stmt
        .query_map(params_from_iter(user_ids.iter()), |row| {
            row.get::<_, String>(0)
        })
        .map_err(|e| AppError::storage(op, e.to_string()))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| AppError::storage(op, e.to_string()))?;
    Ok(ids)
}

// =============================================================================
// Storage trait implementation
// =============================================================================

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_team_with_users(
        &self,
        team_name: &str,
        members: &[TeamMember],
    ) -> Result<()> {
        let conn = self.conn.clone();
        let team_name = team_name.to_string();
        let members = members.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| AppError::storage("create team", e.to_string()))?;

            if team_exists_sync(&tx, &team_name, "create team")? {
                return Err(AppError::TeamExists(team_name));
            }

            let now = Utc::now();
            tx.execute(
                "INSERT INTO teams (team_name, created_at) VALUES (?1, ?2)",
                params![team_name, now],
            )
            .map_err(|e| AppError::storage("create team", e.to_string()))?;

            for member in &members {
                tx.execute(
                    "INSERT INTO users (user_id, username, team_name, is_active, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     ON CONFLICT (user_id) DO UPDATE SET
                         team_name = excluded.team_name,
                         is_active = excluded.is_active,
                         updated_at = excluded.updated_at",
                    params![member.user_id, member.username, team_name, member.is_active, now],
                )
                .map_err(|e| AppError::storage("create team", e.to_string()))?;
            }

            tx.commit()
                .map_err(|e| AppError::storage("create team", e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::storage("create team", e.to_string()))?
    }

    async fn get_team_by_name(&self, team_name: &str) -> Result<Option<Team>> {
        let conn = self.conn.clone();
        let team_name = team_name.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            if !team_exists_sync(&conn, &team_name, "get team")? {
                return Ok(None);
            }
            let members = load_team_roster(&conn, &team_name, false, "get team")?;
            Ok(Some(Team {
                team_name,
                team_members: members.iter().map(TeamMember::from).collect(),
            }))
        })
        .await
        .map_err(|e| AppError::storage("get team", e.to_string()))?
    }

    async fn team_exists(&self, team_name: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let team_name = team_name.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            team_exists_sync(&conn, &team_name, "team exists")
        })
        .await
        .map_err(|e| AppError::storage("team exists", e.to_string()))?
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.conn.clone();
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"),
                params![user_id],
                user_from_row,
            )
            .optional()
            .map_err(|e| AppError::storage("get user", e.to_string()))
        })
        .await
        .map_err(|e| AppError::storage("get user", e.to_string()))?
    }

    async fn get_users_by_team(&self, team_name: &str, active_only: bool) -> Result<Vec<User>> {
        let conn = self.conn.clone();
        let team_name = team_name.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            load_team_roster(&conn, &team_name, active_only, "get team members")
        })
        .await
        .map_err(|e| AppError::storage("get team members", e.to_string()))?
    }

    async fn set_user_active_status(
        &self,
        user_id: &str,
        is_active: bool,
    ) -> Result<Option<User>> {
        let conn = self.conn.clone();
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                &format!(
                    "UPDATE users SET is_active = ?2, updated_at = ?3
                     WHERE user_id = ?1
                     RETURNING {USER_COLUMNS}"
                ),
                params![user_id, is_active, Utc::now()],
                user_from_row,
            )
            .optional()
            .map_err(|e| AppError::storage("set user active status", e.to_string()))
        })
        .await
        .map_err(|e| AppError::storage("set user active status", e.to_string()))?
    }

    async fn create_pr_with_reviewers(
        &self,
        pr: &PullRequest,
        reviewer_ids: &[String],
    ) -> Result<()> {
        let _guard = self.locks.acquire(&pr.pull_request_id).await;

        let conn = self.conn.clone();
        let pr = pr.clone();
        let mut reviewers = reviewer_ids.to_vec();
        reviewers.sort();
        reviewers.dedup();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| AppError::storage("create PR", e.to_string()))?;

            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS (SELECT 1 FROM pull_requests WHERE pull_request_id = ?1)",
                    params![pr.pull_request_id],
                    |row| row.get(0),
                )
                .map_err(|e| AppError::storage("create PR", e.to_string()))?;
            if exists {
                return Err(AppError::PrExists(pr.pull_request_id));
            }

            tx.execute(
                "INSERT INTO pull_requests
                     (pull_request_id, pull_request_name, author_id, status, created_at, merged_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    pr.pull_request_id,
                    pr.pull_request_name,
                    pr.author_id,
                    pr.status.as_str(),
                    pr.created_at,
                    pr.merged_at,
                ],
            )
            .map_err(|e| AppError::storage("create PR", e.to_string()))?;

            for reviewer in &reviewers {
                tx.execute(
                    "INSERT INTO pr_reviewers (pull_request_id, user_id) VALUES (?1, ?2)",
                    params![pr.pull_request_id, reviewer],
                )
                .map_err(|e| AppError::storage("create PR", e.to_string()))?;
            }

            tx.commit()
                .map_err(|e| AppError::storage("create PR", e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::storage("create PR", e.to_string()))?
    }

    async fn get_pr(&self, pull_request_id: &str) -> Result<Option<PullRequest>> {
        let conn = self.conn.clone();
        let pull_request_id = pull_request_id.to_string();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            // Transaction so the row and its reviewer list are read from one
            // snapshot.
            let tx = conn
                .transaction()
                .map_err(|e| AppError::storage("get PR", e.to_string()))?;
            load_pr(&tx, &pull_request_id, "get PR")
        })
        .await
        .map_err(|e| AppError::storage("get PR", e.to_string()))?
    }

    async fn pr_exists(&self, pull_request_id: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let pull_request_id = pull_request_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM pull_requests WHERE pull_request_id = ?1)",
                params![pull_request_id],
                |row| row.get(0),
            )
            .map_err(|e| AppError::storage("PR exists", e.to_string()))
        })
        .await
        .map_err(|e| AppError::storage("PR exists", e.to_string()))?
    }

    async fn merge_pr(
        &self,
        pull_request_id: &str,
        merged_at: DateTime<Utc>,
    ) -> Result<Option<PullRequest>> {
        let _guard = self.locks.acquire(pull_request_id).await;

        let conn = self.conn.clone();
        let pull_request_id = pull_request_id.to_string();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| AppError::storage("merge PR", e.to_string()))?;

            let Some(pr) = load_pr(&tx, &pull_request_id, "merge PR")? else {
                return Ok(None);
            };
            if pr.is_merged() {
                // Already merged: keep the original merge timestamp.
                return Ok(Some(pr));
            }

            tx.execute(
                "UPDATE pull_requests SET status = ?2, merged_at = ?3
                 WHERE pull_request_id = ?1",
                params![pull_request_id, PrStatus::Merged.as_str(), merged_at],
            )
            .map_err(|e| AppError::storage("merge PR", e.to_string()))?;

            let merged = load_pr(&tx, &pull_request_id, "merge PR")?;
            tx.commit()
                .map_err(|e| AppError::storage("merge PR", e.to_string()))?;
            Ok(merged)
        })
        .await
        .map_err(|e| AppError::storage("merge PR", e.to_string()))?
    }

    async fn reassign_reviewer(
        &self,
        pull_request_id: &str,
        old_user_id: &str,
        new_user_id: &str,
    ) -> Result<()> {
        let _guard = self.locks.acquire(pull_request_id).await;

        let conn = self.conn.clone();
        let pull_request_id = pull_request_id.to_string();
        let old_user_id = old_user_id.to_string();
        let new_user_id = new_user_id.to_string();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| AppError::storage("reassign reviewer", e.to_string()))?;

            let pr = load_pr(&tx, &pull_request_id, "reassign reviewer")?
                .ok_or_else(|| AppError::not_found("pull request", &pull_request_id))?;
            if pr.is_merged() {
                return Err(AppError::PrMerged(pull_request_id));
            }
            if !pr.is_assigned(&old_user_id) {
                return Err(AppError::not_assigned(old_user_id, pull_request_id));
            }
            if pr.is_assigned(&new_user_id) {
                return Err(AppError::storage(
                    "reassign reviewer",
                    format!(
                        "replacement '{new_user_id}' already assigned to PR '{pull_request_id}'"
                    ),
                ));
            }

            tx.execute(
                "DELETE FROM pr_reviewers WHERE pull_request_id = ?1 AND user_id = ?2",
                params![pull_request_id, old_user_id],
            )
            .map_err(|e| AppError::storage("reassign reviewer", e.to_string()))?;
            tx.execute(
                "INSERT INTO pr_reviewers (pull_request_id, user_id) VALUES (?1, ?2)",
                params![pull_request_id, new_user_id],
            )
            .map_err(|e| AppError::storage("reassign reviewer", e.to_string()))?;

            tx.commit()
                .map_err(|e| AppError::storage("reassign reviewer", e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::storage("reassign reviewer", e.to_string()))?
    }

    async fn get_prs_by_reviewer(&self, user_id: &str) -> Result<Vec<PullRequestShort>> {
        let conn = self.conn.clone();
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT p.pull_request_id, p.pull_request_name, p.author_id, p.status
                     FROM pull_requests p
                     JOIN pr_reviewers r ON r.pull_request_id = p.pull_request_id
                     WHERE r.user_id = ?1
                     ORDER BY p.created_at DESC, p.pull_request_id",
                )
                .map_err(|e| AppError::storage("get reviews", e.to_string()))?;

            let rows = stmt
                .query_map(params![user_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(|e| AppError::storage("get reviews", e.to_string()))?;

            let mut results = Vec::new();
            for row in rows {
                let (pull_request_id, pull_request_name, author_id, raw_status) =
                    row.map_err(|e| AppError::storage("get reviews", e.to_string()))?;
                results.push(PullRequestShort {
                    pull_request_id,
                    pull_request_name,
                    author_id,
                    status: parse_status(raw_status, "get reviews")?,
                });
            }
            Ok(results)
        })
        .await
        .map_err(|e| AppError::storage("get reviews", e.to_string()))?
    }

    async fn is_user_assigned(&self, pull_request_id: &str, user_id: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let pull_request_id = pull_request_id.to_string();
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT EXISTS(
                     SELECT 1 FROM pr_reviewers WHERE pull_request_id = ?1 AND user_id = ?2
                 )",
                params![pull_request_id, user_id],
                |row| row.get::<_, bool>(0),
            )
            .map_err(|e| AppError::storage("check assignment", e.to_string()))
        })
        .await
        .map_err(|e| AppError::storage("check assignment", e.to_string()))?
    }

    async fn deactivate_team_members_with_reassignment(
        &self,
        team_name: &str,
        user_ids: &[String],
    ) -> Result<DeactivationOutcome> {
        const OP: &str = "deactivate team members";

        for _ in 0..MAX_DEACTIVATION_RETRIES {
            // Snapshot the affected pull requests, then lock them. The
            // snapshot can go stale while we wait for the locks, so it is
            // re-checked inside the transaction and the attempt retried on
            // mismatch.
            let affected = {
                let conn = self.conn.clone();
                let ids = user_ids.to_vec();
                tokio::task::spawn_blocking(move || {
                    let conn = conn.lock().unwrap();
                    affected_open_prs(&conn, &ids, OP)
                })
                .await
                .map_err(|e| AppError::storage(OP, e.to_string()))??
            };
            let _guards = self.locks.acquire_many(&affected).await;

            let conn = self.conn.clone();
            let team = team_name.to_string();
            let ids = user_ids.to_vec();

            let attempt = tokio::task::spawn_blocking(move || {
                let mut conn = conn.lock().unwrap();
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(|e| AppError::storage(OP, e.to_string()))?;

                if affected_open_prs(&tx, &ids, OP)? != affected {
                    return Ok(None);
                }

                // All validation happens here, before the first write.
                if !team_exists_sync(&tx, &team, OP)? {
                    return Err(AppError::not_found("team", &team));
                }
                let deactivating: HashSet<String> = ids.iter().cloned().collect();
                for user_id in &deactivating {
                    let user = tx
                        .query_row(
                            &format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"),
                            params![user_id],
                            user_from_row,
                        )
                        .optional()
                        .map_err(|e| AppError::storage(OP, e.to_string()))?
                        .ok_or_else(|| AppError::not_found("user", user_id))?;
                    if user.team_name != team {
                        return Err(AppError::invalid_team_user(
                            user_id,
                            &team,
                            "does not belong to",
                        ));
                    }
                    if !user.is_active {
                        return Err(AppError::invalid_team_user(
                            user_id,
                            &team,
                            "is not an active member of",
                        ));
                    }
                }

                let roster = load_team_roster(&tx, &team, true, OP)?;
                let mut open_prs = Vec::with_capacity(affected.len());
                for pr_id in &affected {
                    if let Some(pr) = load_pr(&tx, pr_id, OP)? {
                        open_prs.push(pr);
                    }
                }
                let entries = plan_deactivation_reassignments(
                    &mut thread_rng(),
                    &roster,
                    &open_prs,
                    &deactivating,
                );

                let now = Utc::now();
                for user_id in &deactivating {
                    tx.execute(
                        "UPDATE users SET is_active = 0, updated_at = ?2 WHERE user_id = ?1",
                        params![user_id, now],
                    )
                    .map_err(|e| AppError::storage(OP, e.to_string()))?;
                }
                for entry in &entries {
                    tx.execute(
                        "DELETE FROM pr_reviewers WHERE pull_request_id = ?1 AND user_id = ?2",
                        params![entry.pull_request_id, entry.old_reviewer],
                    )
                    .map_err(|e| AppError::storage(OP, e.to_string()))?;
                    if let Some(new) = entry.replacement() {
                        tx.execute(
                            "INSERT INTO pr_reviewers (pull_request_id, user_id) VALUES (?1, ?2)",
                            params![entry.pull_request_id, new],
                        )
                        .map_err(|e| AppError::storage(OP, e.to_string()))?;
                    }
                }

                tx.commit().map_err(|e| AppError::storage(OP, e.to_string()))?;

                let mut deactivated: Vec<String> = deactivating.into_iter().collect();
                deactivated.sort();
                Ok(Some(DeactivationOutcome {
                    deactivated_users: deactivated,
                    reassignments: entries,
                }))
            })
            .await
            .map_err(|e| AppError::storage(OP, e.to_string()))??;

            if let Some(outcome) = attempt {
                return Ok(outcome);
            }
        }

        Err(AppError::storage(
            OP,
            "affected pull request set kept changing".to_string(),
        ))
    }

    async fn get_stats(&self) -> Result<Stats> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stats = Stats::default();

            let mut stmt = conn
                .prepare("SELECT user_id, COUNT(*) FROM pr_reviewers GROUP BY user_id")
                .map_err(|e| AppError::storage("get stats", e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(|e| AppError::storage("get stats", e.to_string()))?;
            for row in rows {
                let (user_id, count) =
                    row.map_err(|e| AppError::storage("get stats", e.to_string()))?;
                stats.user_assignments.insert(user_id, count);
            }

            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM pull_requests GROUP BY status")
                .map_err(|e| AppError::storage("get stats", e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(|e| AppError::storage("get stats", e.to_string()))?;
            for row in rows {
                let (raw_status, count) =
                    row.map_err(|e| AppError::storage("get stats", e.to_string()))?;
                match parse_status(raw_status, "get stats")? {
                    PrStatus::Open => stats.pr_stats.open = count,
                    PrStatus::Merged => stats.pr_stats.merged = count,
                }
            }

            Ok(stats)
        })
        .await
        .map_err(|e| AppError::storage("get stats", e.to_string()))?
    }
}
