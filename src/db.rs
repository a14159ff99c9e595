use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use rusqlite::{Connection, params};

use crate::errors::StoreError;
use crate::models::*;

type Result<T> = std::result::Result<T, StoreError>;

/// Generate an opaque entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Async-safe handle to the datastore.
///
/// Wraps `Database` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads. Every component holds a clone of
/// this handle; the underlying connection closes when the last clone drops.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Database>>,
}

impl DbHandle {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Database) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|_| StoreError::Join)?
    }
}

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the SQLite database at the given path and apply the
    /// embedded schema. Re-applying to an up-to-date database is a no-op.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch(include_str!("../migrations/schema.sql"))?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(&self, email: &str, password_hash: &str) -> Result<User> {
        let id = new_id();
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO users (id, email, password_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![id, email, password_hash, ts],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateEmail
                } else {
                    e.into()
                }
            })?;
        self.get_user(&id)
    }

    pub fn get_user(&self, id: &str) -> Result<User> {
        let mut stmt = self.conn.prepare(
            "SELECT id, email, password_hash, created_at, updated_at FROM users WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_user)?;
        match rows.next() {
            Some(row) => Ok(row?),
            None => Err(StoreError::NotFound),
        }
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<User> {
        let mut stmt = self.conn.prepare(
            "SELECT id, email, password_hash, created_at, updated_at FROM users WHERE email = ?1",
        )?;
        let mut rows = stmt.query_map(params![email], row_to_user)?;
        match rows.next() {
            Some(row) => Ok(row?),
            None => Err(StoreError::NotFound),
        }
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, user_id: &str, title: &str, description: &str) -> Result<Project> {
        let id = new_id();
        let ts = now();
        self.conn.execute(
            "INSERT INTO projects (id, user_id, title, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, user_id, title, description, ts],
        )?;
        self.get_project(&id)
    }

    pub fn list_projects(&self, user_id: &str) -> Result<Vec<Project>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, title, description, created_at, updated_at
             FROM projects WHERE user_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_project)?;
        collect(rows)
    }

    pub fn get_project(&self, id: &str) -> Result<Project> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, title, description, created_at, updated_at
             FROM projects WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_project)?;
        match rows.next() {
            Some(row) => Ok(row?),
            None => Err(StoreError::NotFound),
        }
    }

    pub fn update_project(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Project> {
        let tx = self.conn.unchecked_transaction()?;
        if let Some(t) = title {
            tx.execute(
                "UPDATE projects SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![t, now(), id],
            )?;
        }
        if let Some(d) = description {
            tx.execute(
                "UPDATE projects SET description = ?1, updated_at = ?2 WHERE id = ?3",
                params![d, now(), id],
            )?;
        }
        tx.commit()?;
        self.get_project(id)
    }

    pub fn delete_project(&self, id: &str) -> Result<()> {
        let n = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ── Pods ──────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_pod(
        &self,
        user_id: &str,
        project_id: &str,
        title: &str,
        description: &str,
        repo_url: Option<&str>,
        branch: &str,
        dockerfile_path: &str,
        git_token_id: Option<&str>,
    ) -> Result<Pod> {
        let id = new_id();
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO pods (id, user_id, project_id, title, description, repo_url,
                                   branch, dockerfile_path, git_token_id, status,
                                   created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'created', ?10, ?10)",
                params![
                    id,
                    user_id,
                    project_id,
                    title,
                    description,
                    repo_url,
                    branch,
                    dockerfile_path,
                    git_token_id,
                    ts
                ],
            )
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    StoreError::Integrity("unknown project or git token".to_string())
                } else {
                    e.into()
                }
            })?;
        self.get_pod(&id)
    }

    pub fn list_pods(&self, user_id: &str) -> Result<Vec<Pod>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE user_id = ?1 ORDER BY created_at",
            POD_SELECT
        ))?;
        let rows = stmt.query_map(params![user_id], row_to_pod)?;
        collect(rows)
    }

    pub fn list_pods_by_project(&self, project_id: &str) -> Result<Vec<Pod>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE project_id = ?1 ORDER BY created_at",
            POD_SELECT
        ))?;
        let rows = stmt.query_map(params![project_id], row_to_pod)?;
        collect(rows)
    }

    pub fn get_pod(&self, id: &str) -> Result<Pod> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE id = ?1", POD_SELECT))?;
        let mut rows = stmt.query_map(params![id], row_to_pod)?;
        match rows.next() {
            Some(row) => Ok(row?),
            None => Err(StoreError::NotFound),
        }
    }

    pub fn update_pod(&self, id: &str, update: &PodUpdate) -> Result<Pod> {
        let tx = self.conn.unchecked_transaction()?;
        let ts = now();
        if let Some(v) = &update.title {
            tx.execute(
                "UPDATE pods SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![v, ts, id],
            )?;
        }
        if let Some(v) = &update.description {
            tx.execute(
                "UPDATE pods SET description = ?1, updated_at = ?2 WHERE id = ?3",
                params![v, ts, id],
            )?;
        }
        if let Some(v) = &update.repo_url {
            tx.execute(
                "UPDATE pods SET repo_url = ?1, updated_at = ?2 WHERE id = ?3",
                params![v, ts, id],
            )?;
        }
        if let Some(v) = &update.branch {
            tx.execute(
                "UPDATE pods SET branch = ?1, updated_at = ?2 WHERE id = ?3",
                params![v, ts, id],
            )?;
        }
        if let Some(v) = &update.dockerfile_path {
            tx.execute(
                "UPDATE pods SET dockerfile_path = ?1, updated_at = ?2 WHERE id = ?3",
                params![v, ts, id],
            )?;
        }
        if let Some(v) = &update.git_token_id {
            tx.execute(
                "UPDATE pods SET git_token_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![v, ts, id],
            )?;
        }
        tx.commit()?;
        self.get_pod(id)
    }

    /// Persist a lifecycle transition. Container ids are stored only for
    /// states that actually have a container; `created`, `building` and
    /// `failed` always clear the column.
    pub fn set_pod_state(
        &self,
        id: &str,
        status: PodStatus,
        container_id: Option<&str>,
    ) -> Result<Pod> {
        let stored = match status {
            PodStatus::Running | PodStatus::Stopped => container_id,
            _ => None,
        };
        let n = self.conn.execute(
            "UPDATE pods SET status = ?1, container_id = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), stored, now(), id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_pod(id)
    }

    pub fn delete_pod(&self, id: &str) -> Result<()> {
        let n = self
            .conn
            .execute("DELETE FROM pods WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ── Pod domains ───────────────────────────────────────────────────

    pub fn create_pod_domain(
        &self,
        pod_id: &str,
        domain: &str,
        kind: DomainKind,
        port: i64,
        is_primary: bool,
        ssl_enabled: bool,
    ) -> Result<PodDomain> {
        let id = new_id();
        self.conn.execute(
            "INSERT INTO pod_domains (id, pod_id, domain, type, port, is_primary, ssl_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, pod_id, domain, kind.as_str(), port, is_primary, ssl_enabled],
        )?;
        self.get_pod_domain(&id)
    }

    pub fn list_pod_domains(&self, pod_id: &str) -> Result<Vec<PodDomain>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, pod_id, domain, type, port, is_primary, ssl_enabled
             FROM pod_domains WHERE pod_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![pod_id], row_to_domain)?;
        collect(rows)
    }

    pub fn get_pod_domain(&self, id: &str) -> Result<PodDomain> {
        let mut stmt = self.conn.prepare(
            "SELECT id, pod_id, domain, type, port, is_primary, ssl_enabled
             FROM pod_domains WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_domain)?;
        match rows.next() {
            Some(row) => Ok(row?),
            None => Err(StoreError::NotFound),
        }
    }

    /// Make one domain primary and demote every other domain of the pod, in
    /// a single transaction so at most one primary is ever observable.
    pub fn set_primary_domain(&self, pod_id: &str, domain_id: &str) -> Result<PodDomain> {
        let domain = self.get_pod_domain(domain_id)?;
        if domain.pod_id != pod_id {
            return Err(StoreError::NotFound);
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE pod_domains SET is_primary = 0 WHERE pod_id = ?1",
            params![pod_id],
        )?;
        tx.execute(
            "UPDATE pod_domains SET is_primary = 1 WHERE id = ?1",
            params![domain_id],
        )?;
        tx.commit()?;
        self.get_pod_domain(domain_id)
    }

    pub fn delete_pod_domain(&self, id: &str) -> Result<()> {
        let n = self
            .conn
            .execute("DELETE FROM pod_domains WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ── Pod env vars ──────────────────────────────────────────────────

    pub fn create_pod_env_var(&self, pod_id: &str, key: &str, value: &str) -> Result<PodEnvVar> {
        let id = new_id();
        self.conn.execute(
            "INSERT INTO pod_env_vars (id, pod_id, key, value) VALUES (?1, ?2, ?3, ?4)",
            params![id, pod_id, key, value],
        )?;
        Ok(PodEnvVar {
            id,
            pod_id: pod_id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn list_pod_env_vars(&self, pod_id: &str) -> Result<Vec<PodEnvVar>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, pod_id, key, value FROM pod_env_vars WHERE pod_id = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![pod_id], |row| {
            Ok(PodEnvVar {
                id: row.get(0)?,
                pod_id: row.get(1)?,
                key: row.get(2)?,
                value: row.get(3)?,
            })
        })?;
        collect(rows)
    }

    pub fn get_pod_env_var(&self, id: &str) -> Result<PodEnvVar> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, pod_id, key, value FROM pod_env_vars WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok(PodEnvVar {
                id: row.get(0)?,
                pod_id: row.get(1)?,
                key: row.get(2)?,
                value: row.get(3)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(row?),
            None => Err(StoreError::NotFound),
        }
    }

    pub fn delete_pod_env_var(&self, id: &str) -> Result<()> {
        let n = self
            .conn
            .execute("DELETE FROM pod_env_vars WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ── Git tokens ────────────────────────────────────────────────────

    pub fn create_git_token(
        &self,
        user_id: &str,
        name: &str,
        provider: &str,
        token: &str,
    ) -> Result<GitToken> {
        let id = new_id();
        let ts = now();
        self.conn.execute(
            "INSERT INTO git_tokens (id, user_id, name, provider, token, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id, user_id, name, provider, token, ts],
        )?;
        self.get_git_token(&id)
    }

    pub fn list_git_tokens(&self, user_id: &str) -> Result<Vec<GitToken>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, name, provider, token, created_at, updated_at
             FROM git_tokens WHERE user_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_git_token)?;
        collect(rows)
    }

    pub fn get_git_token(&self, id: &str) -> Result<GitToken> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, name, provider, token, created_at, updated_at
             FROM git_tokens WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_git_token)?;
        match rows.next() {
            Some(row) => Ok(row?),
            None => Err(StoreError::NotFound),
        }
    }

    pub fn delete_git_token(&self, id: &str) -> Result<()> {
        let n = self
            .conn
            .execute("DELETE FROM git_tokens WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

/// Partial pod update; `None` leaves the column untouched.
#[derive(Debug, Default, Clone)]
pub struct PodUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub dockerfile_path: Option<String>,
    pub git_token_id: Option<String>,
}

const POD_SELECT: &str = "SELECT id, user_id, project_id, title, description, repo_url, branch,
                                 dockerfile_path, git_token_id, container_id, status,
                                 created_at, updated_at
                          FROM pods";

// ── Row mappers ───────────────────────────────────────────────────────

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn row_to_pod(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pod> {
    let status: String = row.get(10)?;
    Ok(Pod {
        id: row.get(0)?,
        user_id: row.get(1)?,
        project_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        repo_url: row.get(5)?,
        branch: row.get(6)?,
        dockerfile_path: row.get(7)?,
        git_token_id: row.get(8)?,
        container_id: row.get(9)?,
        status: PodStatus::from_str(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, e.into())
        })?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn row_to_domain(row: &rusqlite::Row<'_>) -> rusqlite::Result<PodDomain> {
    let kind: String = row.get(3)?;
    Ok(PodDomain {
        id: row.get(0)?,
        pod_id: row.get(1)?,
        domain: row.get(2)?,
        kind: DomainKind::from_str(&kind).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?,
        port: row.get(4)?,
        is_primary: row.get(5)?,
        ssl_enabled: row.get(6)?,
    })
}

fn row_to_git_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<GitToken> {
    Ok(GitToken {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        provider: row.get(3)?,
        token: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn collect<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> std::result::Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    ) && err.to_string().contains("UNIQUE")
}

fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    ) && err.to_string().contains("FOREIGN KEY")
}
