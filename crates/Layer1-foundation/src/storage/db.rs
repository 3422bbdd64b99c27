//! SQLite storage
//!
//! Tables:
//! - settings: key-value deployment settings; secret values are sealed with
//!   the key in `secret.key` beside the database
//! - templates: template records and build state
//! - workspaces: workspace containers, consulted by the VMID allocator
//!
//! ## Migration System
//!
//! Database schema is versioned. Migrations run automatically on startup.
//! - Version 1: Initial schema (settings, templates, workspaces)
//! - Version 2: Add os_template column to templates

use super::records::{RecordStore, SettingsStore, Template, TemplateStatus, WorkspaceRecord};
use super::secret::{SecretBox, SECRET_KEY_FILE};
use crate::config::is_secret_setting;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 2;

const TEMPLATE_COLUMNS: &str = "id, user_id, name, description, os_template, parent_template_id, \
     tech_stacks, inherited_tech_stacks, status, vmid, node, storage, staging_container_ip, \
     is_default, error_message, created_at, updated_at";

const WORKSPACE_COLUMNS: &str =
    "id, user_id, name, container_id, container_backend, template_id, node, created_at";

/// SQLite-backed settings and record store
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
    secrets: Arc<SecretBox>,
}

impl Storage {
    /// Open (or create) `burrow.db` under `data_dir`
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;

        let db_path = data_dir.join("burrow.db");
        let conn = Connection::open(&db_path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        let secrets = SecretBox::load_or_create(&data_dir.join(SECRET_KEY_FILE))?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
            secrets: Arc::new(secrets),
        };

        storage.initialize_schema()?;
        storage.run_migrations()?;

        Ok(storage)
    }

    /// Create an in-memory storage (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
            secrets: Arc::new(SecretBox::ephemeral()),
        };

        storage.initialize_schema()?;
        storage.run_migrations()?;

        Ok(storage)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    /// Get current schema version from database
    pub fn get_schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to get schema version: {}", e)))
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                parent_template_id TEXT,
                tech_stacks TEXT NOT NULL DEFAULT '[]',
                inherited_tech_stacks TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL CHECK(status IN ('pending', 'creating', 'staging', 'ready', 'error')),
                vmid INTEGER,
                node TEXT,
                storage TEXT,
                staging_container_ip TEXT,
                is_default INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_templates_user ON templates(user_id);
            CREATE INDEX IF NOT EXISTS idx_templates_parent ON templates(parent_template_id);

            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                container_id TEXT NOT NULL,
                container_backend TEXT NOT NULL,
                template_id TEXT,
                node TEXT,
                created_at TEXT NOT NULL
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version()?;

        if current_version >= CURRENT_SCHEMA_VERSION {
            debug!(
                "Database schema is up to date (version {})",
                current_version
            );
            return Ok(());
        }

        info!(
            "Running database migrations from version {} to {}",
            current_version, CURRENT_SCHEMA_VERSION
        );

        let conn = self.lock()?;

        for version in (current_version + 1)..=CURRENT_SCHEMA_VERSION {
            match version {
                2 => Self::migrate_v2(&conn)?,
                _ => {
                    warn!("Unknown migration version: {}", version);
                }
            }

            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                params![version],
            )
            .map_err(|e| Error::Storage(format!("Failed to record migration: {}", e)))?;

            info!("Applied migration to version {}", version);
        }

        Ok(())
    }

    /// Migration to version 2: per-template appliance override
    fn migrate_v2(conn: &Connection) -> Result<()> {
        conn.execute("ALTER TABLE templates ADD COLUMN os_template TEXT", [])
            .map_err(|e| Error::Storage(format!("Failed to migrate to v2: {}", e)))?;
        Ok(())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

struct TemplateRow {
    id: String,
    user_id: String,
    name: String,
    description: Option<String>,
    os_template: Option<String>,
    parent_template_id: Option<String>,
    tech_stacks: String,
    inherited_tech_stacks: String,
    status: String,
    vmid: Option<i64>,
    node: Option<String>,
    storage: Option<String>,
    staging_container_ip: Option<String>,
    is_default: bool,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TemplateRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            os_template: row.get(4)?,
            parent_template_id: row.get(5)?,
            tech_stacks: row.get(6)?,
            inherited_tech_stacks: row.get(7)?,
            status: row.get(8)?,
            vmid: row.get(9)?,
            node: row.get(10)?,
            storage: row.get(11)?,
            staging_container_ip: row.get(12)?,
            is_default: row.get(13)?,
            error_message: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }

    fn into_template(self) -> Result<Template> {
        Ok(Template {
            status: self.status.parse::<TemplateStatus>()?,
            tech_stacks: serde_json::from_str(&self.tech_stacks)?,
            inherited_tech_stacks: serde_json::from_str(&self.inherited_tech_stacks)?,
            vmid: self
                .vmid
                .map(|v| {
                    u32::try_from(v)
                        .map_err(|_| Error::Storage(format!("vmid out of range: {}", v)))
                })
                .transpose()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            description: self.description,
            os_template: self.os_template,
            parent_template_id: self.parent_template_id,
            node: self.node,
            storage: self.storage,
            staging_container_ip: self.staging_container_ip,
            is_default: self.is_default,
            error_message: self.error_message,
        })
    }
}

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<(WorkspaceRecord, String)> {
    Ok((
        WorkspaceRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            container_id: row.get(3)?,
            container_backend: row.get(4)?,
            template_id: row.get(5)?,
            node: row.get(6)?,
            created_at: Utc::now(),
        },
        row.get(7)?,
    ))
}

fn finish_workspace((mut record, created_at): (WorkspaceRecord, String)) -> Result<WorkspaceRecord> {
    record.created_at = parse_timestamp(&created_at)?;
    Ok(record)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("invalid timestamp '{}': {}", value, e)))
}

// ============================================================================
// Settings Operations
// ============================================================================

impl SettingsStore for Storage {
    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Storage(format!("Failed to get setting: {}", e)))?;
        match value {
            Some(v) if is_secret_setting(key) => self.secrets.open(&v).map(Some),
            other => Ok(other),
        }
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let value = if is_secret_setting(key) {
            self.secrets.seal(value)?
        } else {
            value.to_string()
        };
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![key, value, Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::Storage(format!("Failed to set setting: {}", e)))?;
        Ok(())
    }

    fn all_settings(&self) -> Result<HashMap<String, String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT key, value FROM settings")
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| Error::Storage(format!("Failed to query settings: {}", e)))?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()
            .map_err(|e| Error::Storage(format!("Failed to read settings: {}", e)))?;

        let mut settings = HashMap::with_capacity(rows.len());
        for (key, value) in rows {
            if !is_secret_setting(&key) {
                settings.insert(key, value);
                continue;
            }
            match self.secrets.open(&value) {
                Ok(value) => {
                    settings.insert(key, value);
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable setting"),
            }
        }
        Ok(settings)
    }
}

// ============================================================================
// Template / Workspace Operations
// ============================================================================

impl RecordStore for Storage {
    fn get_template(&self, id: &str) -> Result<Option<Template>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM templates WHERE id = ?1", TEMPLATE_COLUMNS),
                params![id],
                TemplateRow::from_row,
            )
            .optional()
            .map_err(|e| Error::Storage(format!("Failed to get template: {}", e)))?;
        row.map(TemplateRow::into_template).transpose()
    }

    fn list_templates(&self, user_id: Option<&str>) -> Result<Vec<Template>> {
        let conn = self.lock()?;
        let rows = match user_id {
            Some(user_id) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM templates WHERE user_id = ?1 ORDER BY created_at",
                        TEMPLATE_COLUMNS
                    ))
                    .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;
                let rows = stmt
                    .query_map(params![user_id], TemplateRow::from_row)
                    .map_err(|e| Error::Storage(format!("Failed to query templates: {}", e)))?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM templates ORDER BY created_at",
                        TEMPLATE_COLUMNS
                    ))
                    .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;
                let rows = stmt
                    .query_map([], TemplateRow::from_row)
                    .map_err(|e| Error::Storage(format!("Failed to query templates: {}", e)))?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            }
        }
        .map_err(|e| Error::Storage(format!("Failed to read templates: {}", e)))?;

        rows.into_iter().map(TemplateRow::into_template).collect()
    }

    fn save_template(&self, template: &Template) -> Result<()> {
        let tech_stacks = serde_json::to_string(&template.tech_stacks)?;
        let inherited = serde_json::to_string(&template.inherited_tech_stacks)?;
        let conn = self.lock()?;

        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO templates ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                TEMPLATE_COLUMNS
            ),
            params![
                template.id,
                template.user_id,
                template.name,
                template.description,
                template.os_template,
                template.parent_template_id,
                tech_stacks,
                inherited,
                template.status.as_str(),
                template.vmid,
                template.node,
                template.storage,
                template.staging_container_ip,
                template.is_default,
                template.error_message,
                template.created_at.to_rfc3339(),
                template.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Storage(format!("Failed to save template: {}", e)))?;

        Ok(())
    }

    fn delete_template(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM templates WHERE id = ?1", params![id])
            .map_err(|e| Error::Storage(format!("Failed to delete template: {}", e)))?;
        Ok(())
    }

    fn child_templates(&self, parent_id: &str) -> Result<Vec<Template>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM templates WHERE parent_template_id = ?1",
                TEMPLATE_COLUMNS
            ))
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![parent_id], TemplateRow::from_row)
            .map_err(|e| Error::Storage(format!("Failed to query templates: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("Failed to read templates: {}", e)))?;
        rows.into_iter().map(TemplateRow::into_template).collect()
    }

    fn set_default_template(&self, user_id: &str, id: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Storage(format!("Failed to begin transaction: {}", e)))?;

        tx.execute(
            "UPDATE templates SET is_default = 0 WHERE user_id = ?1",
            params![user_id],
        )
        .map_err(|e| Error::Storage(format!("Failed to clear default: {}", e)))?;

        let updated = tx
            .execute(
                "UPDATE templates SET is_default = 1, updated_at = ?3 WHERE id = ?1 AND user_id = ?2",
                params![id, user_id, Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::Storage(format!("Failed to set default: {}", e)))?;

        if updated == 0 {
            return Err(Error::NotFound(format!(
                "template {} for user {}",
                id, user_id
            )));
        }

        tx.commit()
            .map_err(|e| Error::Storage(format!("Failed to commit: {}", e)))?;
        Ok(())
    }

    fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM workspaces WHERE id = ?1", WORKSPACE_COLUMNS),
                params![id],
                workspace_from_row,
            )
            .optional()
            .map_err(|e| Error::Storage(format!("Failed to get workspace: {}", e)))?;
        row.map(finish_workspace).transpose()
    }

    fn list_workspaces(&self) -> Result<Vec<WorkspaceRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM workspaces ORDER BY created_at",
                WORKSPACE_COLUMNS
            ))
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], workspace_from_row)
            .map_err(|e| Error::Storage(format!("Failed to query workspaces: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("Failed to read workspaces: {}", e)))?;
        rows.into_iter().map(finish_workspace).collect()
    }

    fn save_workspace(&self, workspace: &WorkspaceRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO workspaces ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                WORKSPACE_COLUMNS
            ),
            params![
                workspace.id,
                workspace.user_id,
                workspace.name,
                workspace.container_id,
                workspace.container_backend,
                workspace.template_id,
                workspace.node,
                workspace.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Storage(format!("Failed to save workspace: {}", e)))?;
        Ok(())
    }

    fn delete_workspace(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM workspaces WHERE id = ?1", params![id])
            .map_err(|e| Error::Storage(format!("Failed to delete workspace: {}", e)))?;
        Ok(())
    }
}
