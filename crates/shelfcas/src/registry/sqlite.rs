use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyResult};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension};

use super::AssetRegistry;
use crate::asset::{AssetDescriptor, OwnerId, Tier};
use crate::error::{CasError, Result};
use crate::hash::Fingerprint;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS assets (
    owner_id TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    backend TEXT NOT NULL,
    remote_key TEXT NOT NULL,
    public_url TEXT NOT NULL,
    created_at TEXT NOT NULL,
    file_name TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    PRIMARY KEY (owner_id, fingerprint)
);
CREATE INDEX IF NOT EXISTS idx_assets_owner_created ON assets(owner_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_assets_fingerprint ON assets(fingerprint, created_at);
CREATE INDEX IF NOT EXISTS idx_assets_object ON assets(backend, remote_key);
"#;

const COLUMNS: &str = "owner_id, fingerprint, backend, remote_key, public_url, created_at, \
                       file_name, mime_type, size_bytes";

/// SQLite-backed registry with the connection-per-call pattern.
///
/// Each method opens a fresh connection with WAL mode, so the registry can be
/// shared between request handlers without holding a connection lock. The
/// `(owner_id, fingerprint)` primary key makes `register` an atomic
/// insert-if-absent.
#[derive(Debug, Clone)]
pub struct SqliteRegistry {
    path: PathBuf,
}

/// Raw row, converted to a descriptor outside the rusqlite callback.
struct AssetRow {
    owner_id: String,
    fingerprint: String,
    backend: String,
    remote_key: String,
    public_url: String,
    created_at: String,
    file_name: String,
    mime_type: String,
    size_bytes: i64,
}

impl AssetRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            owner_id: row.get(0)?,
            fingerprint: row.get(1)?,
            backend: row.get(2)?,
            remote_key: row.get(3)?,
            public_url: row.get(4)?,
            created_at: row.get(5)?,
            file_name: row.get(6)?,
            mime_type: row.get(7)?,
            size_bytes: row.get(8)?,
        })
    }

    fn into_descriptor(self) -> AnyResult<AssetDescriptor> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .with_context(|| format!("bad created_at in registry: {}", self.created_at))?
            .with_timezone(&Utc);

        Ok(AssetDescriptor {
            fingerprint: Fingerprint::parse(&self.fingerprint)
                .with_context(|| format!("bad fingerprint in registry: {}", self.fingerprint))?,
            backend: self
                .backend
                .parse::<Tier>()
                .map_err(|e| anyhow::anyhow!("{e}"))?,
            remote_key: self.remote_key,
            public_url: self.public_url,
            owner_id: OwnerId::new(self.owner_id).map_err(|e| anyhow::anyhow!("{e}"))?,
            created_at,
            file_name: self.file_name,
            mime_type: self.mime_type,
            size_bytes: self.size_bytes.max(0) as u64,
        })
    }
}

/// Timestamps are stored with nanosecond precision so that `remove_exact`
/// can compare registrations by value, and so text ordering is time ordering.
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

impl SqliteRegistry {
    /// Open the database at path, creating it and its schema if necessary.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create registry directory")?;
        }

        let registry = Self { path };
        registry.initialize()?;
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> AnyResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open registry database: {:?}", self.path))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        Ok(conn)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize registry schema")?;
        Ok(())
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<AssetDescriptor>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).context("failed to prepare registry query")?;
        let rows = stmt
            .query_map(params, AssetRow::from_row)
            .context("registry query failed")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read registry rows")?;

        let descriptors = rows
            .into_iter()
            .map(AssetRow::into_descriptor)
            .collect::<AnyResult<Vec<_>>>()?;
        Ok(descriptors)
    }

    fn query_one(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<AssetDescriptor>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(sql, params, AssetRow::from_row)
            .optional()
            .context("registry lookup failed")?;
        Ok(row.map(AssetRow::into_descriptor).transpose()?)
    }
}

impl AssetRegistry for SqliteRegistry {
    fn lookup(
        &self,
        owner: &OwnerId,
        fingerprint: &Fingerprint,
    ) -> Result<Option<AssetDescriptor>> {
        self.query_one(
            &format!("SELECT {COLUMNS} FROM assets WHERE owner_id = ?1 AND fingerprint = ?2"),
            (owner.as_str(), fingerprint.as_str()),
        )
    }

    fn find_any(&self, fingerprint: &Fingerprint) -> Result<Option<AssetDescriptor>> {
        self.query_one(
            &format!(
                "SELECT {COLUMNS} FROM assets WHERE fingerprint = ?1 \
                 ORDER BY created_at ASC LIMIT 1"
            ),
            [fingerprint.as_str()],
        )
    }

    fn register(&self, descriptor: AssetDescriptor) -> Result<()> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            &format!("INSERT INTO assets ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            (
                descriptor.owner_id.as_str(),
                descriptor.fingerprint.as_str(),
                descriptor.backend.as_str(),
                &descriptor.remote_key,
                &descriptor.public_url,
                timestamp(&descriptor.created_at),
                &descriptor.file_name,
                &descriptor.mime_type,
                descriptor.size_bytes as i64,
            ),
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(CasError::DuplicateKey {
                    owner: descriptor.owner_id,
                    fingerprint: descriptor.fingerprint,
                })
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context("failed to insert asset")
                .into()),
        }
    }

    fn remove(
        &self,
        owner: &OwnerId,
        fingerprint: &Fingerprint,
    ) -> Result<Option<AssetDescriptor>> {
        let Some(existing) = self.lookup(owner, fingerprint)? else {
            return Ok(None);
        };
        // Only the registration we just read is deleted; a concurrent
        // re-registration survives.
        if self.remove_exact(&existing)? {
            Ok(Some(existing))
        } else {
            Ok(None)
        }
    }

    fn remove_exact(&self, descriptor: &AssetDescriptor) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "DELETE FROM assets WHERE owner_id = ?1 AND fingerprint = ?2 AND created_at = ?3",
                (
                    descriptor.owner_id.as_str(),
                    descriptor.fingerprint.as_str(),
                    timestamp(&descriptor.created_at),
                ),
            )
            .context("failed to delete asset")?;
        Ok(rows > 0)
    }

    fn refresh_url(&self, descriptor: &AssetDescriptor, public_url: &str) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE assets SET public_url = ?4 \
                 WHERE owner_id = ?1 AND fingerprint = ?2 AND created_at = ?3",
                (
                    descriptor.owner_id.as_str(),
                    descriptor.fingerprint.as_str(),
                    timestamp(&descriptor.created_at),
                    public_url,
                ),
            )
            .context("failed to refresh asset url")?;
        Ok(rows > 0)
    }

    fn all(&self, owner: &OwnerId) -> Result<Vec<AssetDescriptor>> {
        self.query(
            &format!("SELECT {COLUMNS} FROM assets WHERE owner_id = ?1 ORDER BY created_at DESC"),
            [owner.as_str()],
        )
    }

    fn snapshot(&self) -> Result<Vec<AssetDescriptor>> {
        self.query(&format!("SELECT {COLUMNS} FROM assets"), [])
    }

    fn references(&self, backend: Tier, remote_key: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM assets WHERE backend = ?1 AND remote_key = ?2",
                (backend.as_str(), remote_key),
                |row| row.get(0),
            )
            .context("failed to count asset references")?;
        Ok(count as usize)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))
            .context("failed to count assets")?;
        Ok(count as usize)
    }
}
