//! SQLite persistence for cluster descriptors.
//!
//! Descriptor rows and credential material live in separate tables so that
//! listing queries never read a secret. Timestamps are unix milliseconds.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use secrecy::{ExposeSecret, SecretString};

use super::{
    ClusterDescriptor, ClusterId, ClusterPatch, ClusterStatus, Credential, CredentialKind,
    DescriptorRepository, NewCluster, StoredCluster,
};
use crate::error::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS clusters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    server_url TEXT NOT NULL,
    credential_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'unknown',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Credential material, one row per cluster, never joined into listings
CREATE TABLE IF NOT EXISTS cluster_credentials (
    cluster_id INTEGER PRIMARY KEY,
    secret TEXT NOT NULL,
    skip_tls_verify INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (cluster_id) REFERENCES clusters(id) ON DELETE CASCADE
);
"#;

const DESCRIPTOR_COLUMNS: &str =
    "c.id, c.name, c.description, c.server_url, c.credential_type, c.status, c.created_at, c.updated_at";

/// Descriptor repository backed by a SQLite file
#[derive(Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(|e| {
            Error::internal_with_context(
                "credential_store",
                format!("failed to open {}: {}", path.as_ref().display(), e),
            )
        })?;
        Self::init(conn)
    }

    /// In-memory database, mostly for tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::internal_with_context("credential_store", e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .and_then(|_| conn.execute_batch(SCHEMA))
            .map_err(|e| Error::internal_with_context("credential_store", e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking database operation off the async executor
    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::internal_with_context("credential_store", format!("{}: {}", op, e)))?
        .map_err(|e| map_sqlite_error(op, e))
    }
}

fn map_sqlite_error(op: &str, e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Error::validation_for_field("name", "cluster name already exists")
        }
        _ => Error::internal_with_context("credential_store", format!("{}: {}", op, e)),
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn parse_credential_kind(value: &str) -> CredentialKind {
    match value {
        "kubeconfig" => CredentialKind::Kubeconfig,
        _ => CredentialKind::Token,
    }
}

fn descriptor_from_row(row: &Row<'_>) -> rusqlite::Result<ClusterDescriptor> {
    let credential_type: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(ClusterDescriptor {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        server_url: row.get(3)?,
        credential_type: parse_credential_kind(&credential_type),
        status: ClusterStatus::parse(&status),
        created_at: millis_to_datetime(row.get(6)?),
        updated_at: millis_to_datetime(row.get(7)?),
    })
}

fn stored_from_row(row: &Row<'_>) -> rusqlite::Result<StoredCluster> {
    let descriptor = descriptor_from_row(row)?;
    let secret: String = row.get(8)?;
    let skip_tls_verify: bool = row.get(9)?;
    let credential = match descriptor.credential_type {
        CredentialKind::Token => Credential::Token {
            token: SecretString::from(secret),
            skip_tls_verify,
        },
        CredentialKind::Kubeconfig => Credential::Kubeconfig {
            content: SecretString::from(secret),
        },
    };
    Ok(StoredCluster {
        descriptor,
        credential,
    })
}

fn credential_columns(credential: &Credential) -> (String, bool) {
    match credential {
        Credential::Token {
            token,
            skip_tls_verify,
        } => (token.expose_secret().to_string(), *skip_tls_verify),
        Credential::Kubeconfig { content } => (content.expose_secret().to_string(), false),
    }
}

fn select_descriptor(conn: &Connection, id: ClusterId) -> rusqlite::Result<Option<ClusterDescriptor>> {
    conn.query_row(
        &format!("SELECT {} FROM clusters c WHERE c.id = ?1", DESCRIPTOR_COLUMNS),
        params![id],
        descriptor_from_row,
    )
    .optional()
}

fn select_stored(conn: &Connection, id: ClusterId) -> rusqlite::Result<Option<StoredCluster>> {
    conn.query_row(
        &format!(
            "SELECT {}, cc.secret, cc.skip_tls_verify FROM clusters c \
             JOIN cluster_credentials cc ON cc.cluster_id = c.id WHERE c.id = ?1",
            DESCRIPTOR_COLUMNS
        ),
        params![id],
        stored_from_row,
    )
    .optional()
}

#[async_trait]
impl DescriptorRepository for SqliteRepository {
    async fn insert(&self, cluster: NewCluster) -> Result<ClusterDescriptor> {
        self.with_conn("insert", move |conn| {
            let now = Utc::now();
            let millis = now.timestamp_millis();
            let kind = cluster.credential.kind();
            let (secret, skip_tls_verify) = credential_columns(&cluster.credential);

            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO clusters (name, description, server_url, credential_type, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    cluster.name,
                    cluster.description,
                    cluster.server_url,
                    kind.as_str(),
                    ClusterStatus::Unknown.as_str(),
                    millis
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO cluster_credentials (cluster_id, secret, skip_tls_verify) VALUES (?1, ?2, ?3)",
                params![id, secret, skip_tls_verify],
            )?;
            tx.commit()?;

            Ok(ClusterDescriptor {
                id,
                name: cluster.name,
                description: cluster.description,
                server_url: cluster.server_url,
                credential_type: kind,
                status: ClusterStatus::Unknown,
                created_at: millis_to_datetime(millis),
                updated_at: millis_to_datetime(millis),
            })
        })
        .await
    }

    async fn get(&self, id: ClusterId) -> Result<Option<ClusterDescriptor>> {
        self.with_conn("get", move |conn| select_descriptor(conn, id))
            .await
    }

    async fn fetch(&self, id: ClusterId) -> Result<Option<StoredCluster>> {
        self.with_conn("fetch", move |conn| select_stored(conn, id))
            .await
    }

    async fn list(&self) -> Result<Vec<ClusterDescriptor>> {
        self.with_conn("list", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM clusters c ORDER BY c.id",
                DESCRIPTOR_COLUMNS
            ))?;
            let rows = stmt.query_map([], descriptor_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn update(&self, id: ClusterId, patch: ClusterPatch) -> Result<Option<StoredCluster>> {
        self.with_conn("update", move |conn| {
            let tx = conn.transaction()?;
            let Some(mut stored) = select_stored(&tx, id)? else {
                return Ok(None);
            };

            if let Some(name) = patch.name {
                stored.descriptor.name = name;
            }
            if let Some(description) = patch.description {
                stored.descriptor.description = description;
            }
            if let Some(server_url) = patch.server_url {
                stored.descriptor.server_url = server_url;
            }
            if let Some(credential) = patch.credential {
                let (secret, skip_tls_verify) = credential_columns(&credential);
                tx.execute(
                    "UPDATE cluster_credentials SET secret = ?2, skip_tls_verify = ?3 WHERE cluster_id = ?1",
                    params![id, secret, skip_tls_verify],
                )?;
                stored.descriptor.credential_type = credential.kind();
                stored.credential = credential;
            }

            let now = Utc::now().timestamp_millis();
            tx.execute(
                "UPDATE clusters SET name = ?2, description = ?3, server_url = ?4, credential_type = ?5, updated_at = ?6 \
                 WHERE id = ?1",
                params![
                    id,
                    stored.descriptor.name,
                    stored.descriptor.description,
                    stored.descriptor.server_url,
                    stored.descriptor.credential_type.as_str(),
                    now
                ],
            )?;
            tx.commit()?;

            stored.descriptor.updated_at = millis_to_datetime(now);
            Ok(Some(stored))
        })
        .await
    }

    async fn set_status(
        &self,
        id: ClusterId,
        status: ClusterStatus,
    ) -> Result<Option<ClusterDescriptor>> {
        self.with_conn("set_status", move |conn| {
            conn.execute(
                "UPDATE clusters SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?;
            select_descriptor(conn, id)
        })
        .await
    }

    async fn delete(&self, id: ClusterId) -> Result<bool> {
        self.with_conn("delete", move |conn| {
            let removed = conn.execute("DELETE FROM clusters WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }
}
