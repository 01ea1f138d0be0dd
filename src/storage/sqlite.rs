//! Primary [`StorageBackend`]: SQLite via `rusqlite`, grounded on the
//! connection-per-call `SqliteStorage` pattern (xzatoma's chat history
//! store) adapted for capture records and server registration instead of
//! conversation history. Unlike that single-process CLI, the gateway has
//! several tasks writing concurrently (capture records are not serialized
//! by `StorageManager`), so every connection sets a busy timeout and lets
//! SQLite's own locking retry instead of surfacing `SQLITE_BUSY`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};

use crate::config::ServerConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::storage::backend::{RecordQuery, StorageBackend};
use crate::storage::record::{CaptureRecord, ServerRuntimeView};

/// How long a connection blocks retrying a locked database before giving up
/// with `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a connection to `db_path` with the shared busy timeout applied.
/// Every call site opens its own connection (spec.md §4.8: storage backend
/// writes are individually thread-safe); this is what keeps that safe under
/// concurrent writers instead of surfacing spurious lock errors.
fn open(db_path: &Path) -> GatewayResult<Connection> {
    let conn = Connection::open(db_path)
        .map_err(|e| GatewayError::storage(format!("failed to open database: {e}")))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| GatewayError::storage(format!("failed to set busy timeout: {e}")))?;
    Ok(conn)
}

pub struct SqliteBackend {
    db_path: PathBuf,
}

impl SqliteBackend {
    pub fn new(storage_dir: &Path) -> GatewayResult<Self> {
        std::fs::create_dir_all(storage_dir)?;
        let db_path = storage_dir.join("gateway.db");
        let backend = Self { db_path };
        backend.init()?;
        Ok(backend)
    }

    fn connect(&self) -> GatewayResult<Connection> {
        open(&self.db_path)
    }

    fn init(&self) -> GatewayResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS capture_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                server_name TEXT NOT NULL,
                session_id TEXT NOT NULL,
                method TEXT,
                request_id TEXT,
                direction TEXT NOT NULL,
                body JSON NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| GatewayError::storage(format!("failed to create capture_records: {e}")))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS servers (
                name TEXT PRIMARY KEY,
                config JSON NOT NULL,
                view JSON NOT NULL
            )",
            [],
        )
        .map_err(|e| GatewayError::storage(format!("failed to create servers: {e}")))?;

        Ok(())
    }

    fn record_id(record: &CaptureRecord) -> Option<String> {
        let id = match record {
            CaptureRecord::Request(r) => r.id.as_ref(),
            CaptureRecord::Response(r) => r.id.as_ref(),
            CaptureRecord::SseEvent(r) => r.id.as_ref(),
            CaptureRecord::Error(r) => r.id.as_ref(),
        }?;
        serde_json::to_string(id).ok()
    }

    fn direction_tag(record: &CaptureRecord) -> &'static str {
        match record {
            CaptureRecord::Request(_) => "request",
            CaptureRecord::Response(_) => "response",
            CaptureRecord::SseEvent(_) => "sse-event",
            CaptureRecord::Error(_) => "error",
        }
    }

    fn record_method(record: &CaptureRecord) -> Option<String> {
        match record {
            CaptureRecord::Request(r) => Some(r.method.clone()),
            CaptureRecord::Response(r) => Some(r.method.clone()),
            CaptureRecord::SseEvent(r) => r.method.clone(),
            CaptureRecord::Error(r) => r.method.clone(),
        }
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn write(&self, record: CaptureRecord) -> GatewayResult<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            let body = serde_json::to_string(&record)?;
            conn.execute(
                "INSERT INTO capture_records (server_name, session_id, method, request_id, direction, body, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    record.server_name(),
                    record.session_id(),
                    Self::record_method(&record),
                    Self::record_id(&record),
                    Self::direction_tag(&record),
                    body,
                    record.timestamp().to_rfc3339(),
                ],
            )
            .map_err(|e| GatewayError::storage(format!("failed to insert capture record: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::storage(format!("blocking task panicked: {e}")))?
    }

    async fn update_server_info_for_initialize_request(
        &self,
        session_id: &str,
        id: &turbomcp_protocol::MessageId,
        server_info: crate::session::info_cache::PeerInfo,
    ) -> GatewayResult<()> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_string();
        let request_id = serde_json::to_string(id)?;
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM capture_records
                     WHERE direction = 'request' AND session_id = ? AND request_id = ?
                     ORDER BY seq DESC LIMIT 1",
                    params![session_id, request_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| GatewayError::storage(format!("failed to look up request record: {e}")))?;

            let Some(body) = body else { return Ok(()) };
            let mut record: CaptureRecord = serde_json::from_str(&body)?;
            if let CaptureRecord::Request(req) = &mut record {
                req.server_info = Some(server_info);
            }
            let updated = serde_json::to_string(&record)?;

            conn.execute(
                "UPDATE capture_records SET body = ?
                 WHERE direction = 'request' AND session_id = ? AND request_id = ?",
                params![updated, session_id, request_id],
            )
            .map_err(|e| GatewayError::storage(format!("failed to backfill server info: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::storage(format!("blocking task panicked: {e}")))?
    }

    async fn rekey_session_id(
        &self,
        server_name: &str,
        id: &turbomcp_protocol::MessageId,
        old_session_id: &str,
        new_session_id: &str,
    ) -> GatewayResult<()> {
        let db_path = self.db_path.clone();
        let server_name = server_name.to_string();
        let old_session_id = old_session_id.to_string();
        let new_session_id = new_session_id.to_string();
        let request_id = serde_json::to_string(id)?;
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM capture_records
                     WHERE direction = 'request' AND server_name = ? AND session_id = ? AND request_id = ?
                     ORDER BY seq DESC LIMIT 1",
                    params![server_name, old_session_id, request_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| GatewayError::storage(format!("failed to look up request record: {e}")))?;

            let Some(body) = body else { return Ok(()) };
            let mut record: CaptureRecord = serde_json::from_str(&body)?;
            if let CaptureRecord::Request(req) = &mut record {
                req.session_id = new_session_id.clone();
            }
            let updated = serde_json::to_string(&record)?;

            conn.execute(
                "UPDATE capture_records SET body = ?, session_id = ?
                 WHERE direction = 'request' AND server_name = ? AND session_id = ? AND request_id = ?",
                params![updated, new_session_id, server_name, old_session_id, request_id],
            )
            .map_err(|e| GatewayError::storage(format!("failed to rekey session id: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::storage(format!("blocking task panicked: {e}")))?
    }

    async fn query_records(&self, query: RecordQuery) -> GatewayResult<Vec<CaptureRecord>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;

            let mut sql = "SELECT body FROM capture_records WHERE 1 = 1".to_string();
            if query.server_name.is_some() {
                sql.push_str(" AND server_name = :server_name");
            }
            if query.session_id.is_some() {
                sql.push_str(" AND session_id = :session_id");
            }
            if query.method.is_some() {
                sql.push_str(" AND method = :method");
            }
            sql.push_str(" ORDER BY seq DESC");
            if query.limit > 0 {
                sql.push_str(" LIMIT :limit");
            }

            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| GatewayError::storage(format!("failed to prepare query: {e}")))?;

            let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
            if let Some(server_name) = &query.server_name {
                named.push((":server_name", server_name));
            }
            if let Some(session_id) = &query.session_id {
                named.push((":session_id", session_id));
            }
            if let Some(method) = &query.method {
                named.push((":method", method));
            }
            let limit = query.limit as i64;
            if query.limit > 0 {
                named.push((":limit", &limit));
            }

            let rows = stmt
                .query_map(named.as_slice(), |row| row.get::<_, String>(0))
                .map_err(|e| GatewayError::storage(format!("failed to query capture records: {e}")))?;

            let mut records = Vec::new();
            for row in rows {
                let body = row.map_err(|e| GatewayError::storage(format!("row decode failed: {e}")))?;
                records.push(serde_json::from_str(&body)?);
            }
            Ok(records)
        })
        .await
        .map_err(|e| GatewayError::storage(format!("blocking task panicked: {e}")))?
    }

    async fn add_server(&self, config: ServerConfig) -> GatewayResult<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open(&db_path)?;
            let name = config.name().to_string();

            let tx = conn
                .transaction()
                .map_err(|e| GatewayError::storage(format!("failed to start transaction: {e}")))?;

            let exists: bool = tx
                .query_row("SELECT 1 FROM servers WHERE name = ?", params![name], |_| Ok(true))
                .optional()
                .map_err(|e| GatewayError::storage(format!("failed to check existing server: {e}")))?
                .unwrap_or(false);
            if exists {
                return Err(GatewayError::duplicate_server(name));
            }

            let view = ServerRuntimeView::new(config.clone());
            let config_json = serde_json::to_string(&config)?;
            let view_json = serde_json::to_string(&view)?;
            tx.execute(
                "INSERT INTO servers (name, config, view) VALUES (?, ?, ?)",
                params![name, config_json, view_json],
            )
            .map_err(|e| GatewayError::storage(format!("failed to insert server: {e}")))?;

            tx.commit().map_err(|e| GatewayError::storage(format!("failed to commit: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::storage(format!("blocking task panicked: {e}")))?
    }

    async fn remove_server(&self, name: &str) -> GatewayResult<()> {
        let db_path = self.db_path.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            let affected = conn
                .execute("DELETE FROM servers WHERE name = ?", params![name])
                .map_err(|e| GatewayError::storage(format!("failed to delete server: {e}")))?;
            if affected == 0 {
                return Err(GatewayError::unknown_server(name));
            }
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::storage(format!("blocking task panicked: {e}")))?
    }

    async fn get_servers(&self) -> GatewayResult<Vec<ServerRuntimeView>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            let mut stmt = conn
                .prepare("SELECT view FROM servers ORDER BY name ASC")
                .map_err(|e| GatewayError::storage(format!("failed to prepare query: {e}")))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| GatewayError::storage(format!("failed to query servers: {e}")))?;
            let mut views = Vec::new();
            for row in rows {
                let body = row.map_err(|e| GatewayError::storage(format!("row decode failed: {e}")))?;
                views.push(serde_json::from_str(&body)?);
            }
            Ok(views)
        })
        .await
        .map_err(|e| GatewayError::storage(format!("blocking task panicked: {e}")))?
    }

    async fn get_server(&self, name: &str) -> GatewayResult<Option<ServerRuntimeView>> {
        let db_path = self.db_path.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            let body: Option<String> = conn
                .query_row("SELECT view FROM servers WHERE name = ?", params![name], |row| row.get(0))
                .optional()
                .map_err(|e| GatewayError::storage(format!("failed to query server: {e}")))?;
            match body {
                Some(body) => Ok(Some(serde_json::from_str(&body)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| GatewayError::storage(format!("blocking task panicked: {e}")))?
    }

    async fn update_server_view(&self, view: ServerRuntimeView) -> GatewayResult<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            let name = view.config.name().to_string();
            let view_json = serde_json::to_string(&view)?;
            let affected = conn
                .execute(
                    "UPDATE servers SET view = ? WHERE name = ?",
                    params![view_json, name],
                )
                .map_err(|e| GatewayError::storage(format!("failed to update server view: {e}")))?;
            if affected == 0 {
                return Err(GatewayError::unknown_server(name));
            }
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::storage(format!("blocking task panicked: {e}")))?
    }

    async fn clear_all(&self) -> GatewayResult<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            conn.execute("DELETE FROM capture_records", [])
                .map_err(|e| GatewayError::storage(format!("failed to clear capture_records: {e}")))?;
            conn.execute("DELETE FROM servers", [])
                .map_err(|e| GatewayError::storage(format!("failed to clear servers: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::storage(format!("blocking task panicked: {e}")))?
    }
}
