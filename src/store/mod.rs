//! Durable store: SQLite-backed persistence for flows, events, tool
//! invocations, and the drop log.
//!
//! Writes are serialized on a dedicated OS thread (not a tokio task) fed by
//! a bounded channel, so a slow disk never steals an async worker. Reads go
//! through a small pool of separate connections and run on
//! `spawn_blocking`, since rusqlite is synchronous. Grounded in the
//! dedicated-writer-thread/WAL/batch-transaction architecture used for
//! lifetime statistics, generalized to the flows/events/tool_invocations
//! schema and switched to enforced foreign keys with cascading deletes
//! (see design notes for why this departs from the teacher's
//! foreign_keys=OFF choice).

mod schema;

use crate::error::StoreError;
use crate::model::{DropLogEntry, Event, Flow, ToolInvocation};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

const WRITE_CHANNEL_CAPACITY: usize = 2048;

#[derive(Debug, Clone, Default)]
pub struct FlowFilter {
    pub host: Option<String>,
    pub task_id: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PricingRate {
    pub input_rate: f64,
    pub output_rate: f64,
    pub cache_creation_rate: f64,
    pub cache_read_rate: f64,
}

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

enum WriteCommand {
    SaveFlow(Box<Flow>, Reply<()>),
    UpdateFlow(Box<Flow>, Reply<()>),
    SaveEvent(Box<Event>, Reply<()>),
    SaveEvents(Vec<Event>, Reply<()>),
    SaveToolInvocation(Box<ToolInvocation>, Reply<()>),
    UpdateToolResult {
        tool_use_id: String,
        success: bool,
        duration_ms: Option<i64>,
        error_message: Option<String>,
        reply: Reply<()>,
    },
    LogDrop(Box<DropLogEntry>, Reply<()>),
    SeedPricing(Vec<(String, String, PricingRate)>, Reply<()>),
    RunRetention { drop_log_ttl_days: i64, reply: Reply<u64> },
    Shutdown,
}

pub struct Store {
    write_tx: mpsc::Sender<WriteCommand>,
    writer_handle: Option<JoinHandle<()>>,
    read_pool: r2d2::Pool<SqliteConnectionManager>,
}

impl Store {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // `busy_timeout` is per-connection, unlike `journal_mode=WAL` which
        // persists in the database file itself -- every connection the pool
        // ever opens needs this set, not just the first one pulled.
        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.busy_timeout(std::time::Duration::from_secs(5)));
        let read_pool = r2d2::Pool::builder().max_size(4).build(manager)?;

        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
        let db_path_owned: PathBuf = db_path.to_path_buf();
        let writer_handle = std::thread::Builder::new()
            .name("langley-store-writer".into())
            .spawn(move || writer_thread(db_path_owned, write_rx))?;

        Ok(Self { write_tx, writer_handle: Some(writer_handle), read_pool })
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> WriteCommand) -> Result<T, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(build(tx))
            .await
            .map_err(|_| StoreError::Transient("writer thread is not accepting commands".into()))?;
        rx.await.map_err(|_| StoreError::Transient("writer thread dropped the reply channel".into()))?
    }

    pub async fn save_flow(&self, flow: Flow) -> Result<(), StoreError> {
        self.call(|reply| WriteCommand::SaveFlow(Box::new(flow), reply)).await
    }

    pub async fn update_flow(&self, flow: Flow) -> Result<(), StoreError> {
        self.call(|reply| WriteCommand::UpdateFlow(Box::new(flow), reply)).await
    }

    pub async fn save_event(&self, event: Event) -> Result<(), StoreError> {
        self.call(|reply| WriteCommand::SaveEvent(Box::new(event), reply)).await
    }

    pub async fn save_events(&self, events: Vec<Event>) -> Result<(), StoreError> {
        self.call(|reply| WriteCommand::SaveEvents(events, reply)).await
    }

    pub async fn save_tool_invocation(&self, inv: ToolInvocation) -> Result<(), StoreError> {
        self.call(|reply| WriteCommand::SaveToolInvocation(Box::new(inv), reply)).await
    }

    pub async fn update_tool_result(
        &self,
        tool_use_id: String,
        success: bool,
        duration_ms: Option<i64>,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        self.call(|reply| WriteCommand::UpdateToolResult { tool_use_id, success, duration_ms, error_message, reply })
            .await
    }

    pub async fn log_drop(&self, entry: DropLogEntry) -> Result<(), StoreError> {
        self.call(|reply| WriteCommand::LogDrop(Box::new(entry), reply)).await
    }

    /// Seed the `pricing` table with defaults at first open, without
    /// overwriting rows an operator may have customized.
    pub async fn seed_pricing(&self, rows: Vec<(String, String, PricingRate)>) -> Result<(), StoreError> {
        self.call(|reply| WriteCommand::SeedPricing(rows, reply)).await
    }

    pub async fn run_retention(&self, drop_log_ttl_days: i64) -> Result<u64, StoreError> {
        self.call(|reply| WriteCommand::RunRetention { drop_log_ttl_days, reply }).await
    }

    pub async fn get_flow(&self, id: String) -> Result<Option<Flow>, StoreError> {
        let pool = self.read_pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| StoreError::Transient(e.to_string()))?;
            read_flow(&conn, &id)
        })
        .await
        .map_err(|e| StoreError::Transient(e.to_string()))?
    }

    pub async fn list_flows(&self, filter: FlowFilter) -> Result<Vec<Flow>, StoreError> {
        let pool = self.read_pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| StoreError::Transient(e.to_string()))?;
            list_flows(&conn, &filter)
        })
        .await
        .map_err(|e| StoreError::Transient(e.to_string()))?
    }

    pub async fn get_events_by_flow(&self, flow_id: String) -> Result<Vec<Event>, StoreError> {
        let pool = self.read_pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| StoreError::Transient(e.to_string()))?;
            events_by_flow(&conn, &flow_id)
        })
        .await
        .map_err(|e| StoreError::Transient(e.to_string()))?
    }

    pub async fn get_tool_invocations_by_flow(&self, flow_id: String) -> Result<Vec<ToolInvocation>, StoreError> {
        let pool = self.read_pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| StoreError::Transient(e.to_string()))?;
            tool_invocations_by_flow(&conn, &flow_id)
        })
        .await
        .map_err(|e| StoreError::Transient(e.to_string()))?
    }

    pub async fn pricing_rate(&self, provider: &str, model: &str) -> Result<Option<PricingRate>, StoreError> {
        let pool = self.read_pool.clone();
        let provider = provider.to_string();
        let model = model.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| StoreError::Transient(e.to_string()))?;
            conn.query_row(
                "SELECT input_rate, output_rate, cache_creation_rate, cache_read_rate FROM pricing WHERE provider = ?1 AND model = ?2",
                params![provider, model],
                |row| {
                    Ok(PricingRate {
                        input_rate: row.get(0)?,
                        output_rate: row.get(1)?,
                        cache_creation_rate: row.get(2)?,
                        cache_read_rate: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::Permanent(e.to_string()))
        })
        .await
        .map_err(|e| StoreError::Transient(e.to_string()))?
    }

    /// Signal the writer thread to stop after draining pending writes, and
    /// join it. Safe to call more than once.
    pub async fn close(&mut self) {
        let _ = self.write_tx.send(WriteCommand::Shutdown).await;
        if let Some(handle) = self.writer_handle.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

fn writer_thread(db_path: PathBuf, mut rx: mpsc::Receiver<WriteCommand>) {
    let conn = match Connection::open(&db_path) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!("store writer: failed to open database: {e}");
            return;
        }
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(&db_path) {
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            let _ = std::fs::set_permissions(&db_path, perms);
        }
    }
    if let Err(e) = schema::init(&conn) {
        tracing::error!("store writer: schema init failed: {e}");
        return;
    }

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            WriteCommand::SaveFlow(flow, reply) => {
                let _ = reply.send(insert_flow(&conn, &flow).map_err(to_store_error));
            }
            WriteCommand::UpdateFlow(flow, reply) => {
                let _ = reply.send(update_flow(&conn, &flow).map_err(to_store_error));
            }
            WriteCommand::SaveEvent(event, reply) => {
                let _ = reply.send(insert_event(&conn, &event).map_err(to_store_error));
            }
            WriteCommand::SaveEvents(events, reply) => {
                let _ = reply.send(insert_events_batch(&conn, &events).map_err(to_store_error));
            }
            WriteCommand::SaveToolInvocation(inv, reply) => {
                let _ = reply.send(insert_tool_invocation(&conn, &inv).map_err(to_store_error));
            }
            WriteCommand::UpdateToolResult { tool_use_id, success, duration_ms, error_message, reply } => {
                let _ = reply.send(
                    update_tool_result(&conn, &tool_use_id, success, duration_ms, error_message.as_deref())
                        .map_err(to_store_error),
                );
            }
            WriteCommand::LogDrop(entry, reply) => {
                let _ = reply.send(insert_drop_log(&conn, &entry).map_err(to_store_error));
            }
            WriteCommand::SeedPricing(rows, reply) => {
                let _ = reply.send(seed_pricing(&conn, &rows).map_err(to_store_error));
            }
            WriteCommand::RunRetention { drop_log_ttl_days, reply } => {
                let _ = reply.send(run_retention(&conn, drop_log_ttl_days).map_err(to_store_error));
            }
            WriteCommand::Shutdown => break,
        }
    }
}

fn to_store_error(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if matches!(err.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) {
            return StoreError::Transient(e.to_string());
        }
    }
    StoreError::Permanent(e.to_string())
}

fn headers_to_json(headers: &std::collections::HashMap<String, Vec<String>>) -> String {
    serde_json::to_string(headers).unwrap_or_else(|_| "{}".to_string())
}

fn headers_from_json(s: Option<String>) -> Option<std::collections::HashMap<String, Vec<String>>> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

fn insert_flow(conn: &Connection, flow: &Flow) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO flows (
            id, host, method, path, url, request_headers, request_body, request_body_truncated,
            status_code, status_text, response_headers, response_body, response_body_truncated,
            is_sse, duration_ms, timestamp, timestamp_mono_ns, provider, task_id, task_source, model,
            input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens, total_cost, cost_source,
            flow_integrity, events_dropped_count, created_at, expires_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20,
            ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31
        )",
        params![
            flow.id,
            flow.host,
            flow.method,
            flow.path,
            flow.url,
            headers_to_json(&flow.request_headers),
            flow.request_body,
            flow.request_body_truncated,
            flow.status_code,
            flow.status_text,
            flow.response_headers.as_ref().map(headers_to_json),
            flow.response_body,
            flow.response_body_truncated,
            flow.is_sse,
            flow.duration_ms,
            flow.timestamp.to_rfc3339(),
            flow.timestamp_mono_ns,
            flow.provider.as_str(),
            flow.task_id,
            flow.task_source.map(|s| s.as_str()),
            flow.model,
            flow.input_tokens,
            flow.output_tokens,
            flow.cache_creation_tokens,
            flow.cache_read_tokens,
            flow.total_cost,
            flow.cost_source.map(|s| s.as_str()),
            flow.flow_integrity.as_str(),
            flow.events_dropped_count,
            flow.created_at.to_rfc3339(),
            flow.expires_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn update_flow(conn: &Connection, flow: &Flow) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE flows SET
            status_code = ?2, status_text = ?3, response_headers = ?4, response_body = ?5,
            response_body_truncated = ?6, is_sse = ?7, duration_ms = ?8, task_id = ?9, task_source = ?10,
            model = ?11, input_tokens = ?12, output_tokens = ?13, cache_creation_tokens = ?14,
            cache_read_tokens = ?15, total_cost = ?16, cost_source = ?17, flow_integrity = ?18,
            events_dropped_count = ?19, expires_at = ?20
         WHERE id = ?1",
        params![
            flow.id,
            flow.status_code,
            flow.status_text,
            flow.response_headers.as_ref().map(headers_to_json),
            flow.response_body,
            flow.response_body_truncated,
            flow.is_sse,
            flow.duration_ms,
            flow.task_id,
            flow.task_source.map(|s| s.as_str()),
            flow.model,
            flow.input_tokens,
            flow.output_tokens,
            flow.cache_creation_tokens,
            flow.cache_read_tokens,
            flow.total_cost,
            flow.cost_source.map(|s| s.as_str()),
            flow.flow_integrity.as_str(),
            flow.events_dropped_count,
            flow.expires_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn insert_event(conn: &Connection, event: &Event) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO events (flow_id, sequence, event_type, event_data, priority, timestamp, timestamp_mono_ns)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.flow_id,
            event.sequence as i64,
            event.event_type,
            event.event_data.to_string(),
            event.priority.as_str(),
            event.timestamp.to_rfc3339(),
            event.timestamp_mono_ns,
        ],
    )?;
    Ok(())
}

fn insert_events_batch(conn: &Connection, events: &[Event]) -> rusqlite::Result<()> {
    conn.execute("BEGIN IMMEDIATE", [])?;
    for event in events {
        if let Err(e) = insert_event(conn, event) {
            conn.execute("ROLLBACK", [])?;
            return Err(e);
        }
    }
    conn.execute("COMMIT", [])?;
    Ok(())
}

fn insert_tool_invocation(conn: &Connection, inv: &ToolInvocation) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO tool_invocations (id, flow_id, task_id, tool_use_id, tool_name, tool_type, timestamp, duration_ms, success, error_message, cost)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            inv.id,
            inv.flow_id,
            inv.task_id,
            inv.tool_use_id,
            inv.tool_name,
            inv.tool_type,
            inv.timestamp.to_rfc3339(),
            inv.duration_ms,
            inv.success,
            inv.error_message,
            inv.cost,
        ],
    )?;
    Ok(())
}

fn update_tool_result(
    conn: &Connection,
    tool_use_id: &str,
    success: bool,
    duration_ms: Option<i64>,
    error_message: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE tool_invocations SET success = ?2, duration_ms = ?3, error_message = ?4 WHERE tool_use_id = ?1",
        params![tool_use_id, success, duration_ms, error_message],
    )?;
    Ok(())
}

fn insert_drop_log(conn: &Connection, entry: &DropLogEntry) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO drop_log (flow_id, event_type, priority, reason, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.flow_id,
            entry.event_type,
            entry.priority.map(|p| p.as_str()),
            entry.reason.as_str(),
            entry.timestamp.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn seed_pricing(conn: &Connection, rows: &[(String, String, PricingRate)]) -> rusqlite::Result<()> {
    for (provider, model, rate) in rows {
        conn.execute(
            "INSERT OR IGNORE INTO pricing (provider, model, input_rate, output_rate, cache_creation_rate, cache_read_rate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![provider, model, rate.input_rate, rate.output_rate, rate.cache_creation_rate, rate.cache_read_rate],
        )?;
    }
    Ok(())
}

fn run_retention(conn: &Connection, drop_log_ttl_days: i64) -> rusqlite::Result<u64> {
    let now = chrono::Utc::now().to_rfc3339();
    let drop_log_cutoff = (chrono::Utc::now() - chrono::Duration::days(drop_log_ttl_days)).to_rfc3339();

    conn.execute("BEGIN IMMEDIATE", [])?;
    let deleted_flows = conn.execute("DELETE FROM flows WHERE expires_at IS NOT NULL AND expires_at < ?1", params![now])?;
    let deleted_drop_log = conn.execute("DELETE FROM drop_log WHERE timestamp < ?1", params![drop_log_cutoff])?;
    conn.execute("COMMIT", [])?;

    Ok((deleted_flows + deleted_drop_log) as u64)
}

fn read_flow(conn: &Connection, id: &str) -> Result<Option<Flow>, StoreError> {
    conn.query_row("SELECT * FROM flows WHERE id = ?1", params![id], flow_from_row)
        .optional()
        .map_err(|e| StoreError::Permanent(e.to_string()))
}

fn list_flows(conn: &Connection, filter: &FlowFilter) -> Result<Vec<Flow>, StoreError> {
    let mut sql = String::from("SELECT * FROM flows WHERE 1=1");
    let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(host) = &filter.host {
        sql.push_str(" AND host = ?");
        binds.push(Box::new(host.clone()));
    }
    if let Some(task_id) = &filter.task_id {
        sql.push_str(" AND task_id = ?");
        binds.push(Box::new(task_id.clone()));
    }
    if let Some(since) = &filter.since {
        sql.push_str(" AND timestamp >= ?");
        binds.push(Box::new(since.to_rfc3339()));
    }
    sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
    let limit = if filter.limit == 0 { 100 } else { filter.limit };
    binds.push(Box::new(limit));

    let mut stmt = conn.prepare(&sql).map_err(|e| StoreError::Permanent(e.to_string()))?;
    let params_ref: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(params_ref.as_slice(), flow_from_row)
        .map_err(|e| StoreError::Permanent(e.to_string()))?;

    rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Permanent(e.to_string()))
}

fn flow_from_row(row: &rusqlite::Row) -> rusqlite::Result<Flow> {
    Ok(Flow {
        id: row.get("id")?,
        host: row.get("host")?,
        method: row.get("method")?,
        path: row.get("path")?,
        url: row.get("url")?,
        request_headers: headers_from_json(row.get("request_headers")?).unwrap_or_default(),
        request_body: row.get("request_body")?,
        request_body_truncated: row.get("request_body_truncated")?,
        status_code: row.get("status_code")?,
        status_text: row.get("status_text")?,
        response_headers: headers_from_json(row.get("response_headers")?),
        response_body: row.get("response_body")?,
        response_body_truncated: row.get("response_body_truncated")?,
        is_sse: row.get("is_sse")?,
        duration_ms: row.get("duration_ms")?,
        timestamp: parse_rfc3339(row.get::<_, String>("timestamp")?),
        timestamp_mono_ns: row.get("timestamp_mono_ns")?,
        provider: crate::model::Provider::parse(&row.get::<_, String>("provider")?),
        task_id: row.get("task_id")?,
        task_source: row.get::<_, Option<String>>("task_source")?.map(|s| parse_task_source(&s)),
        model: row.get("model")?,
        input_tokens: row.get("input_tokens")?,
        output_tokens: row.get("output_tokens")?,
        cache_creation_tokens: row.get("cache_creation_tokens")?,
        cache_read_tokens: row.get("cache_read_tokens")?,
        total_cost: row.get("total_cost")?,
        cost_source: row.get::<_, Option<String>>("cost_source")?.map(|s| parse_cost_source(&s)),
        flow_integrity: parse_flow_integrity(&row.get::<_, String>("flow_integrity")?),
        events_dropped_count: row.get("events_dropped_count")?,
        created_at: parse_rfc3339(row.get::<_, String>("created_at")?),
        expires_at: row.get::<_, Option<String>>("expires_at")?.map(parse_rfc3339),
    })
}

fn events_by_flow(conn: &Connection, flow_id: &str) -> Result<Vec<Event>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT * FROM events WHERE flow_id = ?1 ORDER BY sequence ASC")
        .map_err(|e| StoreError::Permanent(e.to_string()))?;
    let rows = stmt
        .query_map(params![flow_id], |row| {
            Ok(Event {
                flow_id: row.get("flow_id")?,
                sequence: row.get::<_, i64>("sequence")? as u64,
                event_type: row.get("event_type")?,
                event_data: serde_json::from_str(&row.get::<_, String>("event_data")?).unwrap_or(serde_json::Value::Null),
                priority: parse_priority(&row.get::<_, String>("priority")?),
                timestamp: parse_rfc3339(row.get::<_, String>("timestamp")?),
                timestamp_mono_ns: row.get("timestamp_mono_ns")?,
            })
        })
        .map_err(|e| StoreError::Permanent(e.to_string()))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Permanent(e.to_string()))
}

fn tool_invocations_by_flow(conn: &Connection, flow_id: &str) -> Result<Vec<ToolInvocation>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT * FROM tool_invocations WHERE flow_id = ?1 ORDER BY timestamp ASC")
        .map_err(|e| StoreError::Permanent(e.to_string()))?;
    let rows = stmt
        .query_map(params![flow_id], |row| {
            Ok(ToolInvocation {
                id: row.get("id")?,
                flow_id: row.get("flow_id")?,
                task_id: row.get("task_id")?,
                tool_use_id: row.get("tool_use_id")?,
                tool_name: row.get("tool_name")?,
                tool_type: row.get("tool_type")?,
                timestamp: parse_rfc3339(row.get::<_, String>("timestamp")?),
                duration_ms: row.get("duration_ms")?,
                success: row.get("success")?,
                error_message: row.get("error_message")?,
                cost: row.get("cost")?,
            })
        })
        .map_err(|e| StoreError::Permanent(e.to_string()))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Permanent(e.to_string()))
}

fn parse_rfc3339(s: String) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&chrono::Utc)).unwrap_or_else(|_| chrono::Utc::now())
}

fn parse_task_source(s: &str) -> crate::model::TaskSource {
    match s {
        "explicit" => crate::model::TaskSource::Explicit,
        "metadata" => crate::model::TaskSource::Metadata,
        _ => crate::model::TaskSource::Inferred,
    }
}

fn parse_cost_source(s: &str) -> crate::model::CostSource {
    match s {
        "exact" => crate::model::CostSource::Exact,
        _ => crate::model::CostSource::Estimated,
    }
}

fn parse_flow_integrity(s: &str) -> crate::model::FlowIntegrity {
    match s {
        "complete" => crate::model::FlowIntegrity::Complete,
        "partial" => crate::model::FlowIntegrity::Partial,
        "corrupted" => crate::model::FlowIntegrity::Corrupted,
        _ => crate::model::FlowIntegrity::Interrupted,
    }
}

fn parse_priority(s: &str) -> crate::model::Priority {
    match s {
        "high" => crate::model::Priority::High,
        "low" => crate::model::Priority::Low,
        _ => crate::model::Priority::Medium,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Flow;

    async fn open_temp() -> Store {
        let dir = std::env::temp_dir().join(format!("langley-store-test-{}-{}", std::process::id(), uuid::Uuid::new_v4()));
        Store::open(&dir.join("langley.db")).unwrap()
    }

    #[tokio::test]
    async fn save_and_get_flow_round_trips() {
        let store = open_temp().await;
        let flow = Flow::new("api.anthropic.com".into(), "POST".into(), "/v1/messages".into(), "https://api.anthropic.com/v1/messages".into(), 1);
        let id = flow.id.clone();
        store.save_flow(flow).await.unwrap();

        let fetched = store.get_flow(id.clone()).await.unwrap().expect("flow should exist");
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.host, "api.anthropic.com");
    }

    #[tokio::test]
    async fn save_event_without_flow_fails() {
        let store = open_temp().await;
        let event = Event {
            flow_id: "missing-flow".into(),
            sequence: 1,
            event_type: "ping".into(),
            event_data: serde_json::json!({}),
            priority: crate::model::Priority::Medium,
            timestamp: chrono::Utc::now(),
            timestamp_mono_ns: 0,
        };
        let result = store.save_event(event).await;
        assert!(result.is_err(), "foreign key violation should surface as an error");
    }

    #[tokio::test]
    async fn retention_deletes_expired_flows_and_cascades_events() {
        let store = open_temp().await;
        let mut flow = Flow::new("api.anthropic.com".into(), "POST".into(), "/v1/messages".into(), "https://api.anthropic.com/v1/messages".into(), 1);
        flow.expires_at = Some(chrono::Utc::now() - chrono::Duration::days(1));
        let id = flow.id.clone();
        store.save_flow(flow).await.unwrap();
        store
            .save_event(Event {
                flow_id: id.clone(),
                sequence: 1,
                event_type: "ping".into(),
                event_data: serde_json::json!({}),
                priority: crate::model::Priority::Medium,
                timestamp: chrono::Utc::now(),
                timestamp_mono_ns: 0,
            })
            .await
            .unwrap();

        let deleted = store.run_retention(30).await.unwrap();
        assert!(deleted >= 1);
        assert!(store.get_flow(id.clone()).await.unwrap().is_none());
        assert!(store.get_events_by_flow(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_flows_filters_by_host() {
        let store = open_temp().await;
        store
            .save_flow(Flow::new("api.anthropic.com".into(), "POST".into(), "/v1/messages".into(), "url".into(), 1))
            .await
            .unwrap();
        store
            .save_flow(Flow::new("api.openai.com".into(), "POST".into(), "/v1/chat".into(), "url".into(), 2))
            .await
            .unwrap();

        let flows = store.list_flows(FlowFilter { host: Some("api.openai.com".into()), ..Default::default() }).await.unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].host, "api.openai.com");
    }
}
