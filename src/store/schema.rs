//! Schema creation and versioned, idempotent migrations.
//!
//! Each migration checks whether its change already applied (column/table
//! existence) before altering, so re-running an interrupted migration on
//! the next startup is safe.

use rusqlite::Connection;

const CURRENT_VERSION: i32 = 1;

pub fn init(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout=5000;
        PRAGMA foreign_keys=ON;
        "#,
    )?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (id INTEGER PRIMARY KEY CHECK (id = 1), version INTEGER NOT NULL);",
    )?;
    let version: i32 = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        apply_v1(conn)?;
    }

    conn.execute(
        "INSERT INTO schema_version (id, version) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version",
        [CURRENT_VERSION],
    )?;

    Ok(())
}

fn apply_v1(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS flows (
            id TEXT PRIMARY KEY,
            host TEXT NOT NULL,
            method TEXT NOT NULL,
            path TEXT NOT NULL,
            url TEXT NOT NULL,
            request_headers TEXT NOT NULL,
            request_body TEXT,
            request_body_truncated INTEGER NOT NULL DEFAULT 0,
            status_code INTEGER,
            status_text TEXT,
            response_headers TEXT,
            response_body TEXT,
            response_body_truncated INTEGER NOT NULL DEFAULT 0,
            is_sse INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER,
            timestamp TEXT NOT NULL,
            timestamp_mono_ns INTEGER NOT NULL,
            provider TEXT NOT NULL,
            task_id TEXT,
            task_source TEXT,
            model TEXT,
            input_tokens INTEGER,
            output_tokens INTEGER,
            cache_creation_tokens INTEGER,
            cache_read_tokens INTEGER,
            total_cost REAL,
            cost_source TEXT,
            flow_integrity TEXT NOT NULL,
            events_dropped_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            expires_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_flows_timestamp ON flows(timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_flows_host_timestamp ON flows(host, timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_flows_task_timestamp ON flows(task_id, timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_flows_expires ON flows(expires_at) WHERE expires_at IS NOT NULL;

        CREATE TABLE IF NOT EXISTS events (
            flow_id TEXT NOT NULL REFERENCES flows(id) ON DELETE CASCADE,
            sequence INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            event_data TEXT NOT NULL,
            priority TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            timestamp_mono_ns INTEGER NOT NULL,
            expires_at TEXT,
            PRIMARY KEY (flow_id, sequence)
        );
        CREATE INDEX IF NOT EXISTS idx_events_type_timestamp ON events(event_type, timestamp);
        CREATE INDEX IF NOT EXISTS idx_events_expires ON events(expires_at) WHERE expires_at IS NOT NULL;

        CREATE TABLE IF NOT EXISTS tool_invocations (
            id TEXT PRIMARY KEY,
            flow_id TEXT NOT NULL REFERENCES flows(id) ON DELETE CASCADE,
            task_id TEXT,
            tool_use_id TEXT,
            tool_name TEXT NOT NULL,
            tool_type TEXT,
            timestamp TEXT NOT NULL,
            duration_ms INTEGER,
            success INTEGER,
            error_message TEXT,
            cost REAL
        );
        CREATE INDEX IF NOT EXISTS idx_tool_invocations_name_time_cost
            ON tool_invocations(tool_name, timestamp, cost, duration_ms);
        CREATE INDEX IF NOT EXISTS idx_tool_invocations_tool_use_id ON tool_invocations(tool_use_id);

        CREATE TABLE IF NOT EXISTS drop_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            flow_id TEXT,
            event_type TEXT,
            priority TEXT,
            reason TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_drop_log_timestamp ON drop_log(timestamp);

        CREATE TABLE IF NOT EXISTS pricing (
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            input_rate REAL NOT NULL,
            output_rate REAL NOT NULL,
            cache_creation_rate REAL NOT NULL,
            cache_read_rate REAL NOT NULL,
            PRIMARY KEY (provider, model)
        );
        "#,
    )?;
    Ok(())
}
