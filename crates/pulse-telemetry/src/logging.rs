use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A persisted warn+ log line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    /// Substring match on the target.
    pub target: Option<String>,
    pub session_id: Option<String>,
    /// RFC 3339 lower bound (inclusive).
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite store for warn+ logs, so dropped frames and connection trouble
/// can be inspected after the fact.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 session_id TEXT,
                 agent_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogRecord) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, session_id, agent_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.session_id,
                record.agent_id,
            ],
        );
    }

    /// Most recent first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut clauses = Vec::new();
        let mut params: Vec<String> = Vec::new();

        if let Some(level) = &q.level {
            params.push(level.to_uppercase());
            clauses.push(format!("level = ?{}", params.len()));
        }
        if let Some(target) = &q.target {
            params.push(format!("%{target}%"));
            clauses.push(format!("target LIKE ?{}", params.len()));
        }
        if let Some(session_id) = &q.session_id {
            params.push(session_id.clone());
            clauses.push(format!("session_id = ?{}", params.len()));
        }
        if let Some(since) = &q.since {
            params.push(since.clone());
            clauses.push(format!("timestamp >= ?{}", params.len()));
        }

        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, session_id, agent_id FROM logs",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                session_id: row.get(6)?,
                agent_id: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// tracing layer that writes warn+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Pulls the message, the correlation ids and every other field out of an
/// event or span.
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    session_id: Option<String>,
    agent_id: Option<String>,
}

impl FieldVisitor {
    fn put(&mut self, name: &str, text: String, raw: serde_json::Value) {
        match name {
            "message" => self.message = Some(text),
            "session_id" => self.session_id = Some(text),
            "agent_id" => self.agent_id = Some(text),
            other => {
                self.fields.insert(other.to_string(), raw);
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}").trim_matches('"').to_string();
        self.put(field.name(), text.clone(), serde_json::Value::String(text));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(
            field.name(),
            value.to_string(),
            serde_json::Value::String(value.to_string()),
        );
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field.name(), value.to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field.name(), value.to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field.name(), value.to_string(), value.into());
    }
}

/// Correlation ids recorded on a span, inherited by events inside it.
struct SpanIds {
    session_id: Option<String>,
    agent_id: Option<String>,
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.session_id.is_none() && visitor.agent_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanIds {
                session_id: visitor.session_id,
                agent_id: visitor.agent_id,
            });
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if visitor.session_id.is_some() && visitor.agent_id.is_some() {
                    break;
                }
                if let Some(ids) = span.extensions().get::<SpanIds>() {
                    if visitor.session_id.is_none() {
                        visitor.session_id.clone_from(&ids.session_id);
                    }
                    if visitor.agent_id.is_none() {
                        visitor.agent_id.clone_from(&ids.agent_id);
                    }
                }
            }
        }

        let fields = (!visitor.fields.is_empty())
            .then(|| serde_json::to_string(&visitor.fields).unwrap_or_default());

        self.sink.insert(&LogRecord {
            id: 0,
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            session_id: visitor.session_id,
            agent_id: visitor.agent_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn record(
        timestamp: &str,
        level: &str,
        target: &str,
        message: &str,
        session: Option<&str>,
    ) -> LogRecord {
        LogRecord {
            id: 0,
            timestamp: timestamp.into(),
            level: level.into(),
            target: target.into(),
            message: message.into(),
            fields: None,
            session_id: session.map(String::from),
            agent_id: None,
        }
    }

    #[test]
    fn sink_on_disk_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("pulse-test-logs-{}", uuid::Uuid::now_v7()));
        let sink = SqliteLogSink::new(&dir.join("nested/logs.db")).unwrap();
        sink.insert(&record("2026-10-18T12:00:00Z", "WARN", "t", "m", None));
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn query_filters_combine() {
        let sink = SqliteLogSink::in_memory().unwrap();
        sink.insert(&record(
            "2026-10-18T11:00:00Z",
            "WARN",
            "pulse_stream::client",
            "old drop",
            Some("sess_a"),
        ));
        sink.insert(&record(
            "2026-10-18T12:00:00Z",
            "WARN",
            "pulse_stream::client",
            "dropped frame",
            Some("sess_a"),
        ));
        sink.insert(&record(
            "2026-10-18T12:00:01Z",
            "ERROR",
            "pulse_relay::server",
            "bind failed",
            None,
        ));
        sink.insert(&record(
            "2026-10-18T12:00:02Z",
            "WARN",
            "pulse_stream::client",
            "other session",
            Some("sess_b"),
        ));

        let by_session = sink
            .query(&LogQuery {
                session_id: Some("sess_a".into()),
                since: Some("2026-10-18T11:30:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_session.len(), 1);
        assert_eq!(by_session[0].message, "dropped frame");

        let errors = sink
            .query(&LogQuery {
                level: Some("error".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].target, "pulse_relay::server");

        let relay = sink
            .query(&LogQuery {
                target: Some("relay".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(relay.len(), 1);
    }

    #[test]
    fn query_limit_returns_newest_first() {
        let sink = SqliteLogSink::in_memory().unwrap();
        for i in 0..10 {
            sink.insert(&record(
                &format!("2026-10-18T12:00:{i:02}Z"),
                "WARN",
                "t",
                &format!("msg {i}"),
                None,
            ));
        }
        let results = sink
            .query(&LogQuery {
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].message, "msg 9");
    }

    #[test]
    fn layer_persists_warnings_with_span_ids() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber =
            tracing_subscriber::registry().with(SqliteLogLayer::new(Arc::clone(&sink)));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("subscription", session_id = "sess_123");
            let _entered = span.enter();
            tracing::info!("connected");
            tracing::warn!(agent_id = "content-writer", reason = "unknown_kind", "dropping frame");
        });

        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message, "dropping frame");
        assert_eq!(rows[0].level, "WARN");
        assert_eq!(rows[0].session_id.as_deref(), Some("sess_123"));
        assert_eq!(rows[0].agent_id.as_deref(), Some("content-writer"));
        assert!(rows[0].fields.as_deref().unwrap().contains("unknown_kind"));
    }
}
