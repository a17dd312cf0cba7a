use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::db;
use crate::utils::redact;

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub ts: String,
    pub level: String,
    pub run_id: Option<String>,
    pub message: String,
}

/// Fixed-capacity buffer behind the live "Health & Logs" view. Volatile;
/// the run_logs table is the archival copy.
pub struct LogBuffer {
    cap: usize,
    lines: Mutex<VecDeque<LogLine>>,
}

impl LogBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            lines: Mutex::new(VecDeque::with_capacity(cap)),
        }
    }

    pub fn push(&self, line: LogLine) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == self.cap {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }
}

/// Writes one run's log stream to the run_logs table and mirrors every line
/// into the ring buffer. Messages are redacted before they go anywhere.
pub struct RunLogger {
    conn: Arc<Mutex<Connection>>,
    buffer: Arc<LogBuffer>,
    run_id: String,
}

impl RunLogger {
    pub fn new(conn: Arc<Mutex<Connection>>, buffer: Arc<LogBuffer>, run_id: &str) -> Self {
        Self {
            conn,
            buffer,
            run_id: run_id.to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn info(&self, message: &str, context: Option<serde_json::Value>) {
        self.log("info", message, context);
    }

    pub fn warn(&self, message: &str, context: Option<serde_json::Value>) {
        self.log("warn", message, context);
    }

    pub fn error(&self, message: &str, context: Option<serde_json::Value>) {
        self.log("error", message, context);
    }

    fn log(&self, level: &str, message: &str, context: Option<serde_json::Value>) {
        let message = redact(message);
        let context_json = context.map(|v| redact(&v.to_string()));

        match level {
            "error" => error!(run_id = %self.run_id, context = context_json.as_deref(), "{message}"),
            "warn" => warn!(run_id = %self.run_id, context = context_json.as_deref(), "{message}"),
            _ => info!(run_id = %self.run_id, context = context_json.as_deref(), "{message}"),
        }

        self.buffer.push(LogLine {
            ts: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            level: level.to_string(),
            run_id: Some(self.run_id.clone()),
            message: message.clone(),
        });

        let conn = self.conn.lock().unwrap();
        if let Err(e) = db::insert_run_log(&conn, &self.run_id, level, &message, context_json.as_deref()) {
            error!(run_id = %self.run_id, "run log write failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory;

    #[test]
    fn ring_buffer_drops_oldest() {
        let buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.push(LogLine {
                ts: String::new(),
                level: "info".into(),
                run_id: None,
                message: format!("m{i}"),
            });
        }
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].message, "m2");
        assert_eq!(snap[2].message, "m4");
    }

    #[test]
    fn logger_writes_table_and_buffer_redacted() {
        let conn = open_memory().unwrap();
        let id = crate::db::insert_newsletter(&conn, "a", "A", "UTC", &[]).unwrap();
        crate::db::insert_run_started(&conn, "r-1", id).unwrap();

        let conn = Arc::new(Mutex::new(conn));
        let buf = Arc::new(LogBuffer::new(16));
        let logger = RunLogger::new(conn.clone(), buf.clone(), "r-1");
        logger.warn(
            "provider rejected token sk_liveXXXXXXXXXXXXXXXXXXXXXXXX",
            Some(serde_json::json!({"provider_id": "primary"})),
        );

        let rows = db::logs_for_run(&conn.lock().unwrap(), "r-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].level, "warn");
        assert!(rows[0].message.contains("[REDACTED]"));
        assert!(!rows[0].message.contains("sk_live"));
        assert_eq!(buf.snapshot().len(), 1);
    }
}
