use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Client;
use rusqlite::Connection;

use crate::runlog::LogBuffer;

const LOG_BUFFER_CAP: usize = 500;

/// Shared by the HTTP handlers, the scheduler, and pipeline tasks.
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub http: Client,
    pub logs: Arc<LogBuffer>,
    /// Newsletters with a run in flight; the coalescing gate.
    running: Mutex<HashSet<i64>>,
    /// Run ids an operator asked to cancel.
    cancelled: Mutex<HashSet<String>>,
}

impl AppState {
    pub fn new(conn: Connection) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .user_agent("briefcast/0.1")
            .build()
            .expect("reqwest client");
        Self {
            db: Arc::new(Mutex::new(conn)),
            http,
            logs: Arc::new(LogBuffer::new(LOG_BUFFER_CAP)),
            running: Mutex::new(HashSet::new()),
            cancelled: Mutex::new(HashSet::new()),
        }
    }

    /// At most one in-flight run per newsletter; returns None when a run is
    /// already active (callers coalesce, they never queue).
    pub fn try_begin_run(self: &Arc<Self>, newsletter_id: i64) -> Option<RunPermit> {
        let mut running = self.running.lock().unwrap();
        if !running.insert(newsletter_id) {
            return None;
        }
        Some(RunPermit {
            state: Arc::clone(self),
            newsletter_id,
        })
    }

    pub fn is_running(&self, newsletter_id: i64) -> bool {
        self.running.lock().unwrap().contains(&newsletter_id)
    }

    pub fn request_cancel(&self, run_id: &str) {
        self.cancelled.lock().unwrap().insert(run_id.to_string());
    }

    pub fn is_cancelled(&self, run_id: &str) -> bool {
        self.cancelled.lock().unwrap().contains(run_id)
    }

    pub fn clear_cancel(&self, run_id: &str) {
        self.cancelled.lock().unwrap().remove(run_id);
    }
}

/// Releases the per-newsletter run slot on drop, whatever way the run ends.
pub struct RunPermit {
    state: Arc<AppState>,
    newsletter_id: i64,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.state.running.lock().unwrap().remove(&self.newsletter_id);
    }
}
