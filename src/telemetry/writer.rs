use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::telemetry::notifier::Notifier;
use crate::telemetry::session::SessionTracker;
use crate::telemetry::TelemetryEvent;

/// Newline-delimited JSON signal log with daily file rotation:
/// `{dir}/signals-YYYY-MM-DD.jsonl`.
pub struct SignalLog {
    dir: PathBuf,
    current_date: String,
    file: Option<File>,
}

impl SignalLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current_date: String::new(),
            file: None,
        }
    }

    pub fn file_name(date: &str) -> String {
        format!("signals-{}.jsonl", date)
    }

    fn rotate_to(&mut self, date: &str) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(Self::file_name(date));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.current_date = date.to_string();
        self.file = Some(file);
        Ok(())
    }

    /// Append one JSON line under the given date, rotating if it changed.
    pub fn write_line(&mut self, date: &str, line: &str) {
        if self.file.is_none() || self.current_date != date {
            if let Err(e) = self.rotate_to(date) {
                warn!(error = %e, "signal log rotation failed");
                return;
            }
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "{}", line) {
                warn!(error = %e, "signal log write failed");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }
}

fn today(now_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(now_ms)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Single background task handling ALL telemetry I/O: the JSONL signal log,
/// webhook notifications and session accounting. Returns the tracker at
/// shutdown for the final report.
pub async fn run_telemetry(
    mut rx: mpsc::Receiver<TelemetryEvent>,
    log_dir: String,
    webhook_url: Option<String>,
) -> SessionTracker {
    let mut log = SignalLog::new(log_dir);
    let mut tracker = SessionTracker::new(chrono::Utc::now().timestamp_millis());
    let mut notifier =
        webhook_url.map(|url| Notifier::new(reqwest::Client::new(), url));
    if notifier.is_some() {
        info!("webhook notifications enabled");
    } else {
        info!("no webhook configured, notifications disabled");
    }

    while let Some(event) = rx.recv().await {
        tracker.observe(&event);
        let now_ms = chrono::Utc::now().timestamp_millis();
        match event {
            TelemetryEvent::Signal {
                candidate,
                mode,
                action,
            } => {
                let line = serde_json::json!({
                    "type": "signal",
                    "mode": mode,
                    "action": action,
                    "signal": &*candidate,
                });
                log.write_line(&today(now_ms), &line.to_string());
            }
            TelemetryEvent::Rejection(record) => {
                let line = serde_json::json!({"type": "rejection", "rejection": record});
                log.write_line(&today(now_ms), &line.to_string());
            }
            TelemetryEvent::Alert(payload) => {
                if let Some(n) = notifier.as_mut() {
                    n.send(&payload, now_ms).await;
                }
            }
            TelemetryEvent::TradeClosed(record) => {
                let line = serde_json::json!({"type": "trade", "trade": record});
                log.write_line(&today(now_ms), &line.to_string());
            }
            TelemetryEvent::Connection { .. } => {}
        }
    }

    log.flush();
    info!("telemetry writer stopped, log flushed");
    tracker
}
