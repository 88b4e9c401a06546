//! Raw wire logging for push-channel sessions.
//!
//! Separate from the `log` facade: when a log directory is configured, every
//! generation mirrors its transport traffic (`OPEN`, `RECV`, `CLOSE`) to an
//! append-only file so a misbehaving stream can be replayed by hand.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::{SecondsFormat, Utc};

/// Thread-safe handle to an append-only log file.
pub type LogHandle = Arc<Mutex<Option<File>>>;

/// Current UTC time as ISO 8601 with milliseconds (e.g. 2026-02-04T10:15:30.123Z).
fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A handle that swallows every write.
pub fn disabled_log() -> LogHandle {
    Arc::new(Mutex::new(None))
}

/// Write a timestamped line to the log file (if present).
///
/// Embedded newlines are escaped so one call always produces one line.
pub fn log_line(handle: &LogHandle, direction: &str, data: &str) {
    if let Ok(mut guard) = handle.lock() {
        if let Some(ref mut file) = *guard {
            let ts = utc_timestamp();
            let data = data.trim_end_matches(&['\r', '\n'][..]).replace('\n', "\\n");
            let _ = writeln!(file, "[{}] {}: {}", ts, direction, data);
            let _ = file.flush();
        }
    }
}

/// Open (or create) a log file at `{log_dir}/{log_id}.log` and return a shared handle.
///
/// Any failure to create the directory or file yields a disabled handle;
/// wire logging never blocks a stream from starting.
pub fn open_log_file(log_dir: Option<&Path>, log_id: &str) -> LogHandle {
    let file = log_dir.and_then(|dir| {
        let path = dir.join(format!("{}.log", log_id));
        if let Err(e) = std::fs::create_dir_all(dir) {
            log::warn!("Cannot create wire log dir {}: {}", dir.display(), e);
            return None;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| log::warn!("Cannot open wire log {}: {}", path.display(), e))
            .ok()
    });
    Arc::new(Mutex::new(file))
}
