use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::{json, Value};

use crate::shared::utils::unix_now;

pub const SESSION_LOG_FILE: &str = "session.jsonl";

/// Hub events of one call, one JSON object per line in `<session_dir>/session.jsonl`.
///
/// A failed write closes the log; the call goes on without it.
pub struct SessionLog {
    out: Option<BufWriter<File>>,
}

impl SessionLog {
    pub fn open(session_dir: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(session_dir.join(SESSION_LOG_FILE))?;
        Ok(Self {
            out: Some(BufWriter::new(file)),
        })
    }

    /// Appends `{"ts": .., "event": event, ..fields}`.
    pub fn event(&mut self, event: &str, fields: Value) {
        let Some(out) = self.out.as_mut() else {
            return;
        };
        let mut entry = json!({ "ts": unix_now(), "event": event });
        if let (Some(entry), Value::Object(fields)) = (entry.as_object_mut(), fields) {
            entry.extend(fields);
        }
        let result = serde_json::to_string(&entry)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(out, "{}", line))
            .and_then(|_| out.flush());
        if let Err(e) = result {
            log::warn!("[hub] session log write failed: {}", e);
            self.out = None;
        }
    }
}
