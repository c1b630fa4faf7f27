use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// One appended history row. Rows are never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    pub step: usize,
    pub action: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

/// Short-term, append-only action history for one session, mirrored to a
/// JSON file so a restarted host sees the same recent context.
pub struct SessionMemory {
    session_id: String,
    rows: Vec<HistoryRow>,
    path: Option<PathBuf>,
}

impl SessionMemory {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            rows: Vec::new(),
            path: None,
        }
    }

    /// File-backed memory: loads existing rows if the file parses.
    pub fn with_file(session_id: impl Into<String>, path: PathBuf) -> Self {
        let mut mem = Self::new(session_id);
        if let Ok(file) = File::open(&path) {
            let reader = BufReader::new(file);
            if let Ok(rows) = serde_json::from_reader::<_, Vec<HistoryRow>>(reader) {
                debug!(rows = rows.len(), "loaded session history");
                mem.rows = rows;
            }
        }
        mem.path = Some(path);
        mem
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn append(&mut self, row: HistoryRow) {
        self.rows.push(row);
        self.save();
    }

    /// The most recent `n` rows, oldest first.
    pub fn recent(&self, n: usize) -> &[HistoryRow] {
        let start = self.rows.len().saturating_sub(n);
        &self.rows[start..]
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn save(&self) {
        let Some(path) = &self.path else { return };
        if let Ok(file) = File::create(path) {
            let writer = BufWriter::new(file);
            let _ = serde_json::to_writer_pretty(writer, &self.rows);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(step: usize, action: &str) -> HistoryRow {
        HistoryRow {
            step,
            action: action.into(),
            summary: format!("did {action}"),
            outcome: None,
        }
    }

    #[test]
    fn recent_returns_last_n_oldest_first() {
        let mut mem = SessionMemory::new("s1");
        for i in 0..8 {
            mem.append(row(i, "SCROLL"));
        }
        let recent = mem.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].step, 5);
        assert_eq!(recent[2].step, 7);
    }

    #[test]
    fn recent_handles_short_history() {
        let mut mem = SessionMemory::new("s1");
        mem.append(row(0, "WAIT"));
        assert_eq!(mem.recent(5).len(), 1);
        assert!(SessionMemory::new("s2").recent(5).is_empty());
    }

    #[test]
    fn file_mirror_roundtrips() {
        let dir = std::env::temp_dir().join(format!("pagepilot-mem-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("history.json");

        {
            let mut mem = SessionMemory::with_file("s1", path.clone());
            mem.append(row(0, "VISION_CLICK"));
            mem.append(row(1, "DONE"));
        }

        let reloaded = SessionMemory::with_file("s1", path.clone());
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.recent(1)[0].action, "DONE");

        let _ = std::fs::remove_dir_all(dir);
    }
}
