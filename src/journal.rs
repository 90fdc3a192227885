use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AppConfig;
use crate::errors::AppResult;

const JOURNAL_FILE: &str = "geocode-journal.jsonl";

#[derive(Debug, Serialize)]
pub struct JournalEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Append-only JSONL record of batch runs, failures and queue transitions.
#[derive(Clone)]
pub struct DiagnosticsJournal {
    inner: Option<Arc<JournalInner>>,
}

struct JournalInner {
    pending: Mutex<Vec<JournalEvent>>,
    path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

impl DiagnosticsJournal {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        if !config.journal_enabled {
            return Ok(Self::disabled());
        }
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(JOURNAL_FILE);
        OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            inner: Some(Arc::new(JournalInner {
                pending: Mutex::new(Vec::new()),
                path,
                batch_size: config.journal_batch_size.max(1),
                max_file_bytes: config.journal_max_bytes,
                max_file_count: config.journal_max_files.max(1),
            })),
        })
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.as_deref().map(|inner| inner.path.as_path())
    }

    pub fn pending(&self) -> usize {
        self.inner
            .as_deref()
            .map(|inner| inner.pending.lock().len())
            .unwrap_or(0)
    }

    pub fn record(&self, name: impl Into<String>, payload: serde_json::Value) -> AppResult<()> {
        let Some(inner) = self.inner.as_deref() else {
            return Ok(());
        };
        let mut pending = inner.pending.lock();
        pending.push(JournalEvent {
            name: name.into(),
            timestamp: Utc::now(),
            payload,
        });
        if pending.len() >= inner.batch_size {
            inner.write_pending(&mut pending)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        match self.inner.as_deref() {
            Some(inner) => {
                let mut pending = inner.pending.lock();
                inner.write_pending(&mut pending)
            }
            None => Ok(()),
        }
    }
}

impl JournalInner {
    /// Events stay queued if the write fails so a later flush can retry them.
    fn write_pending(&self, pending: &mut Vec<JournalEvent>) -> AppResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut lines = Vec::with_capacity(pending.len());
        let mut incoming = 0_u64;
        for event in pending.iter() {
            let mut line = serde_json::to_vec(event)?;
            line.push(b'\n');
            incoming += line.len() as u64;
            lines.push(line);
        }

        self.rotate_if_needed(incoming)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        for line in &lines {
            file.write_all(line)?;
        }
        file.flush()?;
        pending.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming: u64) -> AppResult<()> {
        let current = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current == 0 || current + incoming <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count > 1 {
            let rotated = self.directory().join(format!(
                "{}-{}.jsonl",
                self.stem(),
                Utc::now().format("%Y%m%d%H%M%S%f")
            ));
            fs::rename(&self.path, rotated)?;
            self.prune_rotations()?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let prefix = format!("{}-", self.stem());
        let mut rotations = fs::read_dir(self.directory())?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().to_string_lossy().to_string();
                (name.starts_with(&prefix) && name.ends_with(".jsonl")).then(|| entry.path())
            })
            .collect::<Vec<_>>();

        // Rotation names embed a sortable timestamp.
        rotations.sort();
        let allowed = self.max_file_count.saturating_sub(1);
        let excess = rotations.len().saturating_sub(allowed);
        for path in rotations.into_iter().take(excess) {
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "geocode-journal".into())
    }
}
