// ===============================
// src/recorder.rs
// ===============================
//
// Append-only JSONL audit log:
// - one AuditEvent per line, appended in commit order
// - parent directory created on first open
// - on a write failure the file is reopened and the line retried once
// - flushed after every event; the log is read back by tests and tooling
//
use std::path::{Path, PathBuf};

use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    sync::Mutex,
};
use tracing::{debug, error, warn};

use crate::domain::AuditEvent;
use crate::error::Result;

pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

async fn open_writer(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

impl AuditLog {
    /// Lazy: the file is opened on the first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), writer: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, ev: &AuditEvent) -> Result<()> {
        let mut line = serde_json::to_vec(ev)?;
        line.push(b'\n');

        let mut slot = self.writer.lock().await;
        let mut w = match slot.take() {
            Some(w) => w,
            None => open_writer(&self.path).await?,
        };

        if let Err(e) = write_line(&mut w, &line).await {
            warn!(?e, path = %self.path.display(), "audit: write failed, reopening");
            w = open_writer(&self.path).await?;
            if let Err(e2) = write_line(&mut w, &line).await {
                error!(?e2, path = %self.path.display(), "audit: write failed again after reopen");
                return Err(e2.into());
            }
        }
        *slot = Some(w);
        debug!(kind = ?ev.kind, "audit: appended");
        Ok(())
    }

    /// Every event in file order. A missing file is an empty log; torn lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<AuditEvent>> {
        let file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = BufReader::new(file).lines();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(&line) {
                Ok(ev) => out.push(ev),
                Err(e) => warn!(?e, "audit: skipping unreadable line"),
            }
        }
        Ok(out)
    }
}

async fn write_line(w: &mut BufWriter<File>, line: &[u8]) -> std::io::Result<()> {
    w.write_all(line).await?;
    w.flush().await
}
