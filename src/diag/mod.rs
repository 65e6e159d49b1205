use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use parking_lot::Mutex;

use crate::protocol::PeerId;

/// Transcript of one connection attempt. Lines accumulate in memory and are
/// written to a per-connection file at teardown; on failure the whole
/// transcript additionally goes to the primary log for postmortems.
pub(crate) struct ConnLog {
    peer: PeerId,
    started: Instant,
    lines: Mutex<Vec<String>>,
    path: Option<PathBuf>,
}

impl ConnLog {
    pub(crate) fn new(dir: Option<&Path>, peer: PeerId, seq: u64) -> Self {
        Self {
            peer,
            started: Instant::now(),
            lines: Mutex::new(Vec::new()),
            path: dir.map(|d| d.join(format!("conn-{peer}-{seq}.log"))),
        }
    }

    pub(crate) fn record(&self, message: String) {
        let elapsed = self.started.elapsed();
        log::debug!("[{}] {message}", self.peer);
        self.lines
            .lock()
            .push(format!("[{:>8.3}s] {message}", elapsed.as_secs_f64()));
    }

    /// Replays the transcript into the primary log.
    pub(crate) fn dump_to_primary(&self) {
        let lines = self.lines.lock();
        log::warn!(
            "connection to {} failed, transcript ({} lines):",
            self.peer,
            lines.len()
        );
        for line in lines.iter() {
            log::warn!("[{}] {line}", self.peer);
        }
    }

    pub(crate) async fn flush(&self) {
        let Some(path) = &self.path else { return };
        let contents = self.lines.lock().join("\n") + "\n";
        if let Err(e) = write_transcript(path, contents).await {
            log::warn!("failed to write transcript {}: {e:?}", path.display());
        }
    }
}

async fn write_transcript(path: &Path, contents: String) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Removes transcript files left over from a previous run. Failures are the
/// caller's to log; they must never take the orchestrator down.
pub(crate) async fn purge_stale(dir: &Path) -> anyhow::Result<usize> {
    let mut removed = 0usize;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        // Nothing to purge before the first run.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("reading {}", dir.display())),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with("conn-") && name.ends_with(".log") {
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("could not remove stale transcript {name}: {e:?}"),
            }
        }
    }
    Ok(removed)
}
