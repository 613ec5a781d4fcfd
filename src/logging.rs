//! Session log file plus the `tracing` subscriber that feeds it.

use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::util::format_timestamp;

const KEEP_SESSIONS: usize = 10;
const DEFAULT_FILTER: &str = "uie_lib=info,uie=info";

/// Async session log that writes to `<dir>/latest.log`.
///
/// Writes go through an mpsc channel so callers never block on disk I/O; a
/// background task does the actual writing.
pub struct SessionLog {
    tx: mpsc::UnboundedSender<String>,
    path: PathBuf,
}

impl SessionLog {
    /// - Creates `logs_dir` if it doesn't exist
    /// - Rotates `latest.log` to `session-{timestamp}.log`
    /// - Keeps at most 10 rotated sessions
    /// - Spawns the writer task
    pub async fn open(logs_dir: &Path) -> Option<Self> {
        if tokio::fs::create_dir_all(logs_dir).await.is_err() {
            return None;
        }

        let latest = logs_dir.join("latest.log");
        if latest.exists() {
            let rotated = logs_dir.join(format!("session-{}.log", unix_timestamp()));
            let _ = tokio::fs::rename(&latest, &rotated).await;
        }
        cleanup_old_sessions(logs_dir, KEEP_SESSIONS).await;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&latest)
            .await
            .ok()?;

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(writer_task(file, rx));

        let _ = tx.send(format!(
            "=== UIE session {} ===\n\n",
            format_timestamp(unix_timestamp())
        ));

        Some(Self { tx, path: latest })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writer(&self) -> ChannelWriter {
        ChannelWriter {
            tx: self.tx.clone(),
        }
    }
}

/// `io::Write` end of the session log channel. Never blocks.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<String>,
}

impl io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.tx.send(String::from_utf8_lossy(buf).into_owned());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for ChannelWriter {
    type Writer = ChannelWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

async fn writer_task(file: tokio::fs::File, mut rx: mpsc::UnboundedReceiver<String>) {
    use tokio::io::AsyncWriteExt;
    let mut writer = tokio::io::BufWriter::new(file);

    while let Some(line) = rx.recv().await {
        let _ = writer.write_all(line.as_bytes()).await;
        // Keep the file readable while the session runs.
        let _ = writer.flush().await;
    }

    let footer = format!(
        "\n=== Session ended {} ===\n",
        format_timestamp(unix_timestamp())
    );
    let _ = writer.write_all(footer.as_bytes()).await;
    let _ = writer.flush().await;
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

async fn cleanup_old_sessions(logs_dir: &Path, keep: usize) {
    let mut entries = match tokio::fs::read_dir(logs_dir).await {
        Ok(rd) => rd,
        Err(_) => return,
    };

    let mut session_files: Vec<PathBuf> = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("session-") && name.ends_with(".log") {
            session_files.push(entry.path());
        }
    }

    // Timestamp is embedded, so lexicographic = chronological.
    session_files.sort();
    let excess = session_files.len().saturating_sub(keep);
    for oldest in session_files.drain(..excess) {
        let _ = tokio::fs::remove_file(oldest).await;
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber: warnings and up on stderr, everything the
/// filter allows into the session log. `RUST_LOG` overrides both filters.
pub fn init_tracing(session: Option<&SessionLog>) {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        );

    let file_layer = session.map(|log| {
        tracing_subscriber::fmt::layer()
            .with_writer(log.writer())
            .with_ansi(false)
            .with_target(true)
            .with_filter(env_filter())
    });

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}
