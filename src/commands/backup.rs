use std::path::{Path, PathBuf};

use crate::backup::{BackupReason, BackupRecord};
use crate::engine::Engine;
use crate::error::{Result, SettingsError};
use crate::host::NoticeLevel;

pub async fn backup_now(engine: &Engine) -> Result<BackupRecord> {
    match engine.backups().create_backup(BackupReason::Manual).await {
        Ok(record) => {
            engine.notify(NoticeLevel::Success, "Backup created.");
            Ok(record)
        }
        Err(e) => {
            engine.notify(NoticeLevel::Error, "Backup failed.");
            Err(e)
        }
    }
}

pub async fn restore_latest(engine: &Engine) -> Result<BackupRecord> {
    super::confirm(
        engine,
        "Restore UIE state from latest backup? This will overwrite current UIE settings.",
    )?;
    match engine.backups().restore_latest_backup().await {
        Ok(record) => {
            engine.update_layout();
            engine.notify(NoticeLevel::Success, "UIE restored from latest backup.");
            Ok(record)
        }
        Err(SettingsError::NoBackup) => {
            engine.notify(NoticeLevel::Warning, "No backup found.");
            Err(SettingsError::NoBackup)
        }
        Err(e) => Err(e),
    }
}

/// Write the export into `dir` and return its path.
pub async fn export_backup(engine: &Engine, dir: &Path) -> Result<PathBuf> {
    let export = engine.backups().export_json()?;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(&export.filename);
    tokio::fs::write(&path, export.contents).await?;
    tracing::info!("exported settings to {}", path.display());
    Ok(path)
}

pub async fn import_backup(engine: &Engine, path: &Path) -> Result<()> {
    super::confirm(
        engine,
        "Import UIE backup JSON? This will overwrite current UIE settings.",
    )?;
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SettingsError::InvalidImport(format!("{}: {e}", path.display())))?;
    match engine.backups().import_json(&text).await {
        Ok(()) => {
            engine.update_layout();
            engine.notify(NoticeLevel::Success, "Backup imported.");
            Ok(())
        }
        Err(e) => {
            engine.notify(NoticeLevel::Error, "Import failed (invalid file).");
            Err(e)
        }
    }
}
