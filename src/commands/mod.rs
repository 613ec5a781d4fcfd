//! User-facing actions: confirmation for anything destructive, then the
//! operation, then a notice.

pub mod backup;
pub mod chat;
pub mod state;

use crate::engine::Engine;
use crate::error::{Result, SettingsError};

fn confirm(engine: &Engine, prompt: &str) -> Result<()> {
    if engine.host().confirm(prompt) {
        Ok(())
    } else {
        tracing::debug!("cancelled: {prompt}");
        Err(SettingsError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::document::{lock, Document};
    use crate::host::MemoryHost;
    use crate::storage::{MemoryDurableStore, MemoryStorage};

    fn engine(host: Arc<MemoryHost>) -> Engine {
        Engine::new(
            EngineConfig::default(),
            host,
            Arc::new(MemoryStorage::new(1 << 20)),
            Arc::new(MemoryDurableStore::new()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        )
    }

    #[tokio::test]
    async fn test_declined_reset_changes_nothing() {
        let host = Arc::new(MemoryHost::hydrated(Some(
            json!({"hp": 5}).as_object().cloned().unwrap(),
        )));
        host.set_confirm_answer(false);
        let engine = engine(host.clone());

        assert!(matches!(
            chat::reset_chat_data(&engine),
            Err(SettingsError::Cancelled)
        ));
        assert_eq!(engine.accessor().peek()["hp"], json!(5));
    }

    #[tokio::test]
    async fn test_reset_chat_installs_fresh_values() {
        let host = Arc::new(MemoryHost::hydrated(Some(
            json!({"hp": 5, "ui": {"scale": 1.1}}).as_object().cloned().unwrap(),
        )));
        let engine = engine(host.clone());

        chat::reset_chat_data(&engine).unwrap();
        let doc = engine.accessor().peek();
        assert_eq!(doc["hp"], json!(100));
        assert_eq!(doc["ui"]["scale"], json!(1.1));
        assert!(host
            .notices()
            .iter()
            .any(|(_, m)| m == "Current chat data reset complete."));
    }

    #[tokio::test]
    async fn test_export_then_import_file() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(MemoryHost::hydrated(Some(Document::new())));
        let engine = engine(host);
        lock(&engine.accessor().get()).insert("diary".into(), json!({"k": "v"}));

        let path = backup::export_backup(&engine, dir.path()).await.unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "uie_backup_2023-11-14.json"
        );

        lock(&engine.accessor().get()).insert("diary".into(), json!({}));
        backup::import_backup(&engine, &path).await.unwrap();
        assert_eq!(engine.accessor().peek()["diary"]["k"], json!("v"));
    }

    #[tokio::test]
    async fn test_restore_without_backups_warns() {
        let host = Arc::new(MemoryHost::hydrated(Some(Document::new())));
        let engine = engine(host.clone());
        assert!(matches!(
            backup::restore_latest(&engine).await,
            Err(SettingsError::NoBackup)
        ));
        assert!(host.notices().iter().any(|(_, m)| m == "No backup found."));
    }
}
