use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use crate::clock::SystemClock;
use crate::commands;
use crate::config::{self, EngineConfig};
use crate::document::{has_user_data, looks_empty, saved_at};
use crate::engine::Engine;
use crate::error::SettingsError;
use crate::host::FileHost;
use crate::logging::{init_tracing, SessionLog};
use crate::storage::{FileDurableStore, FileStorage};
use crate::util::expand_tilde;

#[derive(Parser, Debug)]
#[command(name = "uie", version, about = "Inspect, back up and repair UIE settings")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Data directory holding settings, mirror, backups and logs.
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<String>,

    /// Treat this conversation as the active chat.
    #[arg(long = "chat", global = true, value_name = "ID")]
    pub chat: Option<String>,

    /// Answer yes to every confirmation prompt.
    #[arg(long, short = 'y', global = true, default_value_t = false)]
    pub yes: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Summarize the settings document, its mirror and backups.
    Status,
    /// Write the settings document as pretty JSON.
    Export {
        #[arg(value_name = "DIR")]
        dir: Option<PathBuf>,
    },
    /// Replace the settings document with a JSON file.
    Import {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Take a manual backup.
    Backup,
    /// Restore the newest backup.
    Restore,
    /// List backups, newest first.
    Backups,
    /// Reset the active chat's inventory, stats and module data.
    ResetChat,
    /// Snapshot the document under a name.
    SaveState { name: Option<String> },
    /// Load a named snapshot back.
    LoadState { name: String },
    /// Remove a named snapshot.
    DeleteState { name: String },
    /// List named snapshots.
    States,
    /// Print the effective engine config.
    Config {
        /// Also write it to config.json.
        #[arg(long, default_value_t = false)]
        write: bool,
    },
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(run_cli(cli))
}

async fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let root = match cli.data_dir.as_deref() {
        Some(dir) => PathBuf::from(expand_tilde(dir)),
        None => config::data_dir().context("cannot find home directory")?,
    };

    let session = SessionLog::open(&root.join("logs")).await;
    init_tracing(session.as_ref());

    let config_path = root.join("config.json");
    let config = config::load_config_from(&config_path).unwrap_or_default();

    if let Command::Config { write } = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        if write {
            config::save_config_to(&config_path, &config)?;
            println!("Wrote {}", config_path.display());
        }
        return Ok(());
    }

    let engine = open_engine(&root, config, cli.chat.clone(), cli.yes);
    engine.init().await?;
    let result = dispatch(&engine, cli.command, &root).await;
    engine.teardown().await;

    match result {
        Err(SettingsError::Cancelled) => {
            println!("Cancelled.");
            Ok(())
        }
        other => other.map_err(Into::into),
    }
}

fn open_engine(root: &Path, config: EngineConfig, chat: Option<String>, assume_yes: bool) -> Engine {
    let host = Arc::new(FileHost::open(
        root.join("settings.json"),
        &config.extension_id,
        chat,
        assume_yes,
    ));
    let storage = Arc::new(FileStorage::new(root.join("local"), config.flc_quota_bytes));
    let durable = Arc::new(FileDurableStore::new(root.join("durable")));
    Engine::new(config, host, storage, durable, Arc::new(SystemClock))
}

async fn dispatch(engine: &Engine, command: Command, root: &Path) -> crate::error::Result<()> {
    match command {
        Command::Status => {
            let doc = engine.accessor().peek();
            let backups = engine.backups().list_backups().await?;
            let status = json!({
                "conversation": engine.partitioner().last_conversation_id(),
                "keys": doc.len(),
                "savedAt": saved_at(&doc),
                "hasUserData": has_user_data(&doc),
                "looksEmpty": looks_empty(&doc),
                "mirror": engine.mirror().has_non_empty_mirror(),
                "backups": backups.len(),
                "savedStates": engine.saved_states().list_states(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Export { dir } => {
            let dir = dir.unwrap_or_else(|| root.join("exports"));
            let path = commands::backup::export_backup(engine, &dir).await?;
            println!("{}", path.display());
        }
        Command::Import { file } => commands::backup::import_backup(engine, &file).await?,
        Command::Backup => {
            let record = commands::backup::backup_now(engine).await?;
            println!("{}", record.id);
        }
        Command::Restore => {
            commands::backup::restore_latest(engine).await?;
        }
        Command::Backups => {
            for record in engine.backups().list_backups().await? {
                println!("{}\t{:?}\t{} keys", record.id, record.reason, record.data.len());
            }
        }
        Command::ResetChat => commands::chat::reset_chat_data(engine)?,
        Command::SaveState { name } => {
            commands::state::save_state(engine, name.as_deref().unwrap_or(""));
        }
        Command::LoadState { name } => commands::state::load_state(engine, &name)?,
        Command::DeleteState { name } => commands::state::delete_state(engine, &name)?,
        Command::States => {
            for name in engine.saved_states().list_states() {
                println!("{name}");
            }
        }
        Command::Config { .. } => {}
    }
    Ok(())
}
