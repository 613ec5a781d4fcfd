use crate::engine::Engine;
use crate::error::Result;
use crate::host::NoticeLevel;

/// Wipe the active conversation's inventory, stats and module data.
pub fn reset_chat_data(engine: &Engine) -> Result<()> {
    super::confirm(
        engine,
        "Are you sure? This will wipe ALL inventory, stats, and UIE data for this chat only.",
    )?;
    engine.partitioner().reset_current_chat();
    engine.update_layout();
    engine.notify(NoticeLevel::Success, "Current chat data reset complete.");
    Ok(())
}
