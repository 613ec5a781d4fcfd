use crate::engine::Engine;
use crate::error::{Result, SettingsError};
use crate::host::NoticeLevel;

pub fn save_state(engine: &Engine, name: &str) -> String {
    let name = engine.saved_states().save_state(name);
    engine.notify(NoticeLevel::Success, &format!("Saved state \"{name}\"."));
    name
}

pub fn load_state(engine: &Engine, name: &str) -> Result<()> {
    super::confirm(
        engine,
        &format!("Load saved state \"{name}\"? Current values will be overwritten."),
    )?;
    match engine.saved_states().load_state(name) {
        Ok(()) => {
            engine.update_layout();
            engine.notify(NoticeLevel::Success, &format!("Loaded state \"{name}\"."));
            Ok(())
        }
        Err(e @ SettingsError::UnknownState(_)) => {
            engine.notify(NoticeLevel::Warning, &format!("No saved state named \"{name}\"."));
            Err(e)
        }
        Err(e) => Err(e),
    }
}

pub fn delete_state(engine: &Engine, name: &str) -> Result<()> {
    super::confirm(engine, &format!("Delete saved state \"{name}\"?"))?;
    engine.saved_states().delete_state(name)?;
    engine.notify(NoticeLevel::Info, &format!("Deleted state \"{name}\"."));
    Ok(())
}
