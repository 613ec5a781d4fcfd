use serde::Serialize;

/// All errors that can occur while reading, persisting or restoring settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage quota exceeded")]
    QuotaExceeded,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Settings not hydrated yet")]
    NotHydrated,

    #[error("Host context not ready")]
    HostNotReady,

    #[error("Invalid import: {0}")]
    InvalidImport(String),

    #[error("No backup found")]
    NoBackup,

    #[error("Unknown saved state: {0}")]
    UnknownState(String),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("{0}")]
    Custom(String),
}

impl SettingsError {
    /// Conditions that clear up on their own once the host finishes loading.
    pub fn is_transient(&self) -> bool {
        matches!(self, SettingsError::NotHydrated | SettingsError::HostNotReady)
    }
}

// Front-ends receive errors as plain strings.
impl Serialize for SettingsError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SettingsError>;
