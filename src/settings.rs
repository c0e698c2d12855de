//! Server settings from LSP initialization options
//!
//! Created by M&K (c)2025 The LibraxisAI Team

use serde::Deserialize;

/// Behavior toggles the client may pass as `initializationOptions`. Unknown
/// fields are ignored; anything missing keeps its default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Run the checker after every document change.
    pub compile_on_change: bool,
    /// Run the checker on save.
    pub compile_on_save: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            compile_on_change: true,
            compile_on_save: true,
        }
    }
}

impl Settings {
    /// Parse initialization options, falling back to defaults on anything
    /// malformed.
    pub fn from_initialization_options(options: Option<serde_json::Value>) -> Self {
        match options {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!("ignoring malformed initializationOptions: {e}");
                Self::default()
            }),
            None => Self::default(),
        }
    }
}
