//! Generation settings.
//!
//! Global defaults merged field-wise with an optional per-session override at
//! the moment a generation starts.

use serde::{Deserialize, Serialize};

/// Global generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Display identity of the active provider.
    pub provider: String,
    /// Display identity of the active model.
    pub model: String,
    /// Upper bound on the number of prior messages included in the prompt.
    pub max_context_message_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: String::new(),
            model: String::new(),
            max_context_message_count: 64,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Partial per-session override of [`Settings`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_message_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Settings {
    /// Merge a session override over these settings. Fields the override
    /// leaves unset keep the global value.
    pub fn merged(&self, overrides: Option<&SessionSettings>) -> Settings {
        let Some(o) = overrides else {
            return self.clone();
        };
        Settings {
            provider: o.provider.clone().unwrap_or_else(|| self.provider.clone()),
            model: o.model.clone().unwrap_or_else(|| self.model.clone()),
            max_context_message_count: o
                .max_context_message_count
                .unwrap_or(self.max_context_message_count),
            temperature: o.temperature.or(self.temperature),
            max_tokens: o.max_tokens.or(self.max_tokens),
        }
    }
}
