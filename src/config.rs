use std::path::PathBuf;

use crate::models::ChatMode;

/// Application-level constants
pub const APP_NAME: &str = "Colloquy";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Remote (hosted) completion endpoint and defaults.
pub const DEFAULT_REMOTE_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_REMOTE_MODEL: &str = "gpt-4o";
pub const REMOTE_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Local completion endpoint and defaults.
pub const DEFAULT_LOCAL_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_LOCAL_MODEL: &str = "llama3.2";
pub const LOCAL_BASE_URL_ENV: &str = "OLLAMA_HOST";

/// Fixed request policy: not configurable per call.
pub const HISTORY_WINDOW: usize = 10;
pub const TEMPERATURE: f32 = 0.7;
pub const MAX_TOKENS: u32 = 1024;
pub const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Availability probing policy.
pub const PROBE_INTERVAL_SECS: u64 = 30;
pub const PROBE_TIMEOUT_SECS: u64 = 3;

/// Conversation title policy.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New conversation";
pub const TITLE_MAX_CHARS: usize = 30;

/// Maximum decoded size of a single attached image (bytes).
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Preference key for the persisted provider mode.
pub const PREF_CHAT_MODE: &str = "chat_mode";

/// Default tracing filter when RUST_LOG is unset.
pub fn default_log_filter() -> String {
    format!("info,{}=debug", env!("CARGO_PKG_NAME"))
}

/// Get the application data directory
/// ~/Colloquy/ on all platforms (user-visible)
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join(APP_NAME)
}

/// Default path of the local history database.
pub fn default_db_path() -> PathBuf {
    app_data_dir().join("colloquy.db")
}

/// Runtime settings for one session.
///
/// Provider credentials and endpoints are configuration concerns: the
/// engine reads them once at construction and never mutates them.
#[derive(Debug, Clone)]
pub struct Settings {
    pub remote_base_url: String,
    pub remote_api_key: Option<String>,
    pub remote_model: String,
    pub local_base_url: String,
    pub local_model: String,
    pub mode: ChatMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            remote_base_url: DEFAULT_REMOTE_BASE_URL.to_string(),
            remote_api_key: None,
            remote_model: DEFAULT_REMOTE_MODEL.to_string(),
            local_base_url: DEFAULT_LOCAL_BASE_URL.to_string(),
            local_model: DEFAULT_LOCAL_MODEL.to_string(),
            mode: ChatMode::Online,
        }
    }
}

impl Settings {
    /// Build settings from the process environment, falling back to defaults.
    ///
    /// An empty credential variable counts as absent: the remote client
    /// reports the missing credential before any network call.
    pub fn from_env() -> Self {
        let remote_api_key = std::env::var(REMOTE_API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty());
        let local_base_url = std::env::var(LOCAL_BASE_URL_ENV)
            .ok()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOCAL_BASE_URL.to_string());

        Self {
            remote_api_key,
            local_base_url,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_under_home() {
        let dir = app_data_dir();
        let home = dirs::home_dir().unwrap();
        assert!(dir.starts_with(home));
        assert!(dir.ends_with(APP_NAME));
    }

    #[test]
    fn db_path_under_app_data() {
        let path = default_db_path();
        assert!(path.starts_with(app_data_dir()));
        assert!(path.ends_with("colloquy.db"));
    }

    #[test]
    fn default_settings_start_online() {
        let settings = Settings::default();
        assert_eq!(settings.mode, ChatMode::Online);
        assert!(settings.remote_api_key.is_none());
        assert_eq!(settings.local_base_url, DEFAULT_LOCAL_BASE_URL);
    }

    #[test]
    fn history_window_is_fixed_at_ten() {
        assert_eq!(HISTORY_WINDOW, 10);
    }

    #[test]
    fn title_limit_is_thirty_chars() {
        assert_eq!(TITLE_MAX_CHARS, 30);
    }
}
