//! Server-wide configuration shared by every session.

use serde::Deserialize;

// ============================================================================
// Defaults
// ============================================================================

/// Default hard history size limit (15 MiB).
pub const SESSION_SIZE_LIMIT: u64 = 15 * 1024 * 1024;

/// Default autoreset threshold. 0 disables autoreset.
pub const AUTORESET_THRESHOLD: u64 = 0;

/// Default server-wide minimum autoreset threshold.
pub const AUTORESET_THRESHOLD_BASE: u64 = 0;

/// Session log entries kept in memory per session.
pub const LOG_HISTORY_LEN: usize = 1000;

/// Seconds between history size status broadcasts.
pub const STATUS_UPDATE_INTERVAL_SECS: u64 = 10;

/// Port advertised to listing servers.
pub const ANNOUNCE_PORT: u16 = 27750;

/// Protocol version string advertised in listings and recordings.
pub const PROTOCOL_VERSION: &str = "tandem:4.21.2";

// ============================================================================
// Server Config
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Hard history size limit in bytes. 0 means unlimited.
    pub session_size_limit: u64,
    pub autoreset_threshold: u64,
    pub autoreset_threshold_base: u64,
    pub enable_persistence: bool,
    /// Sent as a system chat message to every joining user.
    pub welcome_message: String,
    /// Never reveal user names to listing servers.
    pub private_user_list: bool,
    /// URL prefixes sessions may be announced at. Empty allows any http(s) URL.
    pub allowed_announcement_urls: Vec<String>,
    pub local_hostname: String,
    pub announce_port: u16,
    pub report_url: Option<String>,
    pub report_token: String,
    pub log_history_len: usize,
    pub history_batch_size: usize,
    pub status_update_interval_secs: u64,
    pub protocol_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_size_limit: SESSION_SIZE_LIMIT,
            autoreset_threshold: AUTORESET_THRESHOLD,
            autoreset_threshold_base: AUTORESET_THRESHOLD_BASE,
            enable_persistence: false,
            welcome_message: String::new(),
            private_user_list: false,
            allowed_announcement_urls: Vec::new(),
            local_hostname: String::new(),
            announce_port: ANNOUNCE_PORT,
            report_url: None,
            report_token: String::new(),
            log_history_len: LOG_HISTORY_LEN,
            history_batch_size: tandem_history::DEFAULT_BATCH_SIZE,
            status_update_interval_secs: STATUS_UPDATE_INTERVAL_SECS,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl ServerConfig {
    /// Check an announcement API URL against the allow-list.
    pub fn is_allowed_announcement_url(&self, url: &str) -> bool {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return false;
        }

        self.allowed_announcement_urls.is_empty()
            || self
                .allowed_announcement_urls
                .iter()
                .any(|prefix| url.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Missing keys fall back to defaults.
    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"welcome_message": "hi", "autoreset_threshold": 500}"#)
                .unwrap();

        assert_eq!(config.welcome_message, "hi");
        assert_eq!(config.autoreset_threshold, 500);
        assert_eq!(config.session_size_limit, SESSION_SIZE_LIMIT);
        assert_eq!(config.status_update_interval_secs, STATUS_UPDATE_INTERVAL_SECS);
    }

    #[test]
    fn test_announcement_url_allow_list() {
        let mut config = ServerConfig::default();
        assert!(config.is_allowed_announcement_url("https://listing.example/api/"));
        assert!(!config.is_allowed_announcement_url("ftp://listing.example/"));

        config.allowed_announcement_urls = vec!["https://listing.example/".to_string()];
        assert!(config.is_allowed_announcement_url("https://listing.example/api/"));
        assert!(!config.is_allowed_announcement_url("https://elsewhere.example/api/"));
    }
}
