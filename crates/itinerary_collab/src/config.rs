//! Runtime configuration for clients and the relay server.

use crate::error::{CollabError, CollabResult};
use crate::undo::DEFAULT_CAPTURE_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of the environment variables read by [`CollabConfig::from_env`].
pub const ENV_PREFIX: &str = "ITINERARY_COLLAB_";

/// Collaboration settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// WebSocket URL of the relay (client side).
    pub relay_url: String,
    /// Directory holding persisted update logs.
    pub storage_dir: PathBuf,
    /// How long a remotely edited block stays highlighted.
    pub highlight_window_ms: u64,
    /// Local edits closer together than this undo as one step.
    pub undo_capture_timeout_ms: u64,
    /// Address the relay binds to.
    pub bind_address: String,
    /// Port the relay listens on.
    pub port: u16,
    /// First delay before reconnecting after a dropped connection.
    pub reconnect_base_delay_ms: u64,
    /// Upper bound of the doubling reconnect delay.
    pub reconnect_max_delay_ms: u64,
    /// Reconnect attempts before giving up (0 = never give up).
    pub reconnect_max_attempts: u32,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080".to_string(),
            storage_dir: PathBuf::from("itinerary-data"),
            highlight_window_ms: 3000,
            undo_capture_timeout_ms: DEFAULT_CAPTURE_TIMEOUT.as_millis() as u64,
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 0,
        }
    }
}

impl CollabConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> CollabResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CollabError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| CollabError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Defaults overridden by `ITINERARY_COLLAB_*` environment variables.
    pub fn from_env() -> CollabResult<Self> {
        Self::default().with_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Apply overrides looked up by upper-case field name.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> CollabResult<Self> {
        if let Some(url) = lookup("RELAY_URL") {
            self.relay_url = url;
        }
        if let Some(dir) = lookup("STORAGE_DIR") {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Some(ms) = lookup("HIGHLIGHT_WINDOW_MS") {
            self.highlight_window_ms = parse("HIGHLIGHT_WINDOW_MS", &ms)?;
        }
        if let Some(ms) = lookup("UNDO_CAPTURE_TIMEOUT_MS") {
            self.undo_capture_timeout_ms = parse("UNDO_CAPTURE_TIMEOUT_MS", &ms)?;
        }
        if let Some(addr) = lookup("BIND_ADDRESS") {
            self.bind_address = addr;
        }
        if let Some(port) = lookup("PORT") {
            self.port = parse("PORT", &port)?;
        }
        if let Some(ms) = lookup("RECONNECT_BASE_DELAY_MS") {
            self.reconnect_base_delay_ms = parse("RECONNECT_BASE_DELAY_MS", &ms)?;
        }
        if let Some(ms) = lookup("RECONNECT_MAX_DELAY_MS") {
            self.reconnect_max_delay_ms = parse("RECONNECT_MAX_DELAY_MS", &ms)?;
        }
        if let Some(n) = lookup("RECONNECT_MAX_ATTEMPTS") {
            self.reconnect_max_attempts = parse("RECONNECT_MAX_ATTEMPTS", &n)?;
        }
        Ok(self)
    }

    /// Get the full bind address.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn highlight_window(&self) -> Duration {
        Duration::from_millis(self.highlight_window_ms)
    }

    pub fn undo_capture_timeout(&self) -> Duration {
        Duration::from_millis(self.undo_capture_timeout_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based): the base delay
    /// doubled per earlier attempt, capped at the max delay.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self
            .reconnect_base_delay_ms
            .saturating_mul(factor)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(ms)
    }
}

fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> CollabResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| CollabError::Config(format!("{ENV_PREFIX}{key}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.highlight_window(), Duration::from_secs(3));
        assert_eq!(config.undo_capture_timeout(), Duration::from_millis(500));
        assert_eq!(config.socket_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_reconnect_delay_doubles_up_to_cap() {
        let config = CollabConfig {
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 3000,
            ..CollabConfig::default()
        };
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(500));
        assert_eq!(config.reconnect_delay(2), Duration::from_millis(1000));
        assert_eq!(config.reconnect_delay(3), Duration::from_millis(2000));
        assert_eq!(config.reconnect_delay(4), Duration::from_millis(3000));
        assert_eq!(config.reconnect_delay(80), Duration::from_millis(3000));
    }

    #[test]
    fn test_from_file_fills_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 9001, "highlight_window_ms": 1000}}"#).unwrap();

        let config = CollabConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.highlight_window_ms, 1000);
        assert_eq!(config.undo_capture_timeout_ms, 500);
    }

    #[test]
    fn test_from_file_errors() {
        assert!(matches!(
            CollabConfig::from_file("/definitely/not/here.json"),
            Err(CollabError::Config(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(CollabConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [("PORT", "7000"), ("RELAY_URL", "ws://relay:7000")].into();
        let config = CollabConfig::default()
            .with_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.relay_url, "ws://relay:7000");

        let config = CollabConfig::default()
            .with_overrides(|key| (key == "RECONNECT_MAX_ATTEMPTS").then(|| "3".to_string()))
            .unwrap();
        assert_eq!(config.reconnect_max_attempts, 3);

        let err = CollabConfig::default().with_overrides(|key| (key == "PORT").then(|| "high".to_string()));
        assert!(matches!(err, Err(CollabError::Config(_))));
    }
}
