//! Tunables for a spawn call.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of bytes read from a child's output pipe per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Configuration for a spawn call.
///
/// The terminal proxy timings are heuristics: they shape how long an
/// interactive child is left in the terminal foreground, not whether the
/// exchange is correct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Bytes read from stdout/stderr per chunk.
    pub chunk_size: usize,
    /// How long a child stopped for terminal input is left in the foreground
    /// when input was already queued for it.
    pub input_grace_ms: u64,
    /// Pause after a line was delivered before the child is suspended and
    /// moved back to the background.
    pub handoff_pause_us: u64,
    /// Search path used instead of the `PATH` environment variable.
    pub search_path: Option<String>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            input_grace_ms: 50,
            handoff_pause_us: 100,
            search_path: None,
        }
    }
}

impl SpawnConfig {
    /// Creates config from environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chunk_size: env_parse("SHELLSPAWN_CHUNK_SIZE").unwrap_or(defaults.chunk_size),
            input_grace_ms: env_parse("SHELLSPAWN_INPUT_GRACE_MS")
                .unwrap_or(defaults.input_grace_ms),
            handoff_pause_us: env_parse("SHELLSPAWN_HANDOFF_PAUSE_US")
                .unwrap_or(defaults.handoff_pause_us),
            search_path: None,
        }
    }

    /// Parses a YAML document. Missing keys take their default values.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Sets the search path used to resolve bare program names.
    pub fn with_search_path(mut self, path: impl Into<String>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    /// Sets the output chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Chunk size actually used for reads (never zero).
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }

    pub fn input_grace(&self) -> Duration {
        Duration::from_millis(self.input_grace_ms)
    }

    pub fn handoff_pause(&self) -> Duration {
        Duration::from_micros(self.handoff_pause_us)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SpawnConfig::default();
        assert_eq!(config.chunk_size, 256);
        assert_eq!(config.input_grace(), Duration::from_millis(50));
        assert_eq!(config.handoff_pause(), Duration::from_micros(100));
        assert!(config.search_path.is_none());
    }

    #[test]
    fn test_yaml_overrides_only_given_keys() {
        let config = SpawnConfig::from_yaml("chunk_size: 4096\nsearch_path: /opt/bin:/bin\n")
            .expect("valid yaml");
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.search_path.as_deref(), Some("/opt/bin:/bin"));
        assert_eq!(config.input_grace_ms, 50);
    }

    #[test]
    fn test_yaml_rejects_wrong_types() {
        assert!(SpawnConfig::from_yaml("chunk_size: lots").is_err());
    }

    #[test]
    fn test_zero_chunk_size_is_clamped() {
        let config = SpawnConfig::default().with_chunk_size(0);
        assert_eq!(config.effective_chunk_size(), 1);
    }

    #[test]
    fn test_builder_helpers_set_fields() {
        let config = SpawnConfig::default()
            .with_chunk_size(16)
            .with_search_path("/usr/bin");
        assert_eq!(config.chunk_size, 16);
        assert_eq!(config.search_path.as_deref(), Some("/usr/bin"));
    }
}
