//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value was parsed but is out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Sampling cadence of the player state poller.
///
/// The three tiers are picked from the previous tick's outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollConfig {
    /// Delay after a tick that saw the player playing
    #[serde(default = "default_playing_interval_ms")]
    pub playing_interval_ms: u64,
    /// Delay after a tick that saw the player paused or stopped
    #[serde(default = "default_paused_interval_ms")]
    pub paused_interval_ms: u64,
    /// Delay after a tick where the player could not be reached
    #[serde(default = "default_unreachable_interval_ms")]
    pub unreachable_interval_ms: u64,
    /// Upper bound for a single control surface call
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_playing_interval_ms() -> u64 {
    1000
}

fn default_paused_interval_ms() -> u64 {
    2000
}

fn default_unreachable_interval_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    2000
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            playing_interval_ms: default_playing_interval_ms(),
            paused_interval_ms: default_paused_interval_ms(),
            unreachable_interval_ms: default_unreachable_interval_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl PollConfig {
    pub fn playing_interval(&self) -> Duration {
        Duration::from_millis(self.playing_interval_ms)
    }

    pub fn paused_interval(&self) -> Duration {
        Duration::from_millis(self.paused_interval_ms)
    }

    pub fn unreachable_interval(&self) -> Duration {
        Duration::from_millis(self.unreachable_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Tunables of the audio quality scan that runs after each track change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityConfig {
    /// Hard bound on one scan session
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    /// Sleep between two queries of the event source
    #[serde(default = "default_scan_quantum_ms")]
    pub scan_quantum_ms: u64,
    /// How far before the detected change the first query reaches back
    #[serde(default = "default_lookback_ms")]
    pub lookback_ms: u64,
    /// Interval after the track change in which a weak atmos signal is trusted
    #[serde(default = "default_atmos_window_ms")]
    pub atmos_window_ms: u64,
    /// Minimum bit rate reported for atmos streams
    #[serde(default = "default_atmos_bitrate_floor_kbps")]
    pub atmos_bitrate_floor_kbps: i32,
}

fn default_scan_timeout_ms() -> u64 {
    4000
}

fn default_scan_quantum_ms() -> u64 {
    100
}

fn default_lookback_ms() -> u64 {
    3000
}

fn default_atmos_window_ms() -> u64 {
    1000
}

fn default_atmos_bitrate_floor_kbps() -> i32 {
    768
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: default_scan_timeout_ms(),
            scan_quantum_ms: default_scan_quantum_ms(),
            lookback_ms: default_lookback_ms(),
            atmos_window_ms: default_atmos_window_ms(),
            atmos_bitrate_floor_kbps: default_atmos_bitrate_floor_kbps(),
        }
    }
}

impl QualityConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn scan_quantum(&self) -> Duration {
        Duration::from_millis(self.scan_quantum_ms)
    }

    pub fn lookback(&self) -> Duration {
        Duration::from_millis(self.lookback_ms)
    }

    pub fn atmos_window(&self) -> Duration {
        Duration::from_millis(self.atmos_window_ms)
    }
}

/// Log subsystem identifiers, one per kind of source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourcesConfig {
    #[serde(default = "default_decoder_subsystem")]
    pub decoder: String,
    #[serde(default = "default_companion_app_subsystem")]
    pub companion_app: String,
    #[serde(default = "default_media_pipeline_subsystem")]
    pub media_pipeline: String,
}

fn default_decoder_subsystem() -> String {
    "com.apple.coreaudio".to_string()
}

fn default_companion_app_subsystem() -> String {
    "com.apple.Music".to_string()
}

fn default_media_pipeline_subsystem() -> String {
    "com.apple.coremedia".to_string()
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            decoder: default_decoder_subsystem(),
            companion_app: default_companion_app_subsystem(),
            media_pipeline: default_media_pipeline_subsystem(),
        }
    }
}

/// Which external player to mirror
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PlayerConfig {
    /// Player name handed to the control surface (None = first available)
    #[serde(default)]
    pub name: Option<String>,
}

/// JSON status endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default = "default_status_enabled")]
    pub enabled: bool,
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

fn default_status_enabled() -> bool {
    true
}

fn default_status_bind() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: default_status_enabled(),
            bind: default_status_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - TUNEWATCH_PLAYER -> player.name
    /// - TUNEWATCH_SCAN_TIMEOUT_MS -> quality.scan_timeout_ms
    /// - TUNEWATCH_ATMOS_WINDOW_MS -> quality.atmos_window_ms
    /// - TUNEWATCH_STATUS_BIND -> status.bind
    /// - TUNEWATCH_STATUS_ENABLED -> status.enabled
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("TUNEWATCH_PLAYER") {
            let val = val.trim();
            self.player.name = if val.is_empty() {
                None
            } else {
                Some(val.to_string())
            };
        }

        if let Ok(val) = env::var("TUNEWATCH_SCAN_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.quality.scan_timeout_ms = ms;
            }
        }

        if let Ok(val) = env::var("TUNEWATCH_ATMOS_WINDOW_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.quality.atmos_window_ms = ms;
            }
        }

        if let Ok(val) = env::var("TUNEWATCH_STATUS_BIND") {
            if !val.trim().is_empty() {
                self.status.bind = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("TUNEWATCH_STATUS_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.status.enabled = true,
                "false" | "0" | "no" => self.status.enabled = false,
                _ => {} // Invalid value, keep existing
            }
        }
    }

    /// Reject values that would make a loop spin or never run
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("poll.playing_interval_ms", self.poll.playing_interval_ms),
            ("poll.paused_interval_ms", self.poll.paused_interval_ms),
            ("poll.unreachable_interval_ms", self.poll.unreachable_interval_ms),
            ("poll.command_timeout_ms", self.poll.command_timeout_ms),
            ("quality.scan_timeout_ms", self.quality.scan_timeout_ms),
            ("quality.scan_quantum_ms", self.quality.scan_quantum_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }

        if self.quality.scan_quantum_ms > self.quality.scan_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "quality.scan_quantum_ms ({}) exceeds quality.scan_timeout_ms ({})",
                self.quality.scan_quantum_ms, self.quality.scan_timeout_ms
            )));
        }

        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("TUNEWATCH_PLAYER");
        env::remove_var("TUNEWATCH_SCAN_TIMEOUT_MS");
        env::remove_var("TUNEWATCH_ATMOS_WINDOW_MS");
        env::remove_var("TUNEWATCH_STATUS_BIND");
        env::remove_var("TUNEWATCH_STATUS_ENABLED");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            playing in 1u64..10_000,
            paused in 1u64..10_000,
            unreachable in 1u64..60_000,
            timeout in 1u64..10_000,
            window in 0u64..5_000,
            enabled in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[poll]
playing_interval_ms = {}
paused_interval_ms = {}
unreachable_interval_ms = {}

[quality]
scan_timeout_ms = {}
atmos_window_ms = {}

[sources]
decoder = "dec"

[player]
name = "spotify"

[status]
enabled = {}
"#,
                playing, paused, unreachable, timeout, window, enabled
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.poll.playing_interval_ms, playing);
            prop_assert_eq!(config.poll.paused_interval_ms, paused);
            prop_assert_eq!(config.poll.unreachable_interval_ms, unreachable);
            prop_assert_eq!(config.quality.scan_timeout_ms, timeout);
            prop_assert_eq!(config.quality.atmos_window_ms, window);
            prop_assert_eq!(config.sources.decoder.as_str(), "dec");
            prop_assert_eq!(config.sources.companion_app.as_str(), "com.apple.Music");
            prop_assert_eq!(config.player.name.as_deref(), Some("spotify"));
            prop_assert_eq!(config.status.enabled, enabled);
        }

        #[test]
        fn prop_env_overrides_scan_timeout(
            initial in 1u64..10_000,
            override_ms in 1u64..10_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[quality]\nscan_timeout_ms = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TUNEWATCH_SCAN_TIMEOUT_MS", override_ms.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.quality.scan_timeout_ms, override_ms);
        }

        #[test]
        fn prop_env_overrides_status_enabled(
            initial in proptest::bool::ANY,
            override_enabled in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[status]\nenabled = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TUNEWATCH_STATUS_ENABLED", override_enabled.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.status.enabled, override_enabled);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.poll.playing_interval_ms, 1000);
        assert_eq!(config.poll.paused_interval_ms, 2000);
        assert_eq!(config.poll.unreachable_interval_ms, 5000);
        assert_eq!(config.quality.scan_timeout_ms, 4000);
        assert_eq!(config.quality.scan_quantum_ms, 100);
        assert_eq!(config.quality.lookback_ms, 3000);
        assert_eq!(config.quality.atmos_window_ms, 1000);
        assert_eq!(config.quality.atmos_bitrate_floor_kbps, 768);
        assert_eq!(config.sources.media_pipeline, "com.apple.coremedia");
        assert_eq!(config.player.name, None);
        assert!(config.status.enabled);
        assert_eq!(config.status.bind, "127.0.0.1:7879");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_accessors() {
        let config = Config::default();
        assert_eq!(config.poll.playing_interval(), Duration::from_secs(1));
        assert_eq!(config.quality.scan_timeout(), Duration::from_secs(4));
        assert_eq!(config.quality.lookback(), Duration::from_secs(3));
        assert_eq!(config.quality.atmos_window(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = Config::parse_toml("[poll]\npaused_interval_ms = 0\n").unwrap();
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("paused_interval_ms")),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_quantum_longer_than_timeout() {
        let config =
            Config::parse_toml("[quality]\nscan_timeout_ms = 50\nscan_quantum_ms = 100\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_player_override_and_blank_clears() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::parse_toml("[player]\nname = \"mpd\"\n").unwrap();
        env::set_var("TUNEWATCH_PLAYER", "vlc");
        config.apply_env_overrides();
        assert_eq!(config.player.name.as_deref(), Some("vlc"));

        env::set_var("TUNEWATCH_PLAYER", "  ");
        config.apply_env_overrides();
        assert_eq!(config.player.name, None);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_value_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("TUNEWATCH_ATMOS_WINDOW_MS", "soon");
        env::set_var("TUNEWATCH_STATUS_ENABLED", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.quality.atmos_window_ms, 1000);
        assert!(config.status.enabled);
    }

    #[test]
    fn test_load_reads_file_and_validates() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tunewatch.toml");
        {
            let mut file = fs::File::create(&path).unwrap();
            writeln!(file, "[status]\nbind = \"0.0.0.0:9000\"").unwrap();
        }
        let config = Config::load(&path).expect("config should load");
        assert_eq!(config.status.bind, "0.0.0.0:9000");

        fs::write(&path, "[poll]\nplaying_interval_ms = 0\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = Config::load("/nonexistent/tunewatch/config.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
