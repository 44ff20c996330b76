use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default CDP debugging port.
pub const DEFAULT_CDP_PORT: u16 = 9222;

/// Default per-tool-call timeout.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;

// ---------------------------------------------------------------------------
// Config file (parsed from TOML)
// ---------------------------------------------------------------------------

/// The parsed TOML config file. All fields optional; the file itself is
/// optional too.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub connection: ConnectionConfig,
    pub launch: LaunchConfig,
    pub interception: InterceptionConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub port: Option<u16>,
    pub tool_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Chromium executable override.
    pub chromium_path: Option<String>,
    /// Default profile directory name.
    pub profile: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct InterceptionConfig {
    /// Per-context deadline for paused requests.
    pub pause_timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved config
// ---------------------------------------------------------------------------

/// Fully resolved server configuration, after the precedence chain
/// CLI flag > environment > config file > built-in default.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub tool_timeout_ms: u64,
    pub chromium_path: Option<PathBuf>,
    pub profile: Option<String>,
    pub pause_timeout_ms: Option<u64>,
}

impl Config {
    /// Merge the CLI port (which clap already resolved against the
    /// environment) with the config file.
    #[must_use]
    pub fn resolve(cli_port: Option<u16>, file: &ConfigFile) -> Self {
        Self {
            port: cli_port
                .or(file.connection.port)
                .unwrap_or(DEFAULT_CDP_PORT),
            tool_timeout_ms: file
                .connection
                .tool_timeout_ms
                .unwrap_or(DEFAULT_TOOL_TIMEOUT_MS),
            chromium_path: file.launch.chromium_path.clone().map(PathBuf::from),
            profile: file.launch.profile.clone(),
            pause_timeout_ms: file.interception.pause_timeout_ms,
        }
    }
}

/// Load the config file from the platform config directory
/// (`<config dir>/chromepilot/config.toml`). A missing file yields the
/// empty config; a malformed file is reported and otherwise ignored.
#[must_use]
pub fn load_config() -> ConfigFile {
    let Some(path) = config_file_path() else {
        return ConfigFile::default();
    };
    load_config_from(&path)
}

/// Load a config file from a specific path. Testable variant of
/// [`load_config`].
#[must_use]
pub fn load_config_from(path: &Path) -> ConfigFile {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("ignoring malformed config {}: {e}", path.display());
                ConfigFile::default()
            }
        },
        Err(_) => ConfigFile::default(),
    }
}

fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("chromepilot").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_everything_absent() {
        let config = Config::resolve(None, &ConfigFile::default());
        assert_eq!(config.port, DEFAULT_CDP_PORT);
        assert_eq!(config.tool_timeout_ms, DEFAULT_TOOL_TIMEOUT_MS);
        assert!(config.chromium_path.is_none());
        assert!(config.profile.is_none());
    }

    #[test]
    fn cli_port_beats_config_file() {
        let file: ConfigFile = toml::from_str("[connection]\nport = 9333").unwrap();
        let config = Config::resolve(Some(9444), &file);
        assert_eq!(config.port, 9444);
    }

    #[test]
    fn config_file_port_used_without_cli() {
        let file: ConfigFile = toml::from_str("[connection]\nport = 9333").unwrap();
        let config = Config::resolve(None, &file);
        assert_eq!(config.port, 9333);
    }

    #[test]
    fn launch_and_interception_sections_parse() {
        let file: ConfigFile = toml::from_str(
            "[launch]\nchromium_path = \"/opt/chromium\"\nprofile = \"Profile 2\"\n\
             [interception]\npause_timeout_ms = 5000",
        )
        .unwrap();
        let config = Config::resolve(None, &file);
        assert_eq!(
            config.chromium_path.as_deref(),
            Some(Path::new("/opt/chromium"))
        );
        assert_eq!(config.profile.as_deref(), Some("Profile 2"));
        assert_eq!(config.pause_timeout_ms, Some(5000));
    }

    #[test]
    fn missing_file_yields_default() {
        let config = load_config_from(Path::new("/nonexistent/chromepilot.toml"));
        assert!(config.connection.port.is_none());
    }

    #[test]
    fn malformed_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not [valid toml").unwrap();
        let config = load_config_from(&path);
        assert!(config.connection.port.is_none());
    }
}
