//! Launcher configuration: ports, commands, delays and limits.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::launcher::CommandSpec;

/// Default MCP server host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default MCP server port.
pub const DEFAULT_PORT: u16 = 8000;

/// Configuration for every launch performed by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Host the MCP server binds to
    pub host: String,

    /// Port the MCP server binds to
    pub port: u16,

    /// Directory the commands are started from
    pub install_dir: PathBuf,

    /// MCP server start command
    pub server_command: CommandSpec,

    /// Alternate MCP server command, tried once if the primary fails
    pub server_fallback: Option<CommandSpec>,

    /// Bot start command
    pub bot_command: CommandSpec,

    /// Alternate bot command, tried once if the primary fails
    pub bot_fallback: Option<CommandSpec>,

    /// Image name of the trading terminal the MCP server needs
    pub terminal_image: String,

    /// Fixed wait between starting the MCP server and starting the bot (seconds)
    pub startup_delay_secs: u64,

    /// Time a background server gets before its exit status is checked (seconds)
    pub start_grace_secs: u64,

    /// Health check attempts
    pub health_attempts: u32,

    /// Delay between health check attempts (seconds)
    pub health_delay_secs: u64,

    /// Maximum bot restarts under supervision
    pub max_restarts: u32,

    /// Delay before a supervised restart (seconds)
    pub restart_delay_secs: u64,

    /// How often the supervisor checks the bot (seconds)
    pub check_interval_secs: u64,

    /// Ask for Enter before exiting after a failed launch
    pub pause_on_exit: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let host = DEFAULT_HOST.to_string();
        let port = DEFAULT_PORT;
        Self {
            server_command: CommandSpec::new(
                "python",
                [
                    "mt5_server.py".to_string(),
                    "--host".to_string(),
                    host.clone(),
                    "--port".to_string(),
                    port.to_string(),
                ],
            ),
            server_fallback: Some(CommandSpec::new("python", ["start_mcp_direct.py".to_string()])),
            bot_command: CommandSpec::new("python", ["forex_bot.py".to_string()]),
            bot_fallback: None,
            host,
            port,
            install_dir: PathBuf::from("."),
            terminal_image: "terminal64.exe".to_string(),
            startup_delay_secs: 5,
            start_grace_secs: 2,
            health_attempts: 10,
            health_delay_secs: 2,
            max_restarts: 5,
            restart_delay_secs: 5,
            check_interval_secs: 10,
            pause_on_exit: true,
        }
    }
}

impl LauncherConfig {
    /// Load from a JSON file, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No launcher config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::from_json(&raw)
            .with_context(|| format!("Invalid launcher config in {}", path.display()))?;

        info!(path = %path.display(), "Loaded launcher configuration");
        Ok(config)
    }

    /// Parse a JSON document; missing keys keep their defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Failed to parse launcher config")
    }

    /// Apply host/port overrides from the command line or environment.
    ///
    /// Any `--host`/`--port` pair inside the server command is rewritten
    /// so the server actually binds where the launcher looks.
    pub fn with_endpoint(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.server_command.replace_flag_value("--host", &host);
            self.host = host;
        }
        if let Some(port) = port {
            self.server_command.replace_flag_value("--port", &port.to_string());
            self.port = port;
        }
        self
    }

    /// Base URL of the MCP server.
    pub fn server_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_secs(self.start_grace_secs)
    }

    pub fn health_delay(&self) -> Duration {
        Duration::from_secs(self.health_delay_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_fixed_constants() {
        let config = LauncherConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8000);
        assert_eq!(config.startup_delay(), Duration::from_secs(5));
        assert_eq!(config.server_url(), "http://127.0.0.1:8000");
        assert!(config.server_command.args.contains(&"8000".to_string()));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = LauncherConfig::from_json(r#"{ "port": 9001, "max_restarts": 2 }"#).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.max_restarts, 2);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.terminal_image, "terminal64.exe");
    }

    #[test]
    fn test_json_commands() {
        let raw = r#"{
            "server_command": { "program": "mcp-server", "args": ["--port", "8000"] },
            "server_fallback": null
        }"#;
        let config = LauncherConfig::from_json(raw).unwrap();
        assert_eq!(config.server_command.program, "mcp-server");
        assert!(config.server_fallback.is_none());
    }

    #[test]
    fn test_endpoint_override_rewrites_server_args() {
        let config = LauncherConfig::default().with_endpoint(Some("0.0.0.0".to_string()), Some(8100));
        assert_eq!(config.port, 8100);
        assert_eq!(config.server_url(), "http://0.0.0.0:8100");

        let args = &config.server_command.args;
        let port_idx = args.iter().position(|a| a == "--port").unwrap();
        assert_eq!(args[port_idx + 1], "8100");
        let host_idx = args.iter().position(|a| a == "--host").unwrap();
        assert_eq!(args[host_idx + 1], "0.0.0.0");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = std::env::temp_dir().join(format!("fxlaunch-missing-{}.json", uuid::Uuid::new_v4()));
        let config = LauncherConfig::load(&path).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
    }
}
