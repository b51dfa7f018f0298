//! Command-line and environment configuration.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use octopus_executor::{ApprovalMode, ClaudeConfig};
use tokio::net::TcpListener;

/// How tool permission prompts are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ApprovalArg {
    /// Run every tool without asking.
    Auto,
    /// Park tool calls until a client approves or denies them.
    Interactive,
}

impl From<ApprovalArg> for ApprovalMode {
    fn from(arg: ApprovalArg) -> Self {
        match arg {
            ApprovalArg::Auto => Self::Auto,
            ApprovalArg::Interactive => Self::Interactive,
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "octopus",
    version,
    about = "Relay between a browser UI and local Claude Code sessions"
)]
pub struct Config {
    /// Shared secret for REST (bearer) and WebSocket (`?token=`) clients.
    #[arg(long, env = "OCTOPUS_AUTH_TOKEN", default_value = "changeme", hide_env_values = true)]
    pub auth_token: String,

    /// Address to bind.
    #[arg(long, env = "OCTOPUS_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, env = "OCTOPUS_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Working directory for sessions created without one.
    #[arg(long, env = "OCTOPUS_DEFAULT_WORKING_DIR", default_value = ".")]
    pub default_working_dir: PathBuf,

    /// Allowed browser origins, comma separated.
    #[arg(
        long,
        env = "OCTOPUS_CORS_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:5173"
    )]
    pub cors_origins: Vec<String>,

    /// SQLite database path. Defaults to `<data dir>/octopus/octopus.db`.
    #[arg(long, env = "OCTOPUS_DATABASE")]
    pub database: Option<PathBuf>,

    /// Keep sessions in memory only.
    #[arg(long, env = "OCTOPUS_IN_MEMORY")]
    pub in_memory: bool,

    /// Claude Code base command.
    #[arg(long, env = "OCTOPUS_CLAUDE_COMMAND", default_value = "claude")]
    pub claude_command: String,

    /// Tool approval policy.
    #[arg(long, env = "OCTOPUS_APPROVAL_MODE", value_enum, default_value_t = ApprovalArg::Auto)]
    pub approval_mode: ApprovalArg,
}

impl Config {
    /// Bind the listener. `host` may be an IP address or a host name.
    ///
    /// # Errors
    /// Returns error if the host does not resolve or the port is unavailable.
    pub async fn listener(&self) -> anyhow::Result<TcpListener> {
        TcpListener::bind((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("binding {}:{}", self.host, self.port))
    }

    /// Database location, falling back to the platform data directory.
    ///
    /// # Errors
    /// Returns error if no path is configured and the platform has no data directory.
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.database {
            return Ok(path.clone());
        }
        dirs::data_dir()
            .map(|dir| dir.join("octopus").join("octopus.db"))
            .context("no platform data directory; set OCTOPUS_DATABASE")
    }

    /// Default working directory, made absolute.
    #[must_use]
    pub fn working_dir(&self) -> PathBuf {
        std::path::absolute(&self.default_working_dir)
            .unwrap_or_else(|_| self.default_working_dir.clone())
    }

    #[must_use]
    pub fn claude(&self) -> ClaudeConfig {
        ClaudeConfig {
            command: self.claude_command.clone(),
            approval_mode: self.approval_mode.into(),
            ..ClaudeConfig::default()
        }
    }
}
