//! Gateway configuration
//!
//! CLI arguments and environment variable handling using clap.

use anyhow::Context;
use clap::Parser;
use dispatch::EngineConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::{DevModeProvider, IdentityProvider, StaticTokenProvider};

/// Dispatch gateway - HTTP front door for the alert dispatch engine
#[derive(Parser, Debug, Clone)]
#[command(name = "dispatch-gateway")]
#[command(about = "Emergency alert dispatch with a tamper-evident audit ledger")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Engine configuration file (YAML)
    #[arg(long, env = "ENGINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Audit ledger file (JSON lines). In-memory when omitted
    #[arg(long, env = "LEDGER_PATH")]
    pub ledger_path: Option<PathBuf>,

    /// fsync the ledger file after every append
    #[arg(long, env = "LEDGER_SYNC_WRITES", default_value = "false")]
    pub sync_writes: bool,

    /// Enable development mode (trusts X-Actor-Id, grants every role)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Static bearer tokens, `token=actor:role,role` separated by `;`
    #[arg(long, env = "API_TOKENS", value_delimiter = ';')]
    pub tokens: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode && self.tokens.is_empty() {
            return Err("API_TOKENS is required in production mode".to_string());
        }

        StaticTokenProvider::from_entries(&self.tokens)?;

        if self.ledger_path.is_none() && !self.dev_mode {
            tracing::warn!("No LEDGER_PATH set; the audit ledger will not survive a restart");
        }

        Ok(())
    }

    /// Engine settings from `--config`, or defaults.
    pub fn load_engine_config(&self) -> anyhow::Result<EngineConfig> {
        let Some(path) = &self.config else {
            return Ok(EngineConfig::default());
        };
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        let config = EngineConfig::from_yaml(&yaml)
            .with_context(|| format!("parsing engine config {}", path.display()))?;
        Ok(config)
    }

    /// Identity provider for the configured mode.
    pub fn identity_provider(&self) -> anyhow::Result<Arc<dyn IdentityProvider>> {
        if self.dev_mode {
            return Ok(Arc::new(DevModeProvider));
        }
        let provider =
            StaticTokenProvider::from_entries(&self.tokens).map_err(anyhow::Error::msg)?;
        Ok(Arc::new(provider))
    }
}
