use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

/// On-disk settings file. `host`, `port`, `rules` and `catchall_address`
/// are mandatory; serde rejects a file that omits any of them.
#[derive(Debug, Clone, Deserialize)]
pub struct SentryConfig {
    pub host: String,
    pub port: u16,
    /// Rule declarations, in evaluation order.
    pub rules: Vec<String>,
    /// Address handed out by blocking rules in sinkhole mode.
    pub catchall_address: IpAddr,
    /// Extra rule file, one declaration per line, appended after `rules`.
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
    /// Upstream timeout per attempt, in seconds.
    #[serde(default = "default_resolution_timeout")]
    pub resolution_timeout: f64,
    #[serde(default = "default_threadpool_size")]
    pub threadpool_size: usize,
    #[serde(default)]
    pub block_mode: BlockMode,
    /// Answer SERVFAIL instead of dropping when no rule matched or upstream failed.
    #[serde(default)]
    pub servfail_on_error: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockMode {
    /// NOERROR with an empty answer section.
    #[default]
    Empty,
    /// One address record pointing at `catchall_address`.
    Sinkhole,
}

/// The subset of the configuration rules need at compile time.
#[derive(Debug, Clone)]
pub struct Settings {
    pub catchall_address: IpAddr,
    pub block_mode: BlockMode,
    pub resolution_timeout: Duration,
}

impl SentryConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let host: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("parse host {:?}", self.host))?;
        Ok(SocketAddr::new(host, self.port))
    }

    pub fn settings(&self) -> Settings {
        Settings {
            catchall_address: self.catchall_address,
            block_mode: self.block_mode,
            resolution_timeout: Duration::from_secs_f64(self.resolution_timeout),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.threadpool_size == 0 {
            anyhow::bail!("threadpool_size must be greater than zero");
        }
        if !(self.resolution_timeout.is_finite() && self.resolution_timeout > 0.0) {
            anyhow::bail!(
                "resolution_timeout must be a positive number of seconds, got {}",
                self.resolution_timeout
            );
        }
        self.bind_addr()?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<SentryConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let mut cfg: SentryConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate config file: {}", path.display()))?;

    if let Some(rules_file) = cfg.rules_file.clone() {
        let rules_path = if rules_file.is_relative() {
            path.parent()
                .map(|dir| dir.join(&rules_file))
                .unwrap_or(rules_file)
        } else {
            rules_file
        };
        let extra = load_rules_file(&rules_path)?;
        info!(target = "config", path = %rules_path.display(), lines = extra.len(), "rule file loaded");
        cfg.rules.extend(extra);
    }

    Ok(cfg)
}

pub fn load_rules_file(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read rules file: {}", path.display()))?;
    Ok(raw.lines().map(str::to_string).collect())
}

fn default_resolution_timeout() -> f64 {
    2.0
}

fn default_threadpool_size() -> usize {
    10
}
