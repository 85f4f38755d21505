//! Loopgate configuration stored at `<sessions-dir>/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Loopgate configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below; CLI flags override individual fields per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Ceiling on build iterations per `run`/`resume` invocation.
    pub max_iterations: u32,

    /// Pause between build iterations, in seconds.
    pub cooldown_secs: u64,

    pub agent: AgentConfig,
    pub review: GateConfig,
    pub verification: GateConfig,
    pub server: ServerConfig,
    pub artifacts: ArtifactConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable.
    pub command: String,
    /// Arguments placed before the prompt/tool flags.
    pub args: Vec<String>,
    /// Wall-clock limit for a single agent invocation.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    pub enabled: bool,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub ready_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub stop_command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Glob patterns, relative to the working directory, for files the
    /// verifier's tools leave behind.
    pub patterns: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: ["--print", "--output-format", "stream-json", "--verbose"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            timeout_secs: 60 * 60,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: 15,
            poll_interval_ms: 500,
            request_timeout_ms: 2_000,
            stop_command_timeout_secs: 30,
        }
    }
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            patterns: vec![
                ".playwright-mcp".to_string(),
                "*.png".to_string(),
                "*.jpeg".to_string(),
            ],
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            cooldown_secs: 0,
            agent: AgentConfig::default(),
            review: GateConfig::default(),
            verification: GateConfig::default(),
            server: ServerConfig::default(),
            artifacts: ArtifactConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.agent.command.trim().is_empty() {
            return Err(anyhow!("agent.command must not be empty"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.review.max_attempts == 0 {
            return Err(anyhow!("review.max_attempts must be > 0"));
        }
        if self.verification.max_attempts == 0 {
            return Err(anyhow!("verification.max_attempts must be > 0"));
        }
        if self.server.poll_interval_ms == 0 || self.server.request_timeout_ms == 0 {
            return Err(anyhow!(
                "server.poll_interval_ms and server.request_timeout_ms must be > 0"
            ));
        }
        if self.server.stop_command_timeout_secs == 0 {
            return Err(anyhow!("server.stop_command_timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ServerConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stop_command_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_command_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = RunnerConfig::default();
        cfg.verification.max_attempts = 2;
        cfg.artifacts.patterns = vec!["shots/*.png".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_iterations = 7\n[review]\nenabled = false\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 7);
        assert!(!cfg.review.enabled);
        assert_eq!(cfg.review.max_attempts, 3);
        assert_eq!(cfg.agent, AgentConfig::default());
    }

    #[test]
    fn zero_budget_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[verification]\nmax_attempts = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("verification.max_attempts"));
    }
}
