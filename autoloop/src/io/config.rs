//! Loop configuration stored under `.autoloop/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::run::{DEFAULT_DELAY, DEFAULT_MAX_ITERATIONS};

/// Loop configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to the
/// values used for long unattended runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Attempts allowed per phase before the run fails.
    pub max_iterations: u32,

    /// Pause between a failed attempt and the next one, in seconds.
    pub delay_secs: u64,

    /// Wall-clock limit for a single agent invocation, in seconds.
    pub agent_timeout_secs: u64,

    /// Keep at most this many bytes of each agent stream in memory.
    pub output_limit_bytes: usize,

    /// Prompt size above which droppable sections are removed.
    pub prompt_budget_bytes: usize,

    /// Tee agent output to `.autoloop/stream.log` while it runs.
    pub stream_log: bool,

    pub agent: AgentConfig,
    pub tracker: TrackerConfig,
    pub vcs: VcsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Program and arguments. The prompt is written to the child's stdin.
    pub command: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: [
                "claude",
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Disable to run without any issue tracker integration.
    pub enabled: bool,
    /// Tracker executable (and leading arguments).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// How many ready issues to request when selecting the next phase.
    pub ready_limit: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: vec!["bd".to_string()],
            timeout_secs: 60,
            ready_limit: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VcsConfig {
    pub timeout_secs: u64,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            delay_secs: DEFAULT_DELAY.as_secs(),
            agent_timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
            prompt_budget_bytes: 200_000,
            stream_log: true,
            agent: AgentConfig::default(),
            tracker: TrackerConfig::default(),
            vcs: VcsConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.agent_timeout_secs == 0 {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if is_blank_command(&self.agent.command) {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.tracker.enabled && is_blank_command(&self.tracker.command) {
            return Err(anyhow!("tracker.command must be a non-empty array"));
        }
        if self.tracker.timeout_secs == 0 {
            return Err(anyhow!("tracker.timeout_secs must be > 0"));
        }
        if self.tracker.ready_limit == 0 {
            return Err(anyhow!("tracker.ready_limit must be > 0"));
        }
        if self.vcs.timeout_secs == 0 {
            return Err(anyhow!("vcs.timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

fn is_blank_command(command: &[String]) -> bool {
    command.first().is_none_or(|program| program.trim().is_empty())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
