use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// How to launch the external fuzzing engine and its reproducer runner.
///
/// Argument templates: `{config}` and `{workdir}` are substituted in `command`,
/// `{program}` in `replay-command`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    pub command: Vec<String>,
    pub replay_command: Vec<String>,
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    #[serde(default = "default_replay_timeout_ms")]
    pub replay_timeout_ms: u64,
    #[serde(default = "default_target")]
    pub target: String,
}

impl EngineSettings {
    pub fn replay_timeout(&self) -> Duration {
        Duration::from_millis(self.replay_timeout_ms)
    }
}

pub fn default_workdir() -> PathBuf {
    PathBuf::from("./.kdrift_work")
}

pub fn default_replay_timeout_ms() -> u64 {
    30_000
}

fn default_target() -> String {
    "linux/amd64".to_string()
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DetectorSettings {
    /// Stack frames kept per crash.
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    /// Lines buffered after a trigger before the report is closed.
    #[serde(default = "default_max_capture_lines")]
    pub max_capture_lines: usize,
}

pub fn default_max_frames() -> usize {
    32
}

pub fn default_max_capture_lines() -> usize {
    256
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            max_frames: default_max_frames(),
            max_capture_lines: default_max_capture_lines(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MinimizerSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_oracle_calls")]
    pub max_oracle_calls: usize,
}

pub fn default_workers() -> usize {
    2
}

pub fn default_max_oracle_calls() -> usize {
    2000
}

impl Default for MinimizerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_oracle_calls: default_max_oracle_calls(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignSettings {
    /// Where crash artifacts are persisted. Nothing is written when unset.
    #[serde(default)]
    pub crash_dir: Option<PathBuf>,
    #[serde(default = "default_log_poll_ms")]
    pub log_poll_ms: u64,
}

fn default_log_poll_ms() -> u64 {
    100
}

impl CampaignSettings {
    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_ms.max(1))
    }
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            crash_dir: None,
            log_poll_ms: default_log_poll_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct KdriftConfig {
    #[serde(default)]
    pub engine: Option<EngineSettings>,
    #[serde(default)]
    pub detector: DetectorSettings,
    #[serde(default)]
    pub minimizer: MinimizerSettings,
    #[serde(default)]
    pub campaign: CampaignSettings,
}

impl KdriftConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
