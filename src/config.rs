use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

fn empty_path_none<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<PathBuf>::deserialize(deserializer)?;
    Ok(opt.and_then(|path| {
        if path.as_os_str().is_empty() {
            None
        } else {
            Some(path)
        }
    }))
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config io error: {}", err),
            ConfigError::Parse(err) => write!(f, "config parse error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub run: RunConfig,
    pub stats: StatsConfig,
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            capture: CaptureConfig::default(),
            run: RunConfig::default(),
            stats: StatsConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&raw).map_err(ConfigError::Parse)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub interface: Option<String>,
    #[serde(deserialize_with = "empty_path_none")]
    pub read_file: Option<PathBuf>,
    pub promiscuous: bool,
    pub immediate: bool,
    pub snaplen: i32,
    pub buffer_size: i32,
    pub timeout_ms: i32,
    pub timestamp_source: Option<String>,
    pub filter: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            interface: None,
            read_file: None,
            promiscuous: true,
            immediate: false,
            snaplen: 128,
            buffer_size: 10 * 1024 * 1024,
            timeout_ms: 100,
            timestamp_source: None,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Stop after this many packets (0 = unlimited).
    pub count: u64,
    /// Capacity of the capture queue.
    pub queue_capacity: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            count: 0,
            queue_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            enabled: false,
            interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    #[serde(deserialize_with = "empty_path_none")]
    pub export_json: Option<PathBuf>,
    pub quiet: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            export_json: None,
            quiet: false,
        }
    }
}
