//! Configuration for castwright.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CASTWRIGHT_HOME, SPEECH_KEY, SPEECH_REGION)
//! 2. Config file (.castwright/config.yaml)
//! 3. Defaults (~/.castwright)
//!
//! Config file discovery:
//! - Searches current directory and parents for .castwright/config.yaml
//! - `paths.home` is relative to the .castwright/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::voices::VoiceCasting;
use crate::core::{RetryPolicy, SafetyLimits};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub safety: SafetyLimits,
    #[serde(default)]
    pub podcast: PodcastConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub fabric: FabricConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Store directory (relative to .castwright/)
    pub home: Option<String>,
}

/// Which adapter composes host segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComposerKind {
    /// LLM-written intro, transitions and outro via fabric
    Fabric,

    /// Fixed templates, no external calls
    Template,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodcastConfig {
    #[serde(default = "default_length_minutes")]
    pub default_length_minutes: u32,

    /// Insert host transitions between adjacent stories
    #[serde(default = "default_true")]
    pub show_transitions: bool,

    /// Voice for intro, transitions and outro
    #[serde(default = "default_host_voice")]
    pub host_voice: String,

    /// Voices that take turns reading stories
    #[serde(default = "default_reporter_voices")]
    pub reporter_voices: Vec<String>,

    #[serde(default = "default_composer")]
    pub composer: ComposerKind,
}

fn default_length_minutes() -> u32 {
    5
}
fn default_true() -> bool {
    true
}
fn default_host_voice() -> String {
    "en-US-JennyNeural".to_string()
}
fn default_reporter_voices() -> Vec<String> {
    vec!["en-US-GuyNeural".to_string(), "en-US-DavisNeural".to_string()]
}
fn default_composer() -> ComposerKind {
    ComposerKind::Fabric
}

impl Default for PodcastConfig {
    fn default() -> Self {
        Self {
            default_length_minutes: default_length_minutes(),
            show_transitions: default_true(),
            host_voice: default_host_voice(),
            reporter_voices: default_reporter_voices(),
            composer: default_composer(),
        }
    }
}

impl PodcastConfig {
    pub fn casting(&self) -> VoiceCasting {
        VoiceCasting {
            host_voice: self.host_voice.clone(),
            reporter_voices: self.reporter_voices.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Minimum time between forwarded updates of one job
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,
}

fn default_min_interval() -> u64 {
    500
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval(),
        }
    }
}

impl ProgressConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Fabric binary; detected (fabric-ai, then fabric) when unset
    #[serde(default)]
    pub binary: Option<String>,

    #[serde(default = "default_segments_pattern")]
    pub segments_pattern: String,

    #[serde(default = "default_host_pattern")]
    pub host_pattern: String,
}

fn default_segments_pattern() -> String {
    "create_podcast_segments".to_string()
}
fn default_host_pattern() -> String {
    "write_podcast_host".to_string()
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            binary: None,
            segments_pattern: default_segments_pattern(),
            host_pattern: default_host_pattern(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechConfig {
    #[serde(default)]
    pub region: Option<String>,

    /// Subscription key; never written back out
    #[serde(default, skip_serializing)]
    pub key: Option<String>,

    #[serde(default = "default_output_format")]
    pub output_format: String,
}

fn default_output_format() -> String {
    crate::adapters::azure_speech::DEFAULT_OUTPUT_FORMAT.to_string()
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            region: None,
            key: None,
            output_format: default_output_format(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to castwright home (store, journals)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub safety: SafetyLimits,
    pub podcast: PodcastConfig,
    pub progress: ProgressConfig,
    pub fabric: FabricConfig,
    pub speech: SpeechConfig,
}

impl ResolvedConfig {
    /// Root of the resource store
    pub fn store_dir(&self) -> PathBuf {
        self.home.join("store")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".castwright").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Environment overrides, gathered separately so resolution stays testable
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<String>,
    speech_key: Option<String>,
    speech_region: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            home: var("CASTWRIGHT_HOME"),
            speech_key: var("SPEECH_KEY"),
            speech_region: var("SPEECH_REGION"),
        }
    }
}

/// Merge file, environment and defaults
fn resolve(
    config_path: Option<PathBuf>,
    file: ConfigFile,
    env: EnvOverrides,
    default_home: PathBuf,
) -> ResolvedConfig {
    let home = if let Some(env_home) = env.home {
        PathBuf::from(env_home)
    } else if let (Some(path), Some(home_path)) = (&config_path, &file.paths.home) {
        // home is relative to .castwright/ directory
        let castwright_dir = path.parent().unwrap_or(Path::new("."));
        resolve_path(castwright_dir, home_path)
    } else {
        default_home
    };

    let mut speech = file.speech;
    if env.speech_key.is_some() {
        speech.key = env.speech_key;
    }
    if env.speech_region.is_some() {
        speech.region = env.speech_region;
    }

    ResolvedConfig {
        home,
        config_file: config_path,
        retry: file.retry,
        safety: file.safety,
        podcast: file.podcast,
        progress: file.progress,
        fabric: file.fabric,
        speech,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".castwright");

    let config_path = find_config_file();
    let file = match config_path {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(resolve(config_path, file, EnvOverrides::from_env(), default_home))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the castwright home directory
pub fn castwright_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}
