//! Configuration for voxnote.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (VOXNOTE_HOME, VOXNOTE_DB, VOXNOTE_BLOBS,
//!    VOXNOTE_API_BASE, VOXNOTE_API_KEY / OPENAI_API_KEY)
//! 2. Config file (.voxnote/config.yaml)
//! 3. Defaults (~/.voxnote)
//!
//! Config file discovery:
//! - Searches current directory and parents for .voxnote/config.yaml
//! - Paths in config file are relative to the .voxnote/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::openai::DEFAULT_API_BASE;
use crate::adapters::CompletionOptions;
use crate::core::{
    BatchSettings, CallTimeouts, CircuitConfig, OrchestratorSettings, QuotaLimits,
    RecoverySettings, RetryPolicy,
};
use crate::stages::SalvagePolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".voxnote";
const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub quota: QuotaLimits,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub recovery: RecoverySettings,
    #[serde(default)]
    pub salvage: SalvagePolicy,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            paths: PathsConfig::default(),
            quota: QuotaLimits::default(),
            circuit: CircuitConfig::default(),
            retry: RetryPolicy::default(),
            batch: BatchSettings::default(),
            recovery: RecoverySettings::default(),
            salvage: SalvagePolicy::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .voxnote/)
    pub home: Option<String>,
    /// SQLite database file (relative to .voxnote/)
    pub db: Option<String>,
    /// Audio blob directory (relative to .voxnote/)
    pub blobs: Option<String>,
}

/// External provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Never written back out; prefer the environment
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,

    #[serde(default = "default_analysis_model")]
    pub analysis_model: String,

    /// ISO-639-1 language hint for transcription
    #[serde(default)]
    pub language: Option<String>,

    #[serde(default = "default_transcription_timeout")]
    pub transcription_timeout_seconds: u64,

    #[serde(default = "default_analysis_timeout")]
    pub analysis_timeout_seconds: u64,

    #[serde(default = "default_storage_timeout")]
    pub storage_timeout_seconds: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Completed notes given to the analysis as context
    #[serde(default = "default_prior_context_limit")]
    pub prior_context_limit: usize,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}
fn default_transcription_model() -> String {
    "whisper-1".to_string()
}
fn default_analysis_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_transcription_timeout() -> u64 {
    60
}
fn default_analysis_timeout() -> u64 {
    30
}
fn default_storage_timeout() -> u64 {
    30
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_temperature() -> f32 {
    0.2
}
fn default_prior_context_limit() -> usize {
    5
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key: None,
            transcription_model: default_transcription_model(),
            analysis_model: default_analysis_model(),
            language: None,
            transcription_timeout_seconds: default_transcription_timeout(),
            analysis_timeout_seconds: default_analysis_timeout(),
            storage_timeout_seconds: default_storage_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            prior_context_limit: default_prior_context_limit(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// SQLite database file
    pub db_path: PathBuf,
    /// Audio blob directory
    pub blobs_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Whether an API key was found (the key itself is never serialized)
    pub api_key_set: bool,
    /// Tunables from the config file, after env overrides
    pub settings: ConfigFile,
}

impl ResolvedConfig {
    pub fn api_key(&self) -> Option<&str> {
        self.settings.providers.api_key.as_deref()
    }

    /// Settings for [`crate::core::Orchestrator`]
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let s = &self.settings;
        let p = &s.providers;
        OrchestratorSettings {
            quota: s.quota.clone(),
            circuit: s.circuit.clone(),
            retry: s.retry.clone(),
            batch: s.batch.clone(),
            recovery: s.recovery.clone(),
            salvage: s.salvage.clone(),
            timeouts: CallTimeouts {
                transcription: Duration::from_secs(p.transcription_timeout_seconds),
                analysis: Duration::from_secs(p.analysis_timeout_seconds),
                storage: Duration::from_secs(p.storage_timeout_seconds),
            },
            prior_context_limit: p.prior_context_limit,
            language: p.language.clone(),
            completion: CompletionOptions {
                max_tokens: p.max_tokens,
                temperature: p.temperature,
                json_mode: true,
            },
        }
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
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

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Build the resolved config from an optional file and an env lookup
fn resolve(
    config_file: Option<PathBuf>,
    default_home: PathBuf,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let mut settings = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    // Relative paths in the file hang off .voxnote/
    let base = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);
    let from_file = |value: &Option<String>| -> Option<PathBuf> {
        match (&base, value) {
            (Some(base), Some(value)) => Some(resolve_path(base, value)),
            _ => None,
        }
    };

    let home = env("VOXNOTE_HOME")
        .map(PathBuf::from)
        .or_else(|| from_file(&settings.paths.home))
        .unwrap_or(default_home);

    let db_path = env("VOXNOTE_DB")
        .map(PathBuf::from)
        .or_else(|| from_file(&settings.paths.db))
        .unwrap_or_else(|| home.join("voxnote.db"));

    let blobs_dir = env("VOXNOTE_BLOBS")
        .map(PathBuf::from)
        .or_else(|| from_file(&settings.paths.blobs))
        .unwrap_or_else(|| home.join("blobs"));

    if let Some(api_base) = env("VOXNOTE_API_BASE") {
        settings.providers.api_base = api_base;
    }
    if let Some(key) = env("VOXNOTE_API_KEY").or_else(|| env("OPENAI_API_KEY")) {
        settings.providers.api_key = Some(key);
    }
    settings.providers.api_key = settings
        .providers
        .api_key
        .take()
        .filter(|key| !key.trim().is_empty());

    Ok(ResolvedConfig {
        home,
        db_path,
        blobs_dir,
        config_file,
        api_key_set: settings.providers.api_key.is_some(),
        settings,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    resolve(find_config_file(&cwd), default_home, |key| {
        std::env::var(key).ok()
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the voxnote home directory
pub fn voxnote_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}
