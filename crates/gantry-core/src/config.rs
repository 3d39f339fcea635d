use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GantryError, Result};

/// Top-level gantry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registries: RegistryConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            registries: RegistryConfig::default(),
            fetch: FetchConfig::default(),
            staging: StagingConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(GantryError::ConfigNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| GantryError::Config(e.to_string()))
    }
}

/// The graph-execution server: where it listens and how to launch it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Install root of the server (plugins, models, input and output
    /// trees all live under it).
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    #[serde(default = "default_launch_command")]
    pub launch_command: String,
    #[serde(default)]
    pub launch_args: Vec<String>,
    /// Where to clone the server from when `base_path` is empty.
    #[serde(default = "default_repo_url")]
    pub repo_url: String,
    /// Pin the server checkout to a specific commit.
    #[serde(default)]
    pub commit_hash: Option<String>,
    /// The management add-on, installed into the plugins directory at
    /// bootstrap; the registry endpoints come from it.
    #[serde(default = "default_manager_url")]
    pub manager_url: String,
    /// Forward the server's own stdout/stderr instead of discarding it.
    #[serde(default)]
    pub debug_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            port: default_port(),
            base_path: default_base_path(),
            launch_command: default_launch_command(),
            launch_args: Vec::new(),
            repo_url: default_repo_url(),
            commit_hash: None,
            manager_url: default_manager_url(),
            debug_logs: false,
        }
    }
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    /// Host portion for the WebSocket push channel.
    pub fn ws_host(&self) -> String {
        let host = self
            .addr
            .trim_start_matches("http://")
            .trim_start_matches("https://");
        format!("{}:{}", host, self.port)
    }

    pub fn models_dir(&self) -> PathBuf {
        self.base_path.join("models")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.base_path.join("custom_nodes")
    }

    pub fn input_dir(&self) -> PathBuf {
        self.base_path.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.base_path.join("output")
    }
}

fn default_addr() -> String {
    "http://127.0.0.1".into()
}
fn default_port() -> u16 {
    8188
}
fn default_base_path() -> PathBuf {
    PathBuf::from("./server")
}
fn default_launch_command() -> String {
    "python".into()
}
fn default_repo_url() -> String {
    "https://github.com/comfyanonymous/ComfyUI".into()
}
fn default_manager_url() -> String {
    "https://github.com/ltdrdata/ComfyUI-Manager".into()
}

/// Registry sources, in priority order (earliest wins on collision).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Local registry files mapping filename -> { url, dest }.
    #[serde(default)]
    pub local: Vec<PathBuf>,
    /// Models the run may reference without triggering a download.
    #[serde(default = "default_optional_models")]
    pub optional_models: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            local: Vec::new(),
            optional_models: default_optional_models(),
        }
    }
}

fn default_optional_models() -> Vec<String> {
    vec!["stmfnet.pth".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_clone_attempts")]
    pub clone_attempts: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            clone_attempts: default_clone_attempts(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    3
}
fn default_clone_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Bounded pool size for input staging copies/downloads.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_log")]
    pub log_path: PathBuf,
    /// Readers refresh the in-memory cache at most this often.
    #[serde(default = "default_refresh_secs")]
    pub refresh_interval_secs: u64,
    /// Bounded wait for the advisory lock before surfacing an error.
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            log_path: default_status_log(),
            refresh_interval_secs: default_refresh_secs(),
            lock_wait_secs: default_lock_wait_secs(),
        }
    }
}

fn default_status_log() -> PathBuf {
    PathBuf::from("./generation_status.jsonl")
}
fn default_refresh_secs() -> u64 {
    1
}
fn default_lock_wait_secs() -> u64 {
    5
}
