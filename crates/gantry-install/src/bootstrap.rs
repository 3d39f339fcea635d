use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use gantry_core::config::{FetchConfig, ServerConfig};
use gantry_core::error::{GantryError, Result};
use gantry_core::retry::RetryPolicy;
use gantry_core::types::ExtraNode;

use crate::installer::{repo_name_from_url, run_command};

/// Installs the graph server itself when `base_path` is empty: clone,
/// optional pinned checkout, the management add-on (the registry
/// endpoints come from it), and the server's own requirements.
pub struct ServerBootstrap {
    base_path: PathBuf,
    plugins_dir: PathBuf,
    repo_url: String,
    commit_hash: Option<String>,
    manager_url: String,
    python: String,
    clone_retry: RetryPolicy,
}

impl ServerBootstrap {
    pub fn new(server: &ServerConfig, fetch: &FetchConfig) -> Self {
        Self {
            base_path: server.base_path.clone(),
            plugins_dir: server.plugins_dir(),
            repo_url: server.repo_url.clone(),
            commit_hash: server.commit_hash.clone(),
            manager_url: server.manager_url.clone(),
            python: server.launch_command.clone(),
            clone_retry: RetryPolicy::fixed(fetch.clone_attempts, Duration::from_millis(500)),
        }
    }

    /// The entry script marks a usable installation; nothing deeper is
    /// verified.
    pub fn is_installed(&self) -> bool {
        self.base_path.join("main.py").exists()
    }

    /// Bring the installation up to the configured state. Returns
    /// whether anything was installed or changed. `extra_nodes` may pin
    /// the management add-on to a commit by listing its URL.
    pub async fn ensure_installed(&self, extra_nodes: &[ExtraNode]) -> Result<bool> {
        let mut changed = false;

        if !self.is_installed() {
            info!(url = %self.repo_url, "cloning graph server");
            self.clone_retry
                .run("server clone", || {
                    clone_repo(&self.repo_url, &self.base_path, None)
                })
                .await?;
            changed = true;
        }

        if let Some(hash) = self.commit_hash.clone() {
            self.pin_checkout(&hash).await?;
        }

        let manager_dir = self.plugins_dir.join(repo_name_from_url(&self.manager_url));
        if !manager_dir.exists() {
            let pin = extra_nodes
                .iter()
                .find(|n| n.url.trim_end_matches('/') == self.manager_url.trim_end_matches('/'))
                .and_then(|n| n.commit_hash.as_deref());
            info!(url = %self.manager_url, "installing management add-on");
            self.clone_retry
                .run("manager clone", || {
                    clone_repo(&self.manager_url, &manager_dir, pin)
                })
                .await?;
            changed = true;
        }

        if self.install_missing_requirements().await? {
            changed = true;
        }
        Ok(changed)
    }

    async fn pin_checkout(&self, hash: &str) -> Result<()> {
        let head = command_stdout("git", &["rev-parse", "HEAD"], &self.base_path).await?;
        if head.trim() == hash {
            return Ok(());
        }
        info!(hash, "moving server checkout to pinned commit");
        run_command("git", &["fetch", "origin"], &self.base_path).await?;
        run_command("git", &["checkout", hash], &self.base_path).await
    }

    /// Name-only comparison against `pip list`; versions are not
    /// checked, and a package published under a different name than its
    /// requirements line will always look missing.
    async fn install_missing_requirements(&self) -> Result<bool> {
        let requirements = self.base_path.join("requirements.txt");
        if !requirements.exists() {
            return Ok(false);
        }
        let declared = requirement_names(&tokio::fs::read_to_string(&requirements).await?);
        let installed: HashSet<String> = command_stdout(
            &self.python,
            &["-m", "pip", "list", "--format=freeze"],
            &self.base_path,
        )
        .await
        .map(|raw| requirement_names(&raw).into_iter().collect())
        .unwrap_or_default();

        let missing: Vec<&String> = declared.iter().filter(|n| !installed.contains(*n)).collect();
        if missing.is_empty() {
            return Ok(false);
        }
        debug!(count = missing.len(), "installing missing server requirements");
        run_command(
            &self.python,
            &["-m", "pip", "install", "-r", &requirements.to_string_lossy()],
            &self.base_path,
        )
        .await?;
        Ok(true)
    }
}

async fn clone_repo(url: &str, dest: &Path, commit: Option<&str>) -> Result<()> {
    if dest.exists() {
        tokio::fs::remove_dir_all(dest).await?;
    }
    let parent = dest.parent().unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(parent).await?;
    run_command(
        "git",
        &["clone", "--recursive", url, &dest.to_string_lossy()],
        parent,
    )
    .await?;
    if let Some(hash) = commit {
        run_command("git", &["checkout", hash], dest).await?;
    }
    Ok(())
}

async fn command_stdout(program: &str, args: &[&str], cwd: &Path) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()
        .await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(GantryError::Install {
            plugin: program.to_string(),
            message: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Lowercased package names from a requirements-style listing, version
/// specifiers stripped.
fn requirement_names(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            line.split(['=', '<', '>', '~'])
                .next()
                .map(|name| name.trim().to_lowercase())
        })
        .filter(|name| !name.is_empty())
        .collect()
}
