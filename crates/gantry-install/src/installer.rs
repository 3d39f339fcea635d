use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use gantry_core::config::{FetchConfig, ServerConfig};
use gantry_core::error::{GantryError, Result};
use gantry_core::retry::RetryPolicy;
use gantry_core::types::{InstallType, PluginDescriptor};
use gantry_fetch::Fetcher;

/// Installs plugin packages into the server's plugin directory and runs
/// each plugin's own install steps.
pub struct NodeInstaller {
    plugins_dir: PathBuf,
    assets_dir: PathBuf,
    python: String,
    fetcher: Fetcher,
    clone_retry: RetryPolicy,
}

impl NodeInstaller {
    pub fn new(server: &ServerConfig, fetch: &FetchConfig) -> Self {
        Self {
            plugins_dir: server.plugins_dir(),
            assets_dir: server.base_path.join("web").join("extensions"),
            python: server.launch_command.clone(),
            fetcher: Fetcher::new(fetch),
            clone_retry: RetryPolicy::fixed(fetch.clone_attempts, Duration::from_millis(500)),
        }
    }

    /// Run a descriptor's primary install step, then its declared pip
    /// list regardless of that step's outcome. Returns whether the
    /// primary step succeeded.
    pub async fn install(&self, descriptor: &PluginDescriptor) -> Result<bool> {
        let status = match descriptor.install_type {
            InstallType::GitClone => self.git_clone_install(descriptor).await,
            InstallType::Unzip => self.unzip_install(descriptor).await,
            InstallType::Copy => self.copy_install(descriptor).await,
        };

        for package in &descriptor.pip {
            if let Err(e) = self.pip_install(package, &self.plugins_dir).await {
                warn!(package = %package, error = %e, "declared dependency install failed");
            }
        }

        status
    }

    async fn git_clone_install(&self, descriptor: &PluginDescriptor) -> Result<bool> {
        for url in &descriptor.files {
            let url = url.trim_end_matches('/');
            if !is_valid_url(url) {
                return Err(GantryError::Install {
                    plugin: descriptor.title.clone(),
                    message: format!("invalid git url: {}", url),
                });
            }

            let repo_name = repo_name_from_url(url);
            let repo_path = self.plugins_dir.join(&repo_name);
            let commit = descriptor.commit_hash.as_deref();

            let cloned = self
                .clone_retry
                .run("git clone", || self.clone_once(url, &repo_path, commit))
                .await;
            if let Err(e) = cloned {
                warn!(repo = %repo_name, error = %e, "clone failed after all attempts");
                return Ok(false);
            }
            info!(repo = %repo_name, "cloned");

            if !self.run_plugin_install_steps(&repo_path).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// One clone attempt: clean slate, clone, optional pinned checkout.
    async fn clone_once(&self, url: &str, repo_path: &Path, commit: Option<&str>) -> Result<()> {
        if repo_path.exists() {
            tokio::fs::remove_dir_all(repo_path).await?;
        }
        tokio::fs::create_dir_all(&self.plugins_dir).await?;

        run_command(
            "git",
            &["clone", "--recursive", url, &repo_path.to_string_lossy()],
            &self.plugins_dir,
        )
        .await?;

        if let Some(hash) = commit {
            debug!(repo = %repo_path.display(), hash, "checking out pinned commit");
            run_command("git", &["checkout", hash], repo_path).await?;
        }
        Ok(())
    }

    /// The plugin's own requirements file and install script. A single
    /// requirement failing does not abort the remaining lines; a failing
    /// install script fails the plugin.
    async fn run_plugin_install_steps(&self, repo_path: &Path) -> Result<bool> {
        let requirements = repo_path.join("requirements.txt");
        if requirements.exists() {
            debug!(repo = %repo_path.display(), "installing plugin requirements");
            let raw = tokio::fs::read_to_string(&requirements).await?;
            for line in raw.lines() {
                let package = line.trim();
                if package.is_empty() || package.starts_with('#') {
                    continue;
                }
                if let Err(e) = self.pip_install(package, repo_path).await {
                    warn!(package, error = %e, "requirement install failed, continuing");
                }
            }
        }

        let install_script = repo_path.join("install.py");
        if install_script.exists() {
            debug!(repo = %repo_path.display(), "running plugin install script");
            if let Err(e) = run_command(&self.python, &["install.py"], repo_path).await {
                warn!(repo = %repo_path.display(), error = %e, "install script failed");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Download-and-extract into the plugins root. One bad URL aborts the
    /// whole descriptor.
    async fn unzip_install(&self, descriptor: &PluginDescriptor) -> Result<bool> {
        tokio::fs::create_dir_all(&self.plugins_dir).await?;
        for url in &descriptor.files {
            let url = url.trim_end_matches('/');
            let archive = match self
                .fetcher
                .quick_fetch(url, &self.plugins_dir, Some("plugin-temp.zip"))
                .await
            {
                Ok(path) => path,
                Err(e) => {
                    warn!(url, error = %e, "unzip install download failed");
                    return Ok(false);
                }
            };

            let extract = run_command(
                "unzip",
                &[
                    "-o",
                    &archive.to_string_lossy(),
                    "-d",
                    &self.plugins_dir.to_string_lossy(),
                ],
                &self.plugins_dir,
            )
            .await;
            let _ = tokio::fs::remove_file(&archive).await;
            if let Err(e) = extract {
                warn!(url, error = %e, "unzip install extract failed");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Per-file copy: scripts into the plugins directory, everything else
    /// into a per-plugin asset subdirectory.
    async fn copy_install(&self, descriptor: &PluginDescriptor) -> Result<bool> {
        for url in &descriptor.files {
            let url = url.trim_end_matches('/');
            let dest = if url.ends_with(".py") {
                self.plugins_dir.clone()
            } else {
                match descriptor.js_path.as_deref() {
                    Some(sub) => self.assets_dir.join(sub),
                    None => self.assets_dir.clone(),
                }
            };
            if let Err(e) = self.fetcher.quick_fetch(url, &dest, None).await {
                warn!(url, error = %e, "copy install failed");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn pip_install(&self, package: &str, cwd: &Path) -> Result<()> {
        run_command(&self.python, &["-m", "pip", "install", package], cwd).await
    }
}

fn is_valid_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

pub(crate) fn repo_name_from_url(url: &str) -> String {
    let base = url.rsplit('/').next().unwrap_or(url);
    base.trim_end_matches(".git").to_string()
}

pub(crate) async fn run_command(program: &str, args: &[&str], cwd: &Path) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()
        .await?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        Err(GantryError::Install {
            plugin: program.to_string(),
            message: if stderr.is_empty() { stdout } else { stderr },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_name_from_url() {
        assert_eq!(
            repo_name_from_url("https://github.com/acme/graph-nodes.git"),
            "graph-nodes"
        );
        assert_eq!(
            repo_name_from_url("https://github.com/acme/graph-nodes"),
            "graph-nodes"
        );
    }

    #[test]
    fn test_is_valid_url() {
        assert!(is_valid_url("https://github.com/acme/pack"));
        assert!(!is_valid_url("git@github.com:acme/pack.git"));
    }

    #[tokio::test]
    async fn test_invalid_git_url_is_an_install_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerConfig {
            base_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let installer = NodeInstaller::new(&server, &FetchConfig::default());

        let descriptor = PluginDescriptor::from_git_url("not-a-url", None);
        let err = installer.install(&descriptor).await.unwrap_err();
        assert!(matches!(err, GantryError::Install { .. }));
    }
}
