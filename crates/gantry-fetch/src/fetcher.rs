use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use gantry_core::config::FetchConfig;
use gantry_core::error::{GantryError, Result};
use gantry_core::retry::RetryPolicy;
use gantry_core::types::FetchOutcome;

const PROGRESS_STEP: u64 = 50 * 1024 * 1024;

fn archive_suffix(url: &str) -> Option<&'static str> {
    if url.ends_with(".zip") {
        Some(".zip")
    } else if url.ends_with(".tar") {
        Some(".tar")
    } else {
        None
    }
}

/// Streaming downloader with an existence-based idempotence check and a
/// bounded fixed-delay retry loop.
pub struct Fetcher {
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            retry: RetryPolicy::fixed(
                config.max_attempts,
                Duration::from_secs(config.retry_delay_secs),
            ),
        }
    }

    /// Existence is the whole check: a corrupted file with the right name
    /// passes (known gap, kept for behavior parity). Archive sources are
    /// also checked under their archive-suffixed name.
    pub fn is_downloaded(&self, filename: &str, url: &str, dest: &Path) -> bool {
        let plain = dest.join(filename);
        debug!(path = %plain.display(), "checking file");
        if plain.exists() {
            return true;
        }
        match archive_suffix(url) {
            Some(suffix) => dest.join(format!("{}{}", filename, suffix)).exists(),
            None => false,
        }
    }

    /// Download `url` to `dest/filename`, extracting archives in place.
    ///
    /// Exhausted retries produce `Ok(FetchOutcome::Failed)`, never `Err`;
    /// the orchestrator treats fetch failures as report data.
    pub async fn fetch(&self, filename: &str, url: &str, dest: &Path) -> Result<FetchOutcome> {
        tokio::fs::create_dir_all(dest).await?;

        if self.is_downloaded(filename, url, dest) {
            debug!(filename, "already present");
            return Ok(FetchOutcome::AlreadyPresent);
        }

        // The existence check failed, so anything at the exact destination
        // path is a stale partial download.
        let target = dest.join(filename);
        if target.exists() {
            tokio::fs::remove_file(&target).await?;
        }

        info!(filename, "Downloading");
        let outcome = self
            .retry
            .run("download", || self.download_once(filename, url, dest))
            .await;

        match outcome {
            Ok(()) => Ok(FetchOutcome::NewDownload),
            Err(e) => {
                error!(filename, error = %e, "Download failed after all attempts");
                Ok(FetchOutcome::Failed)
            }
        }
    }

    async fn download_once(&self, filename: &str, url: &str, dest: &Path) -> Result<()> {
        let target = dest.join(filename);
        let result = self.stream_to_file(url, &target).await;
        if let Err(e) = result {
            // No partial leftovers between attempts.
            let _ = tokio::fs::remove_file(&target).await;
            return Err(e);
        }

        if let Some(suffix) = archive_suffix(url) {
            let archive = dest.join(format!("{}{}", filename, suffix));
            tokio::fs::rename(&target, &archive).await?;
            extract(&archive, dest, suffix).await?;
            tokio::fs::remove_file(&archive).await?;
        }
        Ok(())
    }

    async fn stream_to_file(&self, url: &str, target: &Path) -> Result<()> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(GantryError::Server(format!(
                "download returned HTTP {}",
                response.status()
            )));
        }

        let total = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(target).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut next_report = PROGRESS_STEP;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if written >= next_report {
                debug!(
                    written_mb = written / (1024 * 1024),
                    total_mb = total / (1024 * 1024),
                    "download progress"
                );
                next_report += PROGRESS_STEP;
            }
        }
        file.flush().await?;
        Ok(())
    }

    /// Single-shot copy into the staging area: no idempotence check,
    /// always overwrites. Not for model weights.
    pub async fn quick_fetch(
        &self,
        url: &str,
        dest: &Path,
        filename: Option<&str>,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest).await?;
        let filename = match filename {
            Some(name) => name.to_string(),
            None => url
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("download")
                .split('?')
                .next()
                .unwrap_or("download")
                .to_string(),
        };

        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(GantryError::Server(format!(
                "fetch returned HTTP {}",
                response.status()
            )));
        }
        let target = dest.join(filename);
        let bytes = response.bytes().await?;
        tokio::fs::write(&target, &bytes).await?;
        Ok(target)
    }
}

/// Extract with the system tar/unzip, the same way skill tarballs are
/// unpacked elsewhere in the stack.
async fn extract(archive: &Path, dest: &Path, suffix: &str) -> Result<()> {
    let output = if suffix == ".zip" {
        tokio::process::Command::new("unzip")
            .args(["-o", &archive.to_string_lossy(), "-d", &dest.to_string_lossy()])
            .output()
            .await?
    } else {
        tokio::process::Command::new("tar")
            .args(["xf", &archive.to_string_lossy(), "-C", &dest.to_string_lossy()])
            .output()
            .await?
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GantryError::Server(format!(
            "extract failed for {}: {}",
            archive.display(),
            stderr
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher() -> Fetcher {
        Fetcher::new(&FetchConfig {
            max_attempts: 3,
            retry_delay_secs: 0,
            clone_attempts: 5,
        })
    }

    #[tokio::test]
    async fn test_existing_file_short_circuits_network() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.safetensors"), b"weights").unwrap();

        // The URL is unroutable; reaching the network would error out.
        let outcome = fetcher()
            .fetch(
                "model.safetensors",
                "http://invalid.localdomain/model.safetensors",
                dir.path(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn test_archive_suffixed_name_counts_as_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pack.zip"), b"zipped").unwrap();

        let outcome = fetcher()
            .fetch("pack", "http://invalid.localdomain/pack.zip", dir.path())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn test_unreachable_host_reports_failed_without_partial() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = fetcher()
            .fetch(
                "ghost.safetensors",
                "http://invalid.localdomain/ghost.safetensors",
                dir.path(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Failed);
        assert!(!dir.path().join("ghost.safetensors").exists());
    }

    #[tokio::test]
    async fn test_download_succeeds_on_third_attempt() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let server_hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let n = server_hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = if n < 2 {
                    "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                } else {
                    "HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\nweights"
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let url = format!("http://{}/m.safetensors", addr);
        let outcome = fetcher()
            .fetch("m.safetensors", &url, dir.path())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::NewDownload);
        assert_eq!(
            std::fs::read(dir.path().join("m.safetensors")).unwrap(),
            b"weights"
        );
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_archive_suffix_detection() {
        assert_eq!(archive_suffix("http://x/a.zip"), Some(".zip"));
        assert_eq!(archive_suffix("http://x/a.tar"), Some(".tar"));
        assert_eq!(archive_suffix("http://x/a.safetensors"), None);
    }
}
