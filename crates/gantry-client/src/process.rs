use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use gantry_core::config::ServerConfig;
use gantry_core::error::{GantryError, Result};

use crate::api::ServerClient;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Owns (or adopts) the singleton graph server on the configured port.
///
/// "Port already owned by a healthy peer" is success, not conflict; a
/// port owner that fails the liveness probe is a hard error.
pub struct ServerProcess {
    config: ServerConfig,
    child: Option<Child>,
}

impl ServerProcess {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            child: None,
        }
    }

    pub async fn port_open(&self) -> bool {
        let addr = format!("127.0.0.1:{}", self.config.port);
        tokio::time::timeout(Duration::from_millis(300), TcpStream::connect(&addr))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Launch the server if its port is unowned and wait for it to accept
    /// connections; otherwise probe the existing owner.
    pub async fn ensure_running(&mut self, client: &ServerClient) -> Result<()> {
        if self.port_open().await {
            if client.health_check().await {
                debug!("server already running");
                return Ok(());
            }
            return Err(GantryError::PortConflict(self.config.port));
        }

        let mut command = Command::new(&self.config.launch_command);
        command
            .args(&self.config.launch_args)
            .arg("--port")
            .arg(self.config.port.to_string())
            .current_dir(&self.config.base_path);
        if !self.config.debug_logs {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        let child = command.spawn()?;
        info!(port = self.config.port, "launched graph server");
        self.child = Some(child);

        let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
        while !self.port_open().await {
            if tokio::time::Instant::now() > deadline {
                return Err(GantryError::Server(
                    "server did not start accepting connections".into(),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        debug!("graph server is accepting connections");
        Ok(())
    }

    /// Stop the server: our own child if we spawned one, otherwise the
    /// port owner located via lsof.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            child.kill().await?;
            let _ = child.wait().await;
        } else if self.port_open().await {
            match pid_owning_port(self.config.port).await {
                Some(pid) => {
                    let _ = Command::new("kill").arg(pid.to_string()).output().await;
                }
                None => {
                    warn!(port = self.config.port, "no pid found for open port");
                    return Ok(());
                }
            }
        }

        let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
        while self.port_open().await {
            if tokio::time::Instant::now() > deadline {
                return Err(GantryError::Server("server did not release its port".into()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        info!("graph server stopped");
        Ok(())
    }

    pub async fn restart(&mut self, client: &ServerClient) -> Result<()> {
        self.stop().await?;
        self.ensure_running(client).await
    }
}

async fn pid_owning_port(port: u16) -> Option<u32> {
    let output = Command::new("lsof")
        .args(["-ti", &format!(":{}", port)])
        .output()
        .await
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()?
        .trim()
        .parse()
        .ok()
}
