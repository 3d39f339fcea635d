use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gantry_catalog::{Catalog, ModelResolver, Resolution};
use gantry_client::{RemoteNodeEntry, ServerClient, ServerProcess};
use gantry_core::config::AppConfig;
use gantry_core::error::{GantryError, Result};
use gantry_core::types::{
    ExtraModel, ExtraNode, FetchOutcome, IgnoredModel, InputFile, MissingModel,
    ModelInstallReport, NodeInstallReport, PluginDescriptor, RunOutput, WorkflowGraph,
};
use gantry_fetch::fsutil::{clear_directory, search_file};
use gantry_fetch::Fetcher;
use gantry_install::{find_missing, NodeInstaller, ServerBootstrap};
use gantry_status::{CancelStore, FileCancelStore};

use crate::rewrite::rewrite_model_paths;
use crate::stage;

const QUEUE_POLL_ATTEMPTS: u32 = 12;
const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything one run needs beyond the graph itself.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Path to a graph file, or the graph JSON inline.
    pub workflow: String,
    /// Input files to stage before dispatch.
    pub file_paths: Vec<InputFile>,
    /// Models fetched by explicit source, outside registry resolution.
    pub extra_models: Vec<ExtraModel>,
    /// Plugins installed by git URL, outside registry detection.
    pub extra_nodes: Vec<ExtraNode>,
    /// Models the caller placed manually; checked for existence only.
    pub ignore_models: Vec<IgnoredModel>,
    /// Where collected outputs land.
    pub output_folder: PathBuf,
    /// Restrict output collection to these node ids; empty means all.
    pub output_node_ids: Vec<String>,
    /// Identity for the push channel and for cancellation.
    pub client_id: String,
    pub stop_server_after: bool,
}

impl RunRequest {
    pub fn new(workflow: impl Into<String>, output_folder: impl Into<PathBuf>) -> Self {
        Self {
            workflow: workflow.into(),
            file_paths: Vec::new(),
            extra_models: Vec::new(),
            extra_nodes: Vec::new(),
            ignore_models: Vec::new(),
            output_folder: output_folder.into(),
            output_node_ids: Vec::new(),
            client_id: Uuid::new_v4().to_string(),
            stop_server_after: false,
        }
    }
}

/// Drives a workflow end to end: server lifecycle, dependency install,
/// input staging, dispatch, and output collection.
pub struct Runner {
    config: AppConfig,
    client: ServerClient,
    process: ServerProcess,
    fetcher: Fetcher,
    cancel: FileCancelStore,
}

impl Runner {
    pub fn new(config: AppConfig) -> Self {
        let client = ServerClient::new(config.server.base_url());
        let process = ServerProcess::new(config.server.clone());
        let fetcher = Fetcher::new(&config.fetch);
        let cancel = FileCancelStore::new(&config.status);
        Self {
            config,
            client,
            process,
            fetcher,
            cancel,
        }
    }

    /// Run a workflow to completion.
    ///
    /// A graph that is not API-format is the one hard error. Everything
    /// downstream of validation degrades into the returned `RunOutput`:
    /// cancellation sets `cancelled`, missing models fill
    /// `models_not_found`, and an infrastructure failure yields an empty
    /// output after logging.
    pub async fn run(&mut self, request: &RunRequest) -> Result<RunOutput> {
        let graph = WorkflowGraph::load(&request.workflow)?;

        match self.run_stages(graph, request).await {
            Ok(output) => Ok(output),
            Err(GantryError::Cancelled) => {
                info!(client_id = %request.client_id, "run cancelled");
                Ok(RunOutput {
                    cancelled: true,
                    ..Default::default()
                })
            }
            Err(e) => {
                error!(error = %e, "run failed");
                Ok(RunOutput::default())
            }
        }
    }

    async fn run_stages(&mut self, mut graph: WorkflowGraph, request: &RunRequest) -> Result<RunOutput> {
        self.check_cancelled(&request.client_id)?;
        if !self.process.port_open().await {
            let bootstrap = ServerBootstrap::new(&self.config.server, &self.config.fetch);
            bootstrap.ensure_installed(&request.extra_nodes).await?;
        }
        self.process.ensure_running(&self.client).await?;

        let node_report = self.install_nodes(&graph, request).await?;
        let model_report = self.install_models(&graph, request).await?;

        if node_report.nodes_installed || model_report.models_downloaded {
            info!("dependencies changed, restarting server");
            self.process.restart(&self.client).await?;
        }

        if !model_report.status() {
            warn!(
                missing = model_report.models_not_found.len(),
                "unresolved models, not dispatching"
            );
            return Ok(RunOutput {
                models_not_found: model_report.models_not_found,
                ..Default::default()
            });
        }

        rewrite_model_paths(
            &mut graph,
            &self.config.server.models_dir(),
            &self.config.registries.optional_models,
        );

        stage::stage_inputs(
            &self.fetcher,
            &self.config.server.input_dir(),
            &request.file_paths,
            self.config.staging.workers,
        )
        .await?;

        self.check_cancelled(&request.client_id)?;
        // Subscribe before queueing: the server pushes events only to
        // clients connected at emission time, and a fast graph completes
        // before a post-dispatch subscription would land.
        let channel =
            gantry_client::ws::connect(&self.config.server.ws_host(), &request.client_id).await?;
        let prompt_id = self.client.queue_prompt(&graph, &request.client_id).await?;
        channel.await_completion(&prompt_id).await?;

        let history = self.client.history(&prompt_id).await?;
        let (filenames, text_output) =
            stage::extract_outputs(&history, &prompt_id, &request.output_node_ids);
        let file_paths = stage::collect_outputs(
            &filenames,
            &self.config.server.output_dir(),
            &request.output_folder,
        );
        clear_directory(&self.config.server.output_dir())?;

        if request.stop_server_after {
            self.process.stop().await?;
        }

        info!(
            outputs = file_paths.len(),
            text_lines = text_output.len(),
            "run complete"
        );
        Ok(RunOutput {
            file_paths,
            text_output,
            models_not_found: model_report.models_not_found,
            cancelled: false,
        })
    }

    /// Scan the graph for unregistered node types and install their
    /// owning plugins. Registry-known plugins go through the management
    /// add-on; pinned or registry-unknown URLs are installed locally.
    /// One plugin failing does not stop its siblings.
    pub async fn install_nodes(
        &self,
        graph: &WorkflowGraph,
        request: &RunRequest,
    ) -> Result<NodeInstallReport> {
        let registered = self.client.registered_nodes().await?;
        let name_to_url = self.client.node_mappings().await.unwrap_or_else(|e| {
            warn!(error = %e, "node mapping endpoint unavailable");
            Default::default()
        });
        let custom_nodes = self.client.custom_node_list().await.unwrap_or_else(|e| {
            warn!(error = %e, "plugin registry unavailable");
            Vec::new()
        });

        let detection = find_missing(graph, &registered, &name_to_url, &custom_nodes);
        for unresolved in &detection.unresolved {
            warn!(node_type = %unresolved, "no plugin provides this node type");
        }

        let mut report = NodeInstallReport {
            nodes_installed: false,
            unresolved_types: detection.unresolved,
        };

        for entry in &detection.plugins {
            self.check_cancelled(&request.client_id)?;
            if entry.is_installed() {
                debug!(title = %entry.title, "plugin already installed");
                continue;
            }
            match self.client.install_custom_node(entry).await {
                Ok(true) => {
                    info!(title = %entry.title, "plugin installed");
                    report.nodes_installed = true;
                }
                Ok(false) => warn!(title = %entry.title, "plugin install rejected"),
                Err(e) => warn!(title = %entry.title, error = %e, "plugin install failed"),
            }
        }

        for extra in &request.extra_nodes {
            self.check_cancelled(&request.client_id)?;
            if self.install_extra_node(extra, &custom_nodes).await? {
                report.nodes_installed = true;
            }
        }

        Ok(report)
    }

    /// An explicit git URL: the registry entry when one matches and no
    /// commit is pinned, otherwise a local clone.
    async fn install_extra_node(
        &self,
        extra: &ExtraNode,
        custom_nodes: &[RemoteNodeEntry],
    ) -> Result<bool> {
        let url = extra.url.trim_end_matches('/');
        let registry_entry = custom_nodes
            .iter()
            .find(|entry| entry.files.iter().any(|f| f.trim_end_matches('/') == url));

        if let Some(entry) = registry_entry {
            if entry.is_installed() {
                return Ok(false);
            }
            if extra.commit_hash.is_none() {
                return match self.client.install_custom_node(entry).await {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        warn!(%url, "registry install rejected for extra node");
                        Ok(false)
                    }
                    Err(e) => {
                        warn!(%url, error = %e, "registry install failed for extra node");
                        Ok(false)
                    }
                };
            }
        }

        let descriptor = PluginDescriptor::from_git_url(url, extra.commit_hash.clone());
        let installer = NodeInstaller::new(&self.config.server, &self.config.fetch);
        match installer.install(&descriptor).await {
            Ok(installed) => Ok(installed),
            Err(e) => {
                warn!(%url, error = %e, "extra node install failed");
                Ok(false)
            }
        }
    }

    /// Resolve and fetch every model the graph references. Fetch failures
    /// and registry misses become report entries; the only hard exits are
    /// cancellation and I/O on the model tree itself.
    pub async fn install_models(
        &self,
        graph: &WorkflowGraph,
        request: &RunRequest,
    ) -> Result<ModelInstallReport> {
        let optional = &self.config.registries.optional_models;
        let models_dir = self.config.server.models_dir();
        let mut report = ModelInstallReport::default();

        let remote = self.client.external_model_list().await.unwrap_or_else(|e| {
            warn!(error = %e, "model registry unavailable");
            Vec::new()
        });
        let catalog = Catalog::build(&self.config.registries.local, remote)?;
        let resolver = ModelResolver::new(&catalog, &self.fetcher, &models_dir);

        let ignored: Vec<&IgnoredModel> = request.ignore_models.iter().collect();
        for model in &ignored {
            self.check_cancelled(&request.client_id)?;
            let present = match &model.filepath {
                Some(path) => PathBuf::from(path).exists(),
                None => search_file(&model.filename, &models_dir, None).is_some(),
            };
            if !present {
                warn!(filename = %model.filename, "manually managed model is missing");
                report.models_not_found.push(MissingModel {
                    name: model.filename.clone(),
                    similar: Vec::new(),
                });
            }
        }

        for reference in graph.artifact_refs(optional) {
            self.check_cancelled(&request.client_id)?;
            if ignored.iter().any(|m| reference.ends_with(&m.filename)) {
                continue;
            }

            // A file already sitting in its expected folder never goes
            // back to the network.
            let name = reference.rsplit('/').next().unwrap_or(&reference);
            let parent = resolver.expected_parent(&reference);
            if search_file(name, &models_dir, parent.as_deref()).is_some() {
                debug!(model = name, "already on disk");
                continue;
            }

            match resolver.resolve_and_fetch(&reference).await? {
                Resolution::Fetched(FetchOutcome::NewDownload) => {
                    report.models_downloaded = true;
                }
                Resolution::Fetched(FetchOutcome::AlreadyPresent) => {}
                Resolution::Fetched(FetchOutcome::Failed) => {
                    report.models_not_found.push(MissingModel {
                        name: name.to_string(),
                        similar: Vec::new(),
                    });
                }
                Resolution::Unresolved { similar } => {
                    report.models_not_found.push(MissingModel {
                        name: name.to_string(),
                        similar,
                    });
                }
            }
        }

        for extra in &request.extra_models {
            self.check_cancelled(&request.client_id)?;
            let dest = models_dir.join(&extra.dest);
            match self.fetcher.fetch(&extra.filename, &extra.url, &dest).await? {
                FetchOutcome::NewDownload => {
                    report.models_downloaded = true;
                    report.models_not_found.retain(|m| m.name != extra.filename);
                }
                FetchOutcome::AlreadyPresent => {
                    report.models_not_found.retain(|m| m.name != extra.filename);
                }
                FetchOutcome::Failed => {
                    warn!(filename = %extra.filename, "extra model download failed");
                }
            }
        }

        // Last chance: a model counted missing may live anywhere under the
        // server root (a plugin may have fetched it on its own).
        let base = self.config.server.base_path.clone();
        report
            .models_not_found
            .retain(|m| search_file(&m.name, &base, None).is_none());

        Ok(report)
    }

    /// Flag a generation as cancelled and interrupt the server if that
    /// generation is the one currently executing. An empty id interrupts
    /// unconditionally.
    pub async fn cancel_generation(&self, client_id: &str) -> Result<()> {
        self.cancel.mark_cancelled(client_id)?;
        if client_id.is_empty() {
            return self.client.interrupt().await;
        }

        for attempt in 0..QUEUE_POLL_ATTEMPTS {
            // The flag is already durable; an unreachable server only
            // means there is nothing to interrupt right now.
            let queue = match self.client.queue().await {
                Ok(queue) => queue,
                Err(e) => {
                    debug!(attempt, error = %e, "queue poll failed");
                    tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
                    continue;
                }
            };
            let running = queue["queue_running"].as_array().cloned().unwrap_or_default();
            for entry in &running {
                let Some(fields) = entry.as_array() else { continue };
                // Dispatch metadata sits second from the end of each entry.
                let owner = fields
                    .len()
                    .checked_sub(2)
                    .and_then(|i| fields[i]["client_id"].as_str());
                if owner == Some(client_id) {
                    info!(client_id, "interrupting running generation");
                    return self.client.interrupt().await;
                }
            }
            debug!(client_id, attempt, "generation not running yet");
            tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
        }
        warn!(
            client_id,
            "server unreachable or generation never ran, cancellation flag recorded"
        );
        Ok(())
    }

    fn check_cancelled(&self, client_id: &str) -> Result<()> {
        if self.cancel.is_cancelled(client_id) {
            return Err(GantryError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::config::{ServerConfig, StatusConfig};

    fn test_config(dir: &std::path::Path) -> AppConfig {
        AppConfig {
            server: ServerConfig {
                base_path: dir.join("server"),
                ..Default::default()
            },
            status: StatusConfig {
                log_path: dir.join("status.jsonl"),
                refresh_interval_secs: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_request_gets_a_client_id() {
        let request = RunRequest::new("{}", "/tmp/out");
        assert!(!request.client_id.is_empty());
        let other = RunRequest::new("{}", "/tmp/out");
        assert_ne!(request.client_id, other.client_id);
    }

    #[tokio::test]
    async fn test_invalid_workflow_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = Runner::new(test_config(dir.path()));
        let request = RunRequest::new(r#"{"nodes": [], "links": []}"#, dir.path());
        let err = runner.run(&request).await.unwrap_err();
        assert!(matches!(err, GantryError::InvalidWorkflow(_)));
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_returns_cancelled_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut runner = Runner::new(config);

        let request = RunRequest::new(
            r#"{"1": {"class_type": "KSampler", "inputs": {}}}"#,
            dir.path(),
        );
        runner.cancel.mark_cancelled(&request.client_id).unwrap();

        let output = runner.run(&request).await.unwrap();
        assert!(output.cancelled);
        assert!(output.file_paths.is_empty());
    }
}
