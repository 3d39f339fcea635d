use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use gantry_core::error::{GantryError, Result};
use gantry_core::types::{InstallType, PluginDescriptor, WorkflowGraph};

/// A plugin entry from the management add-on's registry snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteNodeEntry {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub install_type: String,
    /// The registry serves this as `true`/`false` or the string "False".
    #[serde(default)]
    pub installed: Value,
    #[serde(default)]
    pub nodename_pattern: Option<String>,
    #[serde(default)]
    pub pip: Vec<String>,
    #[serde(default)]
    pub js_path: Option<String>,
}

impl RemoteNodeEntry {
    pub fn is_installed(&self) -> bool {
        match &self.installed {
            Value::Bool(b) => *b,
            Value::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// `None` when the registry's install_type tag is unknown.
    pub fn to_descriptor(&self) -> Option<PluginDescriptor> {
        Some(PluginDescriptor {
            title: self.title.clone(),
            reference: self.reference.clone(),
            files: self.files.clone(),
            install_type: InstallType::parse(&self.install_type)?,
            installed: self.is_installed(),
            commit_hash: None,
            pip: self.pip.clone(),
            js_path: self.js_path.clone(),
        })
    }
}

/// A model entry from the management add-on's registry snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteModelEntry {
    pub filename: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub save_path: String,
    #[serde(default, rename = "type")]
    pub model_type: String,
}

#[derive(Deserialize)]
struct NodeListResponse {
    #[serde(default)]
    custom_nodes: Vec<RemoteNodeEntry>,
}

#[derive(Deserialize)]
struct ModelListResponse {
    #[serde(default)]
    models: Vec<RemoteModelEntry>,
}

#[derive(Deserialize)]
struct QueuePromptResponse {
    prompt_id: String,
}

/// Loopback HTTP client for the graph-execution server and its
/// management add-on.
#[derive(Clone)]
pub struct ServerClient {
    base_url: String,
    http: reqwest::Client,
}

impl ServerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(GantryError::Server(format!(
                "GET {} returned {}",
                path,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(GantryError::Server(format!(
                "POST {} returned {}",
                path,
                response.status()
            )));
        }
        Ok(response.json().await.unwrap_or(Value::Null))
    }

    /// Enqueue a graph tagged with `client_id`; returns the prompt id.
    pub async fn queue_prompt(&self, graph: &WorkflowGraph, client_id: &str) -> Result<String> {
        let body = serde_json::json!({ "prompt": graph, "client_id": client_id });
        let url = format!("{}/prompt", self.base_url);
        let response = self.http.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(GantryError::Server(format!(
                "prompt queue returned {}",
                response.status()
            )));
        }
        let parsed: QueuePromptResponse = response.json().await?;
        debug!(prompt_id = %parsed.prompt_id, "graph queued");
        Ok(parsed.prompt_id)
    }

    /// Per-node outputs for a finished prompt.
    pub async fn history(&self, prompt_id: &str) -> Result<Value> {
        self.get_json(&format!("/history/{}", prompt_id)).await
    }

    /// The server's currently registered node-type capability names.
    pub async fn registered_nodes(&self) -> Result<HashSet<String>> {
        let info: HashMap<String, Value> = self.get_json("/object_info").await?;
        Ok(info.into_keys().collect())
    }

    /// Currently running/pending executions.
    pub async fn queue(&self) -> Result<Value> {
        self.get_json("/queue").await
    }

    /// Abort whatever the server is currently executing.
    pub async fn interrupt(&self) -> Result<()> {
        let url = format!("{}/interrupt", self.base_url);
        let response = self.http.post(&url).json(&Value::Null).send().await?;
        if !response.status().is_success() {
            return Err(GantryError::Server(format!(
                "interrupt returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// node-type name -> owning plugin URL, flattened from the mapping
    /// endpoint's `{url: [[names...], meta]}` shape.
    pub async fn node_mappings(&self) -> Result<HashMap<String, String>> {
        let raw: HashMap<String, Value> = self.get_json("/customnode/getmappings?mode=local").await?;
        let mut name_to_url = HashMap::new();
        for (url, entry) in raw {
            let names = entry
                .get(0)
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            for name in names {
                if let Some(name) = name.as_str() {
                    name_to_url.insert(name.to_string(), url.clone());
                }
            }
        }
        Ok(name_to_url)
    }

    /// Plugin registry snapshot, preserving the registry's declared order.
    pub async fn custom_node_list(&self) -> Result<Vec<RemoteNodeEntry>> {
        let response: NodeListResponse = self.get_json("/customnode/getlist?mode=local").await?;
        Ok(response.custom_nodes)
    }

    /// Model registry snapshot.
    pub async fn external_model_list(&self) -> Result<Vec<RemoteModelEntry>> {
        let response: ModelListResponse = self.get_json("/externalmodel/getlist?mode=local").await?;
        Ok(response.models)
    }

    /// Delegate a plugin install to the management add-on. An empty JSON
    /// object response means success.
    pub async fn install_custom_node(&self, entry: &RemoteNodeEntry) -> Result<bool> {
        let body = serde_json::to_value(entry)?;
        let response = self.post_json("/customnode/install", &body).await?;
        Ok(response.as_object().map(|o| o.is_empty()).unwrap_or(false))
    }

    /// Delegate a model download to the management add-on. An empty JSON
    /// object response means success.
    pub async fn install_model(&self, entry: &RemoteModelEntry) -> Result<bool> {
        let body = serde_json::to_value(entry)?;
        let response = self.post_json("/model/install", &body).await?;
        Ok(response.as_object().map(|o| o.is_empty()).unwrap_or(false))
    }

    /// Lightweight liveness probe: any well-formed response from the
    /// history endpoint means the port owner is actually our server.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/history/123", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
