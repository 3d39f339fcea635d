use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GantryError, Result};

/// Filename suffixes that mark a node input as a model weight reference.
pub const MODEL_FILETYPES: &[&str] = &[
    ".ckpt",
    ".safetensors",
    ".pt",
    ".pth",
    ".bin",
    ".onnx",
    ".torchscript",
    ".patch",
    ".gguf",
    ".ggml",
];

/// Node types under this prefix are internal to the server and never
/// resolve to an installable plugin.
pub const RESERVED_NODE_PREFIX: &str = "workflow/";

/// One node of a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub class_type: String,
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,
    /// Fields we don't interpret (e.g. `_meta`) but must round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A declarative compute graph keyed by node id.
///
/// Loaded once per run, mutated in place only to rewrite model path
/// references, and discarded after dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph(pub BTreeMap<String, WorkflowNode>);

impl WorkflowGraph {
    /// Load a graph from a file path or an inline JSON payload.
    ///
    /// A payload where any node lacks `class_type` is not API-format
    /// and is rejected before any server interaction.
    pub fn load(input: &str) -> Result<Self> {
        let raw = if Path::new(input).exists() {
            std::fs::read_to_string(input)?
        } else {
            input.to_string()
        };

        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| GantryError::InvalidWorkflow(format!("not valid JSON: {}", e)))?;
        let obj = value
            .as_object()
            .ok_or_else(|| GantryError::InvalidWorkflow("top level must be an object".into()))?;
        if obj.values().any(|v| v.get("class_type").is_none()) {
            return Err(GantryError::InvalidWorkflow(
                "not an API-format graph (missing class_type)".into(),
            ));
        }

        serde_json::from_value(value)
            .map_err(|e| GantryError::InvalidWorkflow(e.to_string()))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&String, &WorkflowNode)> {
        self.0.iter()
    }

    /// All string input values that look like a model weight reference.
    pub fn artifact_refs(&self, optional_models: &[String]) -> Vec<String> {
        let mut refs = Vec::new();
        for node in self.0.values() {
            for input in node.inputs.values() {
                if let Some(s) = input.as_str() {
                    if is_artifact_ref(s, optional_models) {
                        refs.push(s.to_string());
                    }
                }
            }
        }
        refs
    }

    /// Rewrite every artifact-like input in place via `f`. `f` receives
    /// the current value and returns the replacement, or `None` to keep it.
    pub fn rewrite_artifact_refs<F>(&mut self, optional_models: &[String], mut f: F)
    where
        F: FnMut(&str) -> Option<String>,
    {
        for node in self.0.values_mut() {
            for input in node.inputs.values_mut() {
                let current = match input.as_str() {
                    Some(s) if is_artifact_ref(s, optional_models) => s.to_string(),
                    _ => continue,
                };
                if let Some(updated) = f(&current) {
                    *input = Value::String(updated);
                }
            }
        }
    }
}

pub fn is_artifact_ref(value: &str, optional_models: &[String]) -> bool {
    MODEL_FILETYPES.iter().any(|ft| value.ends_with(ft))
        && !optional_models.iter().any(|m| value.ends_with(m.as_str()))
}

/// A resolved download source for one model weight file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub filename: String,
    pub url: String,
    /// Install destination, relative to the models root.
    pub dest: String,
}

/// How a plugin package is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallType {
    GitClone,
    Unzip,
    Copy,
}

impl InstallType {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "git-clone" => Some(Self::GitClone),
            "unzip" => Some(Self::Unzip),
            "copy" => Some(Self::Copy),
            _ => None,
        }
    }
}

/// An installable plugin, built from the registry snapshot or synthesized
/// from a bare URL the caller supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub reference: String,
    pub files: Vec<String>,
    pub install_type: InstallType,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub commit_hash: Option<String>,
    /// Packages the plugin declares independently of its install type.
    #[serde(default)]
    pub pip: Vec<String>,
    /// Subdirectory for non-script payloads of a copy install.
    #[serde(default)]
    pub js_path: Option<String>,
}

impl PluginDescriptor {
    /// Synthesize a git-clone descriptor for a URL the registry doesn't know.
    pub fn from_git_url(url: &str, commit_hash: Option<String>) -> Self {
        Self {
            title: String::new(),
            reference: url.to_string(),
            files: vec![url.to_string()],
            install_type: InstallType::GitClone,
            installed: false,
            commit_hash,
            pip: Vec::new(),
            js_path: None,
        }
    }

    /// The URL a descriptor is deduplicated by.
    pub fn primary_url(&self) -> Option<&str> {
        self.files.first().map(|s| s.as_str())
    }
}

/// Outcome of a single fetch, attached so the orchestrator can decide
/// whether a server restart is warranted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    NewDownload,
    AlreadyPresent,
    Failed,
}

/// A model reference that could not be resolved, with up to two
/// approximate-match alternatives a caller could substitute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingModel {
    pub name: String,
    pub similar: Vec<String>,
}

/// Structured report of the model install pass. Never raised; the
/// orchestrator inspects `status` to decide whether to proceed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInstallReport {
    pub models_not_found: Vec<MissingModel>,
    pub models_downloaded: bool,
}

impl ModelInstallReport {
    pub fn status(&self) -> bool {
        self.models_not_found.is_empty()
    }
}

/// Report of the plugin install pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInstallReport {
    pub nodes_installed: bool,
    /// Node types with no exact or pattern mapping; surfaced, not installed.
    pub unresolved_types: Vec<String>,
}

/// An extra model the caller wants fetched by explicit source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraModel {
    pub filename: String,
    pub url: String,
    pub dest: String,
}

/// A model the caller placed manually; skipped if it physically exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IgnoredModel {
    pub filename: String,
    #[serde(default)]
    pub filepath: Option<String>,
}

/// An extra plugin to install by git URL, optionally pinned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraNode {
    pub url: String,
    #[serde(default)]
    pub commit_hash: Option<String>,
}

/// An input file to stage before dispatch. `source` may be a local path
/// or a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFile {
    pub source: String,
    #[serde(default)]
    pub dest_folder: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

/// Final result of a run. The caller always receives one of these,
/// possibly empty, rather than an exception.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutput {
    pub file_paths: Vec<String>,
    pub text_output: Vec<String>,
    pub models_not_found: Vec<MissingModel>,
    pub cancelled: bool,
}
