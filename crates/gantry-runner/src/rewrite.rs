use std::path::Path;

use tracing::debug;

use gantry_catalog::catalog::family_hint;
use gantry_core::types::WorkflowGraph;
use gantry_fetch::fsutil::find_file_in_directory;

use gantry_catalog::resolver::split_base_hint;

/// Replace every artifact-like reference in the graph with a path
/// relative to the layout the server's loaders expect: relative to the
/// models root, with the leading capability-type folder stripped.
///
/// When a filename exists in several places the `checkpoints` folder is
/// preferred; a base-model hint carried as a directory prefix on the
/// original reference overrides that.
pub fn rewrite_model_paths(
    workflow: &mut WorkflowGraph,
    models_dir: &Path,
    optional_models: &[String],
) {
    let model_folders: Vec<String> = std::fs::read_dir(models_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect()
        })
        .unwrap_or_default();

    workflow.rewrite_artifact_refs(optional_models, |reference| {
        let (base, name) = split_base_hint(reference);
        let hits = find_file_in_directory(models_dir, name);
        if hits.is_empty() {
            return None;
        }

        let mut chosen = hits
            .iter()
            .find(|p| has_component(p, "checkpoints"))
            .unwrap_or(&hits[0]);
        if let Some(base) = base {
            let needle = family_hint(base);
            if let Some(hit) = hits.iter().find(|p| p.to_string_lossy().contains(needle)) {
                chosen = hit;
            }
        }

        let relative = chosen.strip_prefix(models_dir).ok()?;
        let mut parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        if parts.len() > 1 && model_folders.contains(&parts[0]) {
            parts.remove(0);
        }
        let rewritten = parts.join("/");
        debug!(from = reference, to = %rewritten, "rewrote model path");
        Some(rewritten)
    });
}

fn has_component(path: &Path, name: &str) -> bool {
    path.components()
        .any(|c| c.as_os_str().to_string_lossy() == name)
}
