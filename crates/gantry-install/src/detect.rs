use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::{debug, warn};

use gantry_client::RemoteNodeEntry;
use gantry_core::types::{WorkflowGraph, RESERVED_NODE_PREFIX};

/// Output of the static dependency scan.
#[derive(Debug, Default)]
pub struct Detection {
    /// Registry entries owning the missing node types, deduplicated by
    /// primary file URL, registry order preserved.
    pub plugins: Vec<RemoteNodeEntry>,
    /// Node types with neither an exact nor a pattern mapping. Surfaced
    /// to the caller, never installed.
    pub unresolved: Vec<String>,
}

/// Scan a graph for node types absent from the server's registered
/// capability set and map each to an installable plugin.
///
/// Exact-name lookup first; on miss, the registry's `nodename_pattern`
/// regexes are tried in declared order, first match wins. The ordering
/// is significant and deliberately not re-sorted.
pub fn find_missing(
    workflow: &WorkflowGraph,
    registered: &HashSet<String>,
    name_to_url: &HashMap<String, String>,
    custom_nodes: &[RemoteNodeEntry],
) -> Detection {
    let pattern_to_url: Vec<(Regex, &str)> = custom_nodes
        .iter()
        .filter_map(|entry| {
            let pattern = entry.nodename_pattern.as_deref()?;
            let url = entry.files.first()?;
            match Regex::new(pattern) {
                Ok(regex) => Some((regex, url.as_str())),
                Err(e) => {
                    warn!(pattern, error = %e, "invalid nodename_pattern, skipping");
                    None
                }
            }
        })
        .collect();

    let mut missing_urls: HashSet<String> = HashSet::new();
    let mut unresolved = Vec::new();

    for (_, node) in workflow.nodes() {
        let node_type = node.class_type.as_str();
        if node_type.starts_with(RESERVED_NODE_PREFIX) {
            continue;
        }
        if registered.contains(node_type) {
            continue;
        }

        if let Some(url) = name_to_url.get(node_type.trim()) {
            missing_urls.insert(url.clone());
            continue;
        }
        match pattern_to_url.iter().find(|(regex, _)| regex.is_match(node_type)) {
            Some((_, url)) => {
                missing_urls.insert(url.to_string());
            }
            None => {
                debug!(node_type, "no plugin mapping found");
                unresolved.push(node_type.to_string());
            }
        }
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let plugins = custom_nodes
        .iter()
        .filter(|entry| entry.files.iter().any(|f| missing_urls.contains(f)))
        .filter(|entry| match entry.files.first() {
            Some(primary) => seen.insert(primary.as_str()),
            None => false,
        })
        .cloned()
        .collect();

    Detection {
        plugins,
        unresolved,
    }
}
