use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use gantry_client::RemoteModelEntry;
use gantry_core::error::Result;
use gantry_core::types::ArtifactRecord;

use crate::fuzzy;

/// Remote snapshot entries known to carry wrong details; excluded
/// unconditionally.
const MISTAGGED_REMOTE: &[&str] = &[
    "sd_xl_base_1.0.safetensors",
    "sd_xl_refiner_1.0_0.9vae.safetensors",
];

/// Expansion of `save_path == "default"` by model type.
pub fn default_save_path(model_type: &str) -> &'static str {
    match model_type {
        "checkpoint" | "checkpoints" | "unclip" => "checkpoints",
        "VAE" | "vae" => "vae",
        "lora" | "loras" => "loras",
        "controlnet" | "T2I-Adapter" | "T2I-Style" => "controlnet",
        "clip_vision" => "clip_vision",
        "gligen" => "gligen",
        "upscale" | "upscale_models" => "upscale_models",
        "embedding" | "embeddings" => "embeddings",
        _ => "etc",
    }
}

/// Base-model family vocabulary used as a tie-break hint.
pub fn family_hint(base: &str) -> &'static str {
    if base == "SD1.5" || base == "SD1.x" {
        "SD1.5"
    } else {
        "SDXL"
    }
}

#[derive(Debug, Deserialize)]
struct LocalEntry {
    url: String,
    dest: String,
}

/// Immutable-after-build index from artifact filename to download source
/// and install destination. Rebuilt per run; never mutated while shared.
#[derive(Debug, Default)]
pub struct Catalog {
    /// Remote snapshot, all records per filename (tie-break at resolve time).
    remote: HashMap<String, Vec<RemoteModelEntry>>,
    /// Local registries, earliest-loaded source wins.
    local: HashMap<String, ArtifactRecord>,
}

impl Catalog {
    /// Build from local registry files (in priority order) and the remote
    /// registry snapshot. Entries from an earlier-loaded local source are
    /// never overwritten by a later one.
    pub fn build(local_paths: &[impl AsRef<Path>], remote: Vec<RemoteModelEntry>) -> Result<Self> {
        let mut catalog = Self::default();

        for path in local_paths {
            let path = path.as_ref();
            if !path.exists() {
                warn!(path = %path.display(), "registry file not found, skipping");
                continue;
            }
            let raw = std::fs::read_to_string(path)?;
            let entries: HashMap<String, LocalEntry> = serde_json::from_str(&raw)?;
            for (filename, entry) in entries {
                catalog
                    .local
                    .entry(filename.clone())
                    .or_insert(ArtifactRecord {
                        filename,
                        url: entry.url,
                        dest: entry.dest,
                    });
            }
            debug!(path = %path.display(), total = catalog.local.len(), "loaded local registry");
        }

        for entry in remote {
            if MISTAGGED_REMOTE.contains(&entry.filename.as_str()) {
                continue;
            }
            catalog
                .remote
                .entry(entry.filename.clone())
                .or_default()
                .push(entry);
        }

        Ok(catalog)
    }

    /// Resolve a bare filename to a record, remote snapshot first, then
    /// the local registries. `base_hint` breaks ties between remote
    /// records sharing a filename; it is never part of the lookup key.
    pub fn resolve(&self, filename: &str, base_hint: Option<&str>) -> Option<ArtifactRecord> {
        if let Some(candidates) = self.remote.get(filename) {
            let chosen = pick_remote(candidates, base_hint)?;
            let save_path = if chosen.save_path == "default" || chosen.save_path.ends_with("default")
            {
                default_save_path(&chosen.model_type).to_string()
            } else {
                chosen.save_path.clone()
            };
            return Some(ArtifactRecord {
                filename: chosen.filename.clone(),
                url: chosen.url.clone(),
                dest: save_path,
            });
        }
        self.local.get(filename).cloned()
    }

    /// Approximate-match candidates across both registries, best first.
    pub fn similar(&self, name: &str) -> Vec<String> {
        let candidates = self
            .local
            .keys()
            .chain(self.remote.keys())
            .map(|s| s.as_str());
        fuzzy::top_matches(candidates, name, 0.9, 2)
    }
}

fn pick_remote<'a>(
    candidates: &'a [RemoteModelEntry],
    base_hint: Option<&str>,
) -> Option<&'a RemoteModelEntry> {
    if candidates.len() > 1 {
        if let Some(hit) = candidates.iter().find(|c| resolved_dest(c) == "checkpoints") {
            return Some(hit);
        }
        if let Some(base) = base_hint {
            let needle = family_hint(base);
            if let Some(hit) = candidates.iter().find(|c| c.save_path.contains(needle)) {
                return Some(hit);
            }
        }
    }
    candidates.first()
}

fn resolved_dest(entry: &RemoteModelEntry) -> String {
    if entry.save_path == "default" || entry.save_path.ends_with("default") {
        default_save_path(&entry.model_type).to_string()
    } else {
        entry.save_path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn remote(filename: &str, url: &str, save_path: &str, model_type: &str) -> RemoteModelEntry {
        RemoteModelEntry {
            filename: filename.into(),
            url: url.into(),
            save_path: save_path.into(),
            model_type: model_type.into(),
        }
    }

    fn write_registry(entries: &[(&str, &str, &str)]) -> tempfile::NamedTempFile {
        let mut map = serde_json::Map::new();
        for (name, url, dest) in entries {
            map.insert(
                name.to_string(),
                serde_json::json!({"url": url, "dest": dest}),
            );
        }
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::Value::Object(map)).unwrap();
        file
    }

    #[test]
    fn test_earliest_local_source_wins() {
        let first = write_registry(&[("foo.ckpt", "http://first/foo", "checkpoints")]);
        let second = write_registry(&[("foo.ckpt", "http://second/foo", "loras")]);

        let catalog = Catalog::build(&[first.path(), second.path()], vec![]).unwrap();
        let record = catalog.resolve("foo.ckpt", None).unwrap();
        assert_eq!(record.url, "http://first/foo");
        assert_eq!(record.dest, "checkpoints");
    }

    #[test]
    fn test_remote_snapshot_consulted_before_local() {
        let local = write_registry(&[("foo.ckpt", "http://local/foo", "checkpoints")]);
        let catalog = Catalog::build(
            &[local.path()],
            vec![remote("foo.ckpt", "http://remote/foo", "default", "checkpoints")],
        )
        .unwrap();
        let record = catalog.resolve("foo.ckpt", None).unwrap();
        assert_eq!(record.url, "http://remote/foo");
    }

    #[test]
    fn test_default_save_path_expansion() {
        let catalog = Catalog::build(
            &[] as &[&Path],
            vec![remote("v.pt", "http://r/v", "default", "upscale")],
        )
        .unwrap();
        assert_eq!(catalog.resolve("v.pt", None).unwrap().dest, "upscale_models");
    }

    #[test]
    fn test_mistagged_remote_entries_excluded() {
        let catalog = Catalog::build(
            &[] as &[&Path],
            vec![remote(
                "sd_xl_base_1.0.safetensors",
                "http://r/sdxl",
                "default",
                "checkpoints",
            )],
        )
        .unwrap();
        assert!(catalog.resolve("sd_xl_base_1.0.safetensors", None).is_none());
    }

    #[test]
    fn test_remote_tie_break_prefers_checkpoints() {
        let catalog = Catalog::build(
            &[] as &[&Path],
            vec![
                remote("m.ckpt", "http://r/lora", "loras", "lora"),
                remote("m.ckpt", "http://r/ckpt", "checkpoints", "checkpoints"),
            ],
        )
        .unwrap();
        assert_eq!(catalog.resolve("m.ckpt", None).unwrap().url, "http://r/ckpt");
    }

    #[test]
    fn test_remote_tie_break_uses_base_hint() {
        let catalog = Catalog::build(
            &[] as &[&Path],
            vec![
                remote("m.ckpt", "http://r/xl", "SDXL/loras", "lora"),
                remote("m.ckpt", "http://r/15", "SD1.5/loras", "lora"),
            ],
        )
        .unwrap();
        let record = catalog.resolve("m.ckpt", Some("SD1.5")).unwrap();
        assert_eq!(record.url, "http://r/15");
    }

    #[test]
    fn test_similar_suggestions() {
        let local = write_registry(&[("dreamshaper_8.safetensors", "http://l/d8", "checkpoints")]);
        let catalog = Catalog::build(&[local.path()], vec![]).unwrap();
        let similar = catalog.similar("dreamshaper_9.safetensors");
        assert_eq!(similar, vec!["dreamshaper_8.safetensors".to_string()]);
        assert!(catalog.similar("ghost_model.safetensors").is_empty());
    }
}
