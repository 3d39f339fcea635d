use std::path::{Path, PathBuf};

use tracing::debug;

use gantry_core::error::Result;
use gantry_core::types::FetchOutcome;
use gantry_fetch::Fetcher;

use crate::catalog::Catalog;

/// Result of resolving one model reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Fetched(FetchOutcome),
    /// Not in any registry; carries approximate-match alternatives.
    Unresolved { similar: Vec<String> },
}

/// Splits an embedded base-model tag off a reference like
/// `SD1.5/model.ckpt`. The prefix is a tie-break hint only, never part
/// of the lookup key.
pub fn split_base_hint(reference: &str) -> (Option<&str>, &str) {
    match reference.rsplit_once('/') {
        Some((base, name)) => {
            let base = base.split('/').next().unwrap_or(base);
            (Some(base).filter(|b| !b.is_empty()), name)
        }
        None => (None, reference),
    }
}

/// Finds a download source for a workflow's model references and
/// delegates to the fetcher.
pub struct ModelResolver<'a> {
    catalog: &'a Catalog,
    fetcher: &'a Fetcher,
    models_dir: PathBuf,
}

impl<'a> ModelResolver<'a> {
    pub fn new(catalog: &'a Catalog, fetcher: &'a Fetcher, models_dir: &Path) -> Self {
        Self {
            catalog,
            fetcher,
            models_dir: models_dir.to_path_buf(),
        }
    }

    /// The expected destination folder name for a reference, if it
    /// resolves (used to scope the already-on-disk search).
    pub fn expected_parent(&self, reference: &str) -> Option<String> {
        let (base, name) = split_base_hint(reference);
        let record = self.catalog.resolve(name, base)?;
        Path::new(&record.dest)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
    }

    /// Resolve a reference via the catalog and fetch it into the model
    /// tree; unresolvable references report fuzzy alternatives instead.
    pub async fn resolve_and_fetch(&self, reference: &str) -> Result<Resolution> {
        let (base, name) = split_base_hint(reference);
        match self.catalog.resolve(name, base) {
            Some(record) => {
                let dest = self.models_dir.join(&record.dest);
                let outcome = self.fetcher.fetch(&record.filename, &record.url, &dest).await?;
                Ok(Resolution::Fetched(outcome))
            }
            None => {
                debug!(model = name, "not found in any registry");
                Ok(Resolution::Unresolved {
                    similar: self.catalog.similar(name),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_base_hint() {
        assert_eq!(split_base_hint("SD1.5/model.ckpt"), (Some("SD1.5"), "model.ckpt"));
        assert_eq!(split_base_hint("model.ckpt"), (None, "model.ckpt"));
        assert_eq!(
            split_base_hint("SDXL/animatediff/m.ckpt"),
            (Some("SDXL"), "m.ckpt")
        );
    }

    #[tokio::test]
    async fn test_unresolved_reports_similar() {
        let catalog = Catalog::build(&[] as &[&Path], vec![]).unwrap();
        let fetcher = Fetcher::new(&Default::default());
        let dir = tempfile::tempdir().unwrap();
        let resolver = ModelResolver::new(&catalog, &fetcher, dir.path());

        let resolution = resolver
            .resolve_and_fetch("ghost_model.safetensors")
            .await
            .unwrap();
        assert_eq!(
            resolution,
            Resolution::Unresolved { similar: vec![] }
        );
    }

    #[tokio::test]
    async fn test_resolved_on_disk_model_is_already_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("checkpoints")).unwrap();
        std::fs::write(dir.path().join("checkpoints/m.ckpt"), b"w").unwrap();

        let remote = vec![gantry_client::RemoteModelEntry {
            filename: "m.ckpt".into(),
            url: "http://invalid.localdomain/m.ckpt".into(),
            save_path: "checkpoints".into(),
            model_type: "checkpoints".into(),
        }];
        let catalog = Catalog::build(&[] as &[&Path], remote).unwrap();
        let fetcher = Fetcher::new(&Default::default());
        let resolver = ModelResolver::new(&catalog, &fetcher, dir.path());

        let resolution = resolver.resolve_and_fetch("m.ckpt").await.unwrap();
        assert_eq!(resolution, Resolution::Fetched(FetchOutcome::AlreadyPresent));
    }
}
