use std::path::{Path, PathBuf};

use gantry_core::error::Result;

/// Recursively collect every file named `name` under `root`, in a
/// deterministic (sorted) order.
pub fn find_file_in_directory(root: &Path, name: &str) -> Vec<PathBuf> {
    let mut hits = Vec::new();
    walk(root, &mut |path| {
        if path.file_name().and_then(|n| n.to_str()) == Some(name) {
            hits.push(path.to_path_buf());
        }
    });
    hits.sort();
    hits
}

/// Find one file named `name` under `root`. When `parent_folder` is given
/// the match must sit inside a directory of that name (at any depth).
pub fn search_file(name: &str, root: &Path, parent_folder: Option<&str>) -> Option<PathBuf> {
    find_file_in_directory(root, name)
        .into_iter()
        .find(|path| match parent_folder {
            Some(parent) => path
                .ancestors()
                .skip(1)
                .any(|a| a.file_name().and_then(|n| n.to_str()) == Some(parent)),
            None => true,
        })
}

fn walk(dir: &Path, visit: &mut impl FnMut(&Path)) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, visit);
        } else {
            visit(&path);
        }
    }
}

/// Remove everything inside `dir`, keeping the directory itself.
pub fn clear_directory(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Copy `src` into `dest_dir`. Without `overwrite`, a name collision is
/// resolved by suffixing a counter rather than clobbering the existing
/// file. Returns the final destination path.
pub fn copy_into(
    src: &Path,
    dest_dir: &Path,
    overwrite: bool,
    delete_original: bool,
    filename: Option<&str>,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dest_dir)?;
    let name = match filename {
        Some(name) => name.to_string(),
        None => src
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".into()),
    };

    let mut target = dest_dir.join(&name);
    if !overwrite {
        let stem = Path::new(&name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| name.clone());
        let ext = Path::new(&name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let mut counter = 1;
        while target.exists() {
            target = dest_dir.join(format!("{}_{}{}", stem, counter, ext));
            counter += 1;
        }
    }

    std::fs::copy(src, &target)?;
    if delete_original {
        std::fs::remove_file(src)?;
    }
    Ok(target)
}
