use std::path::{Path, PathBuf};

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use gantry_core::error::Result;
use gantry_core::types::InputFile;
use gantry_fetch::fsutil::{clear_directory, copy_into, find_file_in_directory};
use gantry_fetch::Fetcher;

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Stage the request's input files into the server's input directory
/// with a bounded worker pool. The directory is cleared first; each
/// task reports its own failure without aborting siblings.
pub async fn stage_inputs(
    fetcher: &Fetcher,
    input_dir: &Path,
    files: &[InputFile],
    workers: usize,
) -> Result<()> {
    if files.is_empty() {
        return Ok(());
    }
    clear_directory(input_dir)?;

    let mut pending = files.iter();
    let mut in_flight = FuturesUnordered::new();
    loop {
        while in_flight.len() < workers.max(1) {
            match pending.next() {
                Some(file) => in_flight.push(stage_one(fetcher, input_dir, file)),
                None => break,
            }
        }
        match in_flight.next().await {
            Some(Err((source, e))) => warn!(source = %source, error = %e, "input staging failed"),
            Some(Ok(())) => {}
            None => break,
        }
    }
    Ok(())
}

async fn stage_one(
    fetcher: &Fetcher,
    input_dir: &Path,
    file: &InputFile,
) -> std::result::Result<(), (String, String)> {
    let dest = match &file.dest_folder {
        Some(folder) => input_dir.join(folder),
        None => input_dir.to_path_buf(),
    };
    let result: Result<PathBuf> = if is_url(&file.source) {
        fetcher
            .quick_fetch(&file.source, &dest, file.filename.as_deref())
            .await
    } else {
        copy_into(
            Path::new(&file.source),
            &dest,
            true,
            false,
            file.filename.as_deref(),
        )
    };
    match result {
        Ok(path) => {
            debug!(staged = %path.display(), "input staged");
            Ok(())
        }
        Err(e) => Err((file.source.clone(), e.to_string())),
    }
}

/// Pull the emitted filenames and inline text out of a history entry,
/// keeping only the requested output nodes (or all nodes when none were
/// requested).
pub fn extract_outputs(
    history: &Value,
    prompt_id: &str,
    output_node_ids: &[String],
) -> (Vec<String>, Vec<String>) {
    let mut files = Vec::new();
    let mut text = Vec::new();

    let outputs = match history[prompt_id]["outputs"].as_object() {
        Some(outputs) => outputs,
        None => return (files, text),
    };

    for (node_id, node_output) in outputs {
        if !output_node_ids.is_empty() && !output_node_ids.contains(node_id) {
            continue;
        }
        for key in ["images", "gifs"] {
            if let Some(items) = node_output[key].as_array() {
                for item in items {
                    if let Some(name) = item["filename"].as_str() {
                        files.push(name.to_string());
                    }
                }
            }
        }
        if let Some(items) = node_output["text"].as_array() {
            for item in items {
                if let Some(line) = item.as_str() {
                    text.push(line.to_string());
                }
            }
        }
    }
    (files, text)
}

/// Move declared outputs from the server's output tree into the caller's
/// output folder, deduplicating destination names with a counter suffix.
/// Intermediary temp files the server already deleted are skipped.
pub fn collect_outputs(
    filenames: &[String],
    server_output_dir: &Path,
    output_folder: &Path,
) -> Vec<String> {
    let mut collected = Vec::new();
    for filename in filenames {
        let hits = find_file_in_directory(server_output_dir, filename);
        let Some(source) = hits.first() else {
            debug!(filename = %filename, "output file vanished before collection");
            continue;
        };
        match copy_into(source, output_folder, false, true, None) {
            Ok(path) => collected.push(path.to_string_lossy().to_string()),
            Err(e) => warn!(filename = %filename, error = %e, "failed to collect output"),
        }
    }
    collected
}
