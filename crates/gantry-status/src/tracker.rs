use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use gantry_core::config::StatusConfig;
use gantry_core::error::{GantryError, Result};

/// Cancellation-flag store keyed by generation id. Behind a trait so an
/// embedded key-value store could replace the log file without touching
/// callers.
pub trait CancelStore: Send + Sync {
    fn mark_cancelled(&self, id: &str) -> Result<()>;
    fn is_cancelled(&self, id: &str) -> bool;
}

/// One record of the append-only log, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusRecord {
    id: String,
    cancelled: bool,
    /// Microseconds since the epoch; the strictly greater timestamp wins.
    ts: i64,
}

struct Cache {
    entries: HashMap<String, (bool, i64)>,
    last_refresh: Option<Instant>,
}

/// Append-only locked file with an in-memory cache refreshed on a time
/// budget. Records accumulate until external rotation.
pub struct FileCancelStore {
    path: PathBuf,
    refresh_interval: Duration,
    lock_wait: Duration,
    cache: Mutex<Cache>,
}

impl FileCancelStore {
    pub fn new(config: &StatusConfig) -> Self {
        Self {
            path: config.log_path.clone(),
            refresh_interval: Duration::from_secs(config.refresh_interval_secs),
            lock_wait: Duration::from_secs(config.lock_wait_secs),
            cache: Mutex::new(Cache {
                entries: HashMap::new(),
                last_refresh: None,
            }),
        }
    }

    /// Advisory locks only: block for at most `lock_wait`, then surface a
    /// `Lock` error instead of stalling the run forever.
    fn lock_with_deadline(&self, file: &File, exclusive: bool) -> Result<()> {
        let deadline = Instant::now() + self.lock_wait;
        loop {
            let acquired = if exclusive {
                FileExt::try_lock_exclusive(file)
            } else {
                FileExt::try_lock_shared(file)
            };
            match acquired {
                Ok(()) => return Ok(()),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(GantryError::Lock(format!(
                        "{}: {}",
                        self.path.display(),
                        e
                    )))
                }
            }
        }
    }

    fn refresh_cache(&self, cache: &mut Cache) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let file = File::open(&self.path)?;
        self.lock_with_deadline(&file, false)?;
        let result = (|| -> Result<()> {
            for line in BufReader::new(&file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: StatusRecord = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    // A torn write at the tail is not fatal for readers.
                    Err(_) => continue,
                };
                let entry = cache.entries.entry(record.id).or_insert((false, 0));
                if record.ts > entry.1 {
                    *entry = (record.cancelled, record.ts);
                }
            }
            Ok(())
        })();
        let _ = FileExt::unlock(&file);
        result
    }
}

impl CancelStore for FileCancelStore {
    fn mark_cancelled(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Ok(());
        }
        let ts = chrono::Utc::now().timestamp_micros();
        let record = StatusRecord {
            id: id.to_string(),
            cancelled: true,
            ts,
        };
        let line = serde_json::to_string(&record)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.lock_with_deadline(&file, true)?;
        let result = (|| -> Result<()> {
            writeln!(file, "{}", line)?;
            file.flush()?;
            file.sync_all()?;
            Ok(())
        })();
        let _ = FileExt::unlock(&file);
        result?;

        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        let entry = cache.entries.entry(id.to_string()).or_insert((false, 0));
        if ts > entry.1 {
            *entry = (true, ts);
        }
        debug!(id, "generation marked cancelled");
        Ok(())
    }

    fn is_cancelled(&self, id: &str) -> bool {
        if id.is_empty() {
            return false;
        }
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        let stale = match cache.last_refresh {
            Some(at) => at.elapsed() > self.refresh_interval,
            None => true,
        };
        if stale {
            if let Err(e) = self.refresh_cache(&mut cache) {
                debug!(error = %e, "status log refresh failed, serving cache");
            }
            cache.last_refresh = Some(Instant::now());
        }
        cache.entries.get(id).map(|(c, _)| *c).unwrap_or(false)
    }
}
