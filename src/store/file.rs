//! File-backed store
//!
//! Two files live side by side:
//!
//! - `<name>.json`: windows, overrides and queue items as one JSON snapshot,
//!   rewritten after every mutation of those records
//! - `<name>.usage.jsonl`: usage events, one JSON object per line, appended
//!   on every admission and only rewritten when pruning compacts it
//!
//! Every rewrite goes through [`replace_file`]: temp file, fsync, rename,
//! then fsync of the directory. A crash leaves either the previous or the new
//! file on disk, never a torn one. A torn last line in the usage log is
//! skipped on load.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Store, StoreError, StoreState};
use crate::queue::QueueItem;
use crate::rate_limit::{BurstOverride, RateLimitWindow};
use crate::usage::UsageEvent;

/// Usage events plus the open append handle
#[derive(Debug, Default)]
struct UsageLog {
    events: Vec<UsageEvent>,
    file: Option<tokio::fs::File>,
    /// The file may end mid-line; the next append starts a fresh one
    torn: bool,
}

/// JSON snapshot store with an append-only usage log
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    usage_path: PathBuf,
    state: Mutex<StoreState>,
    usage: Mutex<UsageLog>,
}

impl FileStore {
    /// Open the store at `path`, loading the existing snapshot and usage log
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let usage_path = path.with_extension("usage.jsonl");

        let mut state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: StoreState = serde_json::from_slice(&bytes)?;
                info!(
                    path = %path.display(),
                    windows = state.windows.len(),
                    items = state.items.len(),
                    "Loaded store snapshot"
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
                debug!(path = %path.display(), "No store snapshot found, starting empty");
                StoreState::default()
            }
            Err(e) => return Err(e.into()),
        };

        let mut usage = load_usage_log(&usage_path).await?;

        // Snapshots written before the usage log existed carry their events inline
        let legacy = std::mem::take(&mut state.usage);
        let store = if legacy.is_empty() {
            Self {
                path,
                usage_path,
                state: Mutex::new(state),
                usage: Mutex::new(usage),
            }
        } else {
            let mut events = legacy;
            events.append(&mut usage.events);
            replace_file(&usage_path, &encode_lines(&events)?).await?;
            replace_file(&path, &serde_json::to_vec(&state)?).await?;
            info!(events = events.len(), "Moved usage events into the usage log");
            Self {
                path,
                usage_path,
                state: Mutex::new(state),
                usage: Mutex::new(UsageLog {
                    events,
                    ..UsageLog::default()
                }),
            }
        };
        Ok(store)
    }

    /// Location of the snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Location of the usage log
    pub fn usage_path(&self) -> &Path {
        &self.usage_path
    }

    /// Apply `f` to a copy of the snapshot, persist it, then commit it
    async fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> Result<T, StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let out = f(&mut next);
        replace_file(&self.path, &serde_json::to_vec(&next)?).await?;
        *state = next;
        Ok(out)
    }
}

async fn load_usage_log(path: &Path) -> Result<UsageLog, StoreError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(UsageLog::default()),
        Err(e) => return Err(e.into()),
    };

    let mut events = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<UsageEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(
                path = %path.display(),
                line = n + 1,
                error = %e,
                "Skipping unreadable usage log line"
            ),
        }
    }
    debug!(path = %path.display(), events = events.len(), "Loaded usage log");

    Ok(UsageLog {
        events,
        file: None,
        torn: !content.is_empty() && !content.ends_with('\n'),
    })
}

fn encode_lines(events: &[UsageEvent]) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    for event in events {
        serde_json::to_writer(&mut bytes, event)?;
        bytes.push(b'\n');
    }
    Ok(bytes)
}

/// Replace `path` with `bytes` through a synced temp file and a rename
async fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    sync_dir(path).await
}

#[cfg(unix)]
async fn sync_dir(path: &Path) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    tokio::fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[async_trait]
impl Store for FileStore {
    async fn load_windows(&self) -> Result<Vec<RateLimitWindow>, StoreError> {
        Ok(self.state.lock().await.windows.values().cloned().collect())
    }

    async fn save_window(&self, window: &RateLimitWindow) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.windows.insert(window.platform.clone(), window.clone());
        })
        .await
    }

    async fn load_overrides(&self) -> Result<Vec<BurstOverride>, StoreError> {
        Ok(self.state.lock().await.overrides.values().cloned().collect())
    }

    async fn save_override(&self, burst: &BurstOverride) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.overrides.insert(burst.platform.clone(), burst.clone());
        })
        .await
    }

    async fn delete_override(&self, platform: &str) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.overrides.remove(platform);
        })
        .await
    }

    async fn append_usage(&self, event: &UsageEvent) -> Result<(), StoreError> {
        let mut log = self.usage.lock().await;

        let mut line = Vec::new();
        if log.torn {
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, event)?;
        line.push(b'\n');

        let mut file = match log.file.take() {
            Some(file) => file,
            None => {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.usage_path)
                    .await?
            }
        };
        let written = match file.write_all(&line).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            log.torn = true;
            return Err(e.into());
        }

        log.file = Some(file);
        log.torn = false;
        log.events.push(event.clone());
        Ok(())
    }

    async fn usage_between(
        &self,
        platform: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, StoreError> {
        Ok(self
            .usage
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.platform == platform && e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect())
    }

    async fn prune_usage(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut log = self.usage.lock().await;
        let kept: Vec<UsageEvent> = log
            .events
            .iter()
            .filter(|e| e.timestamp >= before)
            .cloned()
            .collect();
        let removed = log.events.len() - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        log.file = None;
        replace_file(&self.usage_path, &encode_lines(&kept)?).await?;
        log.events = kept;
        log.torn = false;
        debug!(removed, "Compacted usage log");
        Ok(removed)
    }

    async fn load_items(&self) -> Result<Vec<QueueItem>, StoreError> {
        Ok(self.state.lock().await.items.values().cloned().collect())
    }

    async fn save_item(&self, item: &QueueItem) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.items.insert(item.id.clone(), item.clone());
        })
        .await
    }
}
