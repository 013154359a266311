//! File-backed activity store
//!
//! Layout under the storage root:
//!
//! ```text
//! actors/<name>/<name>.json     actor descriptor
//! actors/<name>/items/<hash>.json
//! actors/<name>/outbox.txt      one activity IRI per line, append-only
//! foreign/                      reserved for fetched remote documents
//! ```
//!
//! Outbox reads go through an in-memory index of line end offsets, built
//! by one scan on first use and extended by every append.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::models::{Actor, StoredActor};
use crate::error::AppError;

/// Items per outbox or peers page
pub const OUTBOX_PAGE_SIZE: usize = 100;

const OUTBOX_FILE: &str = "outbox.txt";

/// Reject identifiers that are unsafe as a single path or URL segment.
///
/// Only ASCII letters, digits, `-`, `_` and `~` are allowed.
pub fn validate_identifier(name: &str) -> Result<(), AppError> {
    let legal = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'~'));
    if !legal {
        return Err(AppError::IllegalIdentifier(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct OutboxIndex {
    /// Byte range of each non-blank entry, terminator excluded
    entries: Vec<(u64, u64)>,
    /// Current file length
    len: u64,
    /// The file ends in an unterminated line
    needs_newline: bool,
}

impl OutboxIndex {
    fn scan(contents: &[u8]) -> Self {
        let mut entries = Vec::new();
        let mut start = 0usize;
        for line in contents.split(|byte| *byte == b'\n') {
            let end = start + line.len();
            if line.iter().any(|byte| *byte != b'\r') {
                entries.push((start as u64, end as u64));
            }
            start = end + 1;
        }
        Self {
            entries,
            len: contents.len() as u64,
            needs_newline: contents.last().is_some_and(|byte| *byte != b'\n'),
        }
    }
}

type IndexSlot = Arc<tokio::sync::Mutex<Option<OutboxIndex>>>;

/// Durable persistence for actors, their items and outboxes
pub struct ActivityStore {
    root: PathBuf,
    outbox_indexes: Mutex<HashMap<String, IndexSlot>>,
}

impl ActivityStore {
    /// Open the store, creating `actors/` and `foreign/` under `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, AppError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("actors")).await?;
        tokio::fs::create_dir_all(root.join("foreign")).await?;

        tracing::info!(root = %root.display(), "Activity store opened");
        Ok(Self {
            root,
            outbox_indexes: Mutex::new(HashMap::new()),
        })
    }

    fn actor_dir(&self, name: &str) -> PathBuf {
        self.root.join("actors").join(name)
    }

    fn descriptor_path(&self, name: &str) -> PathBuf {
        self.actor_dir(name).join(format!("{}.json", name))
    }

    fn item_path(&self, name: &str, hash: &str) -> PathBuf {
        self.actor_dir(name).join("items").join(format!("{}.json", hash))
    }

    fn outbox_path(&self, name: &str) -> PathBuf {
        self.actor_dir(name).join(OUTBOX_FILE)
    }

    pub async fn exists(&self, name: &str) -> Result<bool, AppError> {
        validate_identifier(name)?;
        Ok(tokio::fs::try_exists(self.descriptor_path(name)).await?)
    }

    /// Names of all actors with a descriptor on disk.
    pub async fn list_actors(&self) -> Result<Vec<String>, AppError> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("actors")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_identifier(&name).is_ok()
                && tokio::fs::try_exists(self.descriptor_path(&name)).await?
            {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Persist the actor descriptor, replacing any previous one atomically.
    pub async fn save(&self, actor: &Actor) -> Result<(), AppError> {
        validate_identifier(&actor.name)?;
        tokio::fs::create_dir_all(self.actor_dir(&actor.name).join("items")).await?;

        let json = serde_json::to_vec_pretty(&actor.to_stored())
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize actor: {}", e)))?;
        write_atomic(&self.descriptor_path(&actor.name), &json).await?;

        tracing::debug!(actor = %actor.name, "Saved actor descriptor");
        Ok(())
    }

    pub async fn load(&self, name: &str) -> Result<Actor, AppError> {
        validate_identifier(name)?;

        let bytes = match tokio::fs::read(self.descriptor_path(name)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::NotFound(format!("actor {}", name)));
            }
            Err(e) => return Err(e.into()),
        };

        let stored: StoredActor = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::CorruptPersistedState(format!("actor {}: {}", name, e)))?;
        if stored.name != name {
            return Err(AppError::CorruptPersistedState(format!(
                "descriptor for {} names {}",
                name, stored.name
            )));
        }

        Actor::from_stored(stored).map_err(|e| match e {
            AppError::KeyFormat(msg) => {
                AppError::CorruptPersistedState(format!("actor {} keys: {}", name, msg))
            }
            other => other,
        })
    }

    /// Store one activity document. Overwrites unconditionally.
    pub async fn save_item(&self, name: &str, hash: &str, document: &Value) -> Result<(), AppError> {
        validate_identifier(name)?;
        validate_identifier(hash)?;
        tokio::fs::create_dir_all(self.actor_dir(name).join("items")).await?;

        let json = serde_json::to_vec(document)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize item: {}", e)))?;
        write_atomic(&self.item_path(name, hash), &json).await
    }

    pub async fn load_item(&self, name: &str, hash: &str) -> Result<Value, AppError> {
        validate_identifier(name)?;
        validate_identifier(hash)?;

        let bytes = match tokio::fs::read(self.item_path(name, hash)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::NotFound(format!("item {}/{}", name, hash)));
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes)
            .map_err(|e| AppError::CorruptPersistedState(format!("item {}/{}: {}", name, hash, e)))
    }

    fn index_slot(&self, name: &str) -> IndexSlot {
        let mut indexes = self
            .outbox_indexes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        indexes.entry(name.to_string()).or_default().clone()
    }

    async fn ensure_index<'a>(
        &self,
        name: &str,
        slot: &'a mut Option<OutboxIndex>,
    ) -> Result<&'a mut OutboxIndex, AppError> {
        if slot.is_none() {
            let contents = match tokio::fs::read(self.outbox_path(name)).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            let index = OutboxIndex::scan(&contents);
            tracing::debug!(actor = %name, items = index.entries.len(), "Indexed outbox");
            *slot = Some(index);
        }
        Ok(slot.get_or_insert_with(OutboxIndex::default))
    }

    /// Append one IRI to the actor's outbox. Prior lines are never rewritten.
    pub async fn append_outbox(&self, name: &str, iri: &str) -> Result<(), AppError> {
        validate_identifier(name)?;
        if iri.trim().is_empty() || iri.contains('\n') || iri.contains('\r') {
            return Err(AppError::Validation(
                "outbox entry is blank or contains a newline".to_string(),
            ));
        }

        let slot = self.index_slot(name);
        let mut guard = slot.lock().await;
        let (needs_newline, len) = {
            let index = self.ensure_index(name, &mut guard).await?;
            (index.needs_newline, index.len)
        };

        let mut line = String::with_capacity(iri.len() + 2);
        if needs_newline {
            line.push('\n');
        }
        line.push_str(iri);
        line.push('\n');

        if let Err(e) = self.write_outbox_line(name, &line).await {
            // A partial write leaves the file out of step with the index
            *guard = None;
            tracing::warn!(actor = %name, error = %e, "Outbox append failed, index dropped");
            return Err(e);
        }

        if let Some(index) = guard.as_mut() {
            let start = len + u64::from(needs_newline);
            let end = start + iri.len() as u64;
            index.entries.push((start, end));
            index.len = end + 1;
            index.needs_newline = false;
        }
        Ok(())
    }

    async fn write_outbox_line(&self, name: &str, line: &str) -> Result<(), AppError> {
        tokio::fs::create_dir_all(self.actor_dir(name)).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.outbox_path(name))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Number of entries in the actor's outbox.
    pub async fn outbox_len(&self, name: &str) -> Result<usize, AppError> {
        validate_identifier(name)?;
        if !tokio::fs::try_exists(self.outbox_path(name)).await? {
            return Ok(0);
        }
        let slot = self.index_slot(name);
        let mut guard = slot.lock().await;
        Ok(self.ensure_index(name, &mut guard).await?.entries.len())
    }

    /// Entries `[(page-1)*page_size, page*page_size)` in append order.
    ///
    /// Pages are 1-based; page 0 reads as page 1. Past the end is empty.
    pub async fn read_outbox_page(
        &self,
        name: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<String>, AppError> {
        validate_identifier(name)?;
        if !tokio::fs::try_exists(self.outbox_path(name)).await? {
            return Ok(Vec::new());
        }
        let page = page.max(1);

        let (start, end) = {
            let slot = self.index_slot(name);
            let mut guard = slot.lock().await;
            let index = self.ensure_index(name, &mut guard).await?;

            let first = (page - 1).saturating_mul(page_size);
            let last = first.saturating_add(page_size).min(index.entries.len());
            if first >= last {
                return Ok(Vec::new());
            }
            (index.entries[first].0, index.entries[last - 1].1)
        };

        let mut file = tokio::fs::File::open(self.outbox_path(name)).await?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut buffer = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buffer).await?;

        let text = String::from_utf8(buffer)
            .map_err(|e| AppError::CorruptPersistedState(format!("outbox {}: {}", name, e)))?;
        Ok(text
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Write to a sibling temp file, then rename over `path`.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), AppError> {
    let tmp = path.with_extension(format!("tmp-{}", ulid::Ulid::new()));
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
