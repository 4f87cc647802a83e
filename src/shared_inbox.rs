//! Images handed over by the share extension through a shared key-value
//! store: a flag saying new items arrived plus the list of their paths.

use crate::error::Result;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::io;
use std::path::{Path, PathBuf};

pub const KEY_HAS_NEW: &str = "hasNewSharedImages";
pub const KEY_PENDING: &str = "pendingSharedImages";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedImage {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// A JSON object file shared with the extension. Keys other than the two
/// above belong to other writers and are preserved.
pub struct SharedInbox {
    store: PathBuf,
}

impl SharedInbox {
    pub fn new(store: PathBuf) -> Self {
        Self { store }
    }

    pub fn store_path(&self) -> &Path {
        &self.store
    }

    /// Queues `image` the way the extension does.
    pub async fn enqueue(&self, image: &Path) -> Result<()> {
        let mut store = self.read_store().await?;
        let pending = store
            .entry(KEY_PENDING)
            .or_insert_with(|| Value::Array(Vec::new()));
        if !pending.is_array() {
            *pending = Value::Array(Vec::new());
        }
        if let Value::Array(items) = pending {
            items.push(Value::String(image.to_string_lossy().into_owned()));
        }
        store.insert(KEY_HAS_NEW.to_string(), Value::Bool(true));
        self.write_store(&store).await
    }

    /// Takes every pending image that still exists, deleting each file once
    /// read, and clears both keys. Does nothing unless the flag is set.
    pub async fn drain(&self) -> Result<Vec<SharedImage>> {
        let mut store = self.read_store().await?;
        if store.get(KEY_HAS_NEW).and_then(Value::as_bool) != Some(true) {
            return Ok(Vec::new());
        }

        let paths: Vec<PathBuf> = store
            .get(KEY_PENDING)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut images = Vec::with_capacity(paths.len());
        for path in paths {
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!("Could not remove shared image {:?}: {}", path, e);
                    }
                    images.push(SharedImage { path, bytes });
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Shared image {:?} is gone, skipping", path);
                }
                Err(e) => warn!("Could not read shared image {:?}: {}", path, e),
            }
        }

        store.insert(KEY_HAS_NEW.to_string(), Value::Bool(false));
        store.remove(KEY_PENDING);
        self.write_store(&store).await?;

        info!("Drained {} shared image(s)", images.len());
        Ok(images)
    }

    async fn read_store(&self) -> Result<Map<String, Value>> {
        let contents = match tokio::fs::read_to_string(&self.store).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => Ok(map),
            _ => {
                warn!("Shared store {:?} is not a JSON object, starting empty", self.store);
                Ok(Map::new())
            }
        }
    }

    async fn write_store(&self, store: &Map<String, Value>) -> Result<()> {
        if let Some(dir) = self.store.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec_pretty(store).map_err(io::Error::from)?;
        let tmp = self.store.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.store).await?;
        Ok(())
    }
}
