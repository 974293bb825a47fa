//! QuickReplyCache
//!
//! Synthesized audio for configured quick-reply phrases, keyed by
//! (provider, voice, normalized text). Files live under their own directory
//! and are never removed by the temp-file cleanup of the delivery path.

use crate::text;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct QuickReplyCache {
    dir: PathBuf,
    entries: Mutex<HashMap<String, PathBuf>>,
}

impl QuickReplyCache {
    /// Opens (and creates if needed) the cache directory, indexing the files
    /// already present.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create quick reply dir {}", dir.display()))?;

        let mut entries = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                entries.insert(stem.to_string(), path);
            }
        }
        debug!(dir = %dir.display(), count = entries.len(), "Opened quick reply cache");
        Ok(Self {
            dir,
            entries: Mutex::new(entries),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key(provider: &str, voice: &str, phrase: &str) -> String {
        let name = format!("{provider}|{voice}|{}", text::normalize(phrase));
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
            .simple()
            .to_string()
    }

    /// Cached audio for the phrase, if present on disk.
    pub fn find(&self, provider: &str, voice: &str, phrase: &str) -> Option<PathBuf> {
        let key = Self::key(provider, voice, phrase);
        let mut entries = self.entries.lock().ok()?;
        match entries.get(&key) {
            Some(path) if path.exists() => Some(path.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Copies freshly synthesized audio into the cache and returns the cached
    /// path. The source file is left untouched.
    pub async fn save(&self, provider: &str, voice: &str, phrase: &str, source: &Path) -> Result<PathBuf> {
        let key = Self::key(provider, voice, phrase);
        let file_name = match source.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{key}.{ext}"),
            None => key.clone(),
        };
        let target = self.dir.join(file_name);
        tokio::fs::copy(source, &target)
            .await
            .with_context(|| format!("Failed to cache quick reply audio {}", source.display()))?;
        match self.entries.lock() {
            Ok(mut entries) => {
                entries.insert(key, target.clone());
            }
            Err(_) => warn!("Quick reply index lock poisoned"),
        }
        Ok(target)
    }

    /// Whether `path` belongs to the cache and must survive cleanup.
    pub fn is_cached_file(&self, path: &Path) -> bool {
        path.starts_with(&self.dir)
    }
}
