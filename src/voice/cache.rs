//! Content-addressed speech cache
//!
//! Synthesized audio is keyed by a hash of (text, voice, model) so identical
//! requests across sessions reuse the same bytes. Entries are immutable once
//! written: the first writer of a key wins and later writers are no-ops.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use mini_moka::sync::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::{Error, Result};

/// Inputs that fully determine synthesized audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice_id: String,
    pub model_id: String,
}

/// Hex SHA-256 of a synthesis request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a request
    ///
    /// Each field is length-prefixed so ("ab", "c") and ("a", "bc") differ.
    #[must_use]
    pub fn new(request: &SynthesisRequest) -> Self {
        let mut hasher = Sha256::new();
        for field in [&request.text, &request.voice_id, &request.model_id] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character shard directory
    fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cached audio for one key
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// MP3 bytes
    pub audio: Bytes,
    pub created_at: DateTime<Utc>,
    pub voice_id: String,
    pub model_id: String,
}

impl CacheEntry {
    /// Build an entry for freshly synthesized audio
    #[must_use]
    pub fn new(request: &SynthesisRequest, audio: Bytes) -> Self {
        Self {
            key: CacheKey::new(request),
            audio,
            created_at: Utc::now(),
            voice_id: request.voice_id.clone(),
            model_id: request.model_id.clone(),
        }
    }

    fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }
}

/// Speech cache backend
#[async_trait]
pub trait SpeechCache: Send + Sync {
    /// Look up an entry
    ///
    /// # Errors
    ///
    /// Returns `Error::Cache` if the backend cannot be read
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Store an entry; a no-op if the key already exists
    ///
    /// # Errors
    ///
    /// Returns `Error::Cache` if the backend cannot be written
    async fn put(&self, entry: CacheEntry) -> Result<()>;

    /// Whether the entry is missing or older than `max_age`
    ///
    /// # Errors
    ///
    /// Returns `Error::Cache` if the backend cannot be read
    async fn is_stale(&self, key: &CacheKey, max_age: Duration) -> Result<bool> {
        Ok(self
            .get(key)
            .await?
            .is_none_or(|entry| entry.age() > max_age))
    }
}

/// Cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory of the on-disk cache
    pub dir: PathBuf,
    /// Entries older than this are pruned
    pub retention: Duration,
    /// Byte budget of the in-process tier
    pub memory_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let dir = directories::BaseDirs::new().map_or_else(
            || PathBuf::from(".eva-cache"),
            |d| d.cache_dir().join("eva").join("voice").join("speech"),
        );

        Self {
            dir,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            memory_capacity: 64 * 1024 * 1024,
        }
    }
}

/// On-disk metadata stored next to each audio file
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryMeta {
    created_at: DateTime<Utc>,
    size: usize,
    voice_id: String,
    model_id: String,
}

/// Outcome of a prune pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub examined: usize,
    pub removed: usize,
    pub bytes_freed: u64,
    /// Audio or temp files with no metadata, left by interrupted writes
    pub orphans_removed: usize,
}

/// Filesystem cache: `<root>/<key[0..2]>/<key>.mp3` plus `<key>.json`
///
/// The metadata file commits an entry. Both files are published with a hard
/// link, which never replaces an existing file.
pub struct FsSpeechCache {
    root: PathBuf,
}

impl FsSpeechCache {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn audio_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.shard()).join(format!("{key}.mp3"))
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.shard()).join(format!("{key}.json"))
    }

    /// Remove entries older than `max_age`
    ///
    /// # Errors
    ///
    /// Returns `Error::Cache` if the cache root cannot be listed
    pub async fn prune(&self, max_age: Duration) -> Result<PruneReport> {
        let mut report = PruneReport::default();

        let mut shards = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(Error::Cache(e.to_string())),
        };

        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|e| Error::Cache(e.to_string()))?
        {
            if !shard.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }

            let mut files = fs::read_dir(shard.path())
                .await
                .map_err(|e| Error::Cache(e.to_string()))?;

            while let Some(file) = files
                .next_entry()
                .await
                .map_err(|e| Error::Cache(e.to_string()))?
            {
                let path = file.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some("json") => prune_entry(&path, max_age, &mut report).await,
                    Some(_) => sweep_orphan(&path, max_age, &mut report).await,
                    None => {}
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            removed = report.removed,
            bytes_freed = report.bytes_freed,
            orphans_removed = report.orphans_removed,
            "speech cache pruned"
        );
        Ok(report)
    }
}

async fn read_meta(path: &Path) -> std::io::Result<EntryMeta> {
    let data = fs::read(path).await?;
    serde_json::from_slice(&data).map_err(std::io::Error::other)
}

/// Remove a committed entry once it is older than `max_age`
async fn prune_entry(meta_path: &Path, max_age: Duration, report: &mut PruneReport) {
    report.examined += 1;

    let meta = match read_meta(meta_path).await {
        Ok(meta) => meta,
        Err(e) => {
            tracing::warn!(path = %meta_path.display(), error = %e, "unreadable cache metadata");
            return;
        }
    };

    let age = (Utc::now() - meta.created_at).to_std().unwrap_or_default();
    if age <= max_age {
        return;
    }

    // Uncommit first so readers never see metadata without audio
    if let Err(e) = fs::remove_file(meta_path).await {
        tracing::warn!(path = %meta_path.display(), error = %e, "failed to remove cache metadata");
        return;
    }
    report.removed += 1;
    report.bytes_freed += meta.size as u64;

    let audio_path = meta_path.with_extension("mp3");
    if let Err(e) = fs::remove_file(&audio_path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %audio_path.display(), error = %e, "failed to remove cache audio");
    }
}

/// Remove an uncommitted audio or temp file older than `max_age`
async fn sweep_orphan(path: &Path, max_age: Duration, report: &mut PruneReport) {
    let is_temp = path.extension().and_then(|e| e.to_str()) == Some("tmp");
    if !is_temp {
        let committed = fs::try_exists(path.with_extension("json"))
            .await
            .unwrap_or(true);
        if committed {
            return;
        }
    }

    let Ok(metadata) = fs::metadata(path).await else {
        return;
    };
    let age = metadata
        .modified()
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .unwrap_or_default();
    if age <= max_age {
        return;
    }

    match fs::remove_file(path).await {
        Ok(()) => {
            report.orphans_removed += 1;
            report.bytes_freed += metadata.len();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove orphaned cache file");
        }
    }
}

/// Publish `data` at `path` unless the path is already taken
///
/// Writes a temp file, then hard-links it into place. Returns `false` when
/// another writer got there first; the existing file is left untouched.
async fn publish(path: &Path, data: &[u8]) -> std::io::Result<bool> {
    let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    let linked = fs::hard_link(&temp_path, path).await;
    if let Err(e) = fs::remove_file(&temp_path).await {
        tracing::debug!(path = %temp_path.display(), error = %e, "failed to remove temp file");
    }

    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl SpeechCache for FsSpeechCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let meta = match read_meta(&self.meta_path(key)).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Cache(e.to_string())),
        };

        let audio = match fs::read(self.audio_path(key)).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Cache(e.to_string())),
        };

        Ok(Some(CacheEntry {
            key: key.clone(),
            audio,
            created_at: meta.created_at,
            voice_id: meta.voice_id,
            model_id: meta.model_id,
        }))
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let meta_path = self.meta_path(&entry.key);
        if fs::try_exists(&meta_path).await.unwrap_or(false) {
            tracing::trace!(key = %entry.key, "cache entry exists, skipping write");
            return Ok(());
        }

        let audio_path = self.audio_path(&entry.key);
        if let Some(parent) = audio_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Cache(e.to_string()))?;
        }

        let wrote_audio = publish(&audio_path, &entry.audio)
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;

        // Audio already there: a concurrent writer or an interrupted one.
        // Describe the file that won instead of replacing it.
        let size = if wrote_audio {
            entry.audio.len()
        } else {
            let existing = fs::metadata(&audio_path)
                .await
                .map_err(|e| Error::Cache(e.to_string()))?;
            usize::try_from(existing.len()).unwrap_or(usize::MAX)
        };

        let meta = EntryMeta {
            created_at: entry.created_at,
            size,
            voice_id: entry.voice_id,
            model_id: entry.model_id,
        };
        let meta_json = serde_json::to_vec(&meta)?;

        let committed = publish(&meta_path, &meta_json)
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;

        if committed {
            tracing::debug!(key = %entry.key, bytes = meta.size, "cache entry written");
        } else {
            tracing::trace!(key = %entry.key, "cache entry written concurrently, keeping first");
        }
        Ok(())
    }
}

/// Process-local cache bounded by total audio bytes
#[derive(Clone)]
pub struct MemorySpeechCache {
    entries: Cache<String, CacheEntry>,
    /// Serializes check-then-insert so the first put of a key wins
    insert_lock: Arc<Mutex<()>>,
}

impl MemorySpeechCache {
    #[must_use]
    pub fn new(capacity_bytes: u64, ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .weigher(|_key, entry: &CacheEntry| {
                    u32::try_from(entry.audio.len()).unwrap_or(u32::MAX)
                })
                .max_capacity(capacity_bytes)
                .time_to_live(ttl)
                .build(),
            insert_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl SpeechCache for MemorySpeechCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(self.entries.get(&key.0))
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let _guard = self
            .insert_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.entries.contains_key(&entry.key.0) {
            self.entries.insert(entry.key.0.clone(), entry);
        }
        Ok(())
    }
}

/// Memory tier in front of the filesystem cache
pub struct TieredSpeechCache {
    memory: MemorySpeechCache,
    disk: Arc<FsSpeechCache>,
}

impl TieredSpeechCache {
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            memory: MemorySpeechCache::new(config.memory_capacity, config.retention),
            disk: Arc::new(FsSpeechCache::new(config.dir.clone())),
        }
    }

    #[must_use]
    pub fn disk(&self) -> Arc<FsSpeechCache> {
        Arc::clone(&self.disk)
    }
}

#[async_trait]
impl SpeechCache for TieredSpeechCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self.memory.get(key).await? {
            return Ok(Some(entry));
        }

        let entry = self.disk.get(key).await?;
        if let Some(entry) = &entry {
            self.memory.put(entry.clone()).await?;
        }
        Ok(entry)
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let key = entry.key.clone();
        self.disk.put(entry.clone()).await?;

        // Mirror whatever the disk committed, which may be another writer's
        let committed = self.disk.get(&key).await?.unwrap_or(entry);
        self.memory.put(committed).await
    }
}
