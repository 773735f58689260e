//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `rendered` — rendered canvas + thumbnail (bincode, LZ4 compressed)
//! - `strokes`  — persisted stroke log of evicted sessions (JSON, LZ4 compressed)
//! - `metadata` — per-session bookkeeping (bincode)
//!
//! All keys are the UTF-8 bytes of the session id. Every write updates
//! the payload and its metadata in one atomic batch, and metadata
//! read-modify-write cycles are serialized per store.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{unix_now, RenderedSnapshot, SnapshotStore, StoreError};
use crate::protocol::{DrawingStroke, SessionId};

const CF_RENDERED: &str = "rendered";
const CF_STROKES: &str = "strokes";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_RENDERED, CF_STROKES, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("duet_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Bookkeeping stored next to each session's payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    /// Strokes in the last persisted log
    pub stroke_count: u64,
    /// Uncompressed size of the last rendered snapshot
    pub rendered_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl SessionMetadata {
    fn new(session_id: &SessionId) -> Self {
        let now = unix_now();
        Self {
            session_id: session_id.to_string(),
            stroke_count: 0,
            rendered_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

pub struct RocksStore {
    db: DB,
    config: StoreConfig,
    /// Guards metadata load -> update -> write.
    metadata_lock: Mutex<()>,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened snapshot store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            metadata_lock: Mutex::new(()),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    pub fn load_metadata(&self, session_id: &SessionId) -> Result<SessionMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, session_id.as_str().as_bytes())? {
            Some(bytes) => SessionMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(session_id.clone())),
        }
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Write `payload` into `cf_name` and the updated metadata in one batch.
    fn put_with_metadata(
        &self,
        cf_name: &str,
        session_id: &SessionId,
        payload: &[u8],
        update: impl FnOnce(&mut SessionMetadata),
    ) -> Result<(), StoreError> {
        let cf = self.cf(cf_name)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let _guard = self.lock_metadata();
        let mut meta = self
            .load_metadata(session_id)
            .unwrap_or_else(|_| SessionMetadata::new(session_id));
        update(&mut meta);
        meta.updated_at = unix_now();

        let key = session_id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, key, lz4_flex::compress_prepend_size(payload));
        batch.put_cf(cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock_metadata(&self) -> MutexGuard<'_, ()> {
        // Guards (), so poisoning leaves nothing inconsistent.
        self.metadata_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get_decompressed(&self, cf_name: &str, session_id: &SessionId) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, session_id.as_str().as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Err(StoreError::NotFound(session_id.clone())),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl SnapshotStore for RocksStore {
    fn save_rendered(&self, session_id: &SessionId, snapshot: &RenderedSnapshot) -> Result<(), StoreError> {
        let encoded = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let size = snapshot.content.len() as u64;
        self.put_with_metadata(CF_RENDERED, session_id, &encoded, |meta| {
            meta.rendered_size = size;
        })
    }

    fn load_rendered(&self, session_id: &SessionId) -> Result<RenderedSnapshot, StoreError> {
        let bytes = self.get_decompressed(CF_RENDERED, session_id)?;
        let (snapshot, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(snapshot)
    }

    fn save_strokes(&self, session_id: &SessionId, strokes: &[DrawingStroke]) -> Result<(), StoreError> {
        // JSON rather than bincode: user ids deserialize through an untagged helper.
        let encoded = serde_json::to_vec(strokes).map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let count = strokes.len() as u64;
        self.put_with_metadata(CF_STROKES, session_id, &encoded, |meta| {
            meta.stroke_count = count;
        })
    }

    fn load_strokes(&self, session_id: &SessionId) -> Result<Vec<DrawingStroke>, StoreError> {
        let bytes = self.get_decompressed(CF_STROKES, session_id)?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    fn list_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            ids.push(SessionId::parse(id).map_err(StoreError::DeserializationError)?);
        }
        Ok(ids)
    }

    fn delete_session(&self, session_id: &SessionId) -> Result<(), StoreError> {
        let key = session_id.as_str().as_bytes();
        let _guard = self.lock_metadata();
        let mut batch = WriteBatch::default();
        for name in COLUMN_FAMILIES {
            batch.delete_cf(self.cf(name)?, key);
        }
        self.db.write(batch)?;
        Ok(())
    }
}
