//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: one record per slug: bincode-encoded `Document`,
//!   LZ4 compressed, keyed by the slug's UTF-8 bytes
//!
//! Reads are lock-free. `insert_if_absent` and `upsert` are read-modify-write
//! sequences, so they run under a store-wide write lock; that is what makes
//! "create at most once" hold when two connections race on a new slug.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{unix_now, Document, DocumentStore, StoreError};
use crate::protocol::Slug;

const CF_DOCUMENTS: &str = "documents";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("codeshare_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB-backed document store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write sequences
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors = vec![ColumnFamilyDescriptor::new(
            CF_DOCUMENTS,
            Self::cf_options(&config),
        )];

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db.cf_handle(CF_DOCUMENTS).ok_or_else(|| {
            StoreError::Unavailable(format!("Column family '{CF_DOCUMENTS}' not found"))
        })
    }

    fn read(&self, slug: &Slug) -> Result<Option<Document>, StoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, slug.as_str().as_bytes())? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Document::decode(&bytes).map(Some)
            }
            None => Ok(None),
        }
    }

    fn write(&self, doc: &Document) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let compressed = lz4_flex::compress_prepend_size(&doc.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(cf, doc.slug.as_str().as_bytes(), &compressed, &write_opts)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("write lock poisoned".into()))
    }
}

impl DocumentStore for RocksStore {
    fn get(&self, slug: &Slug) -> Result<Document, StoreError> {
        self.read(slug)?
            .ok_or_else(|| StoreError::NotFound(slug.clone()))
    }

    fn insert_if_absent(&self, doc: &Document) -> Result<bool, StoreError> {
        let _guard = self.lock()?;
        if self.read(&doc.slug)?.is_some() {
            return Ok(false);
        }
        self.write(doc)?;
        Ok(true)
    }

    fn upsert(&self, slug: &Slug, content: &str, language: &str) -> Result<Document, StoreError> {
        let _guard = self.lock()?;
        let mut doc = self
            .read(slug)?
            .unwrap_or_else(|| Document::empty(slug.clone(), language));
        doc.content = content.to_string();
        doc.language = language.to_string();
        doc.updated_at = unix_now();
        self.write(&doc)?;
        Ok(doc)
    }

    fn list_slugs(&self) -> Result<Vec<Slug>, StoreError> {
        let cf = self.cf()?;
        let mut slugs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let raw = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            match Slug::parse(raw) {
                Ok(slug) => slugs.push(slug),
                Err(e) => log::warn!("Skipping unreadable key in document store: {e}"),
            }
        }
        Ok(slugs)
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
