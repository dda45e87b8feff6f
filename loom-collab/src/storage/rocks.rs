//! RocksDB-backed store implementing all three storage seams.
//!
//! Column families:
//! - `journal`: journal entries, keyed `doc_id (16) ++ sequence (8, BE)`
//! - `checkpoints`: one LZ4-compressed checkpoint per document
//! - `locks`: current lease per document
//! - `meta`: last appended sequence per document
//!
//! Big-endian sequence keys make a forward iterator from
//! `doc_id ++ from` yield one document's entries in replay order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use loom_core::{now_millis, DocumentId};

use super::{
    extend_lease, grant_lease, Checkpoint, JournalEntry, JournalStore, LockError, LockLease,
    LockService, SnapshotStore, StoreError,
};

const CF_JOURNAL: &str = "journal";
const CF_CHECKPOINTS: &str = "checkpoints";
const CF_LOCKS: &str = "locks";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_JOURNAL, CF_CHECKPOINTS, CF_LOCKS, CF_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write. Journal appends always sync regardless.
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("loom_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches and buffers for tests.
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

pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes lease read-modify-write
    lock_guard: Mutex<()>,
}

impl DocumentStore {
    /// Open (or create) the store at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self { db, config, lock_guard: Mutex::new(()) })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_JOURNAL => {
                // many small sequential writes, scanned by doc_id prefix
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_CHECKPOINTS => {
                // blobs are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_LOCKS | CF_META => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }
        opts
    }

    /// Every document with at least one journal entry.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_META)?;
        let mut docs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Ok(bytes) = <[u8; 16]>::try_from(key.as_ref()) {
                docs.push(Uuid::from_bytes(bytes));
            }
        }
        Ok(docs)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Write raw bytes into the journal, bypassing encoding.
    #[cfg(test)]
    fn put_raw_journal(&self, doc_id: DocumentId, sequence: u64, bytes: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_JOURNAL)?;
        self.db.put_cf(cf, journal_key(doc_id, sequence), bytes)?;
        Ok(())
    }

    fn write_options(&self, sync: bool) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(sync || self.config.sync_writes);
        write_opts
    }

    fn load_lease(&self, doc_id: DocumentId) -> Result<Option<LockLease>, StoreError> {
        let cf = self.cf(CF_LOCKS)?;
        self.db
            .get_cf(cf, doc_id.as_bytes())?
            .map(|bytes| LockLease::decode(&bytes))
            .transpose()
    }

    fn store_lease(&self, lease: &LockLease) -> Result<(), StoreError> {
        let cf = self.cf(CF_LOCKS)?;
        self.db.put_cf_opt(cf, lease.doc_id.as_bytes(), lease.encode()?, &self.write_options(true))?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl JournalStore for DocumentStore {
    fn append(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        let cf_journal = self.cf(CF_JOURNAL)?;
        let cf_meta = self.cf(CF_META)?;

        let last = self.last_sequence(entry.doc_id)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_journal, journal_key(entry.doc_id, entry.sequence), entry.encode()?);
        batch.put_cf(cf_meta, entry.doc_id.as_bytes(), last.max(entry.sequence).to_be_bytes());

        // an acknowledged edit must survive a crash
        self.db.write_opt(batch, &self.write_options(true))?;
        Ok(())
    }

    fn read_from(
        &self,
        doc_id: DocumentId,
        from_sequence: u64,
    ) -> Result<(Vec<JournalEntry>, usize), StoreError> {
        let cf = self.cf(CF_JOURNAL)?;
        let start = journal_key(doc_id, from_sequence);

        let mut entries = Vec::new();
        let mut corrupted = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[16..24]);
            let sequence = u64::from_be_bytes(seq_buf);

            // a record whose key disagrees with its body is as bad as a bad checksum
            match JournalEntry::decode(&value) {
                Ok(entry) if entry.verify() && entry.doc_id == doc_id && entry.sequence == sequence => {
                    entries.push(entry)
                }
                _ => corrupted += 1,
            }
        }
        Ok((entries, corrupted))
    }

    fn last_sequence(&self, doc_id: DocumentId) -> Result<u64, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => {
                let buf: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::DeserializationError(format!("bad sequence record for {doc_id}"))
                })?;
                Ok(u64::from_be_bytes(buf))
            }
            None => Ok(0),
        }
    }
}

impl SnapshotStore for DocumentStore {
    fn put(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        let compressed = lz4_flex::compress_prepend_size(&checkpoint.encode()?);
        self.db.put_cf_opt(
            cf,
            checkpoint.doc_id.as_bytes(),
            compressed,
            &self.write_options(true),
        )?;
        Ok(())
    }

    fn get(&self, doc_id: DocumentId) -> Result<Option<Checkpoint>, StoreError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        let Some(compressed) = self.db.get_cf(cf, doc_id.as_bytes())? else {
            return Ok(None);
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        Checkpoint::decode(&bytes).map(Some)
    }
}

impl LockService for DocumentStore {
    fn acquire(
        &self,
        doc_id: DocumentId,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockLease, LockError> {
        let _guard = self.lock_guard.lock().map_err(|_| poisoned())?;
        let lease = grant_lease(self.load_lease(doc_id)?.as_ref(), doc_id, holder, ttl, now_millis())?;
        self.store_lease(&lease)?;
        Ok(lease)
    }

    fn renew(&self, lease: &LockLease, ttl: Duration) -> Result<LockLease, LockError> {
        let _guard = self.lock_guard.lock().map_err(|_| poisoned())?;
        let renewed = extend_lease(self.load_lease(lease.doc_id)?.as_ref(), lease, ttl, now_millis())?;
        self.store_lease(&renewed)?;
        Ok(renewed)
    }

    fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let _guard = self.lock_guard.lock().map_err(|_| poisoned())?;
        if self.load_lease(lease.doc_id)?.is_some_and(|l| l.token == lease.token) {
            let cf = self.cf(CF_LOCKS)?;
            self.db
                .delete_cf_opt(cf, lease.doc_id.as_bytes(), &self.write_options(true))
                .map_err(StoreError::from)?;
        }
        Ok(())
    }
}

fn poisoned() -> LockError {
    LockError::Store(StoreError::Unavailable("lock mutex poisoned".into()))
}

/// `doc_id (16 bytes) ++ sequence (8 bytes big-endian)`
fn journal_key(doc_id: DocumentId, sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(doc_id.as_bytes());
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
