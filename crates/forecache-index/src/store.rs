//! Persistent path index backed by redb.
//!
//! One table per model, keyed by forecast time (`YYYY-MM-DDTHHMM`) with the
//! absolute path of the cached file as value. Keys sort chronologically,
//! which `cleanup` relies on to stop at the first unexpired key.
//!
//! All tables are created when the index is opened; a model that was not
//! registered at open time is an error, never an implicit new table. All
//! writes are synchronous (write txn + commit).

use crate::removal::RemovalSink;
use chrono::{DateTime, Utc};
use forecache_common::ModelRegistry;
use forecache_common::path::{index_key_for, parse_index_key};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Error type for path index operations
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("model not registered in index: {0}")]
    UnknownModel(String),
    #[error("too many model tables: {count} (max {max})")]
    TooManyTables { count: usize, max: usize },
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),
}

impl From<redb::TransactionError> for IndexError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<IndexError> for forecache_common::Error {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::UnknownModel(model) => Self::UnknownModel(model),
            other => Self::index(other.to_string()),
        }
    }
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Result of a `set`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOutcome {
    /// Previous file for the key, handed to the removal sink
    pub superseded: Option<PathBuf>,
}

/// Result of a `rebuild`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Keys inserted per model
    pub inserted: BTreeMap<String, usize>,
    /// Data files whose name is not a forecast time
    pub ignored: usize,
    /// Models whose scan or write failed
    pub errors: usize,
}

impl RebuildReport {
    #[must_use]
    pub fn total_inserted(&self) -> usize {
        self.inserted.values().sum()
    }
}

/// Handle on one model's table
#[derive(Debug, Clone)]
struct IndexTable {
    name: String,
}

impl IndexTable {
    fn definition(&self) -> TableDefinition<'_, &'static str, &'static str> {
        TableDefinition::new(&self.name)
    }
}

/// Forecast-time -> path index
pub struct PathIndex {
    db: Database,
    tables: BTreeMap<String, IndexTable>,
    removal: Arc<dyn RemovalSink>,
}

impl PathIndex {
    /// Upper bound on model tables in one database
    pub const MAX_TABLES: usize = 64;

    /// Open (or create) the index at `path` with one table per model key.
    ///
    /// redb holds an exclusive lock on the file, so a second writer (in
    /// this or another process) fails here.
    pub fn open<I, S>(
        path: impl AsRef<Path>,
        model_keys: I,
        removal: Arc<dyn RemovalSink>,
    ) -> IndexResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let path = path.as_ref();
        let tables: BTreeMap<String, IndexTable> = model_keys
            .into_iter()
            .map(|k| {
                let name = k.into();
                (name.clone(), IndexTable { name })
            })
            .collect();
        if tables.len() > Self::MAX_TABLES {
            return Err(IndexError::TooManyTables {
                count: tables.len(),
                max: Self::MAX_TABLES,
            });
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        for table in tables.values() {
            let _t = write_txn.open_table(table.definition())?;
        }
        write_txn.commit()?;

        info!(
            "Path index opened at {} with {} model tables",
            path.display(),
            tables.len()
        );
        Ok(Self {
            db,
            tables,
            removal,
        })
    }

    /// Open the index with one table per model of `registry`
    pub fn open_for(
        path: impl AsRef<Path>,
        registry: &ModelRegistry,
        removal: Arc<dyn RemovalSink>,
    ) -> IndexResult<Self> {
        Self::open(path, registry.keys(), removal)
    }

    fn table(&self, model_key: &str) -> IndexResult<&IndexTable> {
        self.tables
            .get(model_key)
            .ok_or_else(|| IndexError::UnknownModel(model_key.to_string()))
    }

    /// Path currently recorded for `key`
    pub fn get(&self, model_key: &str, key: &str) -> IndexResult<Option<String>> {
        let table = self.table(model_key)?;
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(table.definition())?;
        Ok(t.get(key)?.map(|v| v.value().to_string()))
    }

    /// Record `path` for `key`, superseding any previous file.
    ///
    /// When the key already pointed at a different file that still exists,
    /// that file is handed to the removal sink after the commit.
    pub fn set(&self, model_key: &str, key: &str, path: &Path) -> IndexResult<SetOutcome> {
        let table = self.table(model_key)?;
        let value = path
            .to_str()
            .ok_or_else(|| IndexError::NonUtf8Path(path.to_path_buf()))?;

        let write_txn = self.db.begin_write()?;
        let previous = {
            let mut t = write_txn.open_table(table.definition())?;
            t.insert(key, value)?.map(|old| old.value().to_string())
        };
        write_txn.commit()?;
        debug!("Index updated for {}: {} -> {}", model_key, key, value);

        let superseded = previous
            .filter(|old| old != value)
            .map(PathBuf::from)
            .filter(|old| old.exists());
        if let Some(old) = &superseded {
            info!(
                "Superseding {} for {} key {}",
                old.display(),
                model_key,
                key
            );
            self.removal.remove(old.clone());
        }
        Ok(SetOutcome { superseded })
    }

    /// Remove every key strictly older than `cutoff`.
    ///
    /// Scans in key order and stops at the first key at or after the
    /// cutoff. Keys that do not parse as forecast times are skipped.
    pub fn cleanup(&self, model_key: &str, cutoff: DateTime<Utc>) -> IndexResult<usize> {
        let table = self.table(model_key)?;
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut t = write_txn.open_table(table.definition())?;
            let mut expired = Vec::new();
            for entry in t.iter()? {
                let (key, _) = entry?;
                let key = key.value();
                match parse_index_key(key) {
                    Ok(time) if time < cutoff => expired.push(key.to_string()),
                    Ok(_) => break,
                    Err(_) => warn!("Skipping unparsable index key for {}: {}", model_key, key),
                }
            }
            for key in &expired {
                t.remove(key.as_str())?;
            }
            expired.len()
        };
        write_txn.commit()?;

        if removed > 0 {
            info!("Expired {} index keys for {}", removed, model_key);
        } else {
            debug!("No expired index keys for {}", model_key);
        }
        Ok(removed)
    }

    /// Entries with `from <= key < to`, in key order
    pub fn range(
        &self,
        model_key: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> IndexResult<Vec<(String, String)>> {
        let table = self.table(model_key)?;
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(table.definition())?;
        let lower = from.map_or(Bound::Unbounded, Bound::Included);
        let upper = to.map_or(Bound::Unbounded, Bound::Excluded);
        let mut result = Vec::new();
        for entry in t.range::<&str>((lower, upper))? {
            let (key, value) = entry?;
            result.push((key.value().to_string(), value.value().to_string()));
        }
        Ok(result)
    }

    /// Number of keys recorded for a model
    pub fn len(&self, model_key: &str) -> IndexResult<u64> {
        let table = self.table(model_key)?;
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(table.definition())?;
        Ok(t.len()?)
    }

    /// Model keys with a table in this index
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Re-index data files already under `cache_root`.
    ///
    /// Walks `<cache_root>/<model>` for every registered model and inserts
    /// each data file whose key is not yet present. When several runs hold
    /// the same forecast time, the latest run is indexed. Existing mappings are
    /// never overwritten and nothing is deleted, so running it twice inserts
    /// nothing the second time. `extra_extension` is accepted in addition
    /// to each model's own extension (placeholder files).
    pub fn rebuild(
        &self,
        cache_root: &Path,
        registry: &ModelRegistry,
        extra_extension: Option<&str>,
    ) -> RebuildReport {
        info!("Starting path index rebuild from {}", cache_root.display());
        let root = std::path::absolute(cache_root).unwrap_or_else(|_| cache_root.to_path_buf());
        let mut report = RebuildReport::default();

        for model in registry.iter() {
            if !self.tables.contains_key(&model.key) {
                continue;
            }
            let model_dir = root.join(&model.key);
            if !model_dir.is_dir() {
                continue;
            }

            let mut extensions = vec![model.file_extension.as_str()];
            if let Some(ext) = extra_extension {
                extensions.push(ext);
            }

            match self.rebuild_model(&model.key, &model_dir, &extensions, &mut report.ignored) {
                Ok(count) => {
                    if count > 0 {
                        info!("Restored {} index keys for {}", count, model.name);
                    }
                    report.inserted.insert(model.key.clone(), count);
                }
                Err(e) => {
                    error!("Failed to rebuild index for {}: {}", model.name, e);
                    report.errors += 1;
                }
            }
        }

        info!(
            "Path index rebuild completed, {} keys restored",
            report.total_inserted()
        );
        report
    }

    fn rebuild_model(
        &self,
        model_key: &str,
        model_dir: &Path,
        extensions: &[&str],
        ignored: &mut usize,
    ) -> IndexResult<usize> {
        let files = collect_data_files(model_dir, extensions)?;
        let table = self.table(model_key)?;

        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut t = write_txn.open_table(table.definition())?;
            let mut inserted = 0;
            for file in files {
                let Some(key) = index_key_for(&file).filter(|k| parse_index_key(k).is_ok())
                else {
                    *ignored += 1;
                    continue;
                };
                let Some(value) = file.to_str() else {
                    *ignored += 1;
                    continue;
                };
                if t.get(key.as_str())?.is_none() {
                    t.insert(key.as_str(), value)?;
                    inserted += 1;
                }
            }
            inserted
        };
        write_txn.commit()?;
        Ok(inserted)
    }
}

/// Every file under `dir` ending in one of `extensions`, newest run first
fn collect_data_files(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>, walkdir::Error> {
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            entry.file_type().is_dir()
                || entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| extensions.iter().any(|ext| name.ends_with(ext)))
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    // Run directories sort chronologically; descending lets the latest
    // reference time claim each key
    files.sort_unstable_by(|a, b| b.cmp(a));
    Ok(files)
}
