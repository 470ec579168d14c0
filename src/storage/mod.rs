//! Append-only storage backends.
//!
//! Every strategy implements [`Backend`], so controllers hold a list of
//! `Arc<dyn Backend>` and never know which concrete store they feed.
//!
//! ## Destination locking
//!
//! Writes addressed to the same physical file are mutually exclusive across
//! every backend instance in the process. [`destination_lock`] hands out one
//! shared async mutex per absolute path; instances constructed against the same
//! path therefore serialize their inspect/alter/insert sequences. Writes to
//! different files proceed concurrently.
pub mod csv_file;
pub mod sqlite;

use crate::error::{AppResult, MesuraError};
use crate::record::Record;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub use self::csv_file::CsvBackend;
pub use self::sqlite::SqliteBackend;

/// A storage strategy that appends records per source.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short label used in diagnostics.
    fn name(&self) -> &str;

    /// Appends `record` to the destination for `source_name`.
    ///
    /// Built-in strategies log and swallow ordinary storage failures, so an
    /// `Err` here is reserved for failures the caller should know about.
    async fn write(&self, record: &Record, source_name: &str) -> AppResult<()>;
}

type DestinationLock = Arc<tokio::sync::Mutex<()>>;

// Entries are never removed; the map grows by one per distinct destination.
static DESTINATION_LOCKS: Lazy<Mutex<HashMap<PathBuf, DestinationLock>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the process-wide lock guarding `path`, creating it if absent.
///
/// `path` should already be absolute; see [`resolve_destination`].
pub fn destination_lock(path: &Path) -> DestinationLock {
    let mut locks = DESTINATION_LOCKS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    locks
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

/// Turns a source name into a storage-safe identifier.
pub fn normalize_source_name(source_name: &str) -> String {
    source_name.replace('-', "_")
}

/// Creates the parent directory of `path` and returns its absolute form.
///
/// The parent is canonicalized, so two spellings of the same file share one
/// destination lock.
pub fn resolve_destination(path: &Path) -> AppResult<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| MesuraError::Storage(format!("'{}' is not a file path", path.display())))?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    Ok(parent.canonicalize()?.join(file_name))
}

/// Creates `dir` if needed and returns its canonical form.
pub fn resolve_directory(dir: &Path) -> AppResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    Ok(dir.canonicalize()?)
}
