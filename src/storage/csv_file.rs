//! Flat-file backend: one CSV per source.
//!
//! The first record written for a source fixes the header. Later rows are laid
//! out in header order; fields that were not part of the header are dropped
//! (the header is never rewritten) and header columns the record lacks are
//! left empty.
use super::{destination_lock, normalize_source_name, resolve_directory, Backend};
use crate::error::AppResult;
use crate::record::Record;
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Backend writing `<data_dir>/<source>.csv` files.
#[derive(Debug, Clone)]
pub struct CsvBackend {
    data_dir: PathBuf,
}

impl CsvBackend {
    /// Creates the data directory if needed.
    pub fn new(data_dir: impl AsRef<Path>) -> AppResult<Self> {
        Ok(Self {
            data_dir: resolve_directory(data_dir.as_ref())?,
        })
    }

    /// Directory holding the CSV files.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// File that receives rows for `source_name`.
    pub fn file_for(&self, source_name: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}.csv", normalize_source_name(source_name)))
    }

    /// Appends `record`, returning the names of fields dropped because the
    /// header predates them.
    pub async fn try_write(&self, record: &Record, source_name: &str) -> AppResult<Vec<String>> {
        if record.is_empty() {
            return Ok(Vec::new());
        }
        let path = self.file_for(source_name);
        let record = record.clone();
        let guard = destination_lock(&path).lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            append_row(&path, &record)
        })
        .await?
    }
}

#[async_trait]
impl Backend for CsvBackend {
    fn name(&self) -> &str {
        "csv"
    }

    async fn write(&self, record: &Record, source_name: &str) -> AppResult<()> {
        match self.try_write(record, source_name).await {
            Ok(dropped) if !dropped.is_empty() => {
                debug!(
                    source = source_name,
                    "Fields not in the CSV header were dropped: {:?}", dropped
                );
            }
            Ok(_) => {}
            Err(e) => error!(source = source_name, "Error writing to CSV: {}", e),
        }
        Ok(())
    }
}

/// Header of an existing, non-empty file.
fn read_header(path: &Path) -> AppResult<Option<Vec<String>>> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => {}
        _ => return Ok(None),
    }
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let header = reader.headers()?.iter().map(str::to_string).collect();
    Ok(Some(header))
}

fn append_row(path: &Path, record: &Record) -> AppResult<Vec<String>> {
    let existing = read_header(path)?;
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::Writer::from_writer(file);

    let header = match existing {
        Some(header) => header,
        None => {
            let header: Vec<String> = record.keys().map(str::to_string).collect();
            writer.write_record(&header)?;
            header
        }
    };

    let row: Vec<String> = header
        .iter()
        .map(|column| record.get(column).map(ToString::to_string).unwrap_or_default())
        .collect();
    writer.write_record(&row)?;
    writer.flush()?;

    Ok(record
        .keys()
        .filter(|key| !header.iter().any(|column| column == key))
        .map(str::to_string)
        .collect())
}
