use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use common::{Catalog, Record};

pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RecordCacheFile {
    version: u32,
    records: BTreeMap<String, Record>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    catalog: Catalog,
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Encode(Box<bincode::ErrorKind>),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "io error: {}", err),
            StoreError::Encode(err) => write!(f, "encode error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<Box<bincode::ErrorKind>> for StoreError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        StoreError::Encode(err)
    }
}

pub fn load_records(path: &Path) -> BTreeMap<String, Record> {
    match read_blob::<RecordCacheFile>(path) {
        Ok(Some(file)) if file.version == STORE_VERSION => file.records,
        Ok(Some(file)) => {
            warn!(
                "Record cache {:?} has version {}, starting empty",
                path, file.version
            );
            BTreeMap::new()
        }
        Ok(None) => BTreeMap::new(),
        Err(err) => {
            warn!("Failed to read record cache {:?}: {}, starting empty", path, err);
            BTreeMap::new()
        }
    }
}

pub fn save_records(path: &Path, records: &BTreeMap<String, Record>) -> Result<(), StoreError> {
    let file = RecordCacheFile {
        version: STORE_VERSION,
        records: records.clone(),
    };
    write_blob(path, &file)
}

pub fn load_snapshot(path: &Path) -> Option<Catalog> {
    match read_blob::<SnapshotFile>(path) {
        Ok(Some(file)) if file.version == STORE_VERSION => Some(file.catalog),
        Ok(Some(file)) => {
            warn!(
                "Snapshot {:?} has version {}, ignoring it",
                path, file.version
            );
            None
        }
        Ok(None) => None,
        Err(err) => {
            warn!("Failed to read snapshot {:?}: {}, ignoring it", path, err);
            None
        }
    }
}

pub fn save_snapshot(path: &Path, catalog: &Catalog) -> Result<(), StoreError> {
    let file = SnapshotFile {
        version: STORE_VERSION,
        catalog: catalog.clone(),
    };
    write_blob(path, &file)
}

fn read_blob<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path)?;
    let mut decoder = GzDecoder::new(file);
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;
    let value = bincode::deserialize(&bytes)?;
    Ok(Some(value))
}

fn write_blob<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let bytes = bincode::serialize(value)?;
    let file = File::create(path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&bytes)?;
    encoder.finish()?;
    Ok(())
}
