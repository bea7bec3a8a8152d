use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};
use walkdir::WalkDir;

use common::{join_relpath, relpath_from, AttrMap, Record};
use metadata::{MetadataError, TagAttributes};

pub trait Extractor {
    fn extract(&self, path: &Path) -> Result<TagAttributes, MetadataError>;

    fn enrich(&self, _path: &Path, _extension: &str) -> AttrMap {
        AttrMap::new()
    }
}

pub struct TagReader;

impl Extractor for TagReader {
    fn extract(&self, path: &Path) -> Result<TagAttributes, MetadataError> {
        metadata::read_attributes(path)
    }

    fn enrich(&self, path: &Path, extension: &str) -> AttrMap {
        metadata::derive_rating(path, extension)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ScanOptions {
    pub force_refresh: bool,
    pub skip_scan: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScanStats {
    pub candidates: usize,
    pub extracted: usize,
    pub fresh: usize,
    pub failed: usize,
    pub pruned: usize,
}

#[derive(Clone, Debug)]
pub struct CategoryScope {
    pub code: String,
    pub dir: String,
}

#[derive(Debug)]
pub enum ScanError {
    Io(std::io::Error),
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        ScanError::Io(err)
    }
}

pub fn scan_records(
    root: &Path,
    scopes: &[CategoryScope],
    extensions: &[String],
    options: ScanOptions,
    extractor: &dyn Extractor,
    records: &mut BTreeMap<String, Record>,
) -> Result<ScanStats, ScanError> {
    let mut stats = ScanStats::default();
    if options.skip_scan {
        info!("Scan skipped, keeping {} cached records", records.len());
        return Ok(stats);
    }

    let candidates = collect_candidates(root, extensions);
    stats.candidates = candidates.len();

    for (relpath, modified_ms) in candidates {
        if !options.force_refresh && is_fresh(records, &relpath, modified_ms) {
            stats.fresh += 1;
            continue;
        }
        let full = join_relpath(root, &relpath);
        let extension = extension_of(&relpath);
        let record = match extractor.extract(&full) {
            Ok(tags) => {
                stats.extracted += 1;
                let TagAttributes {
                    mut attributes,
                    format_info,
                } = tags;
                for (key, value) in extractor.enrich(&full, &extension) {
                    attributes.insert(key, value);
                }
                Record {
                    path: relpath.clone(),
                    attributes,
                    format_info,
                    category_code: claim_category(scopes, &relpath),
                    modified_ms,
                    scanned_at: now_secs(),
                    extension,
                    error: None,
                }
            }
            Err(err) => {
                warn!("Failed to extract tags for {:?}: {:?}", full, err);
                stats.failed += 1;
                Record {
                    path: relpath.clone(),
                    attributes: AttrMap::new(),
                    format_info: AttrMap::new(),
                    category_code: claim_category(scopes, &relpath),
                    modified_ms,
                    scanned_at: now_secs(),
                    extension,
                    error: Some(format!("{:?}", err)),
                }
            }
        };
        records.insert(relpath, record);
    }

    stats.pruned = prune_missing(root, records)?;
    info!(
        "Scan finished: {} candidates, {} extracted, {} fresh, {} failed, {} pruned",
        stats.candidates, stats.extracted, stats.fresh, stats.failed, stats.pruned
    );
    Ok(stats)
}

pub fn is_fresh(records: &BTreeMap<String, Record>, relpath: &str, modified_ms: u64) -> bool {
    records
        .get(relpath)
        .map(|record| record.modified_ms == modified_ms)
        .unwrap_or(false)
}

fn collect_candidates(root: &Path, extensions: &[String]) -> Vec<(String, u64)> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let extension = match entry.path().extension().and_then(|e| e.to_str()) {
            Some(ext) => ext.to_ascii_lowercase(),
            None => continue,
        };
        if !extensions.iter().any(|known| *known == extension) {
            continue;
        }
        let relpath = match relpath_from(root, entry.path()) {
            Some(relpath) => relpath,
            None => continue,
        };
        let modified_ms = match entry.metadata() {
            Ok(meta) => match meta.modified() {
                Ok(time) => system_time_ms(time),
                Err(_) => continue,
            },
            Err(err) => {
                warn!("Cannot stat {:?}, skipping: {}", entry.path(), err);
                continue;
            }
        };
        out.push((relpath, modified_ms));
    }
    out.sort();
    out
}

// A prune only trusts a definite not-found answer. Unreadable entries stay
// cached, anything else points at a broken environment and stops the run.
fn prune_missing(
    root: &Path,
    records: &mut BTreeMap<String, Record>,
) -> Result<usize, ScanError> {
    let mut gone: Vec<String> = Vec::new();
    for relpath in records.keys() {
        let full = join_relpath(root, relpath);
        match fs::metadata(&full) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => gone.push(relpath.clone()),
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                warn!("Cannot verify {:?}, keeping record: {}", full, err);
            }
            Err(err) => return Err(err.into()),
        }
    }
    for relpath in &gone {
        records.remove(relpath);
    }
    Ok(gone.len())
}

// The most specific scope wins; ties keep the first configured category.
fn claim_category(scopes: &[CategoryScope], relpath: &str) -> Option<String> {
    let mut best: Option<&CategoryScope> = None;
    for scope in scopes {
        if !scope_claims(&scope.dir, relpath) {
            continue;
        }
        let more_specific = match best {
            Some(current) => scope.dir.len() > current.dir.len(),
            None => true,
        };
        if more_specific {
            best = Some(scope);
        }
    }
    best.map(|scope| scope.code.clone())
}

fn scope_claims(dir: &str, relpath: &str) -> bool {
    if dir.is_empty() {
        return true;
    }
    match relpath.strip_prefix(dir) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn extension_of(relpath: &str) -> String {
    Path::new(relpath)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

fn system_time_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}
