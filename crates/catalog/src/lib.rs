use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use common::{Catalog, CategoryTree, Playlist, Record};

pub mod config;
pub mod lock;
pub mod playlist;
pub mod scan;
pub mod store;
pub mod taxonomy;

pub use config::{
    config_path_from_env, load_or_create_config, resolve_path, ConfigError, IndexConfig,
};
pub use scan::{Extractor, ScanOptions, ScanStats, TagReader};

#[derive(Clone, Debug)]
pub struct RunContext {
    pub media_root: PathBuf,
    pub cache_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub playlist_store: Option<PathBuf>,
    pub config: IndexConfig,
}

impl RunContext {
    pub fn from_config(config_path: &Path, config: IndexConfig) -> Result<RunContext, CatalogError> {
        let media_root = match config::resolve_media_root(config_path, &config.media_root) {
            Some(root) => root,
            None => return Err(CatalogError::MediaRootMissing),
        };
        let cache_path = config::resolve_path(config_path, &config.cache_path);
        let snapshot_path = config::resolve_path(config_path, &config.snapshot_path);
        let playlist_store = config
            .playlists
            .as_ref()
            .map(|source| config::resolve_path(config_path, &source.store_path));
        Ok(RunContext {
            media_root,
            cache_path,
            snapshot_path,
            playlist_store,
            config,
        })
    }
}

#[derive(Debug)]
pub struct IndexOutcome {
    pub stats: ScanStats,
    pub records: BTreeMap<String, Record>,
    pub catalog: Catalog,
}

#[derive(Debug)]
pub enum CatalogError {
    Scan(scan::ScanError),
    Store(store::StoreError),
    Lock(lock::LockError),
    Playlist(playlist::PlaylistError),
    MediaRootMissing,
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Scan(err) => write!(f, "scan error: {}", err),
            CatalogError::Store(err) => write!(f, "store error: {}", err),
            CatalogError::Lock(err) => write!(f, "lock error: {}", err),
            CatalogError::Playlist(err) => write!(f, "playlist error: {}", err),
            CatalogError::MediaRootMissing => write!(f, "media_root is not configured"),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<scan::ScanError> for CatalogError {
    fn from(err: scan::ScanError) -> Self {
        CatalogError::Scan(err)
    }
}

impl From<store::StoreError> for CatalogError {
    fn from(err: store::StoreError) -> Self {
        CatalogError::Store(err)
    }
}

impl From<lock::LockError> for CatalogError {
    fn from(err: lock::LockError) -> Self {
        CatalogError::Lock(err)
    }
}

impl From<playlist::PlaylistError> for CatalogError {
    fn from(err: playlist::PlaylistError) -> Self {
        CatalogError::Playlist(err)
    }
}

pub fn run_index(
    ctx: &RunContext,
    options: ScanOptions,
    extractor: &dyn Extractor,
) -> Result<IndexOutcome, CatalogError> {
    let lock_dir = match ctx.cache_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let _lock = lock::RunLock::acquire(&lock_dir)?;

    let mut records = store::load_records(&ctx.cache_path);
    let scopes: Vec<scan::CategoryScope> = ctx
        .config
        .categories
        .iter()
        .map(|category| scan::CategoryScope {
            code: category.code.clone(),
            dir: category.dir.clone(),
        })
        .collect();
    let stats = scan::scan_records(
        &ctx.media_root,
        &scopes,
        &ctx.config.extensions,
        options,
        extractor,
        &mut records,
    )?;

    let mut categories: Vec<CategoryTree> = Vec::new();
    for category in &ctx.config.categories {
        let claimed: Vec<&Record> = records
            .values()
            .filter(|record| !record.has_error())
            .filter(|record| record.category_code.as_deref() == Some(category.code.as_str()))
            .collect();
        let groups = taxonomy::build(&claimed, &category.keys);
        categories.push(CategoryTree {
            code: category.code.clone(),
            name: category.name.clone(),
            groups,
        });
    }

    let mut derived: Vec<CategoryTree> = Vec::new();
    for secondary in &ctx.config.secondary_categories {
        let base = match categories
            .iter()
            .find(|tree| tree.code == secondary.inherits_from)
        {
            Some(base) => base,
            None => {
                warn!(
                    "Category {:?} inherits from unknown {:?}, dropping it",
                    secondary.code, secondary.inherits_from
                );
                continue;
            }
        };
        let groups = taxonomy::derive(&base.groups, |record| secondary.filter.matches(record));
        if groups.is_empty() {
            info!("Category {:?} is empty after filtering", secondary.code);
        }
        derived.push(CategoryTree {
            code: secondary.code.clone(),
            name: secondary.name.clone(),
            groups,
        });
    }
    categories.extend(derived);

    let playlists: Vec<Playlist> = match (&ctx.config.playlists, &ctx.playlist_store) {
        (Some(source), Some(store_path)) => {
            let defs = playlist::load_playlists(
                store_path,
                source.include.as_deref(),
                &source.strip_prefix,
            )?;
            playlist::resolve(defs, &records)
        }
        _ => Vec::new(),
    };

    store::save_records(&ctx.cache_path, &records)?;
    let catalog = Catalog {
        categories,
        playlists,
    };
    // The snapshot goes last so an aborted run leaves the previous one intact.
    store::save_snapshot(&ctx.snapshot_path, &catalog)?;

    info!(
        "Catalogue ready: {} records, {} categories, {} playlists",
        records.len(),
        catalog.categories.len(),
        catalog.playlists.len()
    );

    Ok(IndexOutcome {
        stats,
        records,
        catalog,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LeafFilterSpec, PlaylistSource, PrimaryCategory, SecondaryCategory};
    use common::{AttrMap, AttrValue, PlaylistEntry, TaxonomyNode};
    use metadata::{MetadataError, TagAttributes};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedExtractor {
        calls: AtomicUsize,
    }

    impl ScriptedExtractor {
        fn new() -> Self {
            ScriptedExtractor {
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    // Reads tags from the fixture layout <artist>/<album>/<track> <title>.mp3.
    impl Extractor for ScriptedExtractor {
        fn extract(&self, path: &Path) -> Result<TagAttributes, MetadataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let bytes = fs::read(path)?;
            if bytes.starts_with(b"broken") {
                return Err(MetadataError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "unreadable tags",
                )));
            }
            let parts: Vec<String> = path
                .iter()
                .map(|part| part.to_string_lossy().to_string())
                .collect();
            let artist = parts[parts.len() - 3].clone();
            let album = parts[parts.len() - 2].clone();
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            let (track, title) = match stem.split_once(' ') {
                Some((number, rest)) => (number.parse::<i64>().ok(), rest.to_string()),
                None => (None, stem.to_string()),
            };

            let mut tags = TagAttributes::default();
            tags.attributes
                .insert("artist".to_string(), AttrValue::Text(artist));
            tags.attributes
                .insert("album".to_string(), AttrValue::Text(album));
            tags.attributes
                .insert("title".to_string(), AttrValue::Text(title));
            if let Some(track) = track {
                tags.attributes
                    .insert("track".to_string(), AttrValue::Number(track));
            }
            Ok(tags)
        }

        fn enrich(&self, path: &Path, _extension: &str) -> AttrMap {
            let mut out = AttrMap::new();
            let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if name.contains("fav") {
                out.insert("rating".to_string(), AttrValue::Number(5));
            }
            out
        }
    }

    fn test_config(root: &Path, state: &Path) -> IndexConfig {
        IndexConfig {
            media_root: root.to_string_lossy().to_string(),
            cache_path: state.join("records.bin.gz").to_string_lossy().to_string(),
            snapshot_path: state.join("catalog.bin.gz").to_string_lossy().to_string(),
            extensions: vec!["mp3".to_string()],
            categories: vec![PrimaryCategory {
                code: "artists".to_string(),
                name: "Artists".to_string(),
                dir: "".to_string(),
                keys: vec![vec!["artist".to_string()], vec!["album".to_string()]],
            }],
            secondary_categories: Vec::new(),
            playlists: None,
            ..IndexConfig::default()
        }
    }

    fn context(state: &Path, config: IndexConfig) -> RunContext {
        RunContext::from_config(&state.join("catalog.yaml"), config).unwrap()
    }

    fn leaf<'a>(catalog: &'a Catalog, code: &str, top: &str, child: &str) -> &'a TaxonomyNode {
        let tree = catalog
            .categories
            .iter()
            .find(|tree| tree.code == code)
            .unwrap();
        tree.groups
            .get(top)
            .unwrap()
            .children()
            .unwrap()
            .get(child)
            .unwrap()
    }

    #[test]
    fn second_run_extracts_nothing_and_rewrites_cache_identically() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        fs::create_dir_all(media.path().join("X/Y")).unwrap();
        fs::write(media.path().join("X/Y/01 a.mp3"), b"fake").unwrap();
        fs::write(media.path().join("X/Y/02 b.mp3"), b"fake").unwrap();
        let ctx = context(state.path(), test_config(media.path(), state.path()));

        let extractor = ScriptedExtractor::new();
        let first = run_index(&ctx, ScanOptions::default(), &extractor).unwrap();
        assert_eq!(extractor.calls(), 2);
        assert_eq!(first.stats.extracted, 2);
        let cache_bytes = fs::read(&ctx.cache_path).unwrap();

        let second_extractor = ScriptedExtractor::new();
        let second = run_index(&ctx, ScanOptions::default(), &second_extractor).unwrap();
        assert_eq!(second_extractor.calls(), 0);
        assert_eq!(second.stats.fresh, 2);
        assert_eq!(second.stats.extracted, 0);
        assert_eq!(second.records, first.records);
        assert_eq!(fs::read(&ctx.cache_path).unwrap(), cache_bytes);
    }

    #[test]
    fn catalog_groups_by_artist_then_album() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        fs::create_dir_all(media.path().join("X/Y")).unwrap();
        fs::write(media.path().join("X/Y/01 a.mp3"), b"fake").unwrap();
        fs::write(media.path().join("X/Y/02 b.mp3"), b"fake").unwrap();
        let ctx = context(state.path(), test_config(media.path(), state.path()));

        let outcome = run_index(&ctx, ScanOptions::default(), &ScriptedExtractor::new()).unwrap();
        let node = leaf(&outcome.catalog, "artists", "X", "Y");
        let members = node.members().unwrap();
        let paths: Vec<&str> = members.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["X/Y/01 a.mp3", "X/Y/02 b.mp3"]);

        let representative = match node {
            TaxonomyNode::Leaf { representative, .. } => representative,
            TaxonomyNode::Branch { .. } => panic!("expected leaf"),
        };
        assert_eq!(
            representative.get("artist"),
            Some(&AttrValue::Text("X".to_string()))
        );
        assert_eq!(
            representative.get("album"),
            Some(&AttrValue::Text("Y".to_string()))
        );
        assert!(representative.get("title").is_none());
        assert!(representative.get("track").is_none());

        // The snapshot on disk matches what the run returned.
        assert_eq!(store::load_snapshot(&ctx.snapshot_path), Some(outcome.catalog));
    }

    #[test]
    fn scoped_category_wins_over_a_catch_all() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        fs::create_dir_all(media.path().join("Classical/Bach")).unwrap();
        fs::create_dir_all(media.path().join("Pop/X")).unwrap();
        fs::write(media.path().join("Classical/Bach/01 air.mp3"), b"fake").unwrap();
        fs::write(media.path().join("Pop/X/01 hit.mp3"), b"fake").unwrap();

        // The catch-all comes first in the config and still only gets the
        // records no narrower scope claims.
        let mut config = test_config(media.path(), state.path());
        config.categories = vec![
            PrimaryCategory {
                code: "everything".to_string(),
                name: "Everything".to_string(),
                dir: "".to_string(),
                keys: vec![vec!["artist".to_string()], vec!["album".to_string()]],
            },
            PrimaryCategory {
                code: "classical".to_string(),
                name: "Classical".to_string(),
                dir: "Classical".to_string(),
                keys: vec![vec!["artist".to_string()], vec!["album".to_string()]],
            },
        ];
        let ctx = context(state.path(), config);

        let outcome = run_index(&ctx, ScanOptions::default(), &ScriptedExtractor::new()).unwrap();
        let members = leaf(&outcome.catalog, "classical", "Classical", "Bach")
            .members()
            .unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].path, "Classical/Bach/01 air.mp3");

        let everything = outcome
            .catalog
            .categories
            .iter()
            .find(|tree| tree.code == "everything")
            .unwrap();
        assert!(everything.groups.contains_key("Pop"));
        assert!(!everything.groups.contains_key("Classical"));
    }

    #[test]
    fn deleted_files_leave_cache_and_catalog() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        fs::create_dir_all(media.path().join("X/Y")).unwrap();
        fs::write(media.path().join("X/Y/01 a.mp3"), b"fake").unwrap();
        fs::write(media.path().join("X/Y/02 b.mp3"), b"fake").unwrap();
        let ctx = context(state.path(), test_config(media.path(), state.path()));
        run_index(&ctx, ScanOptions::default(), &ScriptedExtractor::new()).unwrap();

        fs::remove_file(media.path().join("X/Y/02 b.mp3")).unwrap();
        let outcome = run_index(&ctx, ScanOptions::default(), &ScriptedExtractor::new()).unwrap();
        assert_eq!(outcome.stats.pruned, 1);
        assert!(!outcome.records.contains_key("X/Y/02 b.mp3"));
        let members = leaf(&outcome.catalog, "artists", "X", "Y").members().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].path, "X/Y/01 a.mp3");
    }

    #[test]
    fn broken_files_are_isolated_from_grouping() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        fs::create_dir_all(media.path().join("X/Y")).unwrap();
        fs::write(media.path().join("X/Y/01 a.mp3"), b"fake").unwrap();
        fs::write(media.path().join("X/Y/02 bad.mp3"), b"broken").unwrap();
        let ctx = context(state.path(), test_config(media.path(), state.path()));

        let outcome = run_index(&ctx, ScanOptions::default(), &ScriptedExtractor::new()).unwrap();
        assert_eq!(outcome.stats.failed, 1);
        assert!(outcome.records.get("X/Y/02 bad.mp3").unwrap().has_error());
        let members = leaf(&outcome.catalog, "artists", "X", "Y").members().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].path, "X/Y/01 a.mp3");
    }

    #[test]
    fn secondary_category_keeps_only_matching_members() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        fs::create_dir_all(media.path().join("X/Y")).unwrap();
        fs::write(media.path().join("X/Y/01 fav song.mp3"), b"fake").unwrap();
        fs::write(media.path().join("X/Y/02 plain.mp3"), b"fake").unwrap();
        let mut config = test_config(media.path(), state.path());
        config.secondary_categories = vec![SecondaryCategory {
            code: "favorites".to_string(),
            name: "Favorites".to_string(),
            inherits_from: "artists".to_string(),
            filter: LeafFilterSpec {
                attribute: "rating".to_string(),
                equals: None,
                at_least: Some(4),
            },
        }];
        let ctx = context(state.path(), config);

        let outcome = run_index(&ctx, ScanOptions::default(), &ScriptedExtractor::new()).unwrap();
        let favorites = leaf(&outcome.catalog, "favorites", "X", "Y").members().unwrap();
        assert_eq!(favorites.len(), 1);
        assert_eq!(favorites[0].path, "X/Y/01 fav song.mp3");
        let all = leaf(&outcome.catalog, "artists", "X", "Y").members().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn all_rejecting_filter_reports_an_empty_category() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        fs::create_dir_all(media.path().join("X/Y")).unwrap();
        fs::write(media.path().join("X/Y/01 plain.mp3"), b"fake").unwrap();
        let mut config = test_config(media.path(), state.path());
        config.secondary_categories = vec![SecondaryCategory {
            code: "favorites".to_string(),
            name: "Favorites".to_string(),
            inherits_from: "artists".to_string(),
            filter: LeafFilterSpec {
                attribute: "rating".to_string(),
                equals: None,
                at_least: Some(4),
            },
        }];
        let ctx = context(state.path(), config);

        let outcome = run_index(&ctx, ScanOptions::default(), &ScriptedExtractor::new()).unwrap();
        let favorites = outcome
            .catalog
            .categories
            .iter()
            .find(|tree| tree.code == "favorites")
            .unwrap();
        assert!(favorites.groups.is_empty());
    }

    #[test]
    fn unknown_inheritance_target_drops_the_category() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        fs::create_dir_all(media.path().join("X/Y")).unwrap();
        fs::write(media.path().join("X/Y/01 a.mp3"), b"fake").unwrap();
        let mut config = test_config(media.path(), state.path());
        config.secondary_categories = vec![SecondaryCategory {
            code: "favorites".to_string(),
            name: "Favorites".to_string(),
            inherits_from: "missing".to_string(),
            filter: LeafFilterSpec::default(),
        }];
        let ctx = context(state.path(), config);

        let outcome = run_index(&ctx, ScanOptions::default(), &ScriptedExtractor::new()).unwrap();
        assert_eq!(outcome.catalog.categories.len(), 1);
        assert_eq!(outcome.catalog.categories[0].code, "artists");
    }

    #[test]
    fn playlists_resolve_in_supplied_order() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        fs::create_dir_all(media.path().join("X/Y")).unwrap();
        fs::write(media.path().join("X/Y/01 a.mp3"), b"fake").unwrap();
        fs::write(media.path().join("X/Y/02 b.mp3"), b"fake").unwrap();
        let store_path = state.path().join("playlists.json");
        fs::write(
            &store_path,
            r#"{"playlists": [{"id": "pl-1", "title": "Mix", "tracks": [
                "X/Y/02 b.mp3", "X/Y/gone.mp3", "X/Y/01 a.mp3"
            ]}]}"#,
        )
        .unwrap();
        let mut config = test_config(media.path(), state.path());
        config.playlists = Some(PlaylistSource {
            store_path: store_path.to_string_lossy().to_string(),
            include: None,
            strip_prefix: "".to_string(),
        });
        let ctx = context(state.path(), config);

        let outcome = run_index(&ctx, ScanOptions::default(), &ScriptedExtractor::new()).unwrap();
        assert_eq!(outcome.catalog.playlists.len(), 1);
        let entries = &outcome.catalog.playlists[0].entries;
        assert_eq!(entries.len(), 3);
        match &entries[0] {
            PlaylistEntry::Resolved(record) => assert_eq!(record.path, "X/Y/02 b.mp3"),
            PlaylistEntry::Unresolved { .. } => panic!("expected resolved entry"),
        }
        assert_eq!(
            entries[1],
            PlaylistEntry::Unresolved {
                path: "X/Y/gone.mp3".to_string()
            }
        );
        match &entries[2] {
            PlaylistEntry::Resolved(record) => assert_eq!(record.path, "X/Y/01 a.mp3"),
            PlaylistEntry::Unresolved { .. } => panic!("expected resolved entry"),
        }
    }

    #[test]
    fn concurrent_run_is_rejected() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        fs::create_dir_all(media.path().join("X/Y")).unwrap();
        fs::write(media.path().join("X/Y/01 a.mp3"), b"fake").unwrap();
        let ctx = context(state.path(), test_config(media.path(), state.path()));

        let _held = lock::RunLock::acquire(state.path()).unwrap();
        let result = run_index(&ctx, ScanOptions::default(), &ScriptedExtractor::new());
        assert!(matches!(
            result,
            Err(CatalogError::Lock(lock::LockError::Held { .. }))
        ));
    }

    #[test]
    fn skip_scan_rebuilds_from_cache_alone() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        fs::create_dir_all(media.path().join("X/Y")).unwrap();
        fs::write(media.path().join("X/Y/01 a.mp3"), b"fake").unwrap();
        let ctx = context(state.path(), test_config(media.path(), state.path()));
        run_index(&ctx, ScanOptions::default(), &ScriptedExtractor::new()).unwrap();

        // New files stay invisible while the scan is skipped.
        fs::write(media.path().join("X/Y/02 b.mp3"), b"fake").unwrap();
        let extractor = ScriptedExtractor::new();
        let options = ScanOptions {
            skip_scan: true,
            ..ScanOptions::default()
        };
        let outcome = run_index(&ctx, options, &extractor).unwrap();
        assert_eq!(extractor.calls(), 0);
        assert_eq!(outcome.records.len(), 1);
        let members = leaf(&outcome.catalog, "artists", "X", "Y").members().unwrap();
        assert_eq!(members.len(), 1);
    }
}
