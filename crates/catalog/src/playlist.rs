use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use common::{normalize_relpath, Playlist, PlaylistEntry, Record};

#[derive(Debug, Deserialize)]
struct StoreFile {
    #[serde(default)]
    playlists: Vec<StoredPlaylist>,
}

#[derive(Debug, Deserialize)]
struct StoredPlaylist {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    tracks: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlaylistDef {
    pub id: String,
    pub title: String,
    pub source: String,
    pub tracks: Vec<String>,
}

#[derive(Debug)]
pub enum PlaylistError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for PlaylistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaylistError::Io(err) => write!(f, "io error: {}", err),
            PlaylistError::Json(err) => write!(f, "json error: {}", err),
        }
    }
}

impl std::error::Error for PlaylistError {}

impl From<std::io::Error> for PlaylistError {
    fn from(err: std::io::Error) -> Self {
        PlaylistError::Io(err)
    }
}

impl From<serde_json::Error> for PlaylistError {
    fn from(err: serde_json::Error) -> Self {
        PlaylistError::Json(err)
    }
}

pub fn load_playlists(
    store_path: &Path,
    include: Option<&[String]>,
    strip_prefix: &str,
) -> Result<Vec<PlaylistDef>, PlaylistError> {
    if !store_path.exists() {
        warn!("Playlist store {:?} not found, skipping playlists", store_path);
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(store_path)?;
    let store: StoreFile = serde_json::from_str(&contents)?;
    let source = store_path.to_string_lossy().to_string();

    let mut out = Vec::new();
    for stored in store.playlists {
        if let Some(titles) = include {
            if !titles.iter().any(|title| *title == stored.title) {
                continue;
            }
        }
        let tracks = stored
            .tracks
            .iter()
            .map(|track| normalize_track(track, strip_prefix))
            .collect();
        let id = if stored.id.trim().is_empty() {
            stored.title.clone()
        } else {
            stored.id
        };
        out.push(PlaylistDef {
            id,
            title: stored.title,
            source: source.clone(),
            tracks,
        });
    }
    Ok(out)
}

pub fn resolve(defs: Vec<PlaylistDef>, records: &BTreeMap<String, Record>) -> Vec<Playlist> {
    let mut out = Vec::new();
    for def in defs {
        let mut entries = Vec::with_capacity(def.tracks.len());
        let mut missing = 0usize;
        for track in &def.tracks {
            match records.get(track) {
                Some(record) if !record.has_error() => {
                    entries.push(PlaylistEntry::Resolved(record.clone()));
                }
                _ => {
                    missing += 1;
                    entries.push(PlaylistEntry::Unresolved {
                        path: track.clone(),
                    });
                }
            }
        }
        if missing > 0 {
            warn!(
                "Playlist {:?}: {} of {} entries unresolved",
                def.title,
                missing,
                entries.len()
            );
        }
        out.push(Playlist {
            id: def.id,
            title: def.title,
            source: def.source,
            entries,
        });
    }
    out
}

// The prefix only strips on a component boundary, otherwise a root such as
// /mnt/music would also bite into /mnt/music2.
fn normalize_track(value: &str, strip_prefix: &str) -> String {
    let slashed = value.replace('\\', "/");
    let prefix = strip_prefix.replace('\\', "/");
    let prefix = prefix.trim_end_matches('/');
    let stripped = match slashed.strip_prefix(prefix) {
        Some(rest) if !prefix.is_empty() && (rest.is_empty() || rest.starts_with('/')) => rest,
        _ => slashed.as_str(),
    };
    normalize_relpath(stripped)
}
