use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use common::{KeySpec, Record};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimaryCategory {
    pub code: String,
    pub name: String,
    pub dir: String,
    pub keys: Vec<KeySpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafFilterSpec {
    pub attribute: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_least: Option<i64>,
}

impl LeafFilterSpec {
    pub fn matches(&self, record: &Record) -> bool {
        let attr = match record.attr(&self.attribute) {
            Some(attr) => attr,
            None => return false,
        };
        let value = match attr.group_value() {
            Some(value) => value,
            None => return false,
        };
        if let Some(expected) = &self.equals {
            if value != *expected {
                return false;
            }
        }
        if let Some(min) = self.at_least {
            match attr.index_value() {
                Some(number) if number >= min => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondaryCategory {
    pub code: String,
    pub name: String,
    pub inherits_from: String,
    pub filter: LeafFilterSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaylistSource {
    pub store_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    pub strip_prefix: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub version: u32,
    pub media_root: String,
    pub cache_path: String,
    pub snapshot_path: String,
    pub extensions: Vec<String>,
    pub categories: Vec<PrimaryCategory>,
    pub secondary_categories: Vec<SecondaryCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlists: Option<PlaylistSource>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            media_root: "".to_string(),
            cache_path: "records.bin.gz".to_string(),
            snapshot_path: "catalog.bin.gz".to_string(),
            extensions: default_extensions(),
            categories: default_categories(),
            secondary_categories: default_secondary_categories(),
            playlists: None,
        }
    }
}

fn default_extensions() -> Vec<String> {
    ["mp3", "flac", "ogg", "m4a", "wav"]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

// Directory scopes partition the collection: every record is claimed by
// exactly one primary category, so a second whole-root default could never
// claim anything.
fn default_categories() -> Vec<PrimaryCategory> {
    vec![PrimaryCategory {
        code: "artists".to_string(),
        name: "Artists".to_string(),
        dir: "".to_string(),
        keys: vec![
            vec!["album_artist".to_string(), "artist".to_string()],
            vec!["album".to_string()],
        ],
    }]
}

fn default_secondary_categories() -> Vec<SecondaryCategory> {
    vec![SecondaryCategory {
        code: "favorites".to_string(),
        name: "Favorites".to_string(),
        inherits_from: "artists".to_string(),
        filter: LeafFilterSpec {
            attribute: "rating".to_string(),
            equals: None,
            at_least: Some(4),
        },
    }]
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("CATALOG_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("catalog.yaml"))
            .unwrap_or_else(|| PathBuf::from("catalog.yaml")),
        Err(_) => PathBuf::from("catalog.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(IndexConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: IndexConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.cache_path.trim().is_empty() {
            config.cache_path = "records.bin.gz".to_string();
        }
        if config.snapshot_path.trim().is_empty() {
            config.snapshot_path = "catalog.bin.gz".to_string();
        }
        if config.extensions.is_empty() {
            config.extensions = default_extensions();
        }
        return Ok((config, false));
    }

    let config = IndexConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &IndexConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

pub fn resolve_media_root(config_path: &Path, value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(resolve_path(config_path, trimmed))
    }
}
