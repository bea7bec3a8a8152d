use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const UNGROUPED: &str = "__ungrouped__";

pub type AttrMap = BTreeMap<String, AttrValue>;
pub type KeySpec = Vec<String>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Text(String),
    Number(i64),
    List(Vec<String>),
}

impl AttrValue {
    // A list's value is its first element; blank still counts as absent.
    pub fn group_value(&self) -> Option<String> {
        match self {
            AttrValue::Text(value) => non_blank(value),
            AttrValue::Number(value) => Some(value.to_string()),
            AttrValue::List(items) => items.first().and_then(|item| non_blank(item)),
        }
    }

    pub fn index_value(&self) -> Option<i64> {
        match self {
            AttrValue::Number(value) => Some(*value),
            AttrValue::Text(value) => parse_leading_number(value),
            AttrValue::List(items) => items.first().and_then(|item| parse_leading_number(item)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub path: String,
    #[serde(default)]
    pub attributes: AttrMap,
    #[serde(default)]
    pub format_info: AttrMap,
    #[serde(default)]
    pub category_code: Option<String>,
    pub modified_ms: u64,
    pub scanned_at: u64,
    pub extension: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl Record {
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TaxonomyNode {
    Branch {
        key_spec: KeySpec,
        group_value: String,
        ungrouped: bool,
        children: BTreeMap<String, TaxonomyNode>,
    },
    Leaf {
        key_spec: KeySpec,
        group_value: String,
        ungrouped: bool,
        members: Vec<Record>,
        representative: AttrMap,
    },
}

impl TaxonomyNode {
    pub fn group_value(&self) -> &str {
        match self {
            TaxonomyNode::Branch { group_value, .. } => group_value,
            TaxonomyNode::Leaf { group_value, .. } => group_value,
        }
    }

    pub fn is_ungrouped(&self) -> bool {
        match self {
            TaxonomyNode::Branch { ungrouped, .. } => *ungrouped,
            TaxonomyNode::Leaf { ungrouped, .. } => *ungrouped,
        }
    }

    pub fn children(&self) -> Option<&BTreeMap<String, TaxonomyNode>> {
        match self {
            TaxonomyNode::Branch { children, .. } => Some(children),
            TaxonomyNode::Leaf { .. } => None,
        }
    }

    pub fn members(&self) -> Option<&[Record]> {
        match self {
            TaxonomyNode::Branch { .. } => None,
            TaxonomyNode::Leaf { members, .. } => Some(members),
        }
    }

    pub fn record_count(&self) -> usize {
        match self {
            TaxonomyNode::Branch { children, .. } => {
                children.values().map(|child| child.record_count()).sum()
            }
            TaxonomyNode::Leaf { members, .. } => members.len(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoryTree {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub groups: BTreeMap<String, TaxonomyNode>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PlaylistEntry {
    Resolved(Record),
    Unresolved { path: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub title: String,
    pub source: String,
    #[serde(default)]
    pub entries: Vec<PlaylistEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub categories: Vec<CategoryTree>,
    #[serde(default)]
    pub playlists: Vec<Playlist>,
}

pub fn relpath_from(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(path_to_slash_string(rel))
}

pub fn join_relpath(root: &Path, relpath: &str) -> PathBuf {
    let mut out = PathBuf::from(root);
    for part in relpath.split('/') {
        if part.is_empty() {
            continue;
        }
        out.push(part);
    }
    out
}

pub fn normalize_relpath(value: &str) -> String {
    let slashed = value.replace('\\', "/");
    let parts: Vec<&str> = slashed
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    parts.join("/")
}

fn path_to_slash_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    parts.join("/")
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_leading_number(text: &str) -> Option<i64> {
    let digits: String = text
        .trim()
        .chars()
        .take_while(|ch| ch.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}
