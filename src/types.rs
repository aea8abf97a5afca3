use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{EdenError, Result};

/// Identifier of one filesystem entry, unique for the lifetime of the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InodeNumber(u64);

impl InodeNumber {
    /// The root tree. Allocation starts right after it.
    pub const ROOT: InodeNumber = InodeNumber(1);

    pub const fn new(value: u64) -> Self {
        InodeNumber(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InodeKind {
    Tree,
    File,
}

impl InodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InodeKind::Tree => "tree",
            InodeKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tree" => Some(InodeKind::Tree),
            "file" => Some(InodeKind::File),
            _ => None,
        }
    }
}

impl fmt::Display for InodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content hash of an object in the backing store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; ObjectId::LEN]);

impl ObjectId {
    pub const LEN: usize = 20;

    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        ObjectId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

impl FromStr for ObjectId {
    type Err = EdenError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != Self::LEN * 2 || !s.is_ascii() {
            return Err(EdenError::InvalidArgument(format!(
                "Object id must be {} hex characters: '{}'",
                Self::LEN * 2,
                s
            )));
        }
        let mut bytes = [0u8; Self::LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|e| {
                EdenError::InvalidArgument(format!("Invalid object id '{}': {}", s, e))
            })?;
        }
        Ok(ObjectId(bytes))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where an inode's content lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentRef {
    /// Unmodified content still served by the backing store.
    Backing(ObjectId),
    /// Content owned by the overlay. For a tree, the catalog holds its children.
    Local,
}

impl ContentRef {
    pub fn is_local(&self) -> bool {
        matches!(self, ContentRef::Local)
    }

    /// Catalog column encoding.
    pub fn encode(&self) -> String {
        match self {
            ContentRef::Backing(id) => format!("backing:{}", id),
            ContentRef::Local => "local".to_string(),
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        if s == "local" {
            return Some(ContentRef::Local);
        }
        s.strip_prefix("backing:")
            .and_then(|hex| hex.parse().ok())
            .map(ContentRef::Backing)
    }
}

/// The persisted record for one inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayEntry {
    pub number: InodeNumber,
    /// `None` for the root, and for unlinked inodes that are still referenced.
    pub parent: Option<InodeNumber>,
    pub name: String,
    pub kind: InodeKind,
    pub content: ContentRef,
}

impl OverlayEntry {
    pub fn new(
        number: InodeNumber,
        parent: Option<InodeNumber>,
        name: impl Into<String>,
        kind: InodeKind,
        content: ContentRef,
    ) -> Self {
        OverlayEntry {
            number,
            parent,
            name: name.into(),
            kind,
            content,
        }
    }

    pub fn is_tree(&self) -> bool {
        self.kind == InodeKind::Tree
    }
}
