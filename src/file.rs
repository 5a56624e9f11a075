use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Stable identifier for a file, derived from name|size|lastModified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Immutable description of the file being uploaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: FileId,
    pub name: String,
    /// Size in bytes. Must be > 0.
    pub size: u64,
    pub mime: String,
    /// Unix timestamp (ms) of last modification, as reported by the host.
    pub last_modified: u64,
}

impl FileDescriptor {
    /// Builds a descriptor, deriving `id` as a stable hash of name|size|lastModified.
    pub fn new(name: impl Into<String>, size: u64, mime: impl Into<String>, last_modified: u64) -> Self {
        let name = name.into();
        let mime = mime.into();
        let id = Self::derive_id(&name, size, last_modified);
        Self {
            id,
            name,
            size,
            mime,
            last_modified,
        }
    }

    fn derive_id(name: &str, size: u64, last_modified: u64) -> FileId {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        name.hash(&mut hasher);
        size.hash(&mut hasher);
        last_modified.hash(&mut hasher);
        FileId(hasher.finish())
    }

    pub fn mime_class(&self) -> MimeClass {
        if self.mime.starts_with("video/") {
            MimeClass::Video
        } else if self.mime.starts_with("image/") {
            MimeClass::Image
        } else {
            MimeClass::Other
        }
    }
}

/// Coarse MIME tier used by adaptive chunk sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeClass {
    Video,
    Image,
    Other,
}
