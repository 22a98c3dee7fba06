//! Application-wide constants.

/// Default upload directories, relative to the work path.
pub const DEFAULT_AVATAR_UPLOAD_PATH: &str = "data/avatars";
pub const DEFAULT_ATTACHMENT_PATH: &str = "data/attachments";
pub const DEFAULT_LFS_CONTENT_PATH: &str = "data/lfs";
pub const DEFAULT_REPOSITORY_AVATAR_UPLOAD_PATH: &str = "data/repo-avatars";

/// Number of keys the migration engine copies at once unless configured.
pub const DEFAULT_MIGRATION_CONCURRENCY: usize = 1;

/// A well-known upload directory that names a subtree of the storage namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPrefix {
    /// Human-readable name used in logs ("avatars", "attachments", ...)
    pub name: &'static str,
    /// Configured path. Relative paths are key prefixes inside managed storage;
    /// absolute paths point outside it.
    pub path: String,
}

impl UploadPrefix {
    pub fn new(name: &'static str, path: impl Into<String>) -> Self {
        Self {
            name,
            path: path.into(),
        }
    }

    /// Whether the configured path lives outside the managed storage root.
    pub fn is_external(&self) -> bool {
        std::path::Path::new(&self.path).is_absolute()
    }

    /// Key prefix selecting the directory's objects, ending in `/`.
    ///
    /// `.` segments and repeated separators are dropped, so `./data//avatars`
    /// becomes `data/avatars/`. A path naming the storage root itself yields
    /// the empty prefix.
    pub fn key_prefix(&self) -> String {
        let segments: Vec<&str> = self
            .path
            .split('/')
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .collect();
        if segments.is_empty() {
            return String::new();
        }
        format!("{}/", segments.join("/"))
    }
}
