use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Error taxonomy for cache operations.
///
/// Each variant maps onto a stable process exit code (see [`CacheError::exit_code`])
/// so scripts can tell failure classes apart.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid arguments: {0}")]
    Args(String),

    #[error("unsupported repository URL `{0}`")]
    UnsupportedUrl(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("network operation failed: {0}")]
    Network(String),

    #[error("filesystem operation failed on `{path}`: {source}")]
    Filesystem {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("git operation failed: {0}")]
    Git(String),

    #[error("host API error: {0}")]
    HostApi(String),

    #[error("validation failed for `{path}`: {reason}")]
    Validation { path: Utf8PathBuf, reason: String },

    #[error("repository at `{path}` is corrupted: {reason}")]
    Corruption { path: Utf8PathBuf, reason: String },

    #[error("timed out waiting for lock on `{0}`")]
    Busy(Utf8PathBuf),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("access forbidden: {0}")]
    Forbidden(String),
}

impl CacheError {
    /// Stable exit code for the binary. Zero is reserved for success; the
    /// remaining codes mirror the documented taxonomy (args=1, config=2,
    /// network=3, filesystem=4, git=5, host-api=6).
    pub fn exit_code(&self) -> u8 {
        match self {
            CacheError::Args(_) | CacheError::UnsupportedUrl(_) => 1,
            CacheError::Config(_) => 2,
            CacheError::Network(_) => 3,
            CacheError::Filesystem { .. } | CacheError::Busy(_) | CacheError::NotFound(_) => 4,
            CacheError::Git(_)
            | CacheError::Validation { .. }
            | CacheError::Corruption { .. } => 5,
            CacheError::HostApi(_) | CacheError::Forbidden(_) => 6,
        }
    }

    pub(crate) fn fs(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        CacheError::Filesystem {
            path: path.into(),
            source,
        }
    }
}

pub(crate) trait IoResultExt<T> {
    /// Attach the path a filesystem operation was acting on.
    fn fs_context(self, path: &Utf8Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn fs_context(self, path: &Utf8Path) -> Result<T> {
        self.map_err(|e| CacheError::fs(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(CacheError::Args("x".into()).exit_code(), 1);
        assert_eq!(CacheError::UnsupportedUrl("x".into()).exit_code(), 1);
        assert_eq!(CacheError::Config("x".into()).exit_code(), 2);
        assert_eq!(CacheError::Network("x".into()).exit_code(), 3);
        assert_eq!(
            CacheError::fs("p", std::io::Error::other("boom")).exit_code(),
            4
        );
        assert_eq!(CacheError::Git("x".into()).exit_code(), 5);
        assert_eq!(CacheError::HostApi("x".into()).exit_code(), 6);
    }
}
