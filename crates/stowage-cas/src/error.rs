//! Soft errors and the mapping of engine errors onto storage errors.

use std::fmt;

use stowage_reduce::ReduceError;
use stowage_storage::StorageError;

/// The best-effort step a [`SoftError`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftOp {
    /// Deleting the shadow after a successful overwrite
    ShadowCleanup,
    /// Reclaiming a shadow leaked by an earlier interrupted push
    ShadowReclaim,
    /// A sidecar object that is not a metadata record
    StrayEntry,
    /// Removing a directory during recursive removal
    Rmdir,
}

impl fmt::Display for SoftOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SoftOp::ShadowCleanup => "shadow cleanup",
            SoftOp::ShadowReclaim => "shadow reclaim",
            SoftOp::StrayEntry => "stray entry",
            SoftOp::Rmdir => "rmdir",
        };
        f.write_str(name)
    }
}

/// A failure that did not fail the surrounding operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{op} {path}: {message}")]
pub struct SoftError {
    /// Logical or sidecar path concerned
    pub path: String,
    /// Step that failed
    pub op: SoftOp,
    /// What went wrong
    pub message: String,
}

impl SoftError {
    /// Builds a soft error from anything displayable
    pub fn new(op: SoftOp, path: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            op,
            message: message.to_string(),
        }
    }
}

/// Lift an engine error into the storage taxonomy. Storage errors raised
/// underneath the engine keep their sentinel kind.
pub fn engine_error(err: ReduceError, context: impl Into<String>) -> StorageError {
    match err {
        ReduceError::Storage(inner) => inner.context(context),
        other => StorageError::engine(other).context(context),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_storage::ErrorKind;

    #[test]
    fn sentinels_survive_the_engine() {
        let err = engine_error(
            ReduceError::Storage(StorageError::not_found("chunks/aa/bb")),
            "open version v1",
        );
        assert_eq!(err.kind(), ErrorKind::ObjectNotFound);
        assert!(err.to_string().contains("open version v1"));
    }

    #[test]
    fn engine_failures_are_engine_kind() {
        let err = engine_error(ReduceError::ManifestNotFound("v1".to_string()), "open");
        assert_eq!(err.kind(), ErrorKind::Engine);
    }

    #[test]
    fn soft_error_display() {
        let soft = SoftError::new(SoftOp::Rmdir, "a/b", "busy");
        assert_eq!(soft.to_string(), "rmdir a/b: busy");
    }
}
