use thiserror::Error;

/// Taxonomy of failures the orchestrator can map to a process exit code.
///
/// Leaf code raises plain `anyhow::Error` with context as usual; a variant
/// here is attached with `.context(BackupErrorKind::X)` only at the point
/// where the failure becomes orchestrator-visible, so `main` can
/// `downcast_ref` it without every callee depending on exit-code policy.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BackupErrorKind {
    #[error("configuration error")]
    Config,
    #[error("environment detection or pre-flight check failed")]
    PreflightFailed,
    #[error("another run holds the lock")]
    LockHeld,
    #[error("collection of a critical source failed")]
    CollectionFailed,
    #[error("archiving or encryption failed")]
    ArchiveFailed,
    #[error("compression failed")]
    CompressionFailed,
    #[error("checksum or manifest verification failed")]
    VerificationFailed,
    #[error("a critical storage tier failed")]
    StorageFailed,
    #[error("run was cancelled")]
    Cancelled,
}

impl BackupErrorKind {
    /// Exit code per the CLI's external contract (§6.5). `LockHeld` and
    /// `StorageFailed` share code 4 with no other kind: the spec allocates
    /// no dedicated code to either, only the generic pipeline-failure bucket.
    pub fn exit_code(self) -> i32 {
        match self {
            BackupErrorKind::Config => 2,
            BackupErrorKind::PreflightFailed => 3,
            BackupErrorKind::LockHeld => 4,
            BackupErrorKind::StorageFailed => 4,
            BackupErrorKind::VerificationFailed => 8,
            BackupErrorKind::CollectionFailed => 9,
            BackupErrorKind::ArchiveFailed => 10,
            BackupErrorKind::CompressionFailed => 11,
            BackupErrorKind::Cancelled => 1,
        }
    }
}

/// Walks an `anyhow::Error`'s source chain looking for a `BackupErrorKind`
/// context, falling back to the generic exit code 1 for anything
/// unclassified. A signal-driven cancellation is special-cased by the
/// caller before this ever runs (see `main::run`), since its exit code
/// (`128 + signo`) isn't a property of the error chain at all.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(kind) = cause.downcast_ref::<BackupErrorKind>() {
            return kind.exit_code();
        }
    }
    1
}

/// True if `err`'s chain already carries a `BackupErrorKind`. Lets a
/// pipeline stage that wraps several fallible sub-steps apply its own
/// generic classification only to errors a narrower inner step didn't
/// already classify more specifically.
pub fn has_kind(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<BackupErrorKind>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn unclassified_error_is_generic() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&err), 1);
    }

    #[test]
    fn classified_error_maps_to_its_code() {
        let err = anyhow::anyhow!("disk full").context(BackupErrorKind::PreflightFailed);
        assert_eq!(exit_code_for(&err), 3);
    }

    #[test]
    fn deepest_classification_wins_first_match() {
        let err = anyhow::anyhow!("root cause")
            .context(BackupErrorKind::ArchiveFailed)
            .context("archiving step");
        assert_eq!(exit_code_for(&err), 10);
    }

    #[test]
    fn compression_failure_has_its_own_code_distinct_from_archive() {
        let err = anyhow::anyhow!("xz exited with status 1").context(BackupErrorKind::CompressionFailed);
        assert_eq!(exit_code_for(&err), 11);
    }
}
