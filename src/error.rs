//! Semantic error kinds shared across the crate.
//!
//! Most functions return `anyhow::Result` with context strings, like the
//! rest of the codebase. The variants here exist so callers can tell apart
//! the handful of outcomes that change control flow (retry, force, fall
//! back to no networking) via `anyhow::Error::downcast_ref::<Error>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A VM, image, or network record does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// An id prefix matched more than one record.
    #[error("ambiguous reference {0:?}: matches multiple records")]
    Ambiguous(String),

    /// The operation requires a live VMM process.
    #[error("VM {0} is not running")]
    NotRunning(String),

    /// Name collision on create.
    #[error("VM name {0:?} already exists")]
    AlreadyExists(String),

    /// Bad user input (empty ref, unparseable size, bad escape char).
    #[error("invalid input: {0}")]
    Invalid(String),

    /// The network provider has no CNI conflist; callers may proceed
    /// without networking.
    #[error("network provider not configured: {0}")]
    NotConfigured(String),
}

/// True when `err` is (or wraps) the given semantic kind.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_)))
}

pub fn is_not_running(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::NotRunning(_)))
}

pub fn is_not_configured(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::NotConfigured(_)))
}

/// Joins per-item failures of a best-effort batch into one error, keeping
/// the list of ids that succeeded. Mirrors the contract of every batch
/// operation: all ids are attempted, successes are returned even when some
/// fail.
pub fn join_batch_errors(op: &str, errs: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    if errs.is_empty() {
        return None;
    }
    let detail = errs
        .iter()
        .map(|e| format!("{e:#}"))
        .collect::<Vec<_>>()
        .join("; ");
    Some(anyhow::anyhow!("{op}: {} failed: {detail}", errs.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_through_context() {
        use anyhow::Context;
        let err: anyhow::Error = Err::<(), _>(Error::NotFound("vm abc".into()))
            .context("resolve ref")
            .unwrap_err();
        assert!(is_not_found(&err));
        assert!(!is_not_running(&err));
    }

    #[test]
    fn batch_join() {
        assert!(join_batch_errors("stop", vec![]).is_none());
        let err = join_batch_errors(
            "stop",
            vec![anyhow::anyhow!("VM a: boom"), anyhow::anyhow!("VM b: bust")],
        )
        .unwrap();
        let msg = format!("{err}");
        assert!(msg.contains("stop"));
        assert!(msg.contains("2 failed"));
    }
}
