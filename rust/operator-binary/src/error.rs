//! Failure taxonomy shared by all components.
//!
//! Every module has its own error enum, but callers (reconcilers, status writers) only care about
//! what *kind* of failure happened, so each error reports a [`FailureKind`].

use stackable_operator::kube;
use strum::{Display, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum FailureKind {
    /// The object does not exist (yet), usually handled by creating it.
    NotFound,
    /// Optimistic concurrency mismatch, the caller should requeue.
    Conflict,
    /// Malformed, expired or otherwise unusable certificate material.
    ValidationFailure,
    /// Transient failure talking to the cluster or the self-monitor.
    TransportFailure,
    Fatal,
    /// The resource-count lock has no free slots left.
    LockInUse,
}

pub trait ClassifyError {
    fn failure_kind(&self) -> FailureKind;
}

impl ClassifyError for kube::Error {
    fn failure_kind(&self) -> FailureKind {
        match self {
            kube::Error::Api(resp) if resp.code == 404 => FailureKind::NotFound,
            kube::Error::Api(resp) if resp.code == 409 => FailureKind::Conflict,
            _ => FailureKind::TransportFailure,
        }
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    err.failure_kind() == FailureKind::NotFound
}

#[cfg(test)]
pub(crate) fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected {code}"),
        reason: String::new(),
        code,
    })
}
