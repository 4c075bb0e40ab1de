//! The interface between the coordination layer and the aggregation
//! collaborator.

use fedlink_core::{wire::GlobalModel, VersionToken, WorkerId};

/// The aggregation collaborator's side of the protocol.
///
/// The server never inspects artifacts or combines updates itself; it calls
/// into an implementation of this trait, injected at construction. All
/// methods are invoked from concurrent request handlers and must be fast and
/// non-blocking; in particular [`is_model_current`](Self::is_model_current)
/// is polled once per check interval for every pending long-poll.
///
/// Implementations must not panic: failures in update processing are
/// reported through the string returned by
/// [`receive_worker_update`](Self::receive_worker_update), which is
/// surfaced verbatim to the submitting worker.
pub trait Federation: Send + Sync + 'static {
    /// A worker transitioned into the registered state.
    fn on_worker_registered(&self, worker_id: &WorkerId);

    /// A worker transitioned out of the registered state.
    fn on_worker_unregistered(&self, worker_id: &WorkerId);

    /// Returns the current global artifact together with its version token.
    fn global_model(&self) -> GlobalModel;

    /// Whether `version` still identifies the current global artifact.
    ///
    /// Version tokens are compared for equality only; `false` means a newer
    /// artifact exists, whatever its token looks like.
    fn is_model_current(&self, version: &VersionToken) -> bool;

    /// Processes an update submitted by a registered worker. The returned
    /// string becomes the HTTP response body of the submission.
    fn receive_worker_update(&self, worker_id: &WorkerId, payload: Vec<u8>) -> String;
}
