//! Long-poll coordination for artifact distribution.
//!
//! A worker that already holds the current artifact version blocks cheaply
//! until a newer one exists. Each pending poll runs as its own lightweight
//! task that re-checks the aggregation collaborator's
//! `is_model_current` predicate on a fixed interval and hands the fetched
//! artifact to its one waiting requester over a single-slot channel. Polls
//! are fully independent: two workers spanning different version bumps each
//! resolve with their own artifact fetch, and an abandoned requester takes
//! its task down with it instead of leaking until the next version change.

use std::{sync::Arc, time::Duration};

use tokio::{sync::oneshot, time};
use tracing::debug;

use fedlink_core::{wire::GlobalModel, VersionToken, WorkerId};

use crate::federation::Federation;

#[derive(Clone)]
/// Resolves pending "give me a newer version" requests.
pub struct LongPollCoordinator {
    federation: Arc<dyn Federation>,
    check_interval: Duration,
}

impl LongPollCoordinator {
    pub fn new(federation: Arc<dyn Federation>, check_interval: Duration) -> Self {
        Self {
            federation,
            check_interval,
        }
    }

    /// Spawns a task waiting until the collaborator reports that
    /// `last_version` is no longer current, then delivers the fresh
    /// artifact through the returned receiver.
    ///
    /// Dropping the receiver cancels the wait: the task notices the closed
    /// channel at its next suspension point and exits without fetching.
    pub fn wait_for_newer(
        &self,
        worker_id: WorkerId,
        last_version: VersionToken,
    ) -> oneshot::Receiver<GlobalModel> {
        let (mut tx, rx) = oneshot::channel();
        let federation = self.federation.clone();
        let check_interval = self.check_interval;

        tokio::spawn(async move {
            while federation.is_model_current(&last_version) {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!(worker_id = %worker_id, "long poll abandoned while waiting");
                        return;
                    }
                    _ = time::delay_for(check_interval) => {}
                }
            }
            if tx.send(federation.global_model()).is_err() {
                debug!(worker_id = %worker_id, "long poll abandoned before delivery");
            }
        });

        rx
    }
}
