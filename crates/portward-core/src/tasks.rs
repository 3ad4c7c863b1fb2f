// ── Child watcher tasks ──
//
// Every tracked machine and application owns one relay task. The task is
// cancelled through a child token of the worker's root token, so a worker
// shutdown reaches every child, while forgetting a single record stops
// only that record's task. Stopping always joins the task before the
// caller removes the record.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Handle on one spawned relay task.
pub(crate) struct WatcherTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl WatcherTask {
    pub(crate) fn new(cancel: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self { cancel, handle }
    }

    /// Cancel the task and wait for it to finish.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!(error = %e, "watcher task panicked");
            }
        }
    }
}
