// ── Long-poll watch relays ──
//
// Each watcher is backed by a relay task that repeatedly long-polls the
// facade with a cursor and forwards the resulting batches over a channel.
// A poll failure closes the channel; consumers treat a closed stream as
// fatal and the supervisor restarts the worker with fresh watchers.

use std::sync::Arc;

use tracing::warn;

use crate::watch::{NotifyWatcher, StringsWatcher};

use super::RestClient;

const WATCH_CHANNEL_SIZE: usize = 16;

/// Spawn a relay for a strings watch endpoint.
///
/// The first poll (`after=0`) returns the full current set, so consumers
/// always see an initial batch describing the world as it is.
pub(crate) fn spawn_strings_watch(
    client: Arc<RestClient>,
    segments: Vec<String>,
) -> StringsWatcher {
    let (tx, watcher) = StringsWatcher::channel(WATCH_CHANNEL_SIZE);
    tokio::spawn(async move {
        let path: Vec<&str> = segments.iter().map(String::as_str).collect();
        let mut cursor = 0u64;
        loop {
            let batch = match client.watch_poll(&path, cursor).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(path = %path.join("/"), error = %e, "watch poll failed; closing stream");
                    return;
                }
            };
            cursor = batch.next;
            if tx.send(batch.changes).await.is_err() {
                return; // consumer gone
            }
        }
    });
    watcher
}

/// Spawn a relay for a notify watch endpoint: each response becomes one
/// bare notification.
pub(crate) fn spawn_notify_watch(client: Arc<RestClient>, segments: Vec<String>) -> NotifyWatcher {
    let (tx, watcher) = NotifyWatcher::channel(WATCH_CHANNEL_SIZE);
    tokio::spawn(async move {
        let path: Vec<&str> = segments.iter().map(String::as_str).collect();
        let mut cursor = 0u64;
        loop {
            let batch = match client.watch_poll(&path, cursor).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(path = %path.join("/"), error = %e, "watch poll failed; closing stream");
                    return;
                }
            };
            cursor = batch.next;
            if tx.send(()).await.is_err() {
                return;
            }
        }
    });
    watcher
}
