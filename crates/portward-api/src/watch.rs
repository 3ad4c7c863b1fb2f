// ── Change-stream watchers ──
//
// A watcher is a stream of change batches. The first batch always carries
// the full current state of whatever is being watched; later batches carry
// only the identifiers that changed. Receiving `None` means the stream is
// closed, which consumers treat as fatal.

use tokio::sync::mpsc;

/// A stream of batches of changed identifiers.
pub struct StringsWatcher {
    rx: mpsc::Receiver<Vec<String>>,
}

impl StringsWatcher {
    pub fn new(rx: mpsc::Receiver<Vec<String>>) -> Self {
        Self { rx }
    }

    /// Create a watcher together with the sender that feeds it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<Vec<String>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }

    /// Wait for the next batch. `None` means the stream is closed.
    pub async fn recv(&mut self) -> Option<Vec<String>> {
        self.rx.recv().await
    }
}

/// A stream of bare change notifications for a single entity.
pub struct NotifyWatcher {
    rx: mpsc::Receiver<()>,
}

impl NotifyWatcher {
    pub fn new(rx: mpsc::Receiver<()>) -> Self {
        Self { rx }
    }

    pub fn channel(buffer: usize) -> (mpsc::Sender<()>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }

    /// Wait for the next notification. `None` means the stream is closed.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}
