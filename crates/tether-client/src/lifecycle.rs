//! Page visibility signal.
//!
//! Environments with a notion of a page being hidden and shown again (a
//! browser tab, a mobile app moving to the background) can tell the socket
//! about it. The socket disconnects on hide and reconnects on show, unless
//! the application connected or disconnected explicitly in between.

use tokio::sync::mpsc;

/// A visibility change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The page was hidden.
    Hidden,
    /// The page was shown again.
    Visible,
}

/// Sending half, held by whatever observes the environment.
#[derive(Debug, Clone)]
pub struct LifecycleNotifier {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleNotifier {
    /// Report that the page was hidden.
    pub fn hide(&self) {
        let _ = self.tx.send(LifecycleEvent::Hidden);
    }

    /// Report that the page is visible again.
    pub fn show(&self) {
        let _ = self.tx.send(LifecycleEvent::Visible);
    }
}

/// Receiving half, handed to the socket through
/// [`SocketOptions::with_lifecycle`](crate::SocketOptions::with_lifecycle).
#[derive(Debug)]
pub struct LifecycleSignal {
    rx: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl LifecycleSignal {
    /// Create a connected notifier/signal pair.
    #[must_use]
    pub fn channel() -> (LifecycleNotifier, LifecycleSignal) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LifecycleNotifier { tx }, LifecycleSignal { rx })
    }

    pub(crate) async fn recv(&mut self) -> Option<LifecycleEvent> {
        self.rx.recv().await
    }
}
