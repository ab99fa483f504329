//! Session observer.
//!
//! Everything a host wants to show (device output, lifecycle, the current
//! filesystem snapshot and coarse progress) is reported through one
//! [`SessionObserver`] injected when the session is built.

use crate::repl::types::FsNode;
use tokio::sync::mpsc;

/// Receives session events. Every method defaults to a no-op.
pub trait SessionObserver: Send + Sync {
    /// Decoded device output meant for display.
    fn on_data(&self, _text: &str) {}

    fn on_connect(&self, _port_name: &str) {}

    fn on_disconnect(&self, _reason: &str) {}

    /// A fresh filesystem tree after a successful walk.
    fn on_fs_snapshot(&self, _tree: &FsNode) {}

    /// Coarse progress of a multi-step operation.
    fn on_progress(&self, _percent: u8, _label: &str) {}
}

/// Observer that drops everything.
pub struct NullObserver;

impl SessionObserver for NullObserver {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Channel-backed observer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted by a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Data(String),
    Connected { port_name: String },
    Disconnected { reason: String },
    FsSnapshot(FsNode),
    Progress { percent: u8, label: String },
}

/// Forwards every callback as a [`SessionEvent`] over an unbounded channel.
pub struct EventObserver {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventObserver {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: SessionEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl SessionObserver for EventObserver {
    fn on_data(&self, text: &str) {
        self.emit(SessionEvent::Data(text.to_string()));
    }

    fn on_connect(&self, port_name: &str) {
        self.emit(SessionEvent::Connected {
            port_name: port_name.to_string(),
        });
    }

    fn on_disconnect(&self, reason: &str) {
        self.emit(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    fn on_fs_snapshot(&self, tree: &FsNode) {
        self.emit(SessionEvent::FsSnapshot(tree.clone()));
    }

    fn on_progress(&self, percent: u8, label: &str) {
        self.emit(SessionEvent::Progress {
            percent,
            label: label.to_string(),
        });
    }
}
