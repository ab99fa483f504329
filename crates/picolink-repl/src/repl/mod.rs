//! Raw REPL crate: sub-modules.

pub mod types;
pub mod error;
pub mod transport;
pub mod port_scanner;
pub mod observer;
pub mod sync;
pub mod mode;
pub mod exec;
pub mod scripts;
pub mod transfer;
pub mod fs_tree;
pub mod guard;
pub mod session;

// Re-export top-level items for convenience.
pub use error::{ReplError, ReplErrorKind, ReplResult};
pub use observer::{EventObserver, NullObserver, SessionEvent, SessionObserver};
pub use session::ReplSession;
pub use transport::{ReplTransport, SimulatedTransport, TransportHandle};
pub use types::*;
