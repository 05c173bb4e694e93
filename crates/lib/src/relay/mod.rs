//! Relay core: send lines, correlate responses to them, emit matched pairs, clean up markers.

pub mod cleanup;
pub mod dispatcher;
mod error;
pub mod options;
pub mod session;
mod signal;
pub mod table;

pub use cleanup::{remove_markers, CleanupReport};
pub use dispatcher::{Dispatched, Dispatcher, ExitReason, Handled};
pub use error::RelayError;
pub use options::{unescape, RelayOptions, ReplyTarget};
pub use session::{run, send_all, spawn_reader, RunSummary, SendReport};
pub use signal::shutdown_signal;
pub use table::{CorrelationTable, OutboundRecord};
