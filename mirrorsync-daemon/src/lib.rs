//! Daemon runtime: tick driver + config watcher + socket server.

mod error;
pub mod log_rotation;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_batch, request_conflicts, request_status, request_stop, request_sync, request_tick,
    send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{init_tracing, run, start_blocking, TickSummary, LOG_FORMAT_ENV};
