/// Console plus file logging through `fern`, with pruning of old log files.
pub mod logger_fern;

pub use logger_fern::{cleanup_old_logs, parse_level, setup_logging};
