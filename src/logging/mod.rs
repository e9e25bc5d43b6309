//! Logging and trade journaling.
//!
//! - `init` installs the process-wide tracing subscriber, once, at entry.
//! - `TradeRecorder` backends journal position lifecycle events:
//!   `CsvRecorder` to a local file, `TracingRecorder` to structured logs,
//!   `MultiRecorder` to fan out.
//! - `LogThrottle` keeps quote-path warnings from storming.

pub mod csv_recorder;
pub mod recorder;
pub mod throttle;
pub mod tracing_recorder;

pub use csv_recorder::CsvRecorder;
pub use recorder::{JournalEvent, MultiRecorder, RecordError, TradeRecord, TradeRecorder};
pub use throttle::{EngineLogThrottles, LogThrottle};
pub use tracing_recorder::TracingRecorder;

use tracing_subscriber::EnvFilter;

use crate::config::JournalConfig;

/// Install the global tracing subscriber. Called exactly once from the
/// binary entrypoint, before anything logs. `RUST_LOG` wins over the
/// `--verbose` default so operators can still scope filters per module.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Assemble the journal from configuration: structured logs always, CSV
/// when a path is configured.
pub fn build_journal(config: &JournalConfig) -> MultiRecorder {
    let mut journal = MultiRecorder::new(vec![Box::new(TracingRecorder::new())]);
    if let Some(path) = &config.csv_path {
        journal.add(Box::new(CsvRecorder::new(path.into())));
    }
    journal
}
