//! CSV journal backend.
//!
//! Appends one line per lifecycle event to a local file, writing the
//! header when the file is new or empty. File I/O runs on the blocking
//! pool so a slow disk never stalls the order path.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::recorder::{RecordError, TradeRecord, TradeRecorder};

pub struct CsvRecorder {
    file_path: Arc<PathBuf>,
    /// Serializes writes and remembers whether the header check ran.
    state: Arc<Mutex<CsvState>>,
}

struct CsvState {
    header_written: bool,
}

impl CsvRecorder {
    pub fn new(file_path: PathBuf) -> Self {
        Self {
            file_path: Arc::new(file_path),
            state: Arc::new(Mutex::new(CsvState {
                header_written: false,
            })),
        }
    }
}

#[async_trait]
impl TradeRecorder for CsvRecorder {
    async fn record(&self, record: &TradeRecord) -> Result<(), RecordError> {
        let file_path = Arc::clone(&self.file_path);
        let state = Arc::clone(&self.state);
        let csv_line = record.to_csv_line();

        tokio::task::spawn_blocking(move || {
            let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());

            if !guard.header_written {
                let needs_header = !file_path.exists()
                    || std::fs::metadata(&*file_path)
                        .map(|m| m.len() == 0)
                        .unwrap_or(true);

                if needs_header {
                    let mut file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&*file_path)?;
                    writeln!(file, "{}", TradeRecord::csv_header())?;
                }
                guard.header_written = true;
            }

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&*file_path)?;
            writeln!(file, "{}", csv_line)?;

            Ok::<(), RecordError>(())
        })
        .await
        .map_err(|e| RecordError::Io(std::io::Error::other(e)))??;

        Ok(())
    }
}
