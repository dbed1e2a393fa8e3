//! # Diagnostic Records
//!
//! Persists one JSON record per logged fault so failures can be inspected
//! after the fact. Each [`DiagnosticLogger`] owns its session id and
//! sequence counter; concurrent sessions use separate loggers.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::logging::log_fault;
use crate::result::OperationResult;
use crate::types::{FaultInfo, Result};

/// Where diagnostic records are written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub log_dir: PathBuf,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("error_logs"),
        }
    }
}

/// On-disk shape of one record. Field names are read by existing tooling.
#[derive(Debug, Serialize)]
pub struct DiagnosticRecord<'a> {
    pub context: &'a str,
    pub error: &'a FaultInfo,
    pub session_id: &'a str,
    pub error_number: u64,
}

/// Writes numbered diagnostic records for one session
#[derive(Debug)]
pub struct DiagnosticLogger {
    log_dir: PathBuf,
    session_id: String,
    error_count: u64,
}

/// `YYYYMMDD_HHMMSS_<8 hex>`
fn new_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", Local::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
}

impl DiagnosticLogger {
    /// Creates the directory if needed and starts a fresh session
    pub fn new<P: Into<PathBuf>>(log_dir: P) -> Result<Self> {
        Self::with_session_id(log_dir, new_session_id())
    }

    pub fn with_session_id<P, S>(log_dir: P, session_id: S) -> Result<Self>
    where
        P: Into<PathBuf>,
        S: Into<String>,
    {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)?;
        Ok(Self {
            log_dir,
            session_id: session_id.into(),
            error_count: 0,
        })
    }

    pub fn from_config(config: &DiagnosticsConfig) -> Result<Self> {
        Self::new(config.log_dir.clone())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Records logged so far, including failed writes
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn record_path(&self, error_number: u64) -> PathBuf {
        self.log_dir
            .join(format!("error_{}_{:04}.json", self.session_id, error_number))
    }

    /// Writes the next record and returns its location.
    ///
    /// The sequence number is consumed even when the write fails; a write
    /// failure is only logged.
    pub fn log(&mut self, error: &FaultInfo, context: &str) -> PathBuf {
        self.error_count += 1;
        let error_number = self.error_count;
        let path = self.record_path(error_number);
        log_fault(error, context);

        let record = DiagnosticRecord {
            context,
            error,
            session_id: &self.session_id,
            error_number,
        };

        let written = serde_json::to_vec_pretty(&record)
            .map_err(crate::types::Error::from)
            .and_then(|bytes| fs::write(&path, bytes).map_err(Into::into));

        match written {
            Ok(()) => info!(path = %path.display(), error_number, "Diagnostic record written"),
            Err(err) => warn!(
                path = %path.display(),
                error_number,
                error = %err,
                "Failed to write diagnostic record"
            ),
        }

        path
    }

    /// Logs the fault of a failed result; successes are ignored
    pub fn log_result<T>(&mut self, result: &OperationResult<T>, context: &str) -> Option<PathBuf> {
        result.error().map(|error| self.log(error, context))
    }
}
