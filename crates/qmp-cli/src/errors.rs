//! Error types for the CLI runtime.

use std::io;
use std::sync::Arc;

use qmp_client::QmpError;
use thiserror::Error;

use crate::telemetry::TelemetryError;

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error("failed to load configuration: {0}")]
    LoadConfiguration(Arc<ortho_config::OrthoError>),
    #[error("{0}")]
    CliUsage(clap::Error),
    #[error("failed to initialise telemetry: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("failed to reach monitor at {endpoint}: {source}")]
    Connect { endpoint: String, source: QmpError },
    /// The monitor rejected the command; rendered as `class: desc`.
    #[error("{0}")]
    Peer(qmp_client::PeerError),
    #[error("monitor command failed: {0}")]
    Command(QmpError),
    #[error("failed to serialise output: {0}")]
    SerialiseOutput(serde_json::Error),
    #[error("failed to write output: {0}")]
    WriteOutput(#[from] io::Error),
}

impl From<QmpError> for AppError {
    fn from(error: QmpError) -> Self {
        match error {
            QmpError::Peer { source, .. } => Self::Peer(source),
            other => Self::Command(other),
        }
    }
}
