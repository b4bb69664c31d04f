use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix for the `type` link in the error envelope
pub const ERRORS_WEB_PREFIX: &str = "https://morio.it/docs/reference/errors/";

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("No such API endpoint")]
    NotFound,

    #[error("Only available in ephemeral mode")]
    EphemeralRequired,

    #[error("Not available in ephemeral mode")]
    EphemeralProhibited,

    #[error("Not available while reloading")]
    ReloadingProhibited,

    #[error("Only available on the cluster leader: {0}")]
    LeaderRequired(String),

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Invalid settings: {0}")]
    SettingsInvalid(String),

    #[error("No settings version {0}")]
    SettingsNotFound(i64),

    #[error("Settings FQDN mismatch")]
    FqdnMismatch,

    #[error("Cluster identity mismatch: expected {expected}, got {actual}")]
    ClusterMismatch { expected: String, actual: String },

    #[error("Checksum mismatch for settings {serial}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        serial: i64,
        expected: String,
        actual: String,
    },

    #[error("Join rejected: {0}")]
    JoinRejected(String),

    #[error("Failed to persist {0}")]
    FsWriteFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable identifier
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound => "morio.core.404",
            CoreError::EphemeralRequired => "morio.core.ephemeral.required",
            CoreError::EphemeralProhibited => "morio.core.ephemeral.prohibited",
            CoreError::ReloadingProhibited => "morio.core.reloading.prohibited",
            CoreError::LeaderRequired(_) => "morio.core.leader.required",
            CoreError::SchemaViolation(_) => "morio.core.schema.violation",
            CoreError::SettingsInvalid(_) => "morio.core.settings.invalid",
            CoreError::SettingsNotFound(_) => "morio.core.settings.404",
            CoreError::FqdnMismatch => "morio.core.settings.fqdn.mismatch",
            CoreError::ClusterMismatch { .. } => "morio.core.cluster.mismatch",
            CoreError::ChecksumMismatch { .. } => "morio.core.checksum.mismatch",
            CoreError::JoinRejected(_) => "morio.core.join.rejected",
            CoreError::FsWriteFailed(_) => "morio.core.fs.write.failed",
            CoreError::Internal(_) => "morio.core.internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            CoreError::NotFound | CoreError::SettingsNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::EphemeralRequired
            | CoreError::EphemeralProhibited
            | CoreError::ReloadingProhibited
            | CoreError::LeaderRequired(_)
            | CoreError::JoinRejected(_) => StatusCode::CONFLICT,
            CoreError::SchemaViolation(_)
            | CoreError::SettingsInvalid(_)
            | CoreError::FqdnMismatch
            | CoreError::ClusterMismatch { .. }
            | CoreError::ChecksumMismatch { .. } => StatusCode::BAD_REQUEST,
            CoreError::FsWriteFailed(_) | CoreError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn title(&self) -> &'static str {
        match self {
            CoreError::NotFound => "No such API endpoint",
            CoreError::EphemeralRequired => "Only available in ephemeral mode",
            CoreError::EphemeralProhibited => "Not available in ephemeral mode",
            CoreError::ReloadingProhibited => "Not available while reloading",
            CoreError::LeaderRequired(_) => "Only available on the cluster leader",
            CoreError::SchemaViolation(_) => "This request violates the data schema",
            CoreError::SettingsInvalid(_) => "These settings are invalid",
            CoreError::SettingsNotFound(_) => "No such settings version",
            CoreError::FqdnMismatch => "Settings FQDN mismatch",
            CoreError::ClusterMismatch { .. } => "Cluster identity mismatch",
            CoreError::ChecksumMismatch { .. } => "Data checksum mismatch",
            CoreError::JoinRejected(_) => "Join request rejected",
            CoreError::FsWriteFailed(_) => "Unable to write to filesystem",
            CoreError::Internal(_) => "Internal error",
        }
    }

    fn detail(&self) -> String {
        match self {
            CoreError::NotFound => {
                "This is the API equivalent of a 404 page. The endpoint you requested does not exist."
                    .to_string()
            }
            CoreError::EphemeralRequired => {
                "This endpoint is only available while the node is in ephemeral mode. This node has been set up, so the endpoint is no longer available."
                    .to_string()
            }
            CoreError::EphemeralProhibited => {
                "This endpoint is not available while the node is in ephemeral mode. Set up the node or join it to a cluster first."
                    .to_string()
            }
            CoreError::ReloadingProhibited => {
                "This endpoint is momentarily unavailable while the node applies new settings."
                    .to_string()
            }
            CoreError::FqdnMismatch => {
                "The provided settings do not include the FQDN used to submit this request."
                    .to_string()
            }
            other => other.to_string(),
        }
    }

    /// Render the error as a problem envelope
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            status: self.status().as_u16(),
            title: self.title().to_string(),
            detail: self.detail(),
            error_type: format!("{}{}", ERRORS_WEB_PREFIX, self.code()),
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(e: anyhow::Error) -> Self {
        CoreError::Internal(format!("{:#}", e))
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let envelope = self.envelope();
        if self.status().is_server_error() {
            tracing::error!(code = self.code(), "{}", self);
        } else {
            tracing::debug!(code = self.code(), "{}", self);
        }
        (
            self.status(),
            [(header::CONTENT_TYPE, "application/problem+json")],
            Json(envelope),
        )
            .into_response()
    }
}

/// Error body of every non-2xx response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub status: u16,
    pub title: String,
    pub detail: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

impl ErrorEnvelope {
    /// The machine-readable code, stripped of the web prefix
    pub fn code(&self) -> &str {
        self.error_type
            .strip_prefix(ERRORS_WEB_PREFIX)
            .unwrap_or(&self.error_type)
    }
}
