// src/error.rs
//! Shared error taxonomy for the pipeline.
//!
//! Transient remote errors are retried inside the remote client; everything
//! else propagates to the orchestrator, which marks the session failed and
//! broadcasts exactly one error event.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Network/timeout, rate-limit, or 5xx from a provider. Retried by the
    /// remote client up to its attempt cap before surfacing.
    #[error("transient error from {service}: {message}")]
    TransientRemote { service: String, message: String },

    /// Non-retryable provider error (4xx other than 429).
    #[error("permanent error from {service}: {message}")]
    PermanentRemote { service: String, message: String },

    /// The provider answered with an explicit `success: false` envelope.
    #[error("{service} reported failure: {message}")]
    ProviderLogic { service: String, message: String },

    /// A required step of the local composition pipeline failed.
    #[error("composition step '{step}' failed: {message}")]
    CompositionStep { step: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Re-entrancy guard rejection: the session already has a stage in flight.
    #[error("session {0} is already processing")]
    AlreadyProcessing(Uuid),

    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("stage '{requested}' cannot run while session is in stage '{current}'")]
    InvalidStage { current: String, requested: String },

    #[error("{service} provider is not configured")]
    NotConfigured { service: String },
}

impl PipelineError {
    /// Short class name used in error status events and REST error bodies.
    pub fn class(&self) -> &'static str {
        match self {
            Self::TransientRemote { .. } => "transient_remote",
            Self::PermanentRemote { .. } => "permanent_remote",
            Self::ProviderLogic { .. } => "provider_logic",
            Self::CompositionStep { .. } => "composition_step",
            Self::Storage(_) => "storage",
            Self::Database(_) => "database",
            Self::AlreadyProcessing(_) => "conflict",
            Self::SessionNotFound(_) => "not_found",
            Self::InvalidStage { .. } => "invalid_stage",
            Self::NotConfigured { .. } => "not_configured",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientRemote { .. })
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::AlreadyProcessing(_) => StatusCode::CONFLICT,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidStage { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotConfigured { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::PermanentRemote { .. } | Self::ProviderLogic { .. } => StatusCode::BAD_GATEWAY,
            Self::TransientRemote { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "status": "error",
            "error": self.class(),
            "reason": self.to_string(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        let transient = PipelineError::TransientRemote {
            service: "image".to_string(),
            message: "503".to_string(),
        };
        let permanent = PipelineError::PermanentRemote {
            service: "image".to_string(),
            message: "404".to_string(),
        };
        let logic = PipelineError::ProviderLogic {
            service: "image".to_string(),
            message: "bad prompt".to_string(),
        };

        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(!logic.is_retryable());
    }

    #[test]
    fn test_error_class_names() {
        let err = PipelineError::CompositionStep {
            step: "concatenate".to_string(),
            message: "ffmpeg exited 1".to_string(),
        };
        assert_eq!(err.class(), "composition_step");

        let err = PipelineError::AlreadyProcessing(Uuid::new_v4());
        assert_eq!(err.class(), "conflict");
    }
}
