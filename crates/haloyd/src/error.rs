use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;
use thiserror::Error;

/// Top-level daemon error. Every variant maps to an HTTP status and a
/// stable `kind` string: internal causes never leak past the
/// `kind`/`message` pair in the response body, but are preserved for
/// `tracing::error!` at the call site.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Layer(#[from] crate::layers::LayerError),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("domain {0:?} is already routed to another app")]
    DomainConflict(String),
    #[error("deploy already in progress for app {0:?}")]
    DeployInProgress(String),
    #[error("image unavailable: {0}")]
    ImageUnavailable(String),
    #[error("layer digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("secret missing: {0}")]
    SecretMissing(String),
    #[error("deploy {0} exceeded its deadline")]
    DeadlineExceeded(String),
    #[error("no certificate available for {0:?}")]
    NoCertificate(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Database(_) => "database_error",
            Error::Docker(_) => "docker_error",
            Error::Io(_) => "io_error",
            Error::Store(crate::store::StoreError::NotFound) => "not_found",
            Error::Store(_) => "database_error",
            Error::Layer(crate::layers::LayerError::NotFound(_)) => "not_found",
            Error::Layer(crate::layers::LayerError::DigestMismatch { .. }) => "digest_mismatch",
            Error::Layer(_) => "internal_error",
            Error::NotFound => "not_found",
            Error::Unauthorized => "unauthorized",
            Error::InvalidConfig(_) => "invalid_config",
            Error::DomainConflict(_) => "domain_conflict",
            Error::DeployInProgress(_) => "deploy_in_progress",
            Error::ImageUnavailable(_) => "image_unavailable",
            Error::DigestMismatch { .. } => "digest_mismatch",
            Error::SecretMissing(_) => "secret_missing",
            Error::DeadlineExceeded(_) => "deadline_exceeded",
            Error::NoCertificate(_) => "no_certificate",
            Error::Other(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::DomainConflict(_) | Error::DeployInProgress(_) => StatusCode::CONFLICT,
            Error::ImageUnavailable(_) | Error::SecretMissing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::DigestMismatch { .. } => StatusCode::BAD_REQUEST,
            Error::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::NoCertificate(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Store(crate::store::StoreError::NotFound) => StatusCode::NOT_FOUND,
            Error::Layer(crate::layers::LayerError::NotFound(_)) => StatusCode::NOT_FOUND,
            Error::Layer(crate::layers::LayerError::DigestMismatch { .. }) => StatusCode::BAD_REQUEST,
            Error::Database(_)
            | Error::Docker(_)
            | Error::Io(_)
            | Error::Store(_)
            | Error::Layer(_)
            | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    kind: &'a str,
    message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let message = self.to_string();
        tracing::error!(kind, %message, "request failed");
        (status, Json(ErrorBody { kind, message })).into_response()
    }
}
