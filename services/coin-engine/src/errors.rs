use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use coin_ledger::LedgerError;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        let error_message = self.to_string();

        HttpResponse::build(status_code).json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": error_message,
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Ledger(err) => match err {
                LedgerError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
                LedgerError::InvalidTransfer(_) => StatusCode::BAD_REQUEST,
                LedgerError::InsufficientFunds { .. } => StatusCode::BAD_REQUEST,
                LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
                LedgerError::DuplicateEntry(_) => StatusCode::CONFLICT,
                LedgerError::Quarantined(_) => StatusCode::LOCKED,
                LedgerError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                LedgerError::CatalogUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                LedgerError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
                LedgerError::CompensationFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                LedgerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl ApiError {
    fn error_type(&self) -> &str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Ledger(err) => err.class(),
            ApiError::Internal(_) => "internal_error",
        }
    }
}
