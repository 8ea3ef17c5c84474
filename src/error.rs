use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    UnknownTab,
    DuplicateSession,
    TransportError,
    TransportTimeout,
    DecodeError,
    IssuanceError,
    PromptTimeout,
    StorageError,
    IoError,
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn unknown_tab(tab_key: &str) -> Self {
        Self::new(ErrorCode::UnknownTab, "Unknown tab").with_details(tab_key.to_string())
    }

    pub fn issuance(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::IssuanceError, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("{0}")]
    Api(ApiError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ApiError> for MuxError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

impl MuxError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MuxError::Api(api) => api.error_code,
            MuxError::Io(_) => ErrorCode::IoError,
            MuxError::Json(_) => ErrorCode::InvalidArgument,
        }
    }

    pub fn into_api(self) -> ApiError {
        match self {
            MuxError::Api(api) => api,
            MuxError::Io(err) => ApiError::new(ErrorCode::IoError, err.to_string()),
            MuxError::Json(err) => ApiError::new(ErrorCode::InvalidArgument, err.to_string()),
        }
    }
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::UnknownTab => "UNKNOWN_TAB",
            ErrorCode::DuplicateSession => "DUPLICATE_SESSION",
            ErrorCode::TransportError => "TRANSPORT_ERROR",
            ErrorCode::TransportTimeout => "TRANSPORT_TIMEOUT",
            ErrorCode::DecodeError => "DECODE_ERROR",
            ErrorCode::IssuanceError => "ISSUANCE_ERROR",
            ErrorCode::PromptTimeout => "PROMPT_TIMEOUT",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::Unsupported => "UNSUPPORTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type MuxResult<T> = Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_screaming_snake_case() {
        let value = serde_json::to_string(&ErrorCode::UnknownTab).expect("serialize");
        assert_eq!(value, "\"UNKNOWN_TAB\"");
        assert_eq!(ErrorCode::IssuanceError.to_string(), "ISSUANCE_ERROR");
    }

    #[test]
    fn into_api_keeps_api_errors_intact() {
        let err: MuxError = ApiError::unknown_tab("tab-1-abc").into();
        assert_eq!(err.code(), ErrorCode::UnknownTab);
        let api = err.into_api();
        assert_eq!(api.details.as_deref(), Some("tab-1-abc"));
    }
}
