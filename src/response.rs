//! Uniform response envelope
//!
//! Every exposed operation answers with an [`ApiResponse`]:
//! - `success`: whether the operation was accepted
//! - `message`: short human-readable description
//! - `data`: payload on success, `null` otherwise
//! - `errors`: field-level validation messages, if any
//! - `status_code`: HTTP-style status suggestion for the presentation layer

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
    pub errors: Option<Vec<String>>,
    pub status_code: u16,
}

impl<T> ApiResponse<T> {
    /// Create success response with the default message
    pub fn success(data: T) -> Self {
        Self::success_with(data, "Request successful")
    }

    pub fn success_with(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            errors: None,
            status_code: 200,
        }
    }

    /// Create failure response
    pub fn failure(message: impl Into<String>, status_code: u16) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            errors: None,
            status_code,
        }
    }

    /// Create validation failure response carrying every rule violation
    pub fn validation_failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            message: "Validation failed".to_string(),
            data: None,
            errors: Some(errors),
            status_code: 400,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

/// Errors that know how to render themselves into the envelope
pub trait EnvelopeError: std::fmt::Display {
    /// Stable machine-readable code
    fn code(&self) -> &'static str;

    /// HTTP status suggestion
    fn http_status(&self) -> u16;

    /// Field-level messages for validation failures
    fn field_errors(&self) -> Option<Vec<String>> {
        None
    }
}

impl<T> ApiResponse<T> {
    pub fn from_error<E: EnvelopeError>(err: &E) -> Self {
        match err.field_errors() {
            Some(errors) => Self::validation_failure(errors),
            None => Self::failure(err.to_string(), err.http_status()),
        }
    }

    pub fn from_result<E: EnvelopeError>(result: Result<T, E>, message: &str) -> Self {
        match result {
            Ok(data) => Self::success_with(data, message),
            Err(e) => Self::from_error(&e),
        }
    }
}
