use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use super::types::ErrorResponse;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Bad input the user can fix.
    #[error("{0}")]
    Validation(String),

    /// The model never loaded; only an operator restart helps.
    #[error("Chatbot model not loaded")]
    ServiceUnavailable,

    #[error("Error generating response: {0}")]
    Generation(String),
}

impl ChatError {
    pub fn empty_message() -> Self {
        ChatError::Validation("Message cannot be empty".into())
    }

    /// Text for the inline page error: the bare cause of a generation
    /// failure, the full message otherwise.
    pub fn into_cause(self) -> String {
        match self {
            ChatError::Generation(cause) => cause,
            other => other.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::ServiceUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            ChatError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}
