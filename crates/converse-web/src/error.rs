//! HTTP error responses.
//!
//! Every failing handler answers with `{"kind": .., "reason": ..}` built from
//! the error's `Display` text, never its debug form.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use converse_agent::{AgentError, ErrorKind};
use converse_store::StoreError;
use serde_json::json;

/// An error on its way to the client.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub reason: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            reason: reason.into(),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::Policy, reason)
    }

    /// Status code for a terminal error of the given kind.
    pub fn status_for(kind: ErrorKind) -> StatusCode {
        match kind {
            ErrorKind::Policy => StatusCode::BAD_REQUEST,
            ErrorKind::Provider | ErrorKind::Retrieval | ErrorKind::Tool => StatusCode::BAD_GATEWAY,
            ErrorKind::Cancelled => StatusCode::CONFLICT,
            ErrorKind::Persistence | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        let status = match &err {
            AgentError::SessionBusy { .. } => StatusCode::CONFLICT,
            AgentError::Store(store) => return store_error(store),
            other => Self::status_for(other.kind()),
        };
        Self::new(status, err.kind(), err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        store_error(&err)
    }
}

fn store_error(err: &StoreError) -> ApiError {
    let status = match err {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "store failure");
    }
    ApiError::new(status, ErrorKind::Persistence, err.to_string())
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "kind": self.kind, "reason": self.reason })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_conflict_and_policy_is_bad_request() {
        let busy = ApiError::from(AgentError::SessionBusy {
            session_id: "s".into(),
        });
        assert_eq!(busy.status, StatusCode::CONFLICT);
        assert_eq!(busy.kind, ErrorKind::Policy);

        let empty = ApiError::from(AgentError::EmptyInput);
        assert_eq!(empty.status, StatusCode::BAD_REQUEST);
        assert_eq!(empty.reason, "empty message");
    }

    #[test]
    fn store_not_found_is_404() {
        let err = ApiError::from(AgentError::Store(StoreError::not_found("conversation", "x")));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.kind, ErrorKind::Persistence);
    }

    #[test]
    fn provider_failures_are_bad_gateway() {
        let err = ApiError::from(AgentError::ProviderAuth {
            provider: "groq".into(),
            reason: "bad key".into(),
        });
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    }
}
