use crate::{Error, ErrorKind};
use axum::{
    Json,
    extract::rejection::JsonRejection,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

/// Uniform error envelope.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    #[schema(example = 102_001)]
    pub code: u32,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            code: err.kind().code(),
            message: err.message().to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.kind().http_status();
        (status, Json(ErrorBody::from(&self))).into_response()
    }
}

/// Unwrap a JSON body, reporting malformed payloads as `invalid-argument`.
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Error> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => {
            debug!(error = %rejection, "rejected request body");
            Err(Error::new(ErrorKind::InvalidArgument, rejection.body_text()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn error_renders_envelope() {
        let response = Error::new(ErrorKind::CredentialLocked, "credential is locked").into_response();
        assert_eq!(response.status(), StatusCode::LOCKED);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.code, ErrorKind::CredentialLocked.code());
        assert_eq!(body.message, "credential is locked");
    }
}
