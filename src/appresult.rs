use axum::{http::StatusCode, response::{IntoResponse, Response}};

use crate::store::StoreError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub error: anyhow::Error,
}

impl AppError {
    pub fn new(status: StatusCode, error: impl Into<anyhow::Error>) -> Self {
        AppError { status, error: error.into() }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = ?self.error, "request failed");
        }
        (self.status, format!("{:#}", self.error)).into_response()
    }
}

impl From<String> for AppError {
    fn from(err: String) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, anyhow::Error::msg(err))
    }
}

impl From<&str> for AppError {
    fn from(err: &str) -> Self {
        Self::from(err.to_owned())
    }
}

impl From<(StatusCode, &str)> for AppError {
    fn from((status, err): (StatusCode, &str)) -> Self {
        Self::new(status, anyhow::Error::msg(err.to_owned()))
    }
}

impl From<(StatusCode, String)> for AppError {
    fn from((status, err): (StatusCode, String)) -> Self {
        Self::new(status, anyhow::Error::msg(err))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::RoomNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::AlreadyRegistered => StatusCode::CONFLICT,
            StoreError::NotAGroup(_)
            | StoreError::TooFewMembers(_)
            | StoreError::InvalidPair
            | StoreError::UnknownUser(_) => StatusCode::BAD_REQUEST,
            StoreError::Database(_) | StoreError::InvalidId(_) | StoreError::Corrupt(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err)
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, err)
            }
        }
    };
}

apperr_impl!(anyhow::Error);
apperr_impl!(serde_json::Error);
apperr_impl!(sqlx::Error);
apperr_impl!(tower_sessions::session::Error);
apperr_impl!(reqwest::Error);
apperr_impl!(tokio::task::JoinError);

impl<E, R> From<oauth2::RequestTokenError<E, R>> for AppError
where
    E: core::error::Error + Send + Sync + 'static,
    R: oauth2::ErrorResponse + Send + Sync + 'static,
{
    fn from(err: oauth2::RequestTokenError<E, R>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, err)
    }
}
