use axum::{http::StatusCode, response::IntoResponse};
use std::fmt::Display;

pub type AppResult<T> = Result<T, AppErr>;

#[derive(thiserror::Error, Debug)]
pub enum AppErr {
    #[error("Bad request: {0}")]
    Bad(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] crate::utils::jwt::AuthError),

    #[error("Config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for AppErr {
    fn into_response(self) -> axum::response::Response {
        let (code, body) = match self {
            AppErr::Bad(msg)          => (StatusCode::BAD_REQUEST, msg),
            AppErr::Unauthorized(e)   => (StatusCode::UNAUTHORIZED, e.to_string()),
            other                     => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        };
        (code, body).into_response()
    }
}

/* ── 小助手：把任何 error 轉成 Bad / Config ── */
pub fn bad<E: Display>(e: E) -> AppErr { AppErr::Bad(e.to_string()) }
pub fn config<E: Display>(e: E) -> AppErr { AppErr::Config(e.to_string()) }
