//! Login and registration on top of the user store and token service.
//!
//! SQLite access and bcrypt are blocking, so every call hops onto the
//! blocking pool.

pub mod token;
pub mod users;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

pub use token::{TokenError, TokenService};
pub use users::{NewUser, User, UserStore, UserStoreError};

/// Failures surfaced to HTTP clients. Display strings are the response
/// messages.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Username and password are required")]
    MissingCredentials,

    #[error("All fields are required")]
    MissingFields,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Username already exists")]
    UsernameTaken,

    #[error("No token provided")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Database error")]
    Database(#[source] UserStoreError),

    #[error("Error comparing passwords")]
    PasswordCheck(#[source] UserStoreError),

    #[error("Internal server error")]
    Internal(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingCredentials | AuthError::MissingFields => StatusCode::BAD_REQUEST,
            AuthError::InvalidCredentials | AuthError::MissingToken | AuthError::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::UsernameTaken => StatusCode::CONFLICT,
            AuthError::Database(_) | AuthError::PasswordCheck(_) | AuthError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = ?self, "auth request failed");
        }
        let body = MessageResponse {
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct AuthGateway {
    users: UserStore,
    tokens: TokenService,
}

impl AuthGateway {
    pub fn new(users: UserStore, tokens: TokenService) -> Self {
        Self { users, tokens }
    }

    /// Check credentials and issue a token for the user.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let users = self.users.clone();
        let username = username.to_owned();
        let password = password.to_owned();
        let user_id = blocking(move || {
            let user = users
                .find_user_by_name(&username)
                .map_err(AuthError::Database)?
                .ok_or(AuthError::InvalidCredentials)?;
            let matches = users
                .verify_password(&user, &password)
                .map_err(AuthError::PasswordCheck)?;
            if matches {
                Ok(user.id)
            } else {
                Err(AuthError::InvalidCredentials)
            }
        })
        .await?;

        self.tokens
            .issue_token(user_id)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    pub async fn register(&self, new: NewUser) -> Result<User, AuthError> {
        if new.username.is_empty() || new.email.is_empty() || new.password.is_empty() {
            return Err(AuthError::MissingFields);
        }

        let users = self.users.clone();
        blocking(move || match users.create_user(new) {
            Ok(user) => Ok(user),
            Err(UserStoreError::Duplicate(_)) => Err(AuthError::UsernameTaken),
            Err(e) => Err(AuthError::Internal(e.to_string())),
        })
        .await
    }

    /// Resolve an `Authorization` header value to a user id.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<i64, AuthError> {
        let token = authorization
            .and_then(|value| value.split(' ').nth(1))
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)?;
        self.tokens.verify_token(token).map_err(|e| {
            tracing::debug!("rejected token: {}", e);
            AuthError::InvalidToken
        })
    }
}

async fn blocking<T, F>(f: F) -> Result<T, AuthError>
where
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?
}
