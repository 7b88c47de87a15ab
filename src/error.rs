//! Error types for quartermaster

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {user_id} is not a member of project {project}")]
    PermissionDenied { user_id: String, project: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TrackerError {
    /// Stable tag for wire responses
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Validation(_) => "validation",
            Self::AlreadyExists(_) => "already_exists",
            Self::Database(_) => "database",
            Self::Catalog(_) => "catalog",
            Self::Delivery(_) => "delivery",
            Self::Connection(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// Errors the caller caused and can fix by changing the request
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::PermissionDenied { .. }
                | Self::Validation(_)
                | Self::AlreadyExists(_)
        )
    }
}
