use std::error::Error;
use std::fmt;

use crate::lifecycle::InvalidTransition;

#[derive(Debug)]
pub enum AppError {
    Io(std::io::Error),
    StorageUnavailable(sea_orm::DbErr),
    Json(serde_json::Error),
    NotFound(String),
    DuplicateKey(String),
    InvalidInput(String),
    InvalidTransition(InvalidTransition),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Io(err) => write!(f, "io error: {err}"),
            AppError::StorageUnavailable(err) => write!(f, "storage unavailable: {err}"),
            AppError::Json(err) => write!(f, "json error: {err}"),
            AppError::NotFound(message) => write_multiline(f, "Not found", message),
            AppError::DuplicateKey(message) => write_multiline(f, "Duplicate key", message),
            AppError::InvalidInput(message) => write_multiline(f, "Invalid input", message),
            AppError::InvalidTransition(err) => write!(f, "Invalid transition: {err}"),
        }
    }
}

impl Error for AppError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AppError::Io(err) => Some(err),
            AppError::StorageUnavailable(err) => Some(err),
            AppError::Json(err) => Some(err),
            AppError::InvalidTransition(err) => Some(err),
            AppError::NotFound(_) | AppError::DuplicateKey(_) | AppError::InvalidInput(_) => None,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<sea_orm::DbErr> for AppError {
    fn from(value: sea_orm::DbErr) -> Self {
        Self::StorageUnavailable(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<InvalidTransition> for AppError {
    fn from(value: InvalidTransition) -> Self {
        Self::InvalidTransition(value)
    }
}

fn write_multiline(f: &mut fmt::Formatter<'_>, label: &str, message: &str) -> fmt::Result {
    if message.contains('\n') {
        write!(f, "{label}:\n{message}")
    } else {
        write!(f, "{label}: {message}")
    }
}
