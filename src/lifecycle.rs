//! Per-record status lifecycle.
//!
//! Each entity kind has its own closed status type. Transitions are plain
//! functions over the current state; anything not listed is rejected with
//! [`InvalidTransition`] instead of being written.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AppError;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub kind: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TallyStatus {
    Pending,
    Synced,
    Error,
}

impl TallyStatus {
    pub const ALL: [TallyStatus; 3] = [Self::Pending, Self::Synced, Self::Error];
    pub const SYNC_ELIGIBLE: [TallyStatus; 2] = [Self::Pending, Self::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "error" => Ok(Self::Error),
            other => Err(unknown_status("tally", other)),
        }
    }

    pub fn mark_synced(self) -> Result<Self, InvalidTransition> {
        match self {
            Self::Pending | Self::Error | Self::Synced => Ok(Self::Synced),
        }
    }

    pub fn mark_error(self) -> Result<Self, InvalidTransition> {
        match self {
            Self::Pending | Self::Error => Ok(Self::Error),
            Self::Synced => Err(self.reject(Self::Error)),
        }
    }

    fn reject(self, to: Self) -> InvalidTransition {
        InvalidTransition {
            kind: "tally",
            from: self.as_str(),
            to: to.as_str(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Draft,
    Pending,
    Finalized,
    Synced,
    Error,
    Archived,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 6] = [
        Self::Draft,
        Self::Pending,
        Self::Finalized,
        Self::Synced,
        Self::Error,
        Self::Archived,
    ];
    pub const SYNC_ELIGIBLE: [SessionStatus; 2] = [Self::Finalized, Self::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Finalized => "finalized",
            Self::Synced => "synced",
            Self::Error => "error",
            Self::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "draft" => Ok(Self::Draft),
            "pending" => Ok(Self::Pending),
            "finalized" => Ok(Self::Finalized),
            "synced" => Ok(Self::Synced),
            "error" => Ok(Self::Error),
            "archived" => Ok(Self::Archived),
            other => Err(unknown_status("session", other)),
        }
    }

    /// Species counts may only change while the session is still open.
    pub fn is_editable(&self) -> bool {
        matches!(self, Self::Draft | Self::Pending | Self::Error)
    }

    pub fn finalize(self) -> Result<Self, InvalidTransition> {
        match self {
            Self::Draft | Self::Pending | Self::Error => Ok(Self::Finalized),
            Self::Finalized | Self::Synced | Self::Archived => Err(self.reject(Self::Finalized)),
        }
    }

    pub fn archive(self) -> Result<Self, InvalidTransition> {
        match self {
            Self::Draft
            | Self::Pending
            | Self::Finalized
            | Self::Synced
            | Self::Error
            | Self::Archived => Ok(Self::Archived),
        }
    }

    pub fn mark_synced(self) -> Result<Self, InvalidTransition> {
        match self {
            Self::Finalized | Self::Pending | Self::Error | Self::Synced => Ok(Self::Synced),
            Self::Draft | Self::Archived => Err(self.reject(Self::Synced)),
        }
    }

    pub fn mark_error(self) -> Result<Self, InvalidTransition> {
        match self {
            Self::Draft | Self::Pending | Self::Finalized | Self::Error => Ok(Self::Error),
            Self::Synced | Self::Archived => Err(self.reject(Self::Error)),
        }
    }

    fn reject(self, to: Self) -> InvalidTransition {
        InvalidTransition {
            kind: "session",
            from: self.as_str(),
            to: to.as_str(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BagupStatus {
    Pending,
    Finalized,
    Synced,
    Error,
}

impl BagupStatus {
    pub const ALL: [BagupStatus; 4] = [Self::Pending, Self::Finalized, Self::Synced, Self::Error];
    pub const SYNC_ELIGIBLE: [BagupStatus; 2] = [Self::Finalized, Self::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Finalized => "finalized",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "pending" => Ok(Self::Pending),
            "finalized" => Ok(Self::Finalized),
            "synced" => Ok(Self::Synced),
            "error" => Ok(Self::Error),
            other => Err(unknown_status("bagup", other)),
        }
    }

    /// Only a bagup that has never been finalized or sent may be discarded.
    pub fn is_removable(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn finalize(self) -> Result<Self, InvalidTransition> {
        match self {
            Self::Pending | Self::Error => Ok(Self::Finalized),
            Self::Finalized | Self::Synced => Err(self.reject(Self::Finalized)),
        }
    }

    pub fn mark_synced(self) -> Result<Self, InvalidTransition> {
        match self {
            Self::Finalized | Self::Pending | Self::Error | Self::Synced => Ok(Self::Synced),
        }
    }

    pub fn mark_error(self) -> Result<Self, InvalidTransition> {
        match self {
            Self::Pending | Self::Finalized | Self::Error => Ok(Self::Error),
            Self::Synced => Err(self.reject(Self::Error)),
        }
    }

    fn reject(self, to: Self) -> InvalidTransition {
        InvalidTransition {
            kind: "bagup",
            from: self.as_str(),
            to: to.as_str(),
        }
    }
}

fn unknown_status(kind: &str, value: &str) -> AppError {
    AppError::InvalidInput(format!("unknown {kind} status '{value}'"))
}
