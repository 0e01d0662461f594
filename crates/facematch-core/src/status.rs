//! Per-photo processing lifecycle.
//!
//! ```text
//! pending → processing → completed(face_count)
//!                      ↘ failed(reason)
//! ```
//!
//! Terminal states have no exits; reprocessing starts a fresh cycle from
//! [`ProcessingStatus::Pending`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Processing,
    Completed { face_count: usize },
    Failed { reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid status transition: {from} → {to}")]
pub struct StatusError {
    pub from: &'static str,
    pub to: &'static str,
}

impl ProcessingStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed { .. } => "completed",
            ProcessingStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed { .. } | ProcessingStatus::Failed { .. })
    }

    fn transition(&self, next: ProcessingStatus) -> Result<ProcessingStatus, StatusError> {
        let allowed = matches!(
            (self, &next),
            (ProcessingStatus::Pending, ProcessingStatus::Processing)
                | (ProcessingStatus::Processing, ProcessingStatus::Completed { .. })
                | (ProcessingStatus::Processing, ProcessingStatus::Failed { .. })
        );
        if allowed {
            Ok(next)
        } else {
            Err(StatusError {
                from: self.name(),
                to: next.name(),
            })
        }
    }

    /// The engine has been invoked.
    pub fn start(&self) -> Result<ProcessingStatus, StatusError> {
        self.transition(ProcessingStatus::Processing)
    }

    /// An encoding set was produced; zero faces is still a completion.
    pub fn complete(&self, face_count: usize) -> Result<ProcessingStatus, StatusError> {
        self.transition(ProcessingStatus::Completed { face_count })
    }

    pub fn fail(&self, reason: impl Into<String>) -> Result<ProcessingStatus, StatusError> {
        self.transition(ProcessingStatus::Failed { reason: reason.into() })
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingStatus::Completed { face_count } => write!(f, "completed ({face_count} faces)"),
            ProcessingStatus::Failed { reason } => write!(f, "failed: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}
