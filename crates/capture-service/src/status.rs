use std::fmt;

use serde::{Deserialize, Serialize};

/// Status tag carried on the status channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Info,
    Completed,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Info => "INFO",
            Status::Completed => "COMPLETED",
            Status::Error => "ERROR",
        }
    }
}

/// One-way notice from the worker. Never acknowledged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: Status,
    pub detail: String,
}

impl StatusMessage {
    pub fn new(status: Status, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn info(detail: impl Into<String>) -> Self {
        Self::new(Status::Info, detail)
    }

    pub fn completed(detail: impl Into<String>) -> Self {
        Self::new(Status::Completed, detail)
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self::new(Status::Error, detail)
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.status.as_str(), self.detail)
    }
}
