//! Application error type shared by the engine and the storage port.
//!
//! Errors fall into stable categories with fixed wire codes; the HTTP
//! layer maps codes to status codes without inspecting messages. Storage
//! failures are surfaced opaquely: the operation name and backend detail
//! are kept for the log line, not for the client.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{resource} '{id}' not found")]
    NotFound { resource: &'static str, id: String },

    #[error("team '{0}' already exists")]
    TeamExists(String),

    #[error("PR '{0}' already exists")]
    PrExists(String),

    #[error("cannot modify merged PR '{0}'")]
    PrMerged(String),

    #[error("user '{user_id}' is not assigned to PR '{pr_id}'")]
    NotAssigned { user_id: String, pr_id: String },

    #[error("no active candidates in team '{0}'")]
    NoCandidate(String),

    #[error("user '{user_id}' {reason} team '{team_name}'")]
    InvalidTeamUser {
        user_id: String,
        team_name: String,
        reason: &'static str,
    },

    #[error("{0}")]
    Validation(String),

    #[error("storage failure during {op}: {detail}")]
    Storage { op: &'static str, detail: String },
}

impl AppError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        AppError::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn not_assigned(user_id: impl Into<String>, pr_id: impl Into<String>) -> Self {
        AppError::NotAssigned {
            user_id: user_id.into(),
            pr_id: pr_id.into(),
        }
    }

    /// A user that exists but cannot be part of this team operation:
    /// wrong team, or already inactive.
    pub fn invalid_team_user(
        user_id: impl Into<String>,
        team_name: impl Into<String>,
        reason: &'static str,
    ) -> Self {
        AppError::InvalidTeamUser {
            user_id: user_id.into(),
            team_name: team_name.into(),
            reason,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    pub fn storage(op: &'static str, detail: impl Into<String>) -> Self {
        AppError::Storage {
            op,
            detail: detail.into(),
        }
    }

    /// Stable wire code for this error, independent of the message text.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound { .. } => "NOT_FOUND",
            AppError::TeamExists(_) => "TEAM_EXISTS",
            AppError::PrExists(_) => "PR_EXISTS",
            AppError::PrMerged(_) => "PR_MERGED",
            AppError::NotAssigned { .. } => "NOT_ASSIGNED",
            AppError::NoCandidate(_) => "NO_CANDIDATE",
            AppError::InvalidTeamUser { .. } => "INVALID_TEAM_USER",
            AppError::Validation(_) => "INVALID_REQUEST",
            AppError::Storage { .. } => "INTERNAL_ERROR",
        }
    }

    /// Message safe to put on the wire. Storage details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Storage { .. } => "internal storage error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AppError::not_found("team", "backend").code(), "NOT_FOUND");
        assert_eq!(AppError::TeamExists("backend".into()).code(), "TEAM_EXISTS");
        assert_eq!(AppError::PrExists("pr-1".into()).code(), "PR_EXISTS");
        assert_eq!(AppError::PrMerged("pr-1".into()).code(), "PR_MERGED");
        assert_eq!(AppError::not_assigned("u1", "pr-1").code(), "NOT_ASSIGNED");
        assert_eq!(AppError::NoCandidate("backend".into()).code(), "NO_CANDIDATE");
        assert_eq!(
            AppError::invalid_team_user("u1", "backend", "does not belong to").code(),
            "INVALID_TEAM_USER"
        );
        assert_eq!(AppError::validation("empty").code(), "INVALID_REQUEST");
        assert_eq!(AppError::storage("get_pr", "disk on fire").code(), "INTERNAL_ERROR");
    }

    #[test]
    fn storage_detail_is_not_exposed() {
        let err = AppError::storage("get_pr", "unique constraint violated on pr_reviewers");
        assert!(!err.public_message().contains("pr_reviewers"));
        // The full detail stays available for logging.
        assert!(err.to_string().contains("pr_reviewers"));
    }

    #[test]
    fn invalid_team_user_message_reads_like_a_sentence() {
        let err = AppError::invalid_team_user("u7", "backend", "is not an active member of");
        assert_eq!(
            err.to_string(),
            "user 'u7' is not an active member of team 'backend'"
        );
    }
}
