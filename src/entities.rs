//! Domain entities for the reviewer assignment service.
//!
//! These are plain value types shared by the engine, the storage backends
//! and the HTTP surface. The reviewer relation is not a standalone entity:
//! a `PullRequest` owns its set of assigned reviewer ids, and users are
//! referenced by id only.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a pull request.
///
/// Transitions are one-way: `Open` -> `Merged`. A merged pull request is
/// immutable with respect to reviewer assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "MERGED")]
    Merged,
}

impl PrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrStatus::Open => "OPEN",
            PrStatus::Merged => "MERGED",
        }
    }

    /// Parse the storage representation. Returns `None` for anything that
    /// is not exactly `OPEN` or `MERGED`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(PrStatus::Open),
            "MERGED" => Some(PrStatus::Merged),
            _ => None,
        }
    }
}

/// A member of exactly one team.
///
/// `is_active == false` means the user may never be selected as a reviewer
/// candidate and may not be assigned to new or reassigned slots. Existing
/// assignments are left alone by the per-user flag; only the bulk
/// deactivation operation vacates slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub username: String,
    pub team_name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Team-membership view of a user, as it appears on the team wire shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub user_id: String,
    pub username: String,
    pub is_active: bool,
}

impl From<&User> for TeamMember {
    fn from(user: &User) -> Self {
        TeamMember {
            user_id: user.user_id.clone(),
            username: user.username.clone(),
            is_active: user.is_active,
        }
    }
}

/// A team and its member listing.
///
/// The member list is a derived view ordered by user id; the
/// `users.team_name` field is the source of truth for affiliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub team_name: String,
    #[serde(rename = "members")]
    pub team_members: Vec<TeamMember>,
}

/// A pull request together with its current reviewer set.
///
/// Invariants maintained by the storage layer: `assigned_reviewers` holds
/// no duplicates, never contains `author_id`, and is kept sorted so that
/// responses are stable. `merged_at` is set exactly once, when the status
/// flips to `Merged`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub pull_request_id: String,
    pub pull_request_name: String,
    pub author_id: String,
    pub status: PrStatus,
    pub assigned_reviewers: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
}

impl PullRequest {
    pub fn is_merged(&self) -> bool {
        self.status == PrStatus::Merged
    }

    pub fn is_assigned(&self, user_id: &str) -> bool {
        self.assigned_reviewers.iter().any(|r| r == user_id)
    }
}

/// Short projection of a pull request, used by reviewer-centric listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestShort {
    pub pull_request_id: String,
    pub pull_request_name: String,
    pub author_id: String,
    pub status: PrStatus,
}

impl From<&PullRequest> for PullRequestShort {
    fn from(pr: &PullRequest) -> Self {
        PullRequestShort {
            pull_request_id: pr.pull_request_id.clone(),
            pull_request_name: pr.pull_request_name.clone(),
            author_id: pr.author_id.clone(),
            status: pr.status,
        }
    }
}

/// Record of one vacated reviewer slot during bulk deactivation.
///
/// `new_reviewer` is the empty string when the slot was vacated without a
/// replacement (no eligible candidate remained), matching the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassignmentEntry {
    pub pull_request_id: String,
    pub old_reviewer: String,
    pub new_reviewer: String,
}

impl ReassignmentEntry {
    pub fn replaced(
        pr_id: impl Into<String>,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        ReassignmentEntry {
            pull_request_id: pr_id.into(),
            old_reviewer: old.into(),
            new_reviewer: new.into(),
        }
    }

    pub fn vacated(pr_id: impl Into<String>, old: impl Into<String>) -> Self {
        ReassignmentEntry {
            pull_request_id: pr_id.into(),
            old_reviewer: old.into(),
            new_reviewer: String::new(),
        }
    }

    /// The replacement, if one was found for this slot.
    pub fn replacement(&self) -> Option<&str> {
        if self.new_reviewer.is_empty() {
            None
        } else {
            Some(&self.new_reviewer)
        }
    }
}

/// Result of a bulk deactivation: who was deactivated and which reviewer
/// slots were vacated or refilled, one entry per slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivationOutcome {
    pub deactivated_users: Vec<String>,
    #[serde(rename = "reassigned_prs")]
    pub reassignments: Vec<ReassignmentEntry>,
}

/// Aggregated assignment and pull-request counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub user_assignments: HashMap<String, i64>,
    pub pr_stats: PrStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrStats {
    pub open: i64,
    pub merged: i64,
}
