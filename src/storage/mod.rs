//! Storage backends and the port the service talks to.
//!
//! [`Storage`] is the full persistence surface: teams, users, pull
//! requests and the transactional reviewer operations. Two backends
//! implement it with identical observable behavior:
//!
//! - [`MemoryStorage`]: a `RwLock`-guarded world, used in tests and as a
//!   throwaway runtime backend;
//! - [`SqliteStorage`]: durable storage on a single SQLite file.
//!
//! The methods that mutate a pull request's reviewer set are
//! transactional: each backend serializes them per pull request (see
//! [`locks::PrLocks`]) so concurrent callers observe either the whole
//! mutation or none of it, and validation always runs against the state
//! the mutation will actually apply to.

pub mod locks;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{
    DeactivationOutcome, PullRequest, PullRequestShort, Stats, Team, TeamMember, User,
};
use crate::error::Result;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Persistence port used by the review service.
///
/// Lookup methods return `Ok(None)` for a missing row rather than an
/// error; the caller decides whether absence is a problem. Mutating
/// methods return domain errors ([`crate::error::AppError`]) when a
/// precondition re-checked inside the transaction fails.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create a team together with its members in one transaction.
    ///
    /// Members that already exist as users are moved onto this team and
    /// take the given activity flag; their username and creation time
    /// are kept. Fails with `TeamExists` when the team name is taken.
    async fn create_team_with_users(&self, team_name: &str, members: &[TeamMember])
        -> Result<()>;

    /// Fetch a team and all its members (active and inactive).
    async fn get_team_by_name(&self, team_name: &str) -> Result<Option<Team>>;

    async fn team_exists(&self, team_name: &str) -> Result<bool>;

    async fn get_user(&self, user_id: &str) -> Result<Option<User>>;

    /// Members of a team, optionally restricted to active ones, ordered
    /// by user id.
    async fn get_users_by_team(&self, team_name: &str, active_only: bool) -> Result<Vec<User>>;

    /// Flip a user's activity flag. Returns the updated user, or
    /// `Ok(None)` when the user does not exist.
    async fn set_user_active_status(&self, user_id: &str, is_active: bool)
        -> Result<Option<User>>;

    /// Persist a new pull request and its chosen reviewers in one
    /// transaction. Fails with `PrExists` when the id is taken.
    async fn create_pr_with_reviewers(
        &self,
        pr: &PullRequest,
        reviewer_ids: &[String],
    ) -> Result<()>;

    async fn get_pr(&self, pull_request_id: &str) -> Result<Option<PullRequest>>;

    async fn pr_exists(&self, pull_request_id: &str) -> Result<bool>;

    /// Mark a pull request merged at `merged_at`. Merging an already
    /// merged pull request is a no-op that returns the stored row
    /// unchanged. Returns `Ok(None)` when the pull request does not
    /// exist.
    async fn merge_pr(
        &self,
        pull_request_id: &str,
        merged_at: DateTime<Utc>,
    ) -> Result<Option<PullRequest>>;

    /// Atomically swap `old_user_id` for `new_user_id` on a pull
    /// request's reviewer list. Preconditions (open, old assigned) are
    /// re-validated inside the transaction.
    async fn reassign_reviewer(
        &self,
        pull_request_id: &str,
        old_user_id: &str,
        new_user_id: &str,
    ) -> Result<()>;

    /// Pull requests on which the user is currently an assigned
    /// reviewer, any status, newest first.
    async fn get_prs_by_reviewer(&self, user_id: &str) -> Result<Vec<PullRequestShort>>;

    /// Whether the user currently holds a reviewer slot on the pull
    /// request.
    async fn is_user_assigned(&self, pull_request_id: &str, user_id: &str) -> Result<bool>;

    /// Deactivate the given members of a team and reassign every open
    /// reviewer slot they hold, all in one transaction. Validation of
    /// the user list (membership, activity) happens inside the
    /// transaction; any failure leaves storage untouched.
    async fn deactivate_team_members_with_reassignment(
        &self,
        team_name: &str,
        user_ids: &[String],
    ) -> Result<DeactivationOutcome>;

    /// Assignment counts per user plus open/merged totals.
    async fn get_stats(&self) -> Result<Stats>;
}
