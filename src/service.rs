//! The review assignment engine.
//!
//! [`ReviewService`] sits between the HTTP surface and a [`Storage`]
//! backend. It owns input validation, the precondition checks whose error
//! ordering is part of the API contract, and the reviewer selection policy
//! (delegated to [`crate::selection`]). Storage re-validates the
//! preconditions that matter under its per-pull-request locks, so a check
//! passing here and failing there is a lost race, not a bug.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rand::thread_rng;
use tracing::info;

use crate::entities::{
    DeactivationOutcome, PrStatus, PullRequest, PullRequestShort, Stats, Team, TeamMember, User,
};
use crate::error::{AppError, Result};
use crate::selection::{
    eligible_candidates, select_initial_reviewers, select_replacement, DEFAULT_MAX_REVIEWERS,
};
use crate::storage::Storage;

#[derive(Clone)]
pub struct ReviewService {
    storage: Arc<dyn Storage>,
}

fn require(value: &str, what: &'static str) -> Result<()> {
    if value.is_empty() {
        return Err(AppError::validation(format!("{what} is required")));
    }
    Ok(())
}

impl ReviewService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Create a team with its initial member list.
    ///
    /// Members that already exist as users are moved onto the new team.
    /// Returns the team as stored, so the response reflects any such
    /// moves.
    pub async fn create_team(&self, team_name: &str, members: &[TeamMember]) -> Result<Team> {
        require(team_name, "team_name")?;
        if members.is_empty() {
            return Err(AppError::validation("at least one member is required"));
        }
        for member in members {
            require(&member.user_id, "member user_id")?;
        }

        if self.storage.team_exists(team_name).await? {
            return Err(AppError::TeamExists(team_name.to_string()));
        }
        self.storage
            .create_team_with_users(team_name, members)
            .await?;

        info!("Created team '{}' with {} members", team_name, members.len());
        self.get_team(team_name).await
    }

    pub async fn get_team(&self, team_name: &str) -> Result<Team> {
        require(team_name, "team_name")?;
        self.storage
            .get_team_by_name(team_name)
            .await?
            .ok_or_else(|| AppError::not_found("team", team_name))
    }

    pub async fn set_user_active(&self, user_id: &str, is_active: bool) -> Result<User> {
        require(user_id, "user_id")?;
        self.storage
            .set_user_active_status(user_id, is_active)
            .await?
            .ok_or_else(|| AppError::not_found("user", user_id))
    }

    /// Pull requests the user currently reviews, newest first. An unknown
    /// user simply has no reviews.
    pub async fn get_user_reviews(&self, user_id: &str) -> Result<Vec<PullRequestShort>> {
        require(user_id, "user_id")?;
        self.storage.get_prs_by_reviewer(user_id).await
    }

    /// Create a pull request and assign up to two reviewers from the
    /// author's team.
    ///
    /// Candidates are the team's active members other than the author. A
    /// team with no candidates still gets its pull request, just with an
    /// empty reviewer list.
    pub async fn create_pull_request(
        &self,
        pull_request_id: &str,
        pull_request_name: &str,
        author_id: &str,
    ) -> Result<PullRequest> {
        require(pull_request_id, "pull_request_id")?;
        require(pull_request_name, "pull_request_name")?;
        require(author_id, "author_id")?;

        if self.storage.pr_exists(pull_request_id).await? {
            return Err(AppError::PrExists(pull_request_id.to_string()));
        }
        let author = self
            .storage
            .get_user(author_id)
            .await?
            .ok_or_else(|| AppError::not_found("author", author_id))?;

        let roster = self
            .storage
            .get_users_by_team(&author.team_name, true)
            .await?;
        let candidates = eligible_candidates(&roster, author_id, &[], &HashSet::new());
        let mut reviewers =
            select_initial_reviewers(&mut thread_rng(), &candidates, DEFAULT_MAX_REVIEWERS);
        reviewers.sort();

        let pr = PullRequest {
            pull_request_id: pull_request_id.to_string(),
            pull_request_name: pull_request_name.to_string(),
            author_id: author_id.to_string(),
            status: PrStatus::Open,
            assigned_reviewers: reviewers.clone(),
            created_at: Utc::now(),
            merged_at: None,
        };
        self.storage.create_pr_with_reviewers(&pr, &reviewers).await?;

        info!(
            "Created PR '{}' by '{}' with reviewers {:?}",
            pull_request_id, author_id, reviewers
        );
        Ok(pr)
    }

    /// Mark a pull request merged. Merging twice returns the stored pull
    /// request unchanged.
    pub async fn merge_pull_request(&self, pull_request_id: &str) -> Result<PullRequest> {
        require(pull_request_id, "pull_request_id")?;

        let pr = self
            .storage
            .get_pr(pull_request_id)
            .await?
            .ok_or_else(|| AppError::not_found("pull request", pull_request_id))?;
        if pr.is_merged() {
            return Ok(pr);
        }

        let merged = self
            .storage
            .merge_pr(pull_request_id, Utc::now())
            .await?
            .ok_or_else(|| AppError::not_found("pull request", pull_request_id))?;
        info!("Merged PR '{}'", pull_request_id);
        Ok(merged)
    }

    /// Swap one assigned reviewer for a randomly chosen replacement from
    /// the departing reviewer's team.
    ///
    /// The replacement pool excludes the author and everyone currently
    /// assigned, the departing reviewer included, so the new reviewer is
    /// always a genuine change. Returns the updated pull request and the
    /// replacement's id.
    pub async fn reassign_reviewer(
        &self,
        pull_request_id: &str,
        old_user_id: &str,
    ) -> Result<(PullRequest, String)> {
        require(pull_request_id, "pull_request_id")?;
        require(old_user_id, "old_user_id")?;

        let pr = self
            .storage
            .get_pr(pull_request_id)
            .await?
            .ok_or_else(|| AppError::not_found("pull request", pull_request_id))?;
        if pr.is_merged() {
            return Err(AppError::PrMerged(pull_request_id.to_string()));
        }
        if !self
            .storage
            .is_user_assigned(pull_request_id, old_user_id)
            .await?
        {
            return Err(AppError::not_assigned(old_user_id, pull_request_id));
        }

        let old_user = self
            .storage
            .get_user(old_user_id)
            .await?
            .ok_or_else(|| AppError::not_found("user", old_user_id))?;
        let roster = self
            .storage
            .get_users_by_team(&old_user.team_name, true)
            .await?;
        let candidates = eligible_candidates(
            &roster,
            &pr.author_id,
            &pr.assigned_reviewers,
            &HashSet::new(),
        );
        let new_user_id = select_replacement(&mut thread_rng(), &candidates)
            .ok_or_else(|| AppError::NoCandidate(old_user.team_name.clone()))?;

        self.storage
            .reassign_reviewer(pull_request_id, old_user_id, &new_user_id)
            .await?;

        let updated = self
            .storage
            .get_pr(pull_request_id)
            .await?
            .ok_or_else(|| AppError::not_found("pull request", pull_request_id))?;
        info!(
            "Reassigned reviewer on PR '{}': '{}' -> '{}'",
            pull_request_id, old_user_id, new_user_id
        );
        Ok((updated, new_user_id))
    }

    /// Deactivate several team members at once, reassigning every open
    /// reviewer slot they hold.
    ///
    /// An empty user list is a no-op that reports an empty outcome without
    /// consulting storage. The whole batch validates atomically in
    /// storage: one bad id and nothing changes.
    pub async fn deactivate_team_members(
        &self,
        team_name: &str,
        user_ids: &[String],
    ) -> Result<DeactivationOutcome> {
        require(team_name, "team_name")?;
        if user_ids.is_empty() {
            return Ok(DeactivationOutcome::default());
        }
        for user_id in user_ids {
            require(user_id, "user_id")?;
        }
        if !self.storage.team_exists(team_name).await? {
            return Err(AppError::not_found("team", team_name));
        }

        let outcome = self
            .storage
            .deactivate_team_members_with_reassignment(team_name, user_ids)
            .await?;
        info!(
            "Deactivated {} members of '{}', touching {} reviewer slots",
            outcome.deactivated_users.len(),
            team_name,
            outcome.reassignments.len()
        );
        Ok(outcome)
    }

    pub async fn get_stats(&self) -> Result<Stats> {
        self.storage.get_stats().await
    }
}
