//! In-memory storage backend.
//!
//! Holds the whole world (teams, users, pull requests) behind one
//! `RwLock`. Every operation validates and mutates inside a single lock
//! section, so a failed precondition never leaves a partial write. Used
//! by the test suite and available as a throwaway runtime backend.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::thread_rng;
use tokio::sync::RwLock;

use crate::entities::{
    DeactivationOutcome, PrStatus, PullRequest, PullRequestShort, Stats, Team, TeamMember, User,
};
use crate::error::{AppError, Result};
use crate::selection::plan_deactivation_reassignments;
use crate::storage::locks::PrLocks;
use crate::storage::Storage;

#[derive(Default)]
struct WorldState {
    teams: HashSet<String>,
    users: HashMap<String, User>,
    prs: HashMap<String, PullRequest>,
}

impl WorldState {
    fn team_roster(&self, team_name: &str, active_only: bool) -> Vec<User> {
        let mut members: Vec<User> = self
            .users
            .values()
            .filter(|u| u.team_name == team_name && (!active_only || u.is_active))
            .cloned()
            .collect();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        members
    }

    /// Ids of open pull requests reviewed by any of the given users.
    fn affected_open_prs(&self, user_ids: &HashSet<String>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .prs
            .values()
            .filter(|pr| {
                pr.status == PrStatus::Open
                    && pr.assigned_reviewers.iter().any(|r| user_ids.contains(r))
            })
            .map(|pr| pr.pull_request_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Storage backend keeping everything in process memory.
///
/// # Concurrency
///
/// The world lock makes each operation atomic on its own. Reviewer
/// mutations additionally take the per-pull-request lock first, so the
/// multi-step operations (notably bulk deactivation, which reads the
/// affected set before writing it) serialize against other mutations of
/// the same pull requests. Lock order is always pull-request lock, then
/// world lock; the world lock is never held across an await.
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<WorldState>,
    locks: PrLocks,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Attempts to stabilize the affected pull-request set during a bulk
/// deactivation before giving up.
const MAX_DEACTIVATION_RETRIES: usize = 16;

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_team_with_users(
        &self,
        team_name: &str,
        members: &[TeamMember],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if state.teams.contains(team_name) {
            return Err(AppError::TeamExists(team_name.to_string()));
        }

        let now = Utc::now();
        state.teams.insert(team_name.to_string());
        for member in members {
            match state.users.get_mut(&member.user_id) {
                Some(existing) => {
                    // Known user: move onto this team, keep username and
                    // creation time.
                    existing.team_name = team_name.to_string();
                    existing.is_active = member.is_active;
                    existing.updated_at = now;
                }
                None => {
                    state.users.insert(
                        member.user_id.clone(),
                        User {
                            user_id: member.user_id.clone(),
                            username: member.username.clone(),
                            team_name: team_name.to_string(),
                            is_active: member.is_active,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn get_team_by_name(&self, team_name: &str) -> Result<Option<Team>> {
        let state = self.state.read().await;
        if !state.teams.contains(team_name) {
            return Ok(None);
        }
        let members = state.team_roster(team_name, false);
        Ok(Some(Team {
            team_name: team_name.to_string(),
            team_members: members.iter().map(TeamMember::from).collect(),
        }))
    }

    async fn team_exists(&self, team_name: &str) -> Result<bool> {
        Ok(self.state.read().await.teams.contains(team_name))
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.state.read().await.users.get(user_id).cloned())
    }

    async fn get_users_by_team(&self, team_name: &str, active_only: bool) -> Result<Vec<User>> {
        Ok(self.state.read().await.team_roster(team_name, active_only))
    }

    async fn set_user_active_status(
        &self,
        user_id: &str,
        is_active: bool,
    ) -> Result<Option<User>> {
        let mut state = self.state.write().await;
        match state.users.get_mut(user_id) {
            Some(user) => {
                user.is_active = is_active;
                user.updated_at = Utc::now();
                Ok(Some(user.clone()))
            }
            None => Ok(None),
        }
    }

    async fn create_pr_with_reviewers(
        &self,
        pr: &PullRequest,
        reviewer_ids: &[String],
    ) -> Result<()> {
        let _guard = self.locks.acquire(&pr.pull_request_id).await;
        let mut state = self.state.write().await;
        if state.prs.contains_key(&pr.pull_request_id) {
            return Err(AppError::PrExists(pr.pull_request_id.clone()));
        }

        let mut reviewers: Vec<String> = reviewer_ids.to_vec();
        reviewers.sort();
        reviewers.dedup();

        let mut stored = pr.clone();
        stored.assigned_reviewers = reviewers;
        state.prs.insert(stored.pull_request_id.clone(), stored);
        Ok(())
    }

    async fn get_pr(&self, pull_request_id: &str) -> Result<Option<PullRequest>> {
        Ok(self.state.read().await.prs.get(pull_request_id).cloned())
    }

    async fn pr_exists(&self, pull_request_id: &str) -> Result<bool> {
        Ok(self.state.read().await.prs.contains_key(pull_request_id))
    }

    async fn merge_pr(
        &self,
        pull_request_id: &str,
        merged_at: DateTime<Utc>,
    ) -> Result<Option<PullRequest>> {
        let _guard = self.locks.acquire(pull_request_id).await;
        let mut state = self.state.write().await;
        match state.prs.get_mut(pull_request_id) {
            Some(pr) => {
                if !pr.is_merged() {
                    pr.status = PrStatus::Merged;
                    pr.merged_at = Some(merged_at);
                }
                Ok(Some(pr.clone()))
            }
            None => Ok(None),
        }
    }

    async fn reassign_reviewer(
        &self,
        pull_request_id: &str,
        old_user_id: &str,
        new_user_id: &str,
    ) -> Result<()> {
        let _guard = self.locks.acquire(pull_request_id).await;
        let mut state = self.state.write().await;
        let pr = state
            .prs
            .get_mut(pull_request_id)
            .ok_or_else(|| AppError::not_found("pull request", pull_request_id))?;

        if pr.is_merged() {
            return Err(AppError::PrMerged(pull_request_id.to_string()));
        }
        if !pr.is_assigned(old_user_id) {
            return Err(AppError::not_assigned(old_user_id, pull_request_id));
        }
        if pr.is_assigned(new_user_id) {
            return Err(AppError::storage(
                "reassign reviewer",
                format!(
                    "replacement '{new_user_id}' already assigned to PR '{pull_request_id}'"
                ),
            ));
        }

        pr.assigned_reviewers.retain(|r| r != old_user_id);
        pr.assigned_reviewers.push(new_user_id.to_string());
        pr.assigned_reviewers.sort();
        Ok(())
    }

    async fn get_prs_by_reviewer(&self, user_id: &str) -> Result<Vec<PullRequestShort>> {
        let state = self.state.read().await;
        let mut prs: Vec<&PullRequest> = state
            .prs
            .values()
            .filter(|pr| pr.is_assigned(user_id))
            .collect();
        prs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.pull_request_id.cmp(&b.pull_request_id))
        });
        Ok(prs.into_iter().map(PullRequestShort::from).collect())
    }

    async fn is_user_assigned(&self, pull_request_id: &str, user_id: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .prs
            .get(pull_request_id)
            .is_some_and(|pr| pr.is_assigned(user_id)))
    }

    async fn deactivate_team_members_with_reassignment(
        &self,
        team_name: &str,
        user_ids: &[String],
    ) -> Result<DeactivationOutcome> {
        let deactivating: HashSet<String> = user_ids.iter().cloned().collect();

        for _ in 0..MAX_DEACTIVATION_RETRIES {
            // Snapshot the affected pull requests, then lock them. The
            // snapshot can go stale while we wait for the locks, so it is
            // re-checked below and the whole attempt retried on mismatch.
            let affected = {
                let state = self.state.read().await;
                state.affected_open_prs(&deactivating)
            };
            let _guards = self.locks.acquire_many(&affected).await;

            let mut state = self.state.write().await;
            if state.affected_open_prs(&deactivating) != affected {
                continue;
            }

            // All validation happens here, before the first mutation.
            if !state.teams.contains(team_name) {
                return Err(AppError::not_found("team", team_name));
            }
            for user_id in &deactivating {
                let user = state
                    .users
                    .get(user_id)
                    .ok_or_else(|| AppError::not_found("user", user_id))?;
                if user.team_name != team_name {
                    return Err(AppError::invalid_team_user(
                        user_id,
                        team_name,
                        "does not belong to",
                    ));
                }
                if !user.is_active {
                    return Err(AppError::invalid_team_user(
                        user_id,
                        team_name,
                        "is not an active member of",
                    ));
                }
            }

            let roster = state.team_roster(team_name, true);
            let open_prs: Vec<PullRequest> = affected
                .iter()
                .filter_map(|id| state.prs.get(id).cloned())
                .collect();
            let entries = plan_deactivation_reassignments(
                &mut thread_rng(),
                &roster,
                &open_prs,
                &deactivating,
            );

            let now = Utc::now();
            for user_id in &deactivating {
                if let Some(user) = state.users.get_mut(user_id) {
                    user.is_active = false;
                    user.updated_at = now;
                }
            }
            for entry in &entries {
                if let Some(pr) = state.prs.get_mut(&entry.pull_request_id) {
                    pr.assigned_reviewers.retain(|r| r != &entry.old_reviewer);
                    if let Some(new) = entry.replacement() {
                        pr.assigned_reviewers.push(new.to_string());
                    }
                    pr.assigned_reviewers.sort();
                }
            }

            let mut deactivated: Vec<String> = deactivating.iter().cloned().collect();
            deactivated.sort();
            return Ok(DeactivationOutcome {
                deactivated_users: deactivated,
                reassignments: entries,
            });
        }

        Err(AppError::storage(
            "deactivate team members",
            "affected pull request set kept changing".to_string(),
        ))
    }

    async fn get_stats(&self) -> Result<Stats> {
        let state = self.state.read().await;
        let mut stats = Stats::default();
        for pr in state.prs.values() {
            match pr.status {
                PrStatus::Open => stats.pr_stats.open += 1,
                PrStatus::Merged => stats.pr_stats.merged += 1,
            }
            for reviewer in &pr.assigned_reviewers {
                *stats.user_assignments.entry(reviewer.clone()).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }
}
