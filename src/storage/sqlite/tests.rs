//! Tests for the SQLite storage implementation.

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use super::SqliteStorage;
use crate::entities::{PrStatus, PullRequest, TeamMember};
use crate::error::AppError;
use crate::storage::{MemoryStorage, Storage};

fn member(id: &str, active: bool) -> TeamMember {
    TeamMember {
        user_id: id.to_string(),
        username: format!("user {id}"),
        is_active: active,
    }
}

/// An open pull request with a deterministic whole-second timestamp, so
/// values survive the text round trip exactly.
fn open_pr_at(id: &str, author: &str, seq: i64) -> PullRequest {
    PullRequest {
        pull_request_id: id.to_string(),
        pull_request_name: format!("pr {id}"),
        author_id: author.to_string(),
        status: PrStatus::Open,
        assigned_reviewers: Vec::new(),
        created_at: DateTime::from_timestamp(1_700_000_000 + seq, 0).unwrap(),
        merged_at: None,
    }
}

fn merge_time(seq: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_800_000_000 + seq, 0).unwrap()
}

async fn seed_team<S: Storage>(storage: &S, team: &str, ids: &[&str]) {
    let members: Vec<TeamMember> = ids.iter().map(|id| member(id, true)).collect();
    storage.create_team_with_users(team, &members).await.unwrap();
}

#[tokio::test]
async fn test_get_team_returns_none_for_missing() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    assert!(storage.get_team_by_name("backend").await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_then_fetch_team() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["charlie", "alice", "bob"]).await;

    let team = storage.get_team_by_name("backend").await.unwrap().unwrap();
    assert_eq!(team.team_name, "backend");
    let ids: Vec<&str> = team
        .team_members
        .iter()
        .map(|m| m.user_id.as_str())
        .collect();
    assert_eq!(ids, vec!["alice", "bob", "charlie"]);
}

#[tokio::test]
async fn test_duplicate_team_is_rejected() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice"]).await;

    let err = storage
        .create_team_with_users("backend", &[member("bob", true)])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::TeamExists(_)));

    // The failed transaction must not have written the new user.
    assert!(storage.get_user("bob").await.unwrap().is_none());
}

#[tokio::test]
async fn test_member_upsert_moves_user_but_keeps_identity() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice"]).await;
    let before = storage.get_user("alice").await.unwrap().unwrap();

    let moved = TeamMember {
        user_id: "alice".to_string(),
        username: "someone else".to_string(),
        is_active: false,
    };
    storage
        .create_team_with_users("frontend", &[moved])
        .await
        .unwrap();

    let after = storage.get_user("alice").await.unwrap().unwrap();
    assert_eq!(after.team_name, "frontend");
    assert!(!after.is_active);
    assert_eq!(after.username, before.username);
    assert_eq!(after.created_at, before.created_at);
}

#[tokio::test]
async fn test_set_active_status_unknown_user() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    assert!(storage
        .set_user_active_status("ghost", false)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_set_active_status_round_trip() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice"]).await;

    let updated = storage
        .set_user_active_status("alice", false)
        .await
        .unwrap()
        .unwrap();
    assert!(!updated.is_active);
    assert!(!storage.get_user("alice").await.unwrap().unwrap().is_active);
}

#[tokio::test]
async fn test_create_pr_stores_sorted_reviewers() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice", "bob", "zed"]).await;

    storage
        .create_pr_with_reviewers(
            &open_pr_at("pr-1", "alice", 0),
            &["zed".to_string(), "bob".to_string()],
        )
        .await
        .unwrap();

    let pr = storage.get_pr("pr-1").await.unwrap().unwrap();
    assert_eq!(pr.assigned_reviewers, vec!["bob", "zed"]);
    assert_eq!(pr.status, PrStatus::Open);
    assert!(pr.merged_at.is_none());
}

#[tokio::test]
async fn test_duplicate_pr_is_rejected() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice", "bob"]).await;
    storage
        .create_pr_with_reviewers(&open_pr_at("pr-1", "alice", 0), &["bob".to_string()])
        .await
        .unwrap();

    let err = storage
        .create_pr_with_reviewers(&open_pr_at("pr-1", "alice", 1), &["bob".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PrExists(_)));
}

#[tokio::test]
async fn test_unknown_author_violates_foreign_key() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice"]).await;

    let err = storage
        .create_pr_with_reviewers(&open_pr_at("pr-1", "ghost", 0), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Storage { .. }));
    assert!(storage.get_pr("pr-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_merge_is_idempotent() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice", "bob"]).await;
    storage
        .create_pr_with_reviewers(&open_pr_at("pr-1", "alice", 0), &["bob".to_string()])
        .await
        .unwrap();

    let first = storage
        .merge_pr("pr-1", merge_time(0))
        .await
        .unwrap()
        .unwrap();
    let second = storage
        .merge_pr("pr-1", merge_time(99))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.status, PrStatus::Merged);
    assert_eq!(first.merged_at, Some(merge_time(0)));
    assert_eq!(second.merged_at, Some(merge_time(0)));
}

#[tokio::test]
async fn test_merge_unknown_pr_is_none() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    assert!(storage
        .merge_pr("pr-404", merge_time(0))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_reassign_swaps_reviewer() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice", "bob", "carol", "zed"]).await;
    storage
        .create_pr_with_reviewers(
            &open_pr_at("pr-1", "alice", 0),
            &["bob".to_string(), "zed".to_string()],
        )
        .await
        .unwrap();

    storage
        .reassign_reviewer("pr-1", "zed", "carol")
        .await
        .unwrap();

    let pr = storage.get_pr("pr-1").await.unwrap().unwrap();
    assert_eq!(pr.assigned_reviewers, vec!["bob", "carol"]);
}

#[tokio::test]
async fn test_reassign_validates_in_transaction() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice", "bob", "carol"]).await;
    storage
        .create_pr_with_reviewers(&open_pr_at("pr-1", "alice", 0), &["bob".to_string()])
        .await
        .unwrap();

    let err = storage
        .reassign_reviewer("pr-404", "bob", "carol")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));

    let err = storage
        .reassign_reviewer("pr-1", "carol", "bob")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotAssigned { .. }));

    storage.merge_pr("pr-1", merge_time(0)).await.unwrap();
    let err = storage
        .reassign_reviewer("pr-1", "bob", "carol")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PrMerged(_)));
}

#[tokio::test]
async fn test_reviews_listed_newest_first() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice", "bob"]).await;
    storage
        .create_pr_with_reviewers(&open_pr_at("pr-old", "alice", 0), &["bob".to_string()])
        .await
        .unwrap();
    storage
        .create_pr_with_reviewers(&open_pr_at("pr-new", "alice", 60), &["bob".to_string()])
        .await
        .unwrap();

    let reviews = storage.get_prs_by_reviewer("bob").await.unwrap();
    let ids: Vec<&str> = reviews.iter().map(|r| r.pull_request_id.as_str()).collect();
    assert_eq!(ids, vec!["pr-new", "pr-old"]);
}

#[tokio::test]
async fn test_assignment_membership_is_queryable() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice", "bob", "carol"]).await;
    storage
        .create_pr_with_reviewers(&open_pr_at("pr-1", "alice", 0), &["bob".to_string()])
        .await
        .unwrap();

    assert!(storage.is_user_assigned("pr-1", "bob").await.unwrap());
    assert!(!storage.is_user_assigned("pr-1", "carol").await.unwrap());
    assert!(!storage.is_user_assigned("pr-404", "bob").await.unwrap());
}

#[tokio::test]
async fn test_deactivation_is_all_or_nothing() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice", "bob", "carol"]).await;
    seed_team(&storage, "frontend", &["dave"]).await;
    storage
        .create_pr_with_reviewers(&open_pr_at("pr-1", "alice", 0), &["bob".to_string()])
        .await
        .unwrap();

    let err = storage
        .deactivate_team_members_with_reassignment(
            "backend",
            &["bob".to_string(), "dave".to_string()],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTeamUser { .. }));

    assert!(storage.get_user("bob").await.unwrap().unwrap().is_active);
    let pr = storage.get_pr("pr-1").await.unwrap().unwrap();
    assert_eq!(pr.assigned_reviewers, vec!["bob"]);
}

#[tokio::test]
async fn test_deactivation_reassigns_open_slots() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice", "bob", "carol", "dave"]).await;
    storage
        .create_pr_with_reviewers(
            &open_pr_at("pr-1", "alice", 0),
            &["bob".to_string(), "carol".to_string()],
        )
        .await
        .unwrap();

    let outcome = storage
        .deactivate_team_members_with_reassignment("backend", &["bob".to_string()])
        .await
        .unwrap();

    assert_eq!(outcome.deactivated_users, vec!["bob"]);
    assert_eq!(outcome.reassignments.len(), 1);
    assert_eq!(outcome.reassignments[0].old_reviewer, "bob");
    assert_eq!(outcome.reassignments[0].replacement(), Some("dave"));

    let pr = storage.get_pr("pr-1").await.unwrap().unwrap();
    assert_eq!(pr.assigned_reviewers, vec!["carol", "dave"]);
    assert!(!storage.get_user("bob").await.unwrap().unwrap().is_active);
}

#[tokio::test]
async fn test_deactivation_vacates_when_no_candidate() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice", "bob"]).await;
    storage
        .create_pr_with_reviewers(&open_pr_at("pr-1", "alice", 0), &["bob".to_string()])
        .await
        .unwrap();

    let outcome = storage
        .deactivate_team_members_with_reassignment("backend", &["bob".to_string()])
        .await
        .unwrap();

    assert_eq!(outcome.reassignments.len(), 1);
    assert_eq!(outcome.reassignments[0].replacement(), None);
    let pr = storage.get_pr("pr-1").await.unwrap().unwrap();
    assert!(pr.assigned_reviewers.is_empty());
}

#[tokio::test]
async fn test_deactivation_skips_merged_prs() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice", "bob", "carol"]).await;
    storage
        .create_pr_with_reviewers(&open_pr_at("pr-1", "alice", 0), &["bob".to_string()])
        .await
        .unwrap();
    storage.merge_pr("pr-1", merge_time(0)).await.unwrap();

    let outcome = storage
        .deactivate_team_members_with_reassignment("backend", &["bob".to_string()])
        .await
        .unwrap();

    assert!(outcome.reassignments.is_empty());
    let pr = storage.get_pr("pr-1").await.unwrap().unwrap();
    assert_eq!(pr.assigned_reviewers, vec!["bob"]);
}

#[tokio::test]
async fn test_stats() {
    let storage = SqliteStorage::new_in_memory().unwrap();
    seed_team(&storage, "backend", &["alice", "bob", "carol"]).await;
    storage
        .create_pr_with_reviewers(
            &open_pr_at("pr-1", "alice", 0),
            &["bob".to_string(), "carol".to_string()],
        )
        .await
        .unwrap();
    storage
        .create_pr_with_reviewers(&open_pr_at("pr-2", "alice", 1), &["bob".to_string()])
        .await
        .unwrap();
    storage.merge_pr("pr-2", merge_time(0)).await.unwrap();

    let stats = storage.get_stats().await.unwrap();
    assert_eq!(stats.pr_stats.open, 1);
    assert_eq!(stats.pr_stats.merged, 1);
    assert_eq!(stats.user_assignments.get("bob"), Some(&2));
    assert_eq!(stats.user_assignments.get("carol"), Some(&1));
    assert_eq!(stats.user_assignments.get("alice"), None);
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("reviewpool.db");

    {
        let storage = SqliteStorage::new(&db_path).unwrap();
        seed_team(&storage, "backend", &["alice", "bob", "carol"]).await;
        storage
            .create_pr_with_reviewers(
                &open_pr_at("pr-1", "alice", 0),
                &["bob".to_string(), "carol".to_string()],
            )
            .await
            .unwrap();
        storage.merge_pr("pr-1", merge_time(0)).await.unwrap();
    }

    let storage = SqliteStorage::new(&db_path).unwrap();
    let team = storage.get_team_by_name("backend").await.unwrap().unwrap();
    assert_eq!(team.team_members.len(), 3);

    let pr = storage.get_pr("pr-1").await.unwrap().unwrap();
    assert_eq!(pr.status, PrStatus::Merged);
    assert_eq!(pr.merged_at, Some(merge_time(0)));
    assert_eq!(pr.assigned_reviewers, vec!["bob", "carol"]);
}

#[tokio::test]
async fn test_creates_missing_state_directory() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("nested").join("reviewpool.db");

    let storage = SqliteStorage::new(&db_path).unwrap();
    seed_team(&storage, "backend", &["alice"]).await;
    assert!(storage.get_user("alice").await.unwrap().is_some());
}

// =============================================================================
// Backend equivalence
// =============================================================================

#[derive(Debug, Clone)]
enum StorageOp {
    Create {
        pr: usize,
        author: usize,
        reviewers: Vec<usize>,
    },
    Merge {
        pr: usize,
    },
    Reassign {
        pr: usize,
        old: usize,
        new: usize,
    },
}

fn arb_op() -> impl Strategy<Value = StorageOp> {
    prop_oneof![
        (0usize..6, 0usize..5, proptest::collection::vec(0usize..5, 0..3)).prop_map(
            |(pr, author, reviewers)| StorageOp::Create {
                pr,
                author,
                reviewers,
            }
        ),
        (0usize..6).prop_map(|pr| StorageOp::Merge { pr }),
        (0usize..6, 0usize..5, 0usize..5)
            .prop_map(|(pr, old, new)| StorageOp::Reassign { pr, old, new }),
    ]
}

fn user_name(idx: usize) -> String {
    format!("u{idx}")
}

fn pr_name(idx: usize) -> String {
    format!("p{idx}")
}

fn err_code<T>(result: &crate::error::Result<T>) -> Option<&'static str> {
    result.as_ref().err().map(|e| e.code())
}

async fn apply_op<S: Storage>(storage: &S, op: &StorageOp, seq: i64) -> Option<&'static str> {
    match op {
        StorageOp::Create {
            pr,
            author,
            reviewers,
        } => {
            let reviewer_ids: Vec<String> = reviewers.iter().map(|r| user_name(*r)).collect();
            let pr = open_pr_at(&pr_name(*pr), &user_name(*author), seq);
            let result = storage.create_pr_with_reviewers(&pr, &reviewer_ids).await;
            err_code(&result)
        }
        StorageOp::Merge { pr } => {
            let result = storage.merge_pr(&pr_name(*pr), merge_time(seq)).await;
            err_code(&result)
        }
        StorageOp::Reassign { pr, old, new } => {
            let result = storage
                .reassign_reviewer(&pr_name(*pr), &user_name(*old), &user_name(*new))
                .await;
            err_code(&result)
        }
    }
}

proptest! {
    /// Property: the SQLite and in-memory backends are observationally
    /// identical for any sequence of deterministic mutations. Errors must
    /// match by code, and every read-back view must match exactly.
    #[test]
    fn backends_agree_on_deterministic_ops(ops in proptest::collection::vec(arb_op(), 0..25)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let sqlite = SqliteStorage::new_in_memory().unwrap();
            let memory = MemoryStorage::new();
            let ids: Vec<&str> = vec!["u0", "u1", "u2", "u3", "u4"];
            seed_team(&sqlite, "backend", &ids).await;
            seed_team(&memory, "backend", &ids).await;

            for (seq, op) in ops.iter().enumerate() {
                let sqlite_code = apply_op(&sqlite, op, seq as i64).await;
                let memory_code = apply_op(&memory, op, seq as i64).await;
                assert_eq!(sqlite_code, memory_code, "op {op:?} diverged");
            }

            for pr_idx in 0..6 {
                let name = pr_name(pr_idx);
                assert_eq!(
                    sqlite.get_pr(&name).await.unwrap(),
                    memory.get_pr(&name).await.unwrap(),
                    "pull request {name} diverged"
                );
            }
            for user_idx in 0..5 {
                let name = user_name(user_idx);
                assert_eq!(
                    sqlite.get_prs_by_reviewer(&name).await.unwrap(),
                    memory.get_prs_by_reviewer(&name).await.unwrap(),
                    "review listing for {name} diverged"
                );
            }
            assert_eq!(sqlite.get_stats().await.unwrap(), memory.get_stats().await.unwrap());
        });
    }
}
