//! HTTP handlers for the review assignment API.
//!
//! A thin JSON binding over [`ReviewService`]: handlers decode the wire
//! types, call the service, and shape the response envelopes. All domain
//! rules live in the service; the only logic here is parameter presence
//! and the error-to-status mapping.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::entities::{
    DeactivationOutcome, PrStatus, PullRequest, PullRequestShort, Stats, Team, TeamMember, User,
};
use crate::error::{AppError, Result};
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/team/add", post(create_team))
        .route("/team/get", get(get_team))
        .route("/team/deactivateMembers", post(deactivate_members))
        .route("/users/setIsActive", post(set_user_active))
        .route("/users/getReview", get(get_user_reviews))
        .route("/pullRequest/create", post(create_pull_request))
        .route("/pullRequest/merge", post(merge_pull_request))
        .route("/pullRequest/reassign", post(reassign_reviewer))
        .route("/stats", get(get_stats))
        .route("/health", get(health_check))
        .with_state(state)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::TeamExists(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::PrExists(_)
            | AppError::PrMerged(_)
            | AppError::NotAssigned { .. }
            | AppError::NoCandidate(_)
            | AppError::InvalidTeamUser { .. } => StatusCode::CONFLICT,
            AppError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self);
        }
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(),
            }
        }));
        (status, body).into_response()
    }
}

fn parse_json<T: DeserializeOwned>(bytes: &Bytes) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| AppError::validation(format!("invalid JSON body: {e}")))
}

// -----------------------------------------------------------------------------
// Wire types
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateTeamRequest {
    team_name: String,
    #[serde(default)]
    members: Vec<TeamMember>,
}

#[derive(Debug, Deserialize)]
struct SetUserActiveRequest {
    user_id: String,
    is_active: bool,
}

#[derive(Debug, Deserialize)]
struct CreatePrRequest {
    pull_request_id: String,
    pull_request_name: String,
    author_id: String,
}

#[derive(Debug, Deserialize)]
struct MergePrRequest {
    pull_request_id: String,
}

#[derive(Debug, Deserialize)]
struct ReassignReviewerRequest {
    pull_request_id: String,
    old_user_id: String,
}

#[derive(Debug, Deserialize)]
struct DeactivateMembersRequest {
    team_name: String,
    #[serde(default)]
    user_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GetTeamQuery {
    team_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetReviewQuery {
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct TeamResponse {
    team_name: String,
    members: Vec<TeamMember>,
}

impl From<Team> for TeamResponse {
    fn from(team: Team) -> Self {
        TeamResponse {
            team_name: team.team_name,
            members: team.team_members,
        }
    }
}

#[derive(Debug, Serialize)]
struct TeamEnvelope {
    team: TeamResponse,
}

/// User as exposed on the wire; timestamps are internal.
#[derive(Debug, Serialize)]
struct UserResponse {
    user_id: String,
    username: String,
    team_name: String,
    is_active: bool,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        UserResponse {
            user_id: user.user_id,
            username: user.username,
            team_name: user.team_name,
            is_active: user.is_active,
        }
    }
}

#[derive(Debug, Serialize)]
struct UserEnvelope {
    user: UserResponse,
}

/// Pull request as exposed on the wire; timestamps are internal.
#[derive(Debug, Serialize)]
struct PullRequestResponse {
    pull_request_id: String,
    pull_request_name: String,
    author_id: String,
    status: PrStatus,
    assigned_reviewers: Vec<String>,
}

impl From<PullRequest> for PullRequestResponse {
    fn from(pr: PullRequest) -> Self {
        PullRequestResponse {
            pull_request_id: pr.pull_request_id,
            pull_request_name: pr.pull_request_name,
            author_id: pr.author_id,
            status: pr.status,
            assigned_reviewers: pr.assigned_reviewers,
        }
    }
}

#[derive(Debug, Serialize)]
struct PrEnvelope {
    pr: PullRequestResponse,
}

#[derive(Debug, Serialize)]
struct ReassignReviewerResponse {
    pr: PullRequestResponse,
    replaced_by: String,
}

#[derive(Debug, Serialize)]
struct UserReviewsResponse {
    user_id: String,
    pull_requests: Vec<PullRequestShort>,
}

// -----------------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------------

/// Handler: POST /team/add
async fn create_team(
    State(state): State<Arc<AppState>>,
    bytes: Bytes,
) -> Result<(StatusCode, Json<TeamEnvelope>)> {
    let req: CreateTeamRequest = parse_json(&bytes)?;
    let team = state.service.create_team(&req.team_name, &req.members).await?;
    Ok((StatusCode::CREATED, Json(TeamEnvelope { team: team.into() })))
}

/// Handler: GET /team/get?team_name=...
async fn get_team(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GetTeamQuery>,
) -> Result<Json<TeamEnvelope>> {
    let team_name = query
        .team_name
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::validation("missing team_name query parameter"))?;
    let team = state.service.get_team(&team_name).await?;
    Ok(Json(TeamEnvelope { team: team.into() }))
}

/// Handler: POST /team/deactivateMembers
async fn deactivate_members(
    State(state): State<Arc<AppState>>,
    bytes: Bytes,
) -> Result<Json<DeactivationOutcome>> {
    let req: DeactivateMembersRequest = parse_json(&bytes)?;
    let outcome = state
        .service
        .deactivate_team_members(&req.team_name, &req.user_ids)
        .await?;
    Ok(Json(outcome))
}

/// Handler: POST /users/setIsActive
async fn set_user_active(
    State(state): State<Arc<AppState>>,
    bytes: Bytes,
) -> Result<Json<UserEnvelope>> {
    let req: SetUserActiveRequest = parse_json(&bytes)?;
    let user = state.service.set_user_active(&req.user_id, req.is_active).await?;
    Ok(Json(UserEnvelope { user: user.into() }))
}

/// Handler: GET /users/getReview?user_id=...
async fn get_user_reviews(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GetReviewQuery>,
) -> Result<Json<UserReviewsResponse>> {
    let user_id = query
        .user_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::validation("missing user_id query parameter"))?;
    let pull_requests = state.service.get_user_reviews(&user_id).await?;
    Ok(Json(UserReviewsResponse {
        user_id,
        pull_requests,
    }))
}

/// Handler: POST /pullRequest/create
async fn create_pull_request(
    State(state): State<Arc<AppState>>,
    bytes: Bytes,
) -> Result<(StatusCode, Json<PrEnvelope>)> {
    let req: CreatePrRequest = parse_json(&bytes)?;
    let pr = state
        .service
        .create_pull_request(&req.pull_request_id, &req.pull_request_name, &req.author_id)
        .await?;
    Ok((StatusCode::CREATED, Json(PrEnvelope { pr: pr.into() })))
}

/// Handler: POST /pullRequest/merge
async fn merge_pull_request(
    State(state): State<Arc<AppState>>,
    bytes: Bytes,
) -> Result<Json<PrEnvelope>> {
    let req: MergePrRequest = parse_json(&bytes)?;
    let pr = state.service.merge_pull_request(&req.pull_request_id).await?;
    Ok(Json(PrEnvelope { pr: pr.into() }))
}

/// Handler: POST /pullRequest/reassign
async fn reassign_reviewer(
    State(state): State<Arc<AppState>>,
    bytes: Bytes,
) -> Result<Json<ReassignReviewerResponse>> {
    let req: ReassignReviewerRequest = parse_json(&bytes)?;
    let (pr, replaced_by) = state
        .service
        .reassign_reviewer(&req.pull_request_id, &req.old_user_id)
        .await?;
    Ok(Json(ReassignReviewerResponse {
        pr: pr.into(),
        replaced_by,
    }))
}

/// Handler: GET /stats
async fn get_stats(State(state): State<Arc<AppState>>) -> Result<Json<Stats>> {
    let stats = state.service.get_stats().await?;
    Ok(Json(stats))
}

/// Handler: GET /health
async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "reviewpool"
    }))
}
