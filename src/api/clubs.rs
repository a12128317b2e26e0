//! Clubs, direct conversations and profile endpoints
//!
//! Membership changes are published on the change feed, so open unread
//! sessions rebuild their realtime filters without a refresh.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{post, put},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::auth::CurrentUser;
use crate::data::{Club, DirectConversation};
use crate::error::AppError;

const MAX_NAME_CHARS: usize = 80;

#[derive(Debug, Deserialize)]
pub struct CreateClubRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateDirectConversationRequest {
    pub participant_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub display_name: String,
}

#[derive(Debug, Serialize)]
pub struct MembershipResponse {
    pub club_id: String,
    pub member: bool,
    pub changed: bool,
}

fn validate_name(field: &str, value: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!("{field} must not be empty")));
    }
    if trimmed.chars().count() > MAX_NAME_CHARS {
        return Err(AppError::Validation(format!(
            "{field} must be at most {MAX_NAME_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// POST /api/v1/clubs
pub async fn create_club(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<CreateClubRequest>,
) -> Result<(StatusCode, Json<Club>), AppError> {
    let name = validate_name("name", &request.name)?;
    let club = state.db.create_club(&name, &user_id).await?;

    tracing::info!(club_id = %club.id, owner = %user_id, "Club created");
    Ok((StatusCode::CREATED, Json(club)))
}

/// POST /api/v1/clubs/:id/join
pub async fn join_club(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(club_id): Path<String>,
) -> Result<Json<MembershipResponse>, AppError> {
    let changed = state.db.join_club(&club_id, &user_id).await?;

    Ok(Json(MembershipResponse {
        club_id,
        member: true,
        changed,
    }))
}

/// POST /api/v1/clubs/:id/leave
pub async fn leave_club(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(club_id): Path<String>,
) -> Result<Json<MembershipResponse>, AppError> {
    let changed = state.db.leave_club(&club_id, &user_id).await?;

    Ok(Json(MembershipResponse {
        club_id,
        member: false,
        changed,
    }))
}

/// POST /api/v1/direct_conversations
///
/// Returns the existing conversation when the pair already has one.
pub async fn create_direct_conversation(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<CreateDirectConversationRequest>,
) -> Result<Json<DirectConversation>, AppError> {
    let participant = request.participant_id.trim();
    if participant.is_empty() {
        return Err(AppError::Validation(
            "participant_id must not be empty".to_string(),
        ));
    }

    let conversation = state
        .db
        .create_direct_conversation(&user_id, participant)
        .await?;
    Ok(Json(conversation))
}

/// PUT /api/v1/profile
pub async fn update_profile(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<UpdateProfileRequest>,
) -> Result<StatusCode, AppError> {
    let display_name = validate_name("display_name", &request.display_name)?;
    state.db.upsert_profile(&user_id, &display_name).await?;

    Ok(StatusCode::NO_CONTENT)
}

pub fn clubs_router() -> Router<AppState> {
    Router::new()
        .route("/clubs", post(create_club))
        .route("/clubs/:id/join", post(join_club))
        .route("/clubs/:id/leave", post(leave_club))
        .route("/direct_conversations", post(create_direct_conversation))
        .route("/profile", put(update_profile))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed_and_bounded() {
        assert_eq!(validate_name("name", "  Dawn Patrol ").unwrap(), "Dawn Patrol");
        assert!(matches!(
            validate_name("name", "   "),
            Err(AppError::Validation(_))
        ));
        assert!(validate_name("name", &"x".repeat(MAX_NAME_CHARS + 1)).is_err());
    }
}
