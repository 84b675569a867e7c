use std::sync::Arc;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AppError;
use crate::game_store::{CharacterRow, GameStore};

/// Giran town spawn, where stuck characters get dropped.
const UNSTUCK_X: i32 = 83_400;
const UNSTUCK_Y: i32 = 147_943;
const UNSTUCK_Z: i32 = -3_404;

#[derive(Clone)]
pub struct CharactersState {
    pub store: Arc<dyn GameStore>,
}

/// Identifies the caller and the character they claim. `linked_login` comes
/// from the web account's stored link; `email` is the authenticated fallback
/// when no link exists yet.
#[derive(Clone, Debug, Deserialize)]
pub struct OwnershipRequest {
    pub character_name: String,
    #[serde(default)]
    pub linked_login: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    pub account_name: String,
}

#[derive(Serialize)]
pub struct TeleportResponse {
    pub teleported: bool,
}

pub fn normalize_name(raw: &str) -> Result<String, AppError> {
    let name = raw.trim();
    if name.is_empty() || name.chars().count() > 35 {
        return Err(AppError::Validation(
            "character name must be 1-35 characters".to_string(),
        ));
    }
    Ok(name.to_string())
}

/// The single authorization gate in front of every purchase and teleport:
/// the character's owning account must match the caller's linked login. The
/// forbidden message is deliberately generic so a mismatch does not confirm
/// that the character exists.
pub async fn resolve_owned_character(
    store: &dyn GameStore,
    request: &OwnershipRequest,
) -> Result<CharacterRow, AppError> {
    let name = normalize_name(&request.character_name)?;

    let login = match &request.linked_login {
        Some(login) if !login.trim().is_empty() => login.trim().to_string(),
        _ => {
            let email = request
                .email
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .ok_or_else(|| {
                    AppError::NotFound("no game account linked to this profile".to_string())
                })?;
            store
                .account_login_for_email(email)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound("no game account linked to this profile".to_string())
                })?
        }
    };

    let character = store
        .find_character(&name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("character {name} not found")))?;

    if !character.account_name.eq_ignore_ascii_case(&login) {
        return Err(AppError::Forbidden(
            "this character is not available for your account".to_string(),
        ));
    }
    Ok(character)
}

/// POST /characters/validate
pub async fn validate_character(
    State(state): State<Arc<CharactersState>>,
    Json(request): Json<OwnershipRequest>,
) -> Result<Json<ValidateResponse>, AppError> {
    let character = resolve_owned_character(state.store.as_ref(), &request).await?;
    Ok(Json(ValidateResponse {
        valid: true,
        account_name: character.account_name,
    }))
}

/// POST /characters/teleport — moves a stuck (offline) character to Giran.
pub async fn teleport_character(
    State(state): State<Arc<CharactersState>>,
    Json(request): Json<OwnershipRequest>,
) -> Result<Json<TeleportResponse>, AppError> {
    let character = resolve_owned_character(state.store.as_ref(), &request).await?;
    if character.online {
        return Err(AppError::Conflict(
            "character must be offline to be teleported".to_string(),
        ));
    }

    state
        .store
        .teleport(&character.name, UNSTUCK_X, UNSTUCK_Y, UNSTUCK_Z)
        .await?;
    info!(character = %character.name, "teleported to town");
    Ok(Json(TeleportResponse { teleported: true }))
}
