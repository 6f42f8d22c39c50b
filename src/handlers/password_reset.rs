use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::services::auth::hash_password;
use crate::services::token::TokenAction;
use crate::state::AppState;

/// パスワードリセットトークンの有効期間（秒）
const RESET_TOKEN_TTL_SECS: i64 = 900;

// === リセットリクエスト ===

#[derive(Debug, Deserialize)]
pub struct ResetRequestRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct ResetRequestResponse {
    pub message: String,
}

/// POST /api/password/reset-request
///
/// # Security
/// - 常に200を返す（ユーザー存在有無を漏洩しない）
/// - トークンはdebugログにのみ出力（メール配送は本サービスの責務外）
pub async fn request_password_reset(
    State(state): State<AppState>,
    Json(request): Json<ResetRequestRequest>,
) -> Result<Json<ResetRequestResponse>, AppError> {
    // バリデーション
    validate_email(&request.email)?;

    // ユーザー不在でもエラーにしない
    if let Some(user) = state.user_repo.find_by_email(&request.email).await? {
        let token = state.token_service.issue(
            TokenAction::ResetPassword,
            &user.id.to_string(),
            RESET_TOKEN_TTL_SECS,
            None,
        )?;

        tracing::debug!(user_id = %user.id, token = %token, "パスワードリセットトークン発行");
    }

    Ok(Json(ResetRequestResponse {
        message: "パスワードリセット手順をメールで送信しました".to_string(),
    }))
}

// === パスワードリセット実行 ===

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct ResetPasswordResponse {
    pub message: String,
}

/// POST /api/password/reset
///
/// # Security
/// - token, new_password はログに出力しない
pub async fn reset_password(
    State(state): State<AppState>,
    Json(request): Json<ResetPasswordRequest>,
) -> Result<Json<ResetPasswordResponse>, AppError> {
    // バリデーション
    validate_reset_password_request(&request)?;

    let claims = state
        .token_service
        .verify_for_action(&request.token, TokenAction::ResetPassword)
        .map_err(|e| {
            tracing::warn!(reason = e.reason(), "パスワードリセットトークン検証失敗");
            AppError::FlowRestart
        })?;

    let user_id: uuid::Uuid = claims.subject.parse().map_err(|_| AppError::FlowRestart)?;

    let user = state
        .user_repo
        .find_by_id(user_id)
        .await?
        .ok_or(AppError::FlowRestart)?;

    let password_hash = hash_password(&request.new_password)?;
    state.user_repo.update_password(user.id, &password_hash).await?;

    tracing::info!(user_id = %user.id, "パスワードリセット完了");

    Ok(Json(ResetPasswordResponse {
        message: "パスワードが更新されました".to_string(),
    }))
}

/// メールアドレスのバリデーション
fn validate_email(email: &str) -> Result<(), AppError> {
    if email.trim().is_empty() || !email.contains('@') {
        return Err(AppError::Validation(
            "有効なメールアドレスを入力してください".to_string(),
        ));
    }
    Ok(())
}

/// リセットパスワードリクエストのバリデーション
fn validate_reset_password_request(request: &ResetPasswordRequest) -> Result<(), AppError> {
    if request.token.trim().is_empty() {
        return Err(AppError::Validation("トークンは必須です".to_string()));
    }
    if request.new_password.len() < 8 {
        return Err(AppError::Validation(
            "パスワードは8文字以上で入力してください".to_string(),
        ));
    }
    Ok(())
}
