use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::services::token::TokenAction;
use crate::state::AppState;

// === 確認メール（再）送信リクエスト ===

#[derive(Debug, Deserialize)]
pub struct RequestValidationRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct RequestValidationResponse {
    pub message: String,
}

/// POST /api/email/request-validation
///
/// メールアドレス確認用トークンを発行する。
/// 確認トークンには有効期限を付けない（未確認アカウントは確認されるまで
/// ログイン不可のままであり、期限切れで詰ませる理由がない）。
///
/// # Security
/// 常に200を返す（ユーザー存在有無を漏洩しない）。
/// トークンはdebugログにのみ出力（メール配送は本サービスの責務外）
pub async fn request_email_validation(
    State(state): State<AppState>,
    Json(request): Json<RequestValidationRequest>,
) -> Result<Json<RequestValidationResponse>, AppError> {
    // バリデーション
    validate_email(&request.email)?;

    // ユーザー不在・確認済みでもエラーにしない
    if let Some(user) = state.user_repo.find_by_email(&request.email).await?
        && !user.active
    {
        let token = state.token_service.issue(
            TokenAction::ValidateEmail,
            &user.id.to_string(),
            0, // 無期限
            None,
        )?;

        tracing::debug!(user_id = %user.id, token = %token, "メール確認トークン発行");
    }

    Ok(Json(RequestValidationResponse {
        message: "確認手順をメールで送信しました".to_string(),
    }))
}

// === メールアドレス確認実行 ===

#[derive(Debug, Deserialize)]
pub struct ValidateEmailRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateEmailResponse {
    pub message: String,
}

/// POST /api/email/validate
///
/// 確認トークンを検証し、アカウントを有効化する
pub async fn validate_email_token(
    State(state): State<AppState>,
    Json(request): Json<ValidateEmailRequest>,
) -> Result<Json<ValidateEmailResponse>, AppError> {
    if request.token.trim().is_empty() {
        return Err(AppError::Validation("トークンは必須です".to_string()));
    }

    let claims = state
        .token_service
        .verify_for_action(&request.token, TokenAction::ValidateEmail)
        .map_err(|e| {
            tracing::warn!(reason = e.reason(), "メール確認トークン検証失敗");
            AppError::FlowRestart
        })?;

    let user_id: uuid::Uuid = claims.subject.parse().map_err(|_| AppError::FlowRestart)?;

    let user = state
        .user_repo
        .find_by_id(user_id)
        .await?
        .ok_or(AppError::FlowRestart)?;

    // 確認済みでも成功応答（リンクの二度押しをエラーにしない）
    if !user.active {
        state.user_repo.activate(user.id).await?;
        tracing::info!(user_id = %user.id, "メールアドレス確認完了");
    }

    Ok(Json(ValidateEmailResponse {
        message: "メールアドレスが確認されました".to_string(),
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
