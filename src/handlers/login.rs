use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::AppError;
use crate::services::token::TokenAction;
use crate::state::AppState;

/// ログインリクエスト
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// ユーザーのメールアドレス
    pub email: String,
    /// ユーザーのパスワード
    pub password: String,
    /// ログイン状態を維持するか
    #[serde(default)]
    pub remember_me: bool,
    /// ログイン完了後のリダイレクト先（相対パス）
    #[serde(default)]
    pub next: Option<String>,
}

/// ログインレスポンス
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    /// 2FAが必要かどうか
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_2fa: Option<bool>,
    /// 2FA継続トークン（2FA必要時のみ）
    ///
    /// /api/2fa/validate に提出するまでの短寿命トークン
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    /// ユーザーID（ログイン完了時のみ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

/// ログインハンドラー
///
/// POST /api/login
///
/// 処理フロー:
/// 1. リクエストバリデーション
/// 2. ユーザー認証（DB照合）
/// 3. 2FA有効チェック（有効なら継続トークンを発行して中断）
/// 4. ログイン完了（last_login 更新）
///
/// # Security
/// 継続トークンの発行時点ではログインは成立していない。
/// コード検証を通過するまで user_id 等の確定情報は返さない
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    // 1. リクエストバリデーション
    validate_login_request(&request)?;

    // 2. ユーザー認証（DB照合）
    let user = state
        .auth_service
        .authenticate(&request.email, &request.password)
        .await?;

    // 3. 2FA有効チェック
    if user.uses_2fa {
        // コード検証後のログイン確定に必要な文脈をトークンに相乗りさせる
        let token = state.token_service.issue(
            TokenAction::Pending2fa,
            &user.id.to_string(),
            state.config.two_fa_token_ttl_secs,
            Some(json!({
                "remember_me": request.remember_me,
                "next": request.next,
            })),
        )?;

        tracing::info!(user_id = %user.id, "第一要素通過、2FAコード待ち");

        return Ok(Json(LoginResponse {
            requires_2fa: Some(true),
            continuation_token: Some(token),
            user_id: None,
        }));
    }

    // 4. ログイン完了
    state.user_repo.touch_last_login(user.id).await?;

    tracing::info!(user_id = %user.id, "ログイン完了");

    Ok(Json(LoginResponse {
        requires_2fa: None,
        continuation_token: None,
        user_id: Some(user.id),
    }))
}

/// ログインリクエストのバリデーション
fn validate_login_request(request: &LoginRequest) -> Result<(), AppError> {
    // email: 必須、メール形式
    if request.email.trim().is_empty() {
        return Err(AppError::Validation("メールアドレスは必須です".to_string()));
    }

    // 簡易的なメール形式チェック（@ が含まれているか）
    if !request.email.contains('@') {
        return Err(AppError::Validation(
            "有効なメールアドレスを入力してください".to_string(),
        ));
    }

    // password: 必須、8文字以上
    if request.password.is_empty() {
        return Err(AppError::Validation("パスワードは必須です".to_string()));
    }

    if request.password.len() < 8 {
        return Err(AppError::Validation(
            "パスワードは8文字以上で入力してください".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> LoginRequest {
        LoginRequest {
            email: "test@example.com".to_string(),
            password: "password123".to_string(),
            remember_me: false,
            next: None,
        }
    }

    #[test]
    fn test_validate_empty_email() {
        let request = LoginRequest {
            email: "".to_string(),
            ..valid_request()
        };
        assert!(validate_login_request(&request).is_err());
    }

    #[test]
    fn test_validate_invalid_email() {
        let request = LoginRequest {
            email: "invalid-email".to_string(),
            ..valid_request()
        };
        assert!(validate_login_request(&request).is_err());
    }

    #[test]
    fn test_validate_short_password() {
        let request = LoginRequest {
            password: "short".to_string(),
            ..valid_request()
        };
        assert!(validate_login_request(&request).is_err());
    }

    #[test]
    fn test_validate_valid_request() {
        assert!(validate_login_request(&valid_request()).is_ok());
    }
}
