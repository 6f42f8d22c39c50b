use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::User;
use crate::services::token::TokenAction;
use crate::services::two_factor::{
    CodeValidation, Disable, EnrollmentConfirm, EnrollmentStart, EnrollmentToken,
};
use crate::state::AppState;

// === 2FA Setup（有効化フロー開始） ===

#[derive(Debug, Deserialize)]
pub struct SetupRequest {
    pub user_id: Uuid,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SetupResponse {
    /// 有効化フロー継続トークン（仮シークレット入り）
    pub enrollment_token: String,
}

/// POST /api/2fa/setup
///
/// 2FA有効化フローを開始し、仮シークレットを封入した有効化トークンを返す。
/// シークレットはトークンが /api/2fa/confirm で確定されるまでDBには書かれない。
///
/// # Security
/// - パスワード確認必須
/// - シークレット平文はログ出力禁止
pub async fn setup_2fa(
    State(state): State<AppState>,
    Json(request): Json<SetupRequest>,
) -> Result<Json<SetupResponse>, AppError> {
    // バリデーション
    validate_password(&request.password)?;

    // パスワード確認
    let user = verify_user_password(&state, request.user_id, &request.password).await?;

    match state.two_factor_service.begin_enrollment(&user).await? {
        EnrollmentStart::AlreadyEnabled => Err(AppError::TwoFactorAlreadyEnabled),
        EnrollmentStart::Started { token } => Ok(Json(SetupResponse {
            enrollment_token: token,
        })),
    }
}

// === 2FA Enroll（有効化フォーム表示用データ取得） ===

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub user_id: Uuid,
    pub password: String,
    pub enrollment_token: String,
}

#[derive(Debug, Serialize)]
pub struct EnrollResponse {
    pub secret: String,
    /// 手入力用に4文字区切りで整形したシークレット
    pub secret_formatted: String,
    pub qr_code: String,
}

/// POST /api/2fa/enroll
///
/// 有効化トークンを検証し、認証アプリ登録用のシークレットとQRコードを返す。
/// トークンが期限切れ・不正ならフローのやり直しを要求する
pub async fn enroll_2fa(
    State(state): State<AppState>,
    Json(request): Json<EnrollRequest>,
) -> Result<Json<EnrollResponse>, AppError> {
    // バリデーション
    validate_password(&request.password)?;

    // パスワード確認
    let user = verify_user_password(&state, request.user_id, &request.password).await?;

    match state
        .two_factor_service
        .validate_enrollment_token(&user, Some(&request.enrollment_token))
    {
        EnrollmentToken::Enabling {
            tentative_secret,
            qr_code_base64,
        } => Ok(Json(EnrollResponse {
            secret_formatted: crate::services::TotpService::format_secret(&tentative_secret),
            secret: tentative_secret,
            qr_code: format!("data:image/png;base64,{qr_code_base64}"),
        })),
        EnrollmentToken::Missing | EnrollmentToken::Invalid | EnrollmentToken::WrongUser => {
            Err(AppError::FlowRestart)
        }
    }
}

// === 2FA Confirm（有効化確定） ===

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub user_id: Uuid,
    pub password: String,
    pub enrollment_token: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub enabled: bool,
    /// 平文バックアップコード。この応答でのみ返却され、以後再取得不可
    pub backup_codes: Vec<String>,
}

/// POST /api/2fa/confirm
///
/// 仮シークレットに対するTOTPコードを検証し、2FAを有効化する。
/// 成功時にバックアップコードを一度だけ平文で返す。
///
/// # Security
/// - コード・バックアップコードはログ出力禁止
pub async fn confirm_2fa(
    State(state): State<AppState>,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>, AppError> {
    // バリデーション
    validate_password(&request.password)?;
    validate_totp_code(&request.code)?;

    // パスワード確認
    let user = verify_user_password(&state, request.user_id, &request.password).await?;

    // 有効化トークンから仮シークレットを取り出す
    let tentative_secret = match state
        .two_factor_service
        .validate_enrollment_token(&user, Some(&request.enrollment_token))
    {
        EnrollmentToken::Enabling {
            tentative_secret, ..
        } => tentative_secret,
        _ => return Err(AppError::FlowRestart),
    };

    match state
        .two_factor_service
        .confirm_enrollment(
            &user,
            &tentative_secret,
            &request.code,
            state.config.backup_code_count,
        )
        .await?
    {
        EnrollmentConfirm::AlreadyEnabled => Err(AppError::TwoFactorAlreadyEnabled),
        EnrollmentConfirm::InvalidCode => Err(AppError::TwoFactorInvalidCode),
        EnrollmentConfirm::Enabled { backup_codes } => Ok(Json(ConfirmResponse {
            enabled: true,
            backup_codes,
        })),
    }
}

// === 2FA Validate（ログイン継続） ===

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    /// /api/login が返した2FA継続トークン
    pub continuation_token: String,
    /// TOTPコードまたはバックアップコード
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub validated: bool,
    pub user_id: Uuid,
    /// "totp" または "backup"
    pub method: &'static str,
    pub remaining_backup_codes: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub remember_me: bool,
    /// ログイン時に指定されたリダイレクト先（あれば）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// POST /api/2fa/validate
///
/// 継続トークンとコードを検証してログインを完了させる。
/// トークン起因の失敗（期限切れ・署名不正・アクション不一致）は全て
/// 同一の「やり直し」応答に集約し、失敗理由はログでのみ区別する
pub async fn validate_2fa(
    State(state): State<AppState>,
    Json(request): Json<ValidateRequest>,
) -> Result<Json<ValidateResponse>, AppError> {
    // バリデーション
    validate_code_input(&request.code)?;

    // 継続トークン検証
    let claims = state
        .token_service
        .verify_for_action(&request.continuation_token, TokenAction::Pending2fa)
        .map_err(|e| {
            tracing::warn!(reason = e.reason(), "2FA継続トークン検証失敗");
            AppError::FlowRestart
        })?;

    let user = lookup_token_user(&state, &claims.subject).await?;

    let remember_me = claims
        .extra_data
        .as_ref()
        .and_then(|extra| extra.get("remember_me"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let next = claims
        .extra_data
        .as_ref()
        .and_then(|extra| extra.get("next"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let (method, remaining, warnings) = match state
        .two_factor_service
        .validate_code(&user, &request.code)
        .await?
    {
        // トークン発行後に2FAが無効化された。フローごと無効
        CodeValidation::NotEnabled => return Err(AppError::FlowRestart),
        CodeValidation::Reused | CodeValidation::InvalidCode => {
            return Err(AppError::TwoFactorInvalidCode);
        }
        CodeValidation::ValidatedByTotp {
            remaining_backup_codes,
            warnings,
        } => ("totp", remaining_backup_codes, warnings),
        CodeValidation::ValidatedByBackup {
            remaining_backup_codes,
            warnings,
        } => ("backup", remaining_backup_codes, warnings),
    };

    // ログイン完了
    state.user_repo.touch_last_login(user.id).await?;

    tracing::info!(user_id = %user.id, method, "2FAログイン完了");

    Ok(Json(ValidateResponse {
        validated: true,
        user_id: user.id,
        method,
        remaining_backup_codes: remaining,
        warnings,
        remember_me,
        next,
    }))
}

// === 2FA Disable ===

#[derive(Debug, Deserialize)]
pub struct DisableRequest {
    pub user_id: Uuid,
    pub password: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct DisableResponse {
    pub disabled: bool,
}

/// POST /api/2fa/disable
///
/// 2FA無効化。シークレットとリプレイマーカーをクリアし、
/// 残存バックアップコードを失効させる
///
/// # Security
/// - パスワード確認必須
/// - 現行コード（TOTPまたはバックアップ）の確認必須
pub async fn disable_2fa(
    State(state): State<AppState>,
    Json(request): Json<DisableRequest>,
) -> Result<Json<DisableResponse>, AppError> {
    // バリデーション
    validate_password(&request.password)?;
    validate_code_input(&request.code)?;

    // パスワード確認
    let user = verify_user_password(&state, request.user_id, &request.password).await?;

    // コード確認
    match state
        .two_factor_service
        .validate_code(&user, &request.code)
        .await?
    {
        CodeValidation::NotEnabled => return Err(AppError::TwoFactorNotEnabled),
        CodeValidation::Reused | CodeValidation::InvalidCode => {
            return Err(AppError::TwoFactorInvalidCode);
        }
        CodeValidation::ValidatedByTotp { .. } | CodeValidation::ValidatedByBackup { .. } => {}
    }

    match state.two_factor_service.disable(&user).await? {
        Disable::NotEnabled => Err(AppError::TwoFactorNotEnabled),
        Disable::Disabled => Ok(Json(DisableResponse { disabled: true })),
    }
}

// === バックアップコード再発行 ===

#[derive(Debug, Deserialize)]
pub struct RegenerateBackupCodesRequest {
    pub user_id: Uuid,
    pub password: String,
    /// 現行のTOTPコードまたはバックアップコード
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct RegenerateBackupCodesResponse {
    /// 新しい平文バックアップコード。既存の未使用コードは全て失効済み
    pub backup_codes: Vec<String>,
}

/// POST /api/2fa/backup-codes
///
/// バックアップコードを再発行する。既存の未使用コードは
/// 新コードの生成前に失効される（旧シートは即座に無効）
///
/// # Security
/// - パスワード確認必須
/// - 現行コード（TOTPまたはバックアップ）の確認必須。
///   パスワードのみで新しいコード一式を入手できてはならない
pub async fn regenerate_backup_codes(
    State(state): State<AppState>,
    Json(request): Json<RegenerateBackupCodesRequest>,
) -> Result<Json<RegenerateBackupCodesResponse>, AppError> {
    // バリデーション
    validate_password(&request.password)?;
    validate_code_input(&request.code)?;

    // パスワード確認
    let user = verify_user_password(&state, request.user_id, &request.password).await?;

    // コード確認
    match state
        .two_factor_service
        .validate_code(&user, &request.code)
        .await?
    {
        CodeValidation::NotEnabled => return Err(AppError::TwoFactorNotEnabled),
        CodeValidation::Reused | CodeValidation::InvalidCode => {
            return Err(AppError::TwoFactorInvalidCode);
        }
        CodeValidation::ValidatedByTotp { .. } | CodeValidation::ValidatedByBackup { .. } => {}
    }

    let codes = state
        .two_factor_service
        .regenerate_backup_codes(&user, state.config.backup_code_count)
        .await?
        .ok_or(AppError::TwoFactorNotEnabled)?;

    tracing::info!(user_id = %user.id, count = codes.len(), "バックアップコード再発行");

    Ok(Json(RegenerateBackupCodesResponse {
        backup_codes: codes,
    }))
}

// === 2FA Status ===

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub user_id: Uuid,
    pub password: String,
    /// 現行のTOTPコードまたはバックアップコード。2FA有効ユーザーのみ必須
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_backup_codes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_formatted: Option<String>,
}

/// POST /api/2fa/status
///
/// 現在の2FA状態（有効フラグ・バックアップコード残数・整形済みシークレット）を返す
///
/// # Security
/// 応答に復号済みシークレットを含むため、2FA有効ユーザーには
/// パスワードに加えて現行コードの提示を要求する。
/// 未有効ユーザーはコード不要（開示すべきシークレットがない）
pub async fn status_2fa(
    State(state): State<AppState>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<StatusResponse>, AppError> {
    // バリデーション
    validate_password(&request.password)?;

    // パスワード確認
    let user = verify_user_password(&state, request.user_id, &request.password).await?;

    // コード確認
    if user.uses_2fa {
        let code = request
            .code
            .as_deref()
            .ok_or_else(|| AppError::Validation("認証コードは必須です".to_string()))?;
        validate_code_input(code)?;

        match state.two_factor_service.validate_code(&user, code).await? {
            CodeValidation::NotEnabled => return Err(AppError::TwoFactorNotEnabled),
            CodeValidation::Reused | CodeValidation::InvalidCode => {
                return Err(AppError::TwoFactorInvalidCode);
            }
            CodeValidation::ValidatedByTotp { .. } | CodeValidation::ValidatedByBackup { .. } => {}
        }
    }

    let status = state.two_factor_service.status(&user).await?;

    Ok(Json(StatusResponse {
        enabled: status.enabled,
        remaining_backup_codes: status.remaining_backup_codes,
        secret_formatted: status.secret_formatted,
    }))
}

// === Helper Functions ===

/// パスワードバリデーション
fn validate_password(password: &str) -> Result<(), AppError> {
    if password.is_empty() {
        return Err(AppError::Validation("パスワードは必須です".to_string()));
    }
    if password.len() < 8 {
        return Err(AppError::Validation(
            "パスワードは8文字以上で入力してください".to_string(),
        ));
    }
    Ok(())
}

/// TOTPコードバリデーション（6桁数字のみ）
fn validate_totp_code(code: &str) -> Result<(), AppError> {
    if code.is_empty() {
        return Err(AppError::Validation("認証コードは必須です".to_string()));
    }
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::Validation(
            "認証コードは6桁の数字で入力してください".to_string(),
        ));
    }
    Ok(())
}

/// コード入力バリデーション（TOTPコードまたはバックアップコード）
///
/// どちらも6文字の英数字。形式で種別を区別せず、検証側で順に試行する
fn validate_code_input(code: &str) -> Result<(), AppError> {
    if code.is_empty() {
        return Err(AppError::Validation("認証コードは必須です".to_string()));
    }
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::Validation(
            "認証コードは6文字の英数字で入力してください".to_string(),
        ));
    }
    Ok(())
}

/// ユーザーのパスワードを検証し、ユーザー情報を返す
async fn verify_user_password(
    state: &AppState,
    user_id: Uuid,
    password: &str,
) -> Result<User, AppError> {
    // ユーザー取得
    let user = state
        .user_repo
        .find_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::Authentication("user not found".to_string()))?;

    // パスワード検証
    state.auth_service.authenticate(&user.email, password).await
}

/// 継続トークンのsubjectからユーザーを引く
///
/// subjectの形式不正・ユーザー不在はいずれもフローやり直し扱い
async fn lookup_token_user(state: &AppState, subject: &str) -> Result<User, AppError> {
    let user_id: Uuid = subject.parse().map_err(|_| {
        tracing::warn!("継続トークンのsubjectがUUIDではありません");
        AppError::FlowRestart
    })?;

    state
        .user_repo
        .find_by_id(user_id)
        .await?
        .ok_or(AppError::FlowRestart)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_empty_password() {
        assert!(validate_password("").is_err());
    }

    #[test]
    fn test_validate_short_password() {
        assert!(validate_password("short").is_err());
    }

    #[test]
    fn test_validate_valid_password() {
        assert!(validate_password("password123").is_ok());
    }

    #[test]
    fn test_validate_empty_code() {
        assert!(validate_totp_code("").is_err());
    }

    #[test]
    fn test_validate_short_code() {
        assert!(validate_totp_code("12345").is_err());
    }

    #[test]
    fn test_validate_non_digit_code() {
        assert!(validate_totp_code("12345a").is_err());
    }

    #[test]
    fn test_validate_valid_code() {
        assert!(validate_totp_code("123456").is_ok());
    }

    #[test]
    fn test_validate_code_input_accepts_backup_code() {
        // バックアップコードは英数字混在
        assert!(validate_code_input("aB3kM9").is_ok());
    }

    #[test]
    fn test_validate_code_input_rejects_symbols() {
        assert!(validate_code_input("ab-3k9").is_err());
    }

    #[test]
    fn test_validate_code_input_rejects_wrong_length() {
        assert!(validate_code_input("abc1234").is_err());
    }
}
