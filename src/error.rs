use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("認証エラー: {0}")]
    Authentication(String),

    #[error("バリデーションエラー: {0}")]
    Validation(String),

    #[error("設定エラー: {0}")]
    Configuration(String),

    #[error("データベースエラー")]
    Database(#[from] sqlx::Error),

    #[error("内部エラー")]
    Internal(#[from] anyhow::Error),

    #[error("暗号化データの復号に失敗しました")]
    Decryption,

    #[error("セッションが無効または期限切れです")]
    FlowRestart,

    #[error("認証コードが無効です")]
    TwoFactorInvalidCode,

    #[error("二要素認証は既に有効です")]
    TwoFactorAlreadyEnabled,

    #[error("二要素認証が有効化されていません")]
    TwoFactorNotEnabled,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                "メールアドレスまたはパスワードが正しくありません".to_string(),
            ),
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Configuration(msg) => {
                // 鍵・ソルト不在は即時に表面化させる（リトライ対象ではない）
                tracing::error!(reason = %msg, "設定エラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                )
            }
            Self::Database(e) => {
                tracing::error!(error = ?e, "データベースエラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                )
            }
            Self::Internal(e) => {
                tracing::error!(error = ?e, "内部エラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                )
            }
            Self::Decryption => {
                // データ破損または鍵ローテーション不整合。「シークレット不在」扱いにはしない
                tracing::error!("保存シークレットの復号失敗（データ整合性エラー）");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                )
            }
            Self::FlowRestart => (
                StatusCode::UNAUTHORIZED,
                // 期限切れ・署名不正・アクション不一致は区別せず同じ応答を返す
                "セッションが無効です。最初からやり直してください".to_string(),
            ),
            Self::TwoFactorInvalidCode => (
                StatusCode::UNAUTHORIZED,
                "認証コードが正しくありません".to_string(),
            ),
            Self::TwoFactorAlreadyEnabled => {
                (StatusCode::CONFLICT, "二要素認証は既に有効です".to_string())
            }
            Self::TwoFactorNotEnabled => (
                StatusCode::BAD_REQUEST,
                "二要素認証が有効化されていません".to_string(),
            ),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
