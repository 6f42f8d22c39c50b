use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// ユーザー
///
/// 2FA関連カラムの不変条件:
/// - `uses_2fa = true` のとき `otp_secret_encrypted` は必ず存在する
/// - 有効化途中（tentative）のシークレットはDBに書かず、アクショントークン内にのみ置く
/// - `last_otp` は直近に受理したTOTP値（リプレイ拒否用）
#[derive(Debug, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: Option<String>,
    pub active: bool,
    pub uses_2fa: bool,
    /// TOTPシード（base32）の暗号文。平文はログ出力禁止
    #[serde(skip)]
    pub otp_secret_encrypted: Option<String>,
    #[serde(skip)]
    pub last_otp: Option<String>,
    pub last_login: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}
