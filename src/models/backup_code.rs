use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// 2FAバックアップコード
///
/// コード自体はargon2idハッシュとして保存（code_hash）。平文は生成時に一度だけ
/// ユーザーに表示し、DBには保存しない。
///
/// ライフサイクル:
/// - `used = false` の間のみ消費可能
/// - 消費・無効化時に `used = true` となり `scheduled_deletion_at` が設定される
/// - `scheduled_deletion_at` を過ぎた行は掃除タスクが物理削除する
#[derive(Debug, FromRow, Serialize)]
pub struct BackupCode {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip)]
    pub code_hash: String,
    pub used: bool,
    pub used_at: Option<OffsetDateTime>,
    pub scheduled_deletion_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}
