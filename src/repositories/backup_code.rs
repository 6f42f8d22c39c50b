use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::BackupCode;

#[derive(Clone)]
pub struct BackupCodeRepository {
    pool: PgPool,
}

impl BackupCodeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 未使用のバックアップコードを全件取得
    ///
    /// バッチ上限が20件のため線形スキャンで問題ない
    pub async fn find_unused(&self, user_id: Uuid) -> Result<Vec<BackupCode>, sqlx::Error> {
        sqlx::query_as::<_, BackupCode>(
            r#"
            SELECT id, user_id, code_hash, used, used_at, scheduled_deletion_at, created_at
            FROM backup_codes
            WHERE user_id = $1 AND used = false
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    /// 未使用コード数をカウント
    pub async fn count_unused(&self, user_id: Uuid) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM backup_codes
            WHERE user_id = $1 AND used = false
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
    }

    /// 新しいコードのハッシュをバッチ挿入
    pub async fn insert_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        code_hashes: &[String],
    ) -> Result<(), sqlx::Error> {
        for code_hash in code_hashes {
            sqlx::query(
                r#"
                INSERT INTO backup_codes (user_id, code_hash)
                VALUES ($1, $2)
                "#,
            )
            .bind(user_id)
            .bind(code_hash)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// 1件のコードを使用済みにマークし、物理削除予定日を設定
    ///
    /// # Note
    /// `used = false` の条件付きUPDATEのため、同一コードへの並行消費は高々1件しか
    /// 成功しない（成功側のみ rows_affected = 1）
    pub async fn mark_used(
        &self,
        id: Uuid,
        scheduled_deletion_at: OffsetDateTime,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE backup_codes
            SET used = true, used_at = NOW(), scheduled_deletion_at = $2
            WHERE id = $1 AND used = false
            "#,
        )
        .bind(id)
        .bind(scheduled_deletion_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// ユーザーの未使用コードを全て無効化（削除はしない）
    pub async fn invalidate_unused(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        scheduled_deletion_at: OffsetDateTime,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE backup_codes
            SET used = true, used_at = NOW(), scheduled_deletion_at = $2
            WHERE user_id = $1 AND used = false
            "#,
        )
        .bind(user_id)
        .bind(scheduled_deletion_at)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    /// 物理削除予定日を過ぎたコードを削除
    ///
    /// # Returns
    /// 削除された行数
    ///
    /// # Note
    /// `used = true` の行しか触らないため、消費処理と並行実行しても安全
    pub async fn delete_expired(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM backup_codes
            WHERE scheduled_deletion_at IS NOT NULL AND scheduled_deletion_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
