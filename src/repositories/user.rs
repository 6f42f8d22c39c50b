use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::User;

#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// メールアドレスでユーザーを検索
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, password_hash, active, uses_2fa,
                   otp_secret_encrypted, last_otp, last_login, created_at, updated_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    /// ユーザーIDでユーザーを検索
    pub async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, password_hash, active, uses_2fa,
                   otp_secret_encrypted, last_otp, last_login, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// ユーザーのパスワードを更新
    ///
    /// # Note
    /// password_hash はログに出力しないこと
    pub async fn update_password(
        &self,
        user_id: Uuid,
        new_password_hash: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET password_hash = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(new_password_hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// メール検証完了としてユーザーを有効化
    pub async fn activate(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET active = true, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// ログイン完了時刻を記録
    pub async fn touch_last_login(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET last_login = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 直近に受理したTOTP値を更新（リプレイ拒否マーカー）
    pub async fn set_last_otp(&self, user_id: Uuid, code: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET last_otp = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(code)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 2FAを有効化（確定シークレットの永続化）
    ///
    /// バックアップコード生成と同一トランザクションで実行するため、
    /// トランザクションを引数に取る
    pub async fn enable_2fa(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        otp_secret_encrypted: &str,
        last_otp: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET uses_2fa = true, otp_secret_encrypted = $2, last_otp = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(otp_secret_encrypted)
        .bind(last_otp)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// 2FAを無効化
    ///
    /// # Note
    /// バックアップコードの無効化より先にコミットすること。途中でクラッシュしても
    /// 「2FA無効＋残存コード」の状態に倒れ、残存コードは掃除タスクが回収する。
    /// 逆順は「2FA無効に見えるのに使えるコードが残る」状態を作るため不可。
    pub async fn disable_2fa(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET uses_2fa = false, otp_secret_encrypted = NULL, last_otp = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
