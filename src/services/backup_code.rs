use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand::Rng;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::AppError;
use crate::repositories::BackupCodeRepository;

/// 視覚的に紛らわしい文字（0/O、1/l/I）を除いたコード用文字セット
pub const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghjkmnpqrstuvwxyz23456789";
/// バックアップコードの固定長
pub const CODE_LENGTH: usize = 6;

/// 使用済みコードを物理削除するまでの保持期間（固定の選択肢のみ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionDays {
    Zero,
    OneWeek,
    TwoWeeks,
    ThreeWeeks,
    OneMonth,
    TwoMonths,
    ThreeMonths,
    SixMonths,
    OneYear,
}

impl RetentionDays {
    pub fn days(self) -> i64 {
        match self {
            Self::Zero => 0,
            Self::OneWeek => 7,
            Self::TwoWeeks => 14,
            Self::ThreeWeeks => 21,
            Self::OneMonth => 30,
            Self::TwoMonths => 60,
            Self::ThreeMonths => 90,
            Self::SixMonths => 180,
            Self::OneYear => 365,
        }
    }

    /// 設定値（日数）から変換。固定の選択肢以外は None
    pub fn try_from_days(days: u32) -> Option<Self> {
        match days {
            0 => Some(Self::Zero),
            7 => Some(Self::OneWeek),
            14 => Some(Self::TwoWeeks),
            21 => Some(Self::ThreeWeeks),
            30 => Some(Self::OneMonth),
            60 => Some(Self::TwoMonths),
            90 => Some(Self::ThreeMonths),
            180 => Some(Self::SixMonths),
            365 => Some(Self::OneYear),
            _ => None,
        }
    }
}

impl Default for RetentionDays {
    fn default() -> Self {
        Self::OneMonth
    }
}

/// バックアップコード管理サービス
///
/// # Security
/// - 平文コードは生成時に一度だけ返し、DBにはargon2idハッシュのみ保存
/// - 照合はargon2の検証（定数時間相当のハッシュ比較）で行う
/// - コードの平文はログに出力しない
#[derive(Clone)]
pub struct BackupCodeService {
    pool: PgPool,
    repo: BackupCodeRepository,
    retention: RetentionDays,
}

impl BackupCodeService {
    pub fn new(pool: PgPool, retention: RetentionDays) -> Self {
        Self {
            repo: BackupCodeRepository::new(pool.clone()),
            pool,
            retention,
        }
    }

    /// 新しいコードをバッチ生成
    ///
    /// 既存の未使用コードは先に無効化（削除ではない）するため、
    /// ユーザーが複数の有効バッチを同時に持つことはない。
    /// 全処理は単一トランザクション（途中失敗時は部分バッチを残さない）。
    ///
    /// # Returns
    /// 平文コードのリスト（表示用。再取得は不可能）
    pub async fn generate(&self, user_id: Uuid, count: usize) -> Result<Vec<String>, AppError> {
        let mut tx = self.pool.begin().await?;
        let codes = self.generate_in_tx(&mut tx, user_id, count).await?;
        tx.commit().await?;

        tracing::info!(user_id = %user_id, count = codes.len(), "バックアップコード生成完了");

        Ok(codes)
    }

    /// トランザクション内でのバッチ生成
    ///
    /// 2FA有効化（シークレット永続化と同一トランザクション必須）から使う
    pub async fn generate_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        count: usize,
    ) -> Result<Vec<String>, AppError> {
        let deletion_at = self.deletion_horizon();
        self.repo.invalidate_unused(tx, user_id, deletion_at).await?;

        let mut plaintexts = Vec::with_capacity(count);
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            let code = Self::random_code();
            hashes.push(Self::hash_code(&code)?);
            plaintexts.push(code);
        }

        self.repo.insert_batch(tx, user_id, &hashes).await?;

        Ok(plaintexts)
    }

    /// コードを検証して消費
    ///
    /// 未使用コードのハッシュ全件と照合し、最初に一致したものを使用済みにする。
    /// バッチ上限が20件のため線形スキャンで十分。
    ///
    /// # Returns
    /// 一致して消費できた場合のみ true。並行消費で負けた側は false
    pub async fn consume(&self, user_id: Uuid, submitted_code: &str) -> Result<bool, AppError> {
        let codes = self.repo.find_unused(user_id).await?;

        for backup_code in &codes {
            if Self::verify_hash(submitted_code, &backup_code.code_hash)? {
                let updated = self
                    .repo
                    .mark_used(backup_code.id, self.deletion_horizon())
                    .await?;
                if updated == 0 {
                    // 別リクエストが先に消費した（許容されるレース）
                    tracing::warn!(user_id = %user_id, "バックアップコードの並行消費を検出");
                    return Ok(false);
                }

                tracing::info!(user_id = %user_id, "バックアップコード消費");
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// 未使用コード数を返す（残量警告の判定用）
    pub async fn remaining_count(&self, user_id: Uuid) -> Result<i64, AppError> {
        Ok(self.repo.count_unused(user_id).await?)
    }

    /// ユーザーの未使用コードを全て無効化
    ///
    /// # Returns
    /// 無効化した件数
    pub async fn invalidate_all(&self, user_id: Uuid) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await?;
        let count = self
            .repo
            .invalidate_unused(&mut tx, user_id, self.deletion_horizon())
            .await?;
        tx.commit().await?;

        Ok(count)
    }

    /// 物理削除予定日を過ぎたコードを削除
    ///
    /// 定期タスクから呼ばれる。冪等で、使用済み行しか触らないため
    /// ユーザー操作と並行実行しても安全
    pub async fn purge_expired(&self) -> Result<u64, AppError> {
        let count = self.repo.delete_expired().await?;
        if count > 0 {
            tracing::info!(count, "期限切れバックアップコードを削除");
        }

        Ok(count)
    }

    fn deletion_horizon(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc() + Duration::days(self.retention.days())
    }

    /// 固定長のランダムコードを生成
    fn random_code() -> String {
        let mut rng = rand::thread_rng();
        (0..CODE_LENGTH)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect()
    }

    /// コードをargon2idでハッシュ化
    fn hash_code(code: &str) -> Result<String, AppError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(code.as_bytes(), &salt)
            .map_err(|e| {
                tracing::error!(error = ?e, "バックアップコードのハッシュ生成エラー");
                AppError::Internal(anyhow::anyhow!("backup code hash error"))
            })?;

        Ok(hash.to_string())
    }

    /// コードを保存済みハッシュと照合
    fn verify_hash(code: &str, hash: &str) -> Result<bool, AppError> {
        let parsed_hash = PasswordHash::new(hash).map_err(|e| {
            tracing::error!(error = ?e, "バックアップコードハッシュのパースエラー");
            AppError::Internal(anyhow::anyhow!("backup code hash parse error"))
        })?;

        Ok(Argon2::default()
            .verify_password(code.as_bytes(), &parsed_hash)
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_code_charset_and_length() {
        for _ in 0..50 {
            let code = BackupCodeService::random_code();
            assert_eq!(code.len(), CODE_LENGTH);
            assert!(code.bytes().all(|b| CHARSET.contains(&b)));
            // 紛らわしい文字は含まれない
            assert!(!code.contains(['0', 'O', '1', 'l', 'I']));
        }
    }

    #[test]
    fn test_hash_and_verify() {
        let code = BackupCodeService::random_code();
        let hash = BackupCodeService::hash_code(&code).unwrap();

        assert_ne!(hash, code);
        assert!(BackupCodeService::verify_hash(&code, &hash).unwrap());
        assert!(!BackupCodeService::verify_hash("XXXXXX", &hash).unwrap());
    }

    #[test]
    fn test_verify_invalid_hash_format() {
        let result = BackupCodeService::verify_hash("abc234", "invalid_hash_format");
        assert!(result.is_err());
    }

    #[test]
    fn test_retention_days_mapping() {
        assert_eq!(RetentionDays::try_from_days(0), Some(RetentionDays::Zero));
        assert_eq!(
            RetentionDays::try_from_days(30),
            Some(RetentionDays::OneMonth)
        );
        assert_eq!(
            RetentionDays::try_from_days(365),
            Some(RetentionDays::OneYear)
        );
        assert_eq!(RetentionDays::try_from_days(31), None);
        assert_eq!(RetentionDays::try_from_days(100), None);

        assert_eq!(RetentionDays::default().days(), 30);
    }
}
