use std::sync::Arc;

use secrecy::ExposeSecret;
use sqlx::PgPool;

use crate::config::Config;
use crate::error::AppError;
use crate::repositories::UserRepository;
use crate::services::{
    ActionTokenService, AuthService, BackupCodeService, KeyCache, RetentionDays, SecretStore,
    TotpService, TwoFactorService,
};

/// アプリケーション共有状態
///
/// axum の State として全ハンドラーで共有される。
/// Clone は必須（axum が内部で clone するため）。
#[derive(Clone)]
pub struct AppState {
    /// PostgreSQL コネクションプール
    pub db_pool: PgPool,
    /// アプリケーション設定（Arc で共有）
    pub config: Arc<Config>,
    /// ユーザーリポジトリ
    pub user_repo: UserRepository,
    /// 第一要素認証サービス
    pub auth_service: AuthService,
    /// アクショントークンサービス
    pub token_service: ActionTokenService,
    /// バックアップコードサービス
    pub backup_code_service: BackupCodeService,
    /// 二要素認証サービス
    pub two_factor_service: TwoFactorService,
}

impl AppState {
    /// 新しい AppState を作成
    ///
    /// 設定値の構造的な検証（保持日数の許容値チェック、空キーの拒否）は
    /// ここで行い、不正な設定は起動失敗に倒す
    pub fn new(db_pool: PgPool, config: Config) -> Result<Self, AppError> {
        let config = Arc::new(config);
        let user_repo = UserRepository::new(db_pool.clone());
        let auth_service = AuthService::new(user_repo.clone());

        let token_service = ActionTokenService::new(config.secret_key.expose_secret())?;
        let totp_service = TotpService::new(config.totp_issuer.clone())?;
        let secret_store = SecretStore::new(
            config.encryption_key.expose_secret(),
            config.encryption_salt.expose_secret(),
            KeyCache::new(),
        )?;

        let retention = RetentionDays::try_from_days(config.backup_code_retention_days)
            .ok_or_else(|| {
                AppError::Configuration(format!(
                    "BACKUP_CODE_RETENTION_DAYS が不正です: {}",
                    config.backup_code_retention_days
                ))
            })?;
        let backup_code_service = BackupCodeService::new(db_pool.clone(), retention);

        let two_factor_service = TwoFactorService::new(
            db_pool.clone(),
            user_repo.clone(),
            backup_code_service.clone(),
            totp_service,
            secret_store,
            token_service.clone(),
            config.two_fa_token_ttl_secs,
        );

        Ok(Self {
            db_pool,
            config,
            user_repo,
            auth_service,
            token_service,
            backup_code_service,
            two_factor_service,
        })
    }
}
