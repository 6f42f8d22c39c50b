//! 2FAフローの結合テスト
//!
//! PostgreSQL が必要なため `#[ignore]` 付き。実行方法:
//! `DATABASE_URL=postgres://... cargo test -- --ignored`

use axum::{Json, extract::State};
use secrecy::SecretBox;
use sqlx::PgPool;
use totp_rs::{Algorithm, TOTP};
use uuid::Uuid;

use cinegate::config::Config;
use cinegate::error::AppError;
use cinegate::handlers::two_factor::{
    RegenerateBackupCodesRequest, StatusRequest, regenerate_backup_codes, status_2fa,
};
use cinegate::repositories::UserRepository;
use cinegate::services::auth::hash_password;
use cinegate::services::two_factor::{
    CodeValidation, Disable, EnrollmentConfirm, EnrollmentStart, EnrollmentToken,
};
use cinegate::services::{
    ActionTokenService, BackupCodeService, KeyCache, RetentionDays, SecretStore, TotpService,
    TwoFactorService,
};
use cinegate::state::AppState;

const BACKUP_COUNT: usize = 10;

async fn insert_user(pool: &PgPool) -> Uuid {
    sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO users (name, email, active)
        VALUES ($1, $2, true)
        RETURNING id
        "#,
    )
    .bind("テストユーザー")
    .bind("test@example.com")
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn insert_user_with_password(pool: &PgPool, password: &str) -> Uuid {
    let password_hash = hash_password(password).unwrap();
    sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO users (name, email, password_hash, active)
        VALUES ($1, $2, $3, true)
        RETURNING id
        "#,
    )
    .bind("テストユーザー")
    .bind("test@example.com")
    .bind(password_hash)
    .fetch_one(pool)
    .await
    .unwrap()
}

fn secret(value: &str) -> SecretBox<String> {
    SecretBox::new(Box::new(value.to_string()))
}

/// ハンドラー呼び出し用の AppState を構築
fn test_state(pool: PgPool) -> AppState {
    let config = Config {
        database_url: secret("unused"),
        host: "127.0.0.1".to_string(),
        port: 3000,
        secret_key: secret("test-secret-key"),
        two_fa_token_ttl_secs: 90,
        encryption_key: secret("test-master-key"),
        encryption_salt: secret("test-salt"),
        totp_issuer: "Cinegate".to_string(),
        backup_code_count: 10,
        backup_code_retention_days: 30,
        purge_interval_secs: 86_400,
    };

    AppState::new(pool, config).unwrap()
}

fn two_factor_service(pool: PgPool, retention: RetentionDays) -> TwoFactorService {
    let user_repo = UserRepository::new(pool.clone());
    let backup_codes = BackupCodeService::new(pool.clone(), retention);
    let totp = TotpService::new("Cinegate".to_string()).unwrap();
    let secret_store =
        SecretStore::new("test-master-key", "test-salt", KeyCache::new()).unwrap();
    let tokens = ActionTokenService::new("test-secret-key").unwrap();

    TwoFactorService::new(pool, user_repo, backup_codes, totp, secret_store, tokens, 90)
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// 指定時刻のTOTPコードを生成（認証アプリ側のシミュレーション）
fn totp_code(secret_b32: &str, time: u64) -> String {
    let secret = data_encoding::BASE32.decode(secret_b32.as_bytes()).unwrap();
    let totp = TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        secret,
        Some("Cinegate".to_string()),
        "test@example.com".to_string(),
    )
    .unwrap();
    totp.generate(time)
}

/// 有効化フロー一式を実行し、(仮シークレット, 確定時コード, バックアップコード) を返す
async fn enroll(
    service: &TwoFactorService,
    user_repo: &UserRepository,
    user_id: Uuid,
) -> (String, String, Vec<String>) {
    let user = user_repo.find_by_id(user_id).await.unwrap().unwrap();

    let EnrollmentStart::Started { token } = service.begin_enrollment(&user).await.unwrap() else {
        panic!("有効化フローが開始されるべき");
    };

    let EnrollmentToken::Enabling {
        tentative_secret, ..
    } = service.validate_enrollment_token(&user, Some(&token))
    else {
        panic!("発行直後のトークンは有効なはず");
    };

    let code = totp_code(&tentative_secret, unix_now());
    let EnrollmentConfirm::Enabled { backup_codes } = service
        .confirm_enrollment(&user, &tentative_secret, &code, BACKUP_COUNT)
        .await
        .unwrap()
    else {
        panic!("正しいコードで有効化されるべき");
    };

    (tentative_secret, code, backup_codes)
}

#[sqlx::test]
#[ignore]
async fn enrollment_flow_enables_2fa(pool: PgPool) {
    let user_id = insert_user(&pool).await;
    let user_repo = UserRepository::new(pool.clone());
    let service = two_factor_service(pool, RetentionDays::OneMonth);

    let (_, code, backup_codes) = enroll(&service, &user_repo, user_id).await;
    assert_eq!(backup_codes.len(), BACKUP_COUNT);

    let user = user_repo.find_by_id(user_id).await.unwrap().unwrap();
    assert!(user.uses_2fa);
    assert!(user.otp_secret_encrypted.is_some());
    // 確定に使ったコードはリプレイマーカーとして記録済み
    assert_eq!(user.last_otp.as_deref(), Some(code.as_str()));
}

#[sqlx::test]
#[ignore]
async fn accepted_code_cannot_be_replayed(pool: PgPool) {
    let user_id = insert_user(&pool).await;
    let user_repo = UserRepository::new(pool.clone());
    let service = two_factor_service(pool, RetentionDays::OneMonth);

    let (secret, code, _) = enroll(&service, &user_repo, user_id).await;

    let user = user_repo.find_by_id(user_id).await.unwrap().unwrap();
    // 確定時に受理した値そのものは、時間ウィンドウ内でも拒否される
    assert!(matches!(
        service.validate_code(&user, &code).await.unwrap(),
        CodeValidation::Reused
    ));

    // 1ステップ前のコードはスキュー許容内なら受理される
    let prev_code = totp_code(&secret, unix_now() - 30);
    if prev_code != code {
        assert!(matches!(
            service.validate_code(&user, &prev_code).await.unwrap(),
            CodeValidation::ValidatedByTotp { .. }
        ));
    }
}

#[sqlx::test]
#[ignore]
async fn backup_code_is_single_use(pool: PgPool) {
    let user_id = insert_user(&pool).await;
    let backup_codes = BackupCodeService::new(pool, RetentionDays::OneMonth);

    let codes = backup_codes.generate(user_id, 5).await.unwrap();
    assert_eq!(codes.len(), 5);

    assert!(backup_codes.consume(user_id, &codes[0]).await.unwrap());
    // 同じコードの二度目は失敗
    assert!(!backup_codes.consume(user_id, &codes[0]).await.unwrap());
    assert_eq!(backup_codes.remaining_count(user_id).await.unwrap(), 4);
}

#[sqlx::test]
#[ignore]
async fn regenerate_invalidates_previous_batch(pool: PgPool) {
    let user_id = insert_user(&pool).await;
    let backup_codes = BackupCodeService::new(pool, RetentionDays::OneMonth);

    let old_codes = backup_codes.generate(user_id, 5).await.unwrap();
    let new_codes = backup_codes.generate(user_id, 5).await.unwrap();

    // 旧バッチは全滅、新バッチのみ有効
    assert!(!backup_codes.consume(user_id, &old_codes[0]).await.unwrap());
    assert!(backup_codes.consume(user_id, &new_codes[0]).await.unwrap());
    assert_eq!(backup_codes.remaining_count(user_id).await.unwrap(), 4);
}

#[sqlx::test]
#[ignore]
async fn purge_respects_retention_period(pool: PgPool) {
    let user_id = insert_user(&pool).await;

    // 保持期間0日: 使用直後から削除対象
    let immediate = BackupCodeService::new(pool.clone(), RetentionDays::Zero);
    let codes = immediate.generate(user_id, 3).await.unwrap();
    assert!(immediate.consume(user_id, &codes[0]).await.unwrap());

    let deleted = immediate.purge_expired().await.unwrap();
    assert_eq!(deleted, 1);
    // 未使用コードは削除対象外
    assert_eq!(immediate.remaining_count(user_id).await.unwrap(), 2);

    // 保持期間30日: 使用済みでもまだ削除されない
    let monthly = BackupCodeService::new(pool, RetentionDays::OneMonth);
    let codes = monthly.generate(user_id, 3).await.unwrap();
    assert!(monthly.consume(user_id, &codes[0]).await.unwrap());
    assert_eq!(monthly.purge_expired().await.unwrap(), 0);
}

#[sqlx::test]
#[ignore]
async fn disable_clears_two_factor_state(pool: PgPool) {
    let user_id = insert_user(&pool).await;
    let user_repo = UserRepository::new(pool.clone());
    let service = two_factor_service(pool.clone(), RetentionDays::OneMonth);

    enroll(&service, &user_repo, user_id).await;

    let user = user_repo.find_by_id(user_id).await.unwrap().unwrap();
    assert!(matches!(
        service.disable(&user).await.unwrap(),
        Disable::Disabled
    ));

    let user = user_repo.find_by_id(user_id).await.unwrap().unwrap();
    assert!(!user.uses_2fa);
    assert!(user.otp_secret_encrypted.is_none());
    assert!(user.last_otp.is_none());

    let backup_codes = BackupCodeService::new(pool, RetentionDays::OneMonth);
    assert_eq!(backup_codes.remaining_count(user_id).await.unwrap(), 0);
}

#[sqlx::test]
#[ignore]
async fn concurrent_consume_accepts_only_one(pool: PgPool) {
    let user_id = insert_user(&pool).await;
    let backup_codes = BackupCodeService::new(pool, RetentionDays::OneMonth);
    let codes = backup_codes.generate(user_id, 5).await.unwrap();

    // 同一コードを2つのリクエストが同時に提出する良性レース。
    // 条件付きUPDATEにより成功はちょうど1件に収まる
    let (first, second) = tokio::join!(
        backup_codes.consume(user_id, &codes[0]),
        backup_codes.consume(user_id, &codes[0]),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(first ^ second, "並行消費はちょうど1件だけ成功するはず");
    assert_eq!(backup_codes.remaining_count(user_id).await.unwrap(), 4);
}

#[sqlx::test]
#[ignore]
async fn status_requires_current_code_when_enabled(pool: PgPool) {
    let user_id = insert_user_with_password(&pool, "password123").await;
    let state = test_state(pool.clone());
    let user_repo = UserRepository::new(pool);

    // 未有効ユーザーはコード不要（開示されるシークレットがない）
    let response = status_2fa(
        State(state.clone()),
        Json(StatusRequest {
            user_id,
            password: "password123".to_string(),
            code: None,
        }),
    )
    .await
    .unwrap();
    assert!(!response.0.enabled);
    assert!(response.0.secret_formatted.is_none());

    let (totp_secret, confirm_code, _) =
        enroll(&state.two_factor_service, &user_repo, user_id).await;

    // 有効化後はパスワードのみではシークレットを開示しない
    let err = status_2fa(
        State(state.clone()),
        Json(StatusRequest {
            user_id,
            password: "password123".to_string(),
            code: None,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // 受理済みの値の再提出も拒否
    let err = status_2fa(
        State(state.clone()),
        Json(StatusRequest {
            user_id,
            password: "password123".to_string(),
            code: Some(confirm_code.clone()),
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::TwoFactorInvalidCode));

    // 有効なコードを提示すればシークレットを開示
    let prev_code = totp_code(&totp_secret, unix_now() - 30);
    if prev_code != confirm_code {
        let response = status_2fa(
            State(state),
            Json(StatusRequest {
                user_id,
                password: "password123".to_string(),
                code: Some(prev_code),
            }),
        )
        .await
        .unwrap();
        assert!(response.0.enabled);
        assert!(response.0.secret_formatted.is_some());
    }
}

#[sqlx::test]
#[ignore]
async fn regenerate_requires_current_code(pool: PgPool) {
    let user_id = insert_user_with_password(&pool, "password123").await;
    let state = test_state(pool.clone());
    let user_repo = UserRepository::new(pool.clone());

    let (totp_secret, confirm_code, old_codes) =
        enroll(&state.two_factor_service, &user_repo, user_id).await;

    // パスワード＋不正コードでは再発行できない
    let err = regenerate_backup_codes(
        State(state.clone()),
        Json(RegenerateBackupCodesRequest {
            user_id,
            password: "password123".to_string(),
            code: "Xq7Pw2".to_string(),
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::TwoFactorInvalidCode));

    // 有効なコードを提示すれば再発行され、旧バッチは失効する
    let prev_code = totp_code(&totp_secret, unix_now() - 30);
    if prev_code != confirm_code {
        let response = regenerate_backup_codes(
            State(state),
            Json(RegenerateBackupCodesRequest {
                user_id,
                password: "password123".to_string(),
                code: prev_code,
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.0.backup_codes.len(), BACKUP_COUNT);

        let backup_codes = BackupCodeService::new(pool, RetentionDays::OneMonth);
        assert!(!backup_codes.consume(user_id, &old_codes[0]).await.unwrap());
        assert!(
            backup_codes
                .consume(user_id, &response.0.backup_codes[0])
                .await
                .unwrap()
        );
    }
}

#[sqlx::test]
#[ignore]
async fn validate_code_rejects_unknown_code(pool: PgPool) {
    let user_id = insert_user(&pool).await;
    let user_repo = UserRepository::new(pool.clone());
    let service = two_factor_service(pool, RetentionDays::OneMonth);

    enroll(&service, &user_repo, user_id).await;

    let user = user_repo.find_by_id(user_id).await.unwrap().unwrap();
    // TOTPでもバックアップコードでもない値
    assert!(matches!(
        service.validate_code(&user, "zzzzzz").await.unwrap(),
        CodeValidation::InvalidCode
    ));
}
