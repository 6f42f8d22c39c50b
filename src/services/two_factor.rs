use serde_json::{Value, json};
use sqlx::PgPool;
use subtle::ConstantTimeEq;

use crate::error::AppError;
use crate::models::User;
use crate::repositories::UserRepository;
use crate::services::backup_code::BackupCodeService;
use crate::services::secret_store::SecretStore;
use crate::services::token::{ActionTokenService, TokenAction};
use crate::services::totp::TotpService;

/// 一度に保持できるバックアップコードの上限
pub const MAX_BACKUP_CODES: usize = 20;
/// 残量警告を出す閾値
const LOW_BACKUP_THRESHOLD: i64 = 2;

// 有効化トークンの extra_data キー
const EXTRA_TENTATIVE_SECRET: &str = "tentative_secret";
const EXTRA_QR_CODE: &str = "qr_code_base64";

/// 有効化フロー開始の結果
#[derive(Debug)]
pub enum EnrollmentStart {
    AlreadyEnabled,
    /// 仮シークレットとQRコードを内包したアクショントークン。
    /// 仮シークレットはこの時点ではDBに書かれず、トークンの中にのみ存在する
    Started { token: String },
}

/// 有効化トークン検証の結果
#[derive(Debug)]
pub enum EnrollmentToken {
    Missing,
    Invalid,
    WrongUser,
    /// 有効化フォームの再表示に必要なデータ
    Enabling {
        tentative_secret: String,
        qr_code_base64: String,
    },
}

/// 有効化確定の結果
#[derive(Debug)]
pub enum EnrollmentConfirm {
    AlreadyEnabled,
    InvalidCode,
    /// 平文バックアップコードはここで一度だけ返る。以後再取得は不可能
    Enabled { backup_codes: Vec<String> },
}

/// ログイン時のコード検証の結果
#[derive(Debug)]
pub enum CodeValidation {
    NotEnabled,
    /// 直前に受理したTOTP値の再提出。有効ウィンドウ内でも拒否する
    Reused,
    InvalidCode,
    ValidatedByTotp {
        remaining_backup_codes: i64,
        warnings: Vec<String>,
    },
    ValidatedByBackup {
        remaining_backup_codes: i64,
        warnings: Vec<String>,
    },
}

/// 無効化の結果
#[derive(Debug)]
pub enum Disable {
    NotEnabled,
    Disabled,
}

/// 2FAの現在状態（プロファイル画面用）
#[derive(Debug)]
pub struct TwoFactorStatus {
    pub enabled: bool,
    pub remaining_backup_codes: Option<i64>,
    /// 4文字区切りで整形したシークレット（手入力用）
    pub secret_formatted: Option<String>,
}

/// 二要素認証の状態機械
///
/// 有効化（シークレット生成 → トークン発行 → TOTP検証 → 永続化＋バックアップコード発行）、
/// ログイン時検証（リプレイ拒否 → TOTP → バックアップコード）、無効化を編成する。
/// 各操作の結果は閉じたenumで返し、呼び出し側に網羅的な分岐を強制する。
#[derive(Clone)]
pub struct TwoFactorService {
    pool: PgPool,
    user_repo: UserRepository,
    backup_codes: BackupCodeService,
    totp: TotpService,
    secret_store: SecretStore,
    tokens: ActionTokenService,
    token_ttl_secs: i64,
}

impl TwoFactorService {
    pub fn new(
        pool: PgPool,
        user_repo: UserRepository,
        backup_codes: BackupCodeService,
        totp: TotpService,
        secret_store: SecretStore,
        tokens: ActionTokenService,
        token_ttl_secs: i64,
    ) -> Self {
        Self {
            pool,
            user_repo,
            backup_codes,
            totp,
            secret_store,
            tokens,
            token_ttl_secs,
        }
    }

    /// 有効化フローを開始
    ///
    /// 新しいシークレットとQRコードを生成し、`activating_2fa` アクションの
    /// トークンに封入して返す。シークレットはトークンが確定されるまで
    /// サーバー側には一切保存しない（未確定シークレット漏洩の影響範囲を
    /// トークンのTTLに限定する）。
    pub async fn begin_enrollment(&self, user: &User) -> Result<EnrollmentStart, AppError> {
        if user.uses_2fa {
            return Ok(EnrollmentStart::AlreadyEnabled);
        }

        let secret = TotpService::generate_secret();
        let qr_code = self.totp.generate_qr_code(&user.email, &secret)?;

        let token = self.tokens.issue(
            TokenAction::Activating2fa,
            &user.id.to_string(),
            self.token_ttl_secs,
            Some(json!({
                EXTRA_TENTATIVE_SECRET: secret,
                EXTRA_QR_CODE: qr_code,
            })),
        )?;

        tracing::info!(user_id = %user.id, "2FA有効化フロー開始");

        Ok(EnrollmentStart::Started { token })
    }

    /// 有効化トークンを検証し、フォーム再表示に必要なデータを取り出す
    pub fn validate_enrollment_token(
        &self,
        user: &User,
        token: Option<&str>,
    ) -> EnrollmentToken {
        let Some(token) = token else {
            tracing::warn!(user_id = %user.id, "2FA有効化トークンなし");
            return EnrollmentToken::Missing;
        };

        let claims = match self.tokens.verify_for_action(token, TokenAction::Activating2fa) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::warn!(user_id = %user.id, reason = e.reason(), "2FA有効化トークン検証失敗");
                return EnrollmentToken::Invalid;
            }
        };

        let extra = claims.extra_data.unwrap_or(Value::Null);
        let (Some(tentative_secret), Some(qr_code_base64)) = (
            extra.get(EXTRA_TENTATIVE_SECRET).and_then(Value::as_str),
            extra.get(EXTRA_QR_CODE).and_then(Value::as_str),
        ) else {
            tracing::warn!(user_id = %user.id, "2FA有効化トークンのペイロード欠落");
            return EnrollmentToken::Invalid;
        };

        if claims.subject != user.id.to_string() {
            tracing::warn!(user_id = %user.id, "2FA有効化トークンのsubject不一致");
            return EnrollmentToken::WrongUser;
        }

        EnrollmentToken::Enabling {
            tentative_secret: tentative_secret.to_string(),
            qr_code_base64: qr_code_base64.to_string(),
        }
    }

    /// 有効化を確定
    ///
    /// 仮シークレットに対するTOTPコードを検証し、成功時のみ
    /// 「2FAフラグON＋暗号化シークレット永続化＋リプレイマーカー設定＋
    /// バックアップコード発行」を単一トランザクションで適用する。
    /// コード不一致時は一切の状態変更を行わない。
    pub async fn confirm_enrollment(
        &self,
        user: &User,
        tentative_secret: &str,
        submitted_code: &str,
        backup_count: usize,
    ) -> Result<EnrollmentConfirm, AppError> {
        if user.uses_2fa {
            return Ok(EnrollmentConfirm::AlreadyEnabled);
        }

        if !self.totp.verify_code(tentative_secret, submitted_code)? {
            return Ok(EnrollmentConfirm::InvalidCode);
        }

        let backup_count = backup_count.min(MAX_BACKUP_CODES);
        let encrypted_secret = self.secret_store.encrypt(tentative_secret)?;

        // 失敗時はトランザクション全体がロールバックされる
        // （フラグだけ立ってコードがない、という部分適用を残さない）
        let mut tx = self.pool.begin().await?;
        self.user_repo
            .enable_2fa(&mut tx, user.id, &encrypted_secret, submitted_code)
            .await?;
        let backup_codes = self
            .backup_codes
            .generate_in_tx(&mut tx, user.id, backup_count)
            .await?;
        tx.commit().await?;

        tracing::info!(user_id = %user.id, backup_codes = backup_codes.len(), "2FA有効化完了");

        Ok(EnrollmentConfirm::Enabled { backup_codes })
    }

    /// ログイン時のコード検証
    ///
    /// 処理順: リプレイ拒否 → TOTP（±1ステップ） → バックアップコード。
    /// 直前に受理したTOTP値と同一のコードは、TOTPの有効ウィンドウ内であっても
    /// 拒否する（標準より厳しい意図的な仕様）。
    pub async fn validate_code(
        &self,
        user: &User,
        submitted_code: &str,
    ) -> Result<CodeValidation, AppError> {
        let Some(encrypted_secret) = user
            .otp_secret_encrypted
            .as_deref()
            .filter(|_| user.uses_2fa)
        else {
            return Ok(CodeValidation::NotEnabled);
        };

        if let Some(last_otp) = &user.last_otp
            && constant_time_eq(last_otp, submitted_code)
        {
            tracing::warn!(user_id = %user.id, "TOTPコードの再使用を拒否");
            return Ok(CodeValidation::Reused);
        }

        // 復号失敗はデータ整合性エラーとしてそのまま伝播（「2FA無効」扱いにしない）
        let secret = self.secret_store.decrypt(encrypted_secret)?;

        if self.totp.verify_code(&secret, submitted_code)? {
            self.user_repo.set_last_otp(user.id, submitted_code).await?;

            let remaining = self.backup_codes.remaining_count(user.id).await?;
            let mut warnings = Vec::new();
            if remaining <= LOW_BACKUP_THRESHOLD {
                warnings.push(format!(
                    "残りのバックアップコードが少なくなっています（残り{remaining}件）"
                ));
            }

            tracing::info!(user_id = %user.id, method = "totp", "2FAコード検証成功");

            return Ok(CodeValidation::ValidatedByTotp {
                remaining_backup_codes: remaining,
                warnings,
            });
        }

        if self.backup_codes.consume(user.id, submitted_code).await? {
            let remaining = self.backup_codes.remaining_count(user.id).await?;
            let mut warnings = vec!["バックアップコードを使用しました".to_string()];
            if remaining == 0 {
                warnings.push("重大: 残りのバックアップコードがありません".to_string());
            } else if remaining <= LOW_BACKUP_THRESHOLD {
                warnings.push(format!(
                    "注意: 残りのバックアップコードは{remaining}件です"
                ));
            }

            tracing::info!(user_id = %user.id, method = "backup", "2FAコード検証成功");

            return Ok(CodeValidation::ValidatedByBackup {
                remaining_backup_codes: remaining,
                warnings,
            });
        }

        Ok(CodeValidation::InvalidCode)
    }

    /// 2FAを無効化
    ///
    /// ユーザー行のクリア（フラグ・シークレット・リプレイマーカー）を先にコミットし、
    /// その後にバックアップコードを無効化する。この順序なら途中でクラッシュしても
    /// 「2FA無効＋残存コード」に倒れ、残存コードは掃除タスクが回収する
    pub async fn disable(&self, user: &User) -> Result<Disable, AppError> {
        if !user.uses_2fa {
            return Ok(Disable::NotEnabled);
        }

        self.user_repo.disable_2fa(user.id).await?;
        let invalidated = self.backup_codes.invalidate_all(user.id).await?;

        tracing::warn!(user_id = %user.id, invalidated, "2FA無効化完了");

        Ok(Disable::Disabled)
    }

    /// バックアップコードを再発行（2FA有効ユーザーのみ）
    pub async fn regenerate_backup_codes(
        &self,
        user: &User,
        count: usize,
    ) -> Result<Option<Vec<String>>, AppError> {
        if !user.uses_2fa {
            return Ok(None);
        }

        let codes = self
            .backup_codes
            .generate(user.id, count.min(MAX_BACKUP_CODES))
            .await?;

        Ok(Some(codes))
    }

    /// 現在の2FA状態を取得
    pub async fn status(&self, user: &User) -> Result<TwoFactorStatus, AppError> {
        if !user.uses_2fa {
            return Ok(TwoFactorStatus {
                enabled: false,
                remaining_backup_codes: None,
                secret_formatted: None,
            });
        }

        let remaining = self.backup_codes.remaining_count(user.id).await?;
        let secret_formatted = match &user.otp_secret_encrypted {
            Some(encrypted) => Some(TotpService::format_secret(
                &self.secret_store.decrypt(encrypted)?,
            )),
            None => None,
        };

        Ok(TwoFactorStatus {
            enabled: true,
            remaining_backup_codes: Some(remaining),
            secret_formatted,
        })
    }
}

/// 定数時間の文字列比較（リプレイマーカー照合用）
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
