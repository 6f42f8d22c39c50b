use data_encoding::BASE32;
use rand::RngCore;
use totp_rs::{Algorithm, TOTP};

use crate::error::AppError;

/// TOTP (Time-based One-Time Password) サービス
///
/// # Security
/// - シークレット平文はログに出力しない
/// - シークレットの保存時暗号化は SecretStore が担当する
#[derive(Clone)]
pub struct TotpService {
    issuer: String,
}

impl TotpService {
    /// 新しい TotpService を作成
    ///
    /// # Arguments
    /// * `issuer` - TOTP発行者名（アプリ名）。otpauth URIの制約上 ':' は不可
    pub fn new(issuer: String) -> Result<Self, AppError> {
        if issuer.is_empty() || issuer.contains(':') {
            return Err(AppError::Configuration(
                "totp_issuer が未設定、または ':' を含んでいます".to_string(),
            ));
        }

        Ok(Self { issuer })
    }

    /// 20バイトのランダムシークレットを生成し、Base32でエンコード
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        BASE32.encode(&bytes)
    }

    /// プロビジョニングURIを構築
    ///
    /// 一般的な認証アプリが読める標準形式:
    /// `otpauth://totp/{issuer}:{account}?secret={base32}&issuer={issuer}`
    pub fn provisioning_uri(&self, account: &str, secret: &str) -> String {
        let issuer = urlencoding::encode(&self.issuer);
        let account = urlencoding::encode(account);
        format!("otpauth://totp/{issuer}:{account}?secret={secret}&issuer={issuer}")
    }

    /// QRコードを生成（PNG形式、Base64エンコード）
    ///
    /// # Arguments
    /// * `account` - アカウント識別子（ユーザーのメールアドレス）
    /// * `secret` - Base32エンコードされたシークレット
    pub fn generate_qr_code(&self, account: &str, secret: &str) -> Result<String, AppError> {
        let totp = self.create_totp(account, secret)?;

        let qr_code = totp.get_qr_base64().map_err(|e| {
            tracing::error!(error = %e, "QRコード生成エラー");
            AppError::Internal(anyhow::anyhow!("qr code generation error"))
        })?;

        Ok(qr_code)
    }

    /// TOTPコードを検証
    ///
    /// # Note
    /// 前後1ステップの時間ウィンドウを許容（±30秒、時計ずれ対策）
    pub fn verify_code(&self, secret: &str, code: &str) -> Result<bool, AppError> {
        // 入力検証: コードは6桁の数字のみ
        if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
            return Ok(false);
        }

        let totp = self.create_totp_for_verify(secret)?;

        let current_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| {
                tracing::error!(error = ?e, "システム時刻取得エラー");
                AppError::Internal(anyhow::anyhow!("system time error"))
            })?
            .as_secs();

        // check は内部で skew を考慮して検証
        Ok(totp.check(code, current_time))
    }

    /// シークレットを4文字区切りで整形（プロファイル画面での手入力用）
    pub fn format_secret(secret: &str) -> String {
        secret
            .as_bytes()
            .chunks(4)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// TOTP オブジェクトを作成（QRコード生成用）
    fn create_totp(&self, account: &str, secret: &str) -> Result<TOTP, AppError> {
        let secret_bytes = BASE32.decode(secret.as_bytes()).map_err(|e| {
            tracing::error!(error = ?e, "シークレットのBase32デコードエラー");
            AppError::Internal(anyhow::anyhow!("invalid base32 secret"))
        })?;

        TOTP::new(
            Algorithm::SHA1,
            6,  // 6桁
            1,  // skew: 前後1ステップ許容
            30, // period: 30秒
            secret_bytes,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| {
            tracing::error!(error = %e, "TOTP作成エラー");
            AppError::Internal(anyhow::anyhow!("totp creation error"))
        })
    }

    /// TOTP オブジェクトを作成（検証用）
    fn create_totp_for_verify(&self, secret: &str) -> Result<TOTP, AppError> {
        let secret_bytes = BASE32.decode(secret.as_bytes()).map_err(|e| {
            tracing::error!(error = ?e, "シークレットのBase32デコードエラー");
            AppError::Internal(anyhow::anyhow!("invalid base32 secret"))
        })?;

        TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret_bytes,
            None,
            String::new(),
        )
        .map_err(|e| {
            tracing::error!(error = %e, "TOTP作成エラー");
            AppError::Internal(anyhow::anyhow!("totp creation error"))
        })
    }
}
