use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::AppError;

/// アクショントークンが許可する次のアクション
///
/// トークンはアクション単位でスコープされる。あるフロー用に発行されたトークンを
/// 別フローの検証器に渡しても、署名が正しくても拒否される
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenAction {
    NoAction,
    ValidateEmail,
    ResetPassword,
    Pending2fa,
    Activating2fa,
}

impl TokenAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoAction => "no_action",
            Self::ValidateEmail => "validate_email",
            Self::ResetPassword => "reset_password",
            Self::Pending2fa => "pending2fa",
            Self::Activating2fa => "activating2fa",
        }
    }
}

/// トークン検証の失敗理由
///
/// ログ・テレメトリ用の区別であり、ユーザー向けの応答では全て
/// 「フローをやり直してください」に集約すること
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("トークンの有効期限が切れています")]
    Expired,
    #[error("トークンの署名が不正です")]
    BadSignature,
    #[error("トークンが不正または必須クレームが欠落しています")]
    Malformed,
    #[error("トークンのアクションが一致しません")]
    ActionMismatch,
}

impl TokenError {
    /// 構造化ログ用の理由タグ
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::BadSignature => "bad_signature",
            Self::Malformed => "malformed",
            Self::ActionMismatch => "action_mismatch",
        }
    }
}

/// ワイヤ形式のクレーム {sub, iat, nbf, exp?, action, extra_data?}
#[derive(Debug, Serialize, Deserialize)]
struct ClaimsWire {
    sub: String,
    iat: i64,
    nbf: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
    action: TokenAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra_data: Option<Value>,
}

/// 検証済みトークンのクレーム
#[derive(Debug)]
pub struct TokenClaims {
    pub subject: String,
    pub action: TokenAction,
    /// 発行からの経過秒数（now - iat）
    pub age: i64,
    pub extra_data: Option<Value>,
}

/// アクショントークンサービス
///
/// サーバー側セッションを持たずにリクエスト間で部分認証状態を運ぶための、
/// アクションスコープ付き短寿命署名トークン（HS256）を発行・検証する。
///
/// # Security
/// - トークンは有効期間中ベアラー相当の秘密として扱う
/// - ユーザーに見えるレベルでログ出力しないこと（debugのみ可）
#[derive(Clone)]
pub struct ActionTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl ActionTokenService {
    pub fn new(secret_key: &str) -> Result<Self, AppError> {
        if secret_key.is_empty() {
            return Err(AppError::Configuration(
                "secret_key が設定されていません".to_string(),
            ));
        }

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret_key.as_bytes()),
        })
    }

    /// トークンを発行
    ///
    /// # Arguments
    /// * `ttl_secs` - 有効期間（秒）。0以下なら exp クレームを付けない（= 無期限）
    /// * `extra_data` - 任意の構造化ペイロード
    pub fn issue(
        &self,
        action: TokenAction,
        subject: &str,
        ttl_secs: i64,
        extra_data: Option<Value>,
    ) -> Result<String, AppError> {
        if subject.is_empty() {
            // subjectを文字列化できないのは呼び出し側の誤り（トークンの欠陥ではない）
            return Err(AppError::Validation(
                "トークンの subject が空です".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = ClaimsWire {
            sub: subject.to_string(),
            iat: now,
            nbf: now,
            exp: (ttl_secs > 0).then(|| now + ttl_secs),
            action,
            extra_data,
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| {
            tracing::error!(error = ?e, "トークン署名エラー");
            AppError::Internal(anyhow::anyhow!("token signing error"))
        })
    }

    /// トークンを検証し、クレームを返す
    ///
    /// 失敗理由（期限切れ・署名不正・不正形式）はログ用に区別されるが、
    /// 呼び出し側はユーザーに対して同一の応答を返すこと
    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_nbf = true;
        // exp は任意（無期限トークンを許容）、sub は必須
        validation.set_required_spec_claims(&["sub"]);

        let data = decode::<ClaimsWire>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::BadSignature,
                _ => TokenError::Malformed,
            }
        })?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        Ok(TokenClaims {
            subject: data.claims.sub,
            action: data.claims.action,
            age: now - data.claims.iat,
            extra_data: data.claims.extra_data,
        })
    }

    /// 特定アクション向けとしてトークンを検証
    ///
    /// 署名が正しくてもアクションが一致しなければ拒否する（フロー間リプレイ防止）
    pub fn verify_for_action(
        &self,
        token: &str,
        expected: TokenAction,
    ) -> Result<TokenClaims, TokenError> {
        let claims = self.verify(token)?;
        if claims.action != expected {
            return Err(TokenError::ActionMismatch);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_service() -> ActionTokenService {
        ActionTokenService::new("test-secret-key").unwrap()
    }

    #[test]
    fn test_issue_verify_roundtrip() {
        let service = create_test_service();

        let token = service
            .issue(
                TokenAction::Pending2fa,
                "user-123",
                600,
                Some(json!({"remember_me": true})),
            )
            .unwrap();

        let claims = service.verify(&token).unwrap();
        assert_eq!(claims.subject, "user-123");
        assert_eq!(claims.action, TokenAction::Pending2fa);
        assert!(claims.age >= 0);
        assert_eq!(
            claims.extra_data.unwrap().get("remember_me"),
            Some(&json!(true))
        );
    }

    #[test]
    fn test_no_expiry_token() {
        // ttl <= 0 は無期限（expクレームなし）
        let service = create_test_service();
        let token = service
            .issue(TokenAction::ValidateEmail, "user@example.com", 0, None)
            .unwrap();

        let claims = service.verify(&token).unwrap();
        assert_eq!(claims.subject, "user@example.com");
        assert_eq!(claims.action, TokenAction::ValidateEmail);
    }

    #[test]
    fn test_expired_token() {
        let service = create_test_service();

        // 過去のexpを持つクレームを直接組み立てて署名
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = ClaimsWire {
            sub: "user-123".to_string(),
            iat: now - 120,
            nbf: now - 120,
            exp: Some(now - 60),
            action: TokenAction::Pending2fa,
            extra_data: None,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret-key"),
        )
        .unwrap();

        assert_eq!(service.verify(&token).unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn test_bad_signature() {
        let service = create_test_service();
        let other = ActionTokenService::new("other-secret-key").unwrap();

        let token = other
            .issue(TokenAction::Pending2fa, "user-123", 600, None)
            .unwrap();

        assert_eq!(service.verify(&token).unwrap_err(), TokenError::BadSignature);
    }

    #[test]
    fn test_malformed_token() {
        let service = create_test_service();
        assert_eq!(service.verify("not-a-token").unwrap_err(), TokenError::Malformed);
        assert_eq!(service.verify("").unwrap_err(), TokenError::Malformed);
    }

    #[test]
    fn test_action_scope_enforced() {
        // アクションAのトークンはアクションBの検証器に拒否される
        let service = create_test_service();
        let token = service
            .issue(TokenAction::ResetPassword, "user@example.com", 600, None)
            .unwrap();

        assert!(service.verify(&token).is_ok());
        assert_eq!(
            service
                .verify_for_action(&token, TokenAction::Pending2fa)
                .unwrap_err(),
            TokenError::ActionMismatch
        );
        assert!(
            service
                .verify_for_action(&token, TokenAction::ResetPassword)
                .is_ok()
        );
    }

    #[test]
    fn test_empty_subject_rejected() {
        let service = create_test_service();
        let result = service.issue(TokenAction::NoAction, "", 600, None);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_empty_secret_key() {
        assert!(matches!(
            ActionTokenService::new(""),
            Err(AppError::Configuration(_))
        ));
    }
}
