use secrecy::SecretBox;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub database_url: SecretBox<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    // アクショントークン設定
    /// トークン署名キー（HMAC-SHA256）
    ///
    /// ローテーションすると発行済みトークンは全て無効になる（運用上許容）
    pub secret_key: SecretBox<String>,
    /// 2FA継続トークンのTTL（秒）
    ///
    /// 同一ブラウジングセッション内で消費される前提のため短寿命
    #[serde(default = "default_two_fa_token_ttl_secs")]
    pub two_fa_token_ttl_secs: i64,

    // シークレット保管（フィールド暗号化）設定
    /// フィールド暗号化のマスターキー
    pub encryption_key: SecretBox<String>,
    /// 鍵導出に使うソルト
    pub encryption_salt: SecretBox<String>,

    // 2FA (TOTP) 設定
    /// TOTP発行者名（認証アプリに表示される）
    pub totp_issuer: String,

    // バックアップコード設定
    /// 2FA有効化時に生成するバックアップコード数
    #[serde(default = "default_backup_code_count")]
    pub backup_code_count: usize,
    /// 使用済みコードを物理削除するまでの保持日数
    ///
    /// 0/7/14/21/30/60/90/180/365 のいずれかのみ有効
    #[serde(default = "default_backup_code_retention_days")]
    pub backup_code_retention_days: u32,
    /// 期限切れコード掃除タスクの実行間隔（秒）
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_TWO_FA_TOKEN_TTL_SECS: i64 = 90;
const DEFAULT_BACKUP_CODE_COUNT: usize = 10;
const DEFAULT_BACKUP_CODE_RETENTION_DAYS: u32 = 30;
const DEFAULT_PURGE_INTERVAL_SECS: u64 = 86_400;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_two_fa_token_ttl_secs() -> i64 {
    DEFAULT_TWO_FA_TOKEN_TTL_SECS
}

fn default_backup_code_count() -> usize {
    DEFAULT_BACKUP_CODE_COUNT
}

fn default_backup_code_retention_days() -> u32 {
    DEFAULT_BACKUP_CODE_RETENTION_DAYS
}

fn default_purge_interval_secs() -> u64 {
    DEFAULT_PURGE_INTERVAL_SECS
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        envy::from_env()
    }
}
