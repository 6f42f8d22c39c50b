use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, OsRng},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// PBKDF2-HMAC-SHA256 の反復回数
const PBKDF2_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;

/// 導出済み暗号化鍵のプロセス全域キャッシュ
///
/// 鍵導出は高コストのため、(マスターキー, ソルト) の組ごとにプロセス内で
/// 一度だけ実行する。起動時に一つ構築し、SecretStore に注入して共有する。
/// Mutexで保護されているため、同一組に対する初回導出が並行しても導出は一度に潰れる。
#[derive(Clone, Default)]
pub struct KeyCache {
    inner: Arc<Mutex<HashMap<String, [u8; 32]>>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_derive(&self, fingerprint: &str, derive: impl FnOnce() -> [u8; 32]) -> [u8; 32] {
        // ロック汚染時もキャッシュ済みデータ自体は有効
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *cache
            .entry(fingerprint.to_string())
            .or_insert_with(derive)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// シークレット保管サービス（フィールド単位の認証付き暗号化）
///
/// TOTPシードをDBに保存する前に暗号化し、読み出し時に復号する。
///
/// # Security
/// - 鍵はマスターキーとソルトから PBKDF2-HMAC-SHA256 で導出
/// - 暗号化は AES-256-GCM（96ビットランダムnonce）
/// - 復号失敗はデータ破損または鍵ローテーション不整合であり、
///   「シークレット不在」扱いにしてはならない
#[derive(Clone)]
pub struct SecretStore {
    master_key: String,
    salt: String,
    cache: KeyCache,
}

impl SecretStore {
    /// 新しい SecretStore を作成
    ///
    /// # Errors
    /// マスターキーまたはソルトが未設定なら `AppError::Configuration`
    pub fn new(master_key: &str, salt: &str, cache: KeyCache) -> Result<Self, AppError> {
        if master_key.is_empty() {
            return Err(AppError::Configuration(
                "encryption_key が設定されていません".to_string(),
            ));
        }
        if salt.is_empty() {
            return Err(AppError::Configuration(
                "encryption_salt が設定されていません".to_string(),
            ));
        }

        Ok(Self {
            master_key: master_key.to_string(),
            salt: salt.to_string(),
            cache,
        })
    }

    /// (マスターキー, ソルト) の組を識別するフィンガープリント
    ///
    /// キャッシュのキーにのみ使用する。鍵素材そのものをキーにしない
    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.master_key.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.salt.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn derived_key(&self) -> [u8; 32] {
        self.cache.get_or_derive(&self.fingerprint(), || {
            let mut key = [0u8; 32];
            pbkdf2_hmac::<Sha256>(
                self.master_key.as_bytes(),
                self.salt.as_bytes(),
                PBKDF2_ITERATIONS,
                &mut key,
            );
            key
        })
    }

    /// 平文をAES-256-GCMで暗号化
    ///
    /// # Returns
    /// base64url（パディングなし）エンコードされた nonce + 暗号文
    pub fn encrypt(&self, plaintext: &str) -> Result<String, AppError> {
        let key = self.derived_key();
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            AppError::Internal(anyhow::anyhow!("cipher initialization error"))
        })?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, plaintext.as_bytes()).map_err(|e| {
            tracing::error!(error = ?e, "シークレット暗号化エラー");
            AppError::Internal(anyhow::anyhow!("encryption error"))
        })?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(combined))
    }

    /// 暗号文を復号
    ///
    /// # Errors
    /// 不正なbase64・改ざん・切り詰めは全て `AppError::Decryption`。
    /// 呼び出し側はこれを握り潰さず、読み出し操作の失敗として伝播させること
    pub fn decrypt(&self, encrypted: &str) -> Result<String, AppError> {
        let combined = URL_SAFE_NO_PAD.decode(encrypted).map_err(|e| {
            tracing::error!(error = ?e, "暗号文のBase64デコード失敗");
            AppError::Decryption
        })?;

        if combined.len() <= NONCE_LEN {
            tracing::error!(len = combined.len(), "暗号化データが短すぎる");
            return Err(AppError::Decryption);
        }

        let key = self.derived_key();
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            AppError::Internal(anyhow::anyhow!("cipher initialization error"))
        })?;

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|e| {
            tracing::error!(error = ?e, "シークレット復号エラー");
            AppError::Decryption
        })?;

        String::from_utf8(plaintext).map_err(|e| {
            tracing::error!(error = ?e, "復号データのUTF-8変換エラー");
            AppError::Decryption
        })
    }
}
