pub mod auth;
pub mod backup_code;
pub mod secret_store;
pub mod token;
pub mod totp;
pub mod two_factor;

pub use auth::AuthService;
pub use backup_code::{BackupCodeService, RetentionDays};
pub use secret_store::{KeyCache, SecretStore};
pub use token::{ActionTokenService, TokenAction, TokenClaims, TokenError};
pub use totp::TotpService;
pub use two_factor::TwoFactorService;
