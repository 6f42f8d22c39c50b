pub mod backup_code;
pub mod user;

pub use backup_code::BackupCode;
pub use user::User;
