pub mod backup_code;
pub mod user;

pub use backup_code::BackupCodeRepository;
pub use user::UserRepository;
