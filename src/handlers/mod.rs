pub mod email_validation;
pub mod health;
pub mod login;
pub mod password_reset;
pub mod two_factor;

pub use email_validation::{request_email_validation, validate_email_token};
pub use health::health_check;
pub use login::login;
pub use password_reset::{request_password_reset, reset_password};
pub use two_factor::{
    confirm_2fa, disable_2fa, enroll_2fa, regenerate_backup_codes, setup_2fa, status_2fa,
    validate_2fa,
};
