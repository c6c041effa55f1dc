pub mod logging;
pub mod sanitization;

pub use logging::{init_logging, LoggingConfig};
pub use sanitization::{
    sanitize_invoice, sanitize_payment_hash, sanitize_preimage, sanitize_receive_key,
    sanitize_secret, SanitizationConfig, SensitiveData, SensitiveDataType,
};
