use std::fmt;

/// Controls how much of a sensitive value survives into logs
#[derive(Clone, Debug)]
pub struct SanitizationConfig {
    pub sanitize_preimages: bool,
    pub sanitize_invoices: bool,
    /// Receive keys link invoices to the same user; redact them by default
    pub sanitize_receive_keys: bool,
    /// Characters kept at each end of a redacted value
    pub partial_show_chars: usize,
}

impl Default for SanitizationConfig {
    fn default() -> Self {
        Self {
            sanitize_preimages: true,
            sanitize_invoices: true,
            sanitize_receive_keys: true,
            partial_show_chars: 6,
        }
    }
}

/// Wrapper whose `Display` never prints the full inner value
#[derive(Clone, Debug)]
pub struct SensitiveData<T> {
    inner: T,
    data_type: SensitiveDataType,
    config: SanitizationConfig,
}

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum SensitiveDataType {
    LightningInvoice,
    PaymentPreimage,
    /// Base or tweaked receive key
    ReceiveKey,
    /// Secret key or tweak scalar
    SecretMaterial,
    PaymentHash,
}

impl SensitiveDataType {
    fn display_name(&self) -> &'static str {
        match self {
            Self::LightningInvoice => "invoice",
            Self::PaymentPreimage => "preimage",
            Self::ReceiveKey => "receive_key",
            Self::SecretMaterial => "secret",
            Self::PaymentHash => "payment_hash",
        }
    }
}

impl<T: fmt::Display> SensitiveData<T> {
    pub fn new(data: T, data_type: SensitiveDataType) -> Self {
        Self::with_config(data, data_type, SanitizationConfig::default())
    }

    pub fn with_config(data: T, data_type: SensitiveDataType, config: SanitizationConfig) -> Self {
        Self {
            inner: data,
            data_type,
            config,
        }
    }

    fn should_sanitize(&self) -> bool {
        match self.data_type {
            SensitiveDataType::LightningInvoice => self.config.sanitize_invoices,
            SensitiveDataType::PaymentPreimage => self.config.sanitize_preimages,
            SensitiveDataType::ReceiveKey => self.config.sanitize_receive_keys,
            SensitiveDataType::SecretMaterial => true,
            SensitiveDataType::PaymentHash => false,
        }
    }

    fn sanitized_repr(&self) -> String {
        let original = self.inner.to_string();
        if !self.should_sanitize() {
            return original;
        }

        let label = self.data_type.display_name().to_uppercase();
        let keep = self.config.partial_show_chars;

        // Secret material never shows any characters
        if self.data_type == SensitiveDataType::SecretMaterial || original.len() <= keep * 2 {
            return format!("[REDACTED_{}]", label);
        }

        // Bech32 and hex are ASCII, but stay on char boundaries regardless
        let chars: Vec<char> = original.chars().collect();
        let start: String = chars[..keep].iter().collect();
        let end: String = chars[chars.len() - keep..].iter().collect();
        format!(
            "{}[REDACTED_{}_{}_CHARS]{}",
            start,
            label,
            chars.len() - keep * 2,
            end
        )
    }
}

impl<T: fmt::Display> fmt::Display for SensitiveData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sanitized_repr())
    }
}

pub fn sanitize_invoice<T: fmt::Display>(invoice: T) -> SensitiveData<T> {
    SensitiveData::new(invoice, SensitiveDataType::LightningInvoice)
}

pub fn sanitize_preimage<T: fmt::Display>(preimage: T) -> SensitiveData<T> {
    SensitiveData::new(preimage, SensitiveDataType::PaymentPreimage)
}

pub fn sanitize_receive_key<T: fmt::Display>(key: T) -> SensitiveData<T> {
    SensitiveData::new(key, SensitiveDataType::ReceiveKey)
}

pub fn sanitize_secret<T: fmt::Display>(secret: T) -> SensitiveData<T> {
    SensitiveData::new(secret, SensitiveDataType::SecretMaterial)
}

pub fn sanitize_payment_hash<T: fmt::Display>(hash: T) -> SensitiveData<T> {
    SensitiveData::new(hash, SensitiveDataType::PaymentHash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_sanitization() {
        let invoice = "lnbcrt10u1pjqqqqqpp5qqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqypqdq5xysxxatsyp3k7enxv4jsxqzpu";
        let result = sanitize_invoice(invoice).to_string();

        assert!(result.starts_with("lnbcrt"));
        assert!(result.ends_with("sxqzpu"));
        assert!(result.contains("[REDACTED_INVOICE_"));
        assert!(!result.contains("qqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqf"));
    }

    #[test]
    fn test_short_preimage_is_fully_redacted() {
        assert_eq!(sanitize_preimage("abc").to_string(), "[REDACTED_PREIMAGE]");
    }

    #[test]
    fn test_secret_material_shows_nothing() {
        let config = SanitizationConfig {
            sanitize_preimages: false,
            sanitize_invoices: false,
            sanitize_receive_keys: false,
            partial_show_chars: 6,
        };
        let secret = "0909090909090909090909090909090909090909090909090909090909090909";
        let result =
            SensitiveData::with_config(secret, SensitiveDataType::SecretMaterial, config).to_string();

        assert_eq!(result, "[REDACTED_SECRET]");
    }

    #[test]
    fn test_payment_hash_is_logged_verbatim() {
        let hash = "abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";
        assert_eq!(sanitize_payment_hash(hash).to_string(), hash);
    }

    #[test]
    fn test_receive_key_keeps_prefix_for_correlation() {
        let key = "02f9308a019258c31049344f85f89d5229b531c845836f99b08601f113bce036f9";
        let result = sanitize_receive_key(key).to_string();

        assert!(result.starts_with("02f930"));
        assert!(result.contains("[REDACTED_RECEIVE_KEY_54_CHARS]"));
    }
}
