use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    // Local validation
    InvalidAmount,
    InvalidExpiry,
    InvalidIndex,
    InvalidDescription,
    InvalidInvoice,
    InvalidTransition,

    // Selection and lookup
    NoGatewayAvailable,
    NotFound,

    // Federation errors
    UnreachableFederation,

    // Bounded waits
    Timeout,

    // Terminal payment/receive failure converted into an error by a caller
    OperationFailed,

    // System errors
    InternalError,
}

impl ErrorCategory {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidAmount => "INVALID_AMOUNT",
            Self::InvalidExpiry => "INVALID_EXPIRY",
            Self::InvalidIndex => "INVALID_INDEX",
            Self::InvalidDescription => "INVALID_DESCRIPTION",
            Self::InvalidInvoice => "INVALID_INVOICE",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::NoGatewayAvailable => "NO_GATEWAY_AVAILABLE",
            Self::NotFound => "NOT_FOUND",
            Self::UnreachableFederation => "UNREACHABLE_FEDERATION",
            Self::Timeout => "TIMEOUT",
            Self::OperationFailed => "OPERATION_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Errors caused by the caller's input, rejected before any work is done
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAmount
                | Self::InvalidExpiry
                | Self::InvalidIndex
                | Self::InvalidDescription
                | Self::InvalidInvoice
                | Self::NotFound
        )
    }

    /// Whether calling the same operation again may succeed. The engine itself
    /// never retries; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UnreachableFederation | Self::Timeout | Self::NoGatewayAvailable
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_codes() {
        assert_eq!(ErrorCategory::InvalidAmount.error_code(), "INVALID_AMOUNT");
        assert_eq!(
            ErrorCategory::NoGatewayAvailable.error_code(),
            "NO_GATEWAY_AVAILABLE"
        );
        assert_eq!(
            ErrorCategory::UnreachableFederation.error_code(),
            "UNREACHABLE_FEDERATION"
        );
        assert_eq!(ErrorCategory::Timeout.error_code(), "TIMEOUT");
    }

    #[test]
    fn test_client_vs_retryable_errors() {
        assert!(ErrorCategory::InvalidExpiry.is_client_error());
        assert!(ErrorCategory::InvalidDescription.is_client_error());
        assert!(!ErrorCategory::InvalidDescription.is_retryable());
        assert!(!ErrorCategory::InvalidExpiry.is_retryable());

        assert!(ErrorCategory::UnreachableFederation.is_retryable());
        assert!(!ErrorCategory::UnreachableFederation.is_client_error());

        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(!ErrorCategory::InternalError.is_retryable());
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(format!("{}", ErrorCategory::InvalidIndex), "INVALID_INDEX");
        assert_eq!(
            format!("{}", ErrorCategory::InternalError),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_error_category_serde() {
        let json = serde_json::to_string(&ErrorCategory::NoGatewayAvailable).unwrap();
        assert_eq!(json, "\"no_gateway_available\"");
    }
}
