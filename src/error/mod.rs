use std::fmt;

use tracing::{error, warn};

pub mod categories;

pub use categories::ErrorCategory;

#[cfg(test)]
#[path = "tests.rs"]
mod tests;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug)]
pub struct EngineError {
    pub category: ErrorCategory,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EngineError {
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors for common error types
    pub fn invalid_amount(message: impl Into<String>) -> Self {
        Self::with_category(ErrorCategory::InvalidAmount, message)
    }

    pub fn invalid_expiry(message: impl Into<String>) -> Self {
        Self::with_category(ErrorCategory::InvalidExpiry, message)
    }

    pub fn invalid_index(message: impl Into<String>) -> Self {
        Self::with_category(ErrorCategory::InvalidIndex, message)
    }

    pub fn invalid_description(message: impl Into<String>) -> Self {
        Self::with_category(ErrorCategory::InvalidDescription, message)
    }

    pub fn invalid_invoice(message: impl Into<String>) -> Self {
        Self::with_category(ErrorCategory::InvalidInvoice, message)
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::with_category(ErrorCategory::InvalidTransition, message)
    }

    pub fn no_gateway_available(message: impl Into<String>) -> Self {
        Self::with_category(ErrorCategory::NoGatewayAvailable, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_category(ErrorCategory::NotFound, message)
    }

    pub fn unreachable_federation(message: impl Into<String>) -> Self {
        Self::with_category(ErrorCategory::UnreachableFederation, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::with_category(ErrorCategory::Timeout, message)
    }

    pub fn operation_failed(reason: impl Into<String>) -> Self {
        Self::with_category(ErrorCategory::OperationFailed, reason)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::with_category(ErrorCategory::InternalError, message)
    }

    pub fn with_category(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// Log the error at a level matching its category and hand it back, for
    /// use at the engine boundary: `.map_err(EngineError::logged)`.
    pub fn logged(self) -> Self {
        if self.category.is_client_error() {
            warn!(
                category = ?self.category,
                code = self.category.error_code(),
                message = %self.message,
                details = ?self.details,
                "Rejected engine call"
            );
        } else {
            error!(
                category = ?self.category,
                code = self.category.error_code(),
                message = %self.message,
                details = ?self.details,
                source = ?self.source,
                "Engine call failed"
            );
        }
        self
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// Backend plumbing reports through anyhow; anything that reaches the boundary
// unclassified is an internal error
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal_error(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal_error(format!("JSON error: {}", err)).with_source(err)
    }
}

impl From<lightning_invoice::ParseOrSemanticError> for EngineError {
    fn from(err: lightning_invoice::ParseOrSemanticError) -> Self {
        Self::invalid_invoice(format!("Invalid bolt11 invoice: {}", err)).with_source(err)
    }
}

impl From<lightning_invoice::CreationError> for EngineError {
    fn from(err: lightning_invoice::CreationError) -> Self {
        use lightning_invoice::CreationError;

        let message = format!("Invoice creation error: {}", err);
        let error = match err {
            CreationError::InvalidAmount => Self::invalid_amount(message),
            CreationError::DescriptionTooLong => Self::invalid_description(message),
            _ => Self::internal_error(message),
        };
        error.with_source(err)
    }
}
