use std::str::FromStr;

use anyhow::anyhow;

use super::*;

#[test]
fn test_engine_error_constructors() {
    assert_eq!(
        EngineError::invalid_amount("zero").category,
        ErrorCategory::InvalidAmount
    );
    assert_eq!(
        EngineError::no_gateway_available("empty").category,
        ErrorCategory::NoGatewayAvailable
    );
    assert_eq!(
        EngineError::timeout("10s").category(),
        ErrorCategory::Timeout
    );
}

#[test]
fn test_engine_error_from_anyhow() {
    let error = EngineError::from(anyhow!("backend exploded"));
    assert_eq!(error.category, ErrorCategory::InternalError);
    assert!(error.message.contains("backend exploded"));
}

#[test]
fn test_engine_error_display() {
    let error = EngineError::not_found("operation abc not found");
    assert_eq!(
        format!("{}", error),
        "NOT_FOUND: operation abc not found"
    );
}

#[test]
fn test_engine_error_with_details() {
    let error = EngineError::invalid_index("negative index")
        .with_details(serde_json::json!({ "index": -1 }));
    assert_eq!(error.details.unwrap()["index"], -1);
}

#[test]
fn test_engine_error_from_invoice_parse_error() {
    let err = lightning_invoice::Bolt11Invoice::from_str("lnbc-not-an-invoice").unwrap_err();
    let error = EngineError::from(err);
    assert_eq!(error.category, ErrorCategory::InvalidInvoice);
    assert!(std::error::Error::source(&error).is_some());
}
