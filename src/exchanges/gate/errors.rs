use crate::core::errors::{ErrorKind, NormalizedError};
use crate::core::kernel::rest::{status_error, ErrorClassifier};
use serde_json::Value;

/// Gate.io APIv4 `{"label": "INVALID_KEY", "message": "..."}` envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateErrors;

/// Documented APIv4 error labels and their normalized kind.
pub const ERROR_LABELS: &[(&str, ErrorKind)] = &[
    ("INVALID_KEY", ErrorKind::Auth),
    ("INVALID_SIGNATURE", ErrorKind::Auth),
    ("MISSING_REQUIRED_HEADER", ErrorKind::Auth),
    ("REQUEST_EXPIRED", ErrorKind::Auth),
    ("IP_FORBIDDEN", ErrorKind::Auth),
    ("READ_ONLY", ErrorKind::Auth),
    ("FORBIDDEN", ErrorKind::Auth),
    ("INVALID_CREDENTIALS", ErrorKind::Auth),
    ("ACCOUNT_LOCKED", ErrorKind::Auth),
    ("TOO_MANY_REQUESTS", ErrorKind::RateLimit),
    ("SERVER_ERROR", ErrorKind::Network),
    ("TOO_BUSY", ErrorKind::Network),
    ("INVALID_PARAM_VALUE", ErrorKind::InvalidParam),
    ("INVALID_PROTOCOL", ErrorKind::InvalidParam),
    ("INVALID_ARGUMENT", ErrorKind::InvalidParam),
    ("INVALID_REQUEST_BODY", ErrorKind::InvalidParam),
    ("MISSING_REQUIRED_PARAM", ErrorKind::InvalidParam),
    ("BAD_REQUEST", ErrorKind::InvalidParam),
    ("INVALID_CONTENT_TYPE", ErrorKind::InvalidParam),
    ("NOT_ACCEPTABLE", ErrorKind::InvalidParam),
    ("METHOD_NOT_ALLOWED", ErrorKind::InvalidParam),
    ("NOT_FOUND", ErrorKind::InvalidParam),
    ("INVALID_CURRENCY", ErrorKind::InvalidParam),
    ("INVALID_CURRENCY_PAIR", ErrorKind::InvalidParam),
    ("INVALID_PRECISION", ErrorKind::InvalidParam),
    ("INVALID_CONTRACT", ErrorKind::InvalidParam),
    ("INVALID_ORDER_SIZE", ErrorKind::InvalidParam),
    ("BALANCE_NOT_ENOUGH", ErrorKind::ExchangeRejected),
    ("ORDER_NOT_FOUND", ErrorKind::ExchangeRejected),
    ("ORDER_CLOSED", ErrorKind::ExchangeRejected),
    ("ORDER_CANCELLED", ErrorKind::ExchangeRejected),
    ("POC_FILL_IMMEDIATELY", ErrorKind::ExchangeRejected),
    ("INSUFFICIENT_AVAILABLE", ErrorKind::ExchangeRejected),
    ("TRADE_RESTRICTED", ErrorKind::ExchangeRejected),
    ("MARGIN_BALANCE_NOT_ENOUGH", ErrorKind::ExchangeRejected),
    ("LIQUIDATE_IMMEDIATELY", ErrorKind::ExchangeRejected),
    ("REDUCE_ONLY_FAIL", ErrorKind::ExchangeRejected),
];

pub fn kind_for_label(label: &str) -> Option<ErrorKind> {
    ERROR_LABELS
        .iter()
        .find(|(known, _)| *known == label)
        .map(|(_, kind)| *kind)
}

impl ErrorClassifier for GateErrors {
    fn classify(&self, status: u16, body: &Value) -> Option<NormalizedError> {
        let label = body.get("label")?.as_str()?;
        let message = body
            .get("message")
            .or_else(|| body.get("detail"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let raw_code = Some(label.to_string());

        Some(match kind_for_label(label) {
            Some(kind) => NormalizedError::new(kind, raw_code, message),
            None if (200..300).contains(&status) => NormalizedError::unknown(raw_code, message),
            None => status_error(status, raw_code, message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_lists_are_not_errors() {
        assert!(GateErrors.classify(200, &json!([{"currency": "BTC"}])).is_none());
    }

    #[test]
    fn test_labels() {
        let err = GateErrors
            .classify(401, &json!({"label": "INVALID_SIGNATURE", "message": "Signature mismatch"}))
            .unwrap();
        assert_eq!(err.kind, ErrorKind::Auth);
        assert_eq!(err.raw_code.as_deref(), Some("INVALID_SIGNATURE"));

        let err = GateErrors
            .classify(400, &json!({"label": "SOMETHING_NEW", "message": "?"}))
            .unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidParam);
    }
}
