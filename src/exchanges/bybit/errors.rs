use crate::core::errors::{ErrorKind, NormalizedError};
use crate::core::kernel::rest::{status_error, ErrorClassifier};
use serde_json::Value;

/// Bybit V5 `{"retCode": 0, "retMsg": "OK", "result": {...}}` envelopes.
///
/// A non-zero `retCode` is an error even when the HTTP status is 200.
#[derive(Debug, Clone, Copy, Default)]
pub struct BybitErrors;

/// Documented V5 `retCode` values and their normalized kind.
pub const ERROR_CODES: &[(i64, ErrorKind)] = &[
    (10000, ErrorKind::Network),
    (10001, ErrorKind::InvalidParam),
    // Timestamp outside the recv window.
    (10002, ErrorKind::Auth),
    (10003, ErrorKind::Auth),
    (10004, ErrorKind::Auth),
    (10005, ErrorKind::Auth),
    (10006, ErrorKind::RateLimit),
    (10007, ErrorKind::Auth),
    (10009, ErrorKind::Auth),
    (10010, ErrorKind::Auth),
    (10016, ErrorKind::Network),
    (10017, ErrorKind::InvalidParam),
    (10018, ErrorKind::RateLimit),
    (33004, ErrorKind::Auth),
    (110001, ErrorKind::ExchangeRejected),
    (110003, ErrorKind::InvalidParam),
    (110004, ErrorKind::ExchangeRejected),
    (110007, ErrorKind::ExchangeRejected),
    (110012, ErrorKind::ExchangeRejected),
    (110017, ErrorKind::ExchangeRejected),
    (170001, ErrorKind::InvalidParam),
    (170130, ErrorKind::ExchangeRejected),
    (170131, ErrorKind::ExchangeRejected),
];

pub fn kind_for_code(code: i64) -> Option<ErrorKind> {
    ERROR_CODES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, kind)| *kind)
}

impl ErrorClassifier for BybitErrors {
    fn classify(&self, status: u16, body: &Value) -> Option<NormalizedError> {
        let code = body.get("retCode")?.as_i64()?;
        if code == 0 {
            return None;
        }
        let message = body
            .get("retMsg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let raw_code = Some(code.to_string());

        Some(match kind_for_code(code) {
            Some(kind) => NormalizedError::new(kind, raw_code, message),
            None if (200..300).contains(&status) => NormalizedError::unknown(raw_code, message),
            None => status_error(status, raw_code, message),
        })
    }
}
