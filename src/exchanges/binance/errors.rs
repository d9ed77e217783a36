use crate::core::errors::{ErrorKind, NormalizedError};
use crate::core::kernel::rest::{status_error, ErrorClassifier};
use serde_json::Value;

/// Binance `{"code": -1121, "msg": "..."}` envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinanceErrors;

/// Documented Binance error codes and their normalized kind.
pub const ERROR_CODES: &[(i64, ErrorKind)] = &[
    // 10xx: server or network issues
    (-1000, ErrorKind::Network),
    (-1001, ErrorKind::Network),
    (-1002, ErrorKind::Auth),
    (-1003, ErrorKind::RateLimit),
    (-1006, ErrorKind::Network),
    (-1007, ErrorKind::Network),
    (-1008, ErrorKind::Network),
    (-1013, ErrorKind::InvalidParam),
    (-1014, ErrorKind::InvalidParam),
    (-1015, ErrorKind::RateLimit),
    (-1016, ErrorKind::Network),
    (-1020, ErrorKind::InvalidParam),
    (-1021, ErrorKind::Auth),
    (-1022, ErrorKind::Auth),
    // 11xx: request issues
    (-1100, ErrorKind::InvalidParam),
    (-1101, ErrorKind::InvalidParam),
    (-1102, ErrorKind::InvalidParam),
    (-1103, ErrorKind::InvalidParam),
    (-1104, ErrorKind::InvalidParam),
    (-1105, ErrorKind::InvalidParam),
    (-1106, ErrorKind::InvalidParam),
    (-1111, ErrorKind::InvalidParam),
    (-1112, ErrorKind::InvalidParam),
    (-1114, ErrorKind::InvalidParam),
    (-1115, ErrorKind::InvalidParam),
    (-1116, ErrorKind::InvalidParam),
    (-1117, ErrorKind::InvalidParam),
    (-1121, ErrorKind::InvalidParam),
    (-1125, ErrorKind::InvalidParam),
    (-1127, ErrorKind::InvalidParam),
    (-1128, ErrorKind::InvalidParam),
    (-1130, ErrorKind::InvalidParam),
    // 20xx: processing issues
    (-2010, ErrorKind::ExchangeRejected),
    (-2011, ErrorKind::ExchangeRejected),
    (-2013, ErrorKind::ExchangeRejected),
    (-2014, ErrorKind::Auth),
    (-2015, ErrorKind::Auth),
    (-2018, ErrorKind::ExchangeRejected),
    (-2019, ErrorKind::ExchangeRejected),
    (-2021, ErrorKind::ExchangeRejected),
    (-2022, ErrorKind::ExchangeRejected),
    (-4164, ErrorKind::ExchangeRejected),
];

/// Table lookup, then the 11xx block (malformed requests) for undocumented codes.
pub fn kind_for_code(code: i64) -> Option<ErrorKind> {
    ERROR_CODES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, kind)| *kind)
        .or_else(|| (-1199..=-1100).contains(&code).then_some(ErrorKind::InvalidParam))
}

impl ErrorClassifier for BinanceErrors {
    fn classify(&self, status: u16, body: &Value) -> Option<NormalizedError> {
        let code = body.get("code")?.as_i64()?;
        // futures acknowledges some writes with `{"code": 200, "msg": ...}`
        if code == 200 && (200..300).contains(&status) {
            return None;
        }
        let message = body
            .get("msg")
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_bodies_are_not_errors() {
        assert!(BinanceErrors.classify(200, &json!({"orderId": 1})).is_none());
        assert!(BinanceErrors.classify(200, &json!([])).is_none());
        assert!(BinanceErrors
            .classify(200, &json!({"code": 200, "msg": "The operation of cancel all open order is done."}))
            .is_none());
    }

    #[test]
    fn test_unmapped_code_keeps_raw_payload() {
        let err = BinanceErrors
            .classify(200, &json!({"code": -9999, "msg": "mystery"}))
            .unwrap();
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert_eq!(err.raw_code.as_deref(), Some("-9999"));
        assert_eq!(err.raw_message, "mystery");
    }

    #[test]
    fn test_undocumented_request_code_is_invalid_param() {
        assert_eq!(kind_for_code(-1199), Some(ErrorKind::InvalidParam));
        assert_eq!(kind_for_code(-1099), None);
    }

    #[test]
    fn test_unmapped_code_uses_status() {
        let err = BinanceErrors
            .classify(503, &json!({"code": -9999, "msg": "busy"}))
            .unwrap();
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(err.retryable);
    }
}
