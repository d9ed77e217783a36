use crate::core::types::conversion::value_to_decimal;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Unified accounts report empty strings for unused balance fields.
fn lenient_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value_to_decimal(value.as_ref()))
}

/// V5 success envelope. Errors are classified before this is parsed.
#[derive(Debug, Clone, Deserialize)]
pub struct BybitResponse<T> {
    pub result: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BybitList<T> {
    pub list: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitWallet {
    pub account_type: String,
    pub coin: Vec<BybitCoinBalance>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitCoinBalance {
    pub coin: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub wallet_balance: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub locked: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitOrderResult {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: Option<String>,
}

/// Entry of `/v5/order/realtime`. Cancel-all entries carry only the ids.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitOrder {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub order_status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitInstrument {
    pub symbol: String,
    pub base_coin: String,
    pub quote_coin: String,
    pub status: String,
}
