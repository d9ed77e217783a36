use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct GateSpotBalance {
    pub currency: String,
    pub available: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateFuturesAccount {
    pub currency: String,
    pub total: Decimal,
    pub available: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateCurrencyPair {
    pub id: String,
    pub base: String,
    pub quote: String,
    pub trade_status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateContract {
    pub name: String,
    #[serde(default)]
    pub in_delisting: bool,
}
