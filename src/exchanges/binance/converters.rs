use crate::core::types::{
    Balance, Instrument, OrderAck, OrderRequest, OrderSide, OrderType, RequestSpec, TimeInForce,
};
use crate::exchanges::binance::types::{
    BinanceAccountInfo, BinanceFuturesAccount, BinanceMarket, BinanceOrderResponse,
};
use rust_decimal::Decimal;
use serde_json::Value;

pub const fn side(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

pub const fn order_type(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
    }
}

pub const fn time_in_force(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::GTC => "GTC",
        TimeInForce::IOC => "IOC",
        TimeInForce::FOK => "FOK",
    }
}

/// Decimals go on the wire without trailing zeros.
pub fn decimal(value: Decimal) -> String {
    value.normalize().to_string()
}

/// Order parameters in the order Binance documents them.
pub fn order_params(spec: RequestSpec, order: &OrderRequest) -> RequestSpec {
    let tif = match order.order_type {
        OrderType::Limit => Some(time_in_force(order.time_in_force.unwrap_or(TimeInForce::GTC))),
        OrderType::Market => None,
    };
    spec.query("symbol", order.symbol.as_str())
        .query("side", side(order.side))
        .query("type", order_type(order.order_type))
        .query_opt("timeInForce", tif)
        .query("quantity", decimal(order.quantity))
        .query_opt("price", order.price.map(decimal))
        .query_opt("newClientOrderId", order.client_order_id.as_deref())
}

/// Spot balances, skipping empty assets.
pub fn spot_balances(account: BinanceAccountInfo) -> Vec<Balance> {
    account
        .balances
        .into_iter()
        .filter(|b| !b.free.is_zero() || !b.locked.is_zero())
        .map(|b| Balance {
            asset: b.asset,
            free: b.free,
            locked: b.locked,
        })
        .collect()
}

/// Futures wallet balances. Whatever is not available is reported as locked.
pub fn futures_balances(account: BinanceFuturesAccount) -> Vec<Balance> {
    account
        .assets
        .into_iter()
        .filter(|a| !a.wallet_balance.is_zero())
        .map(|a| Balance {
            asset: a.asset,
            free: a.available_balance,
            locked: (a.wallet_balance - a.available_balance).max(Decimal::ZERO),
        })
        .collect()
}

pub fn order_ack(response: BinanceOrderResponse, raw: Value) -> OrderAck {
    OrderAck {
        order_id: response.order_id.to_string(),
        client_order_id: response.orig_client_order_id.or(response.client_order_id),
        symbol: response.symbol,
        status: response.status.unwrap_or_else(|| "NEW".to_string()),
        raw,
    }
}

/// Orders in a list response. Order-list (OCO) summaries are skipped, and a body
/// that is not a list (futures cancel-all) holds no orders.
pub fn order_acks(raw: Value) -> Result<Vec<OrderAck>, serde_json::Error> {
    let Value::Array(items) = raw else {
        return Ok(Vec::new());
    };
    items
        .into_iter()
        .filter(|item| item.get("orderId").is_some())
        .map(|item| {
            let response: BinanceOrderResponse = serde_json::from_value(item.clone())?;
            Ok(order_ack(response, item))
        })
        .collect()
}

pub fn instrument(market: BinanceMarket) -> Instrument {
    Instrument {
        trading: market.status == "TRADING",
        symbol: market.symbol,
        base_asset: market.base_asset,
        quote_asset: market.quote_asset,
    }
}
