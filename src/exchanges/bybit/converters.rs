use crate::core::types::{
    Balance, Instrument, MarketKind, OrderAck, OrderRequest, OrderSide, OrderType, TimeInForce,
};
use crate::exchanges::bybit::types::{BybitInstrument, BybitOrder, BybitWallet};
use rust_decimal::Decimal;
use serde_json::{Map, Value};

pub const fn category(market: MarketKind) -> &'static str {
    match market {
        MarketKind::Spot => "spot",
        MarketKind::Perpetual => "linear",
    }
}

pub const fn side(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "Buy",
        OrderSide::Sell => "Sell",
    }
}

pub const fn order_type(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "Market",
        OrderType::Limit => "Limit",
    }
}

pub const fn time_in_force(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::GTC => "GTC",
        TimeInForce::IOC => "IOC",
        TimeInForce::FOK => "FOK",
    }
}

/// `/v5/order/create` body. Absent fields are omitted rather than sent as null.
pub fn order_body(market: MarketKind, order: &OrderRequest) -> Value {
    let mut body = Map::new();
    body.insert("category".into(), category(market).into());
    body.insert("symbol".into(), order.symbol.to_uppercase().into());
    body.insert("side".into(), side(order.side).into());
    body.insert("orderType".into(), order_type(order.order_type).into());
    body.insert("qty".into(), order.quantity.normalize().to_string().into());
    if let Some(price) = order.price {
        body.insert("price".into(), price.normalize().to_string().into());
    }
    if order.order_type == OrderType::Limit {
        let tif = order.time_in_force.unwrap_or(TimeInForce::GTC);
        body.insert("timeInForce".into(), time_in_force(tif).into());
    }
    if let Some(id) = &order.client_order_id {
        body.insert("orderLinkId".into(), id.clone().into());
    }
    Value::Object(body)
}

/// Orders of a `result.list`. `status` stands in where an entry has no `orderStatus`.
pub fn orders(list: Vec<Value>, symbol: &str, status: &str) -> Result<Vec<OrderAck>, serde_json::Error> {
    list.into_iter()
        .map(|raw| {
            let order: BybitOrder = serde_json::from_value(raw.clone())?;
            Ok(OrderAck {
                order_id: order.order_id,
                client_order_id: order.order_link_id.filter(|id| !id.is_empty()),
                symbol: order.symbol.unwrap_or_else(|| symbol.to_uppercase()),
                status: order.order_status.unwrap_or_else(|| status.to_string()),
                raw,
            })
        })
        .collect()
}

/// Flatten every wallet in the response; `free` is whatever is not locked.
pub fn balances(wallets: Vec<BybitWallet>) -> Vec<Balance> {
    wallets
        .into_iter()
        .flat_map(|wallet| wallet.coin)
        .filter(|coin| !coin.wallet_balance.is_zero())
        .map(|coin| Balance {
            asset: coin.coin,
            free: (coin.wallet_balance - coin.locked).max(Decimal::ZERO),
            locked: coin.locked,
        })
        .collect()
}

pub fn instrument(info: BybitInstrument) -> Instrument {
    Instrument {
        trading: info.status == "Trading",
        symbol: info.symbol,
        base_asset: info.base_coin,
        quote_asset: info.quote_coin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_order_body_omits_price() {
        let order = OrderRequest::market("btcusdt", OrderSide::Sell, Decimal::ONE)
            .client_order_id("link-1");
        let body = order_body(MarketKind::Perpetual, &order);
        assert_eq!(body["category"], "linear");
        assert_eq!(body["symbol"], "BTCUSDT");
        assert_eq!(body["qty"], "1");
        assert_eq!(body["orderLinkId"], "link-1");
        assert!(body.get("price").is_none());
        assert!(body.get("timeInForce").is_none());
    }

    #[test]
    fn test_cancel_all_entries_take_fallback_status() {
        let list = vec![
            serde_json::json!({"orderId": "a1", "orderLinkId": ""}),
            serde_json::json!({"orderId": "a2", "orderLinkId": "link-2", "symbol": "ETHUSDT", "orderStatus": "PartiallyFilled"}),
        ];
        let acks = orders(list, "btcusdt", "Cancelled").unwrap();
        assert_eq!(acks[0].symbol, "BTCUSDT");
        assert_eq!(acks[0].status, "Cancelled");
        assert_eq!(acks[0].client_order_id, None);
        assert_eq!(acks[1].symbol, "ETHUSDT");
        assert_eq!(acks[1].status, "PartiallyFilled");
        assert_eq!(acks[1].client_order_id.as_deref(), Some("link-2"));
    }
}
