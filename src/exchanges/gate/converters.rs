use crate::core::types::conversion::value_to_string;
use crate::core::types::{
    Balance, Instrument, OrderAck, OrderRequest, OrderSide, OrderType, TimeInForce,
};
use crate::exchanges::gate::types::{
    GateContract, GateCurrencyPair, GateFuturesAccount, GateSpotBalance,
};
use rust_decimal::Decimal;
use serde_json::{Map, Value};

/// Gate requires custom order ids to start with `t-`.
pub fn order_text(client_order_id: &str) -> String {
    if client_order_id.starts_with("t-") {
        client_order_id.to_string()
    } else {
        format!("t-{}", client_order_id)
    }
}

fn time_in_force(order: &OrderRequest) -> &'static str {
    match (order.order_type, order.time_in_force) {
        // market orders must not rest on the book
        (OrderType::Market, Some(TimeInForce::FOK)) => "fok",
        (OrderType::Market, _) => "ioc",
        (OrderType::Limit, Some(TimeInForce::IOC)) => "ioc",
        (OrderType::Limit, Some(TimeInForce::FOK)) => "fok",
        (OrderType::Limit, _) => "gtc",
    }
}

/// `POST /spot/orders` body.
pub fn spot_order_body(order: &OrderRequest) -> Value {
    let mut body = Map::new();
    body.insert("currency_pair".into(), order.symbol.to_uppercase().into());
    let side = match order.side {
        OrderSide::Buy => "buy",
        OrderSide::Sell => "sell",
    };
    body.insert("side".into(), side.into());
    let kind = match order.order_type {
        OrderType::Market => "market",
        OrderType::Limit => "limit",
    };
    body.insert("type".into(), kind.into());
    body.insert("amount".into(), order.quantity.normalize().to_string().into());
    if let Some(price) = order.price {
        body.insert("price".into(), price.normalize().to_string().into());
    }
    body.insert("time_in_force".into(), time_in_force(order).into());
    if let Some(id) = &order.client_order_id {
        body.insert("text".into(), order_text(id).into());
    }
    Value::Object(body)
}

/// `POST /futures/usdt/orders` body. Size is a signed contract count; price `0` means market.
pub fn futures_order_body(order: &OrderRequest) -> Result<Value, String> {
    if !order.quantity.fract().is_zero() {
        return Err(format!(
            "futures size must be a whole number of contracts, got {}",
            order.quantity
        ));
    }
    let contracts = order.quantity.normalize().to_string();
    let size = match order.side {
        OrderSide::Buy => contracts,
        OrderSide::Sell => format!("-{}", contracts),
    };
    let size: i64 = size.parse().map_err(|_| format!("size out of range: {}", order.quantity))?;

    let mut body = Map::new();
    body.insert("contract".into(), order.symbol.to_uppercase().into());
    body.insert("size".into(), size.into());
    let price = order.price.unwrap_or(Decimal::ZERO).normalize().to_string();
    body.insert("price".into(), price.into());
    body.insert("tif".into(), time_in_force(order).into());
    if let Some(id) = &order.client_order_id {
        body.insert("text".into(), order_text(id).into());
    }
    Ok(Value::Object(body))
}

/// Spot and futures order responses share `id`, `text` and `status`.
pub fn order_ack(symbol: &str, raw: Value) -> Result<OrderAck, String> {
    let order_id = value_to_string(raw.get("id")).ok_or("order response without id")?;
    let client_order_id = raw
        .get("text")
        .and_then(Value::as_str)
        .filter(|text| text.starts_with("t-"))
        .map(str::to_string);
    let status = raw
        .get("status")
        .or_else(|| raw.get("finish_as"))
        .and_then(Value::as_str)
        .unwrap_or("open")
        .to_string();
    Ok(OrderAck {
        order_id,
        client_order_id,
        symbol: symbol.to_uppercase(),
        status,
        raw,
    })
}

/// Orders of a list response, e.g. open orders or the result of a cancel-all.
pub fn order_acks(symbol: &str, raw: Value) -> Result<Vec<OrderAck>, String> {
    let Value::Array(items) = raw else {
        return Err("expected a list of orders".to_string());
    };
    items.into_iter().map(|item| order_ack(symbol, item)).collect()
}

pub fn spot_balances(balances: Vec<GateSpotBalance>) -> Vec<Balance> {
    balances
        .into_iter()
        .filter(|b| !b.available.is_zero() || !b.locked.is_zero())
        .map(|b| Balance {
            asset: b.currency,
            free: b.available,
            locked: b.locked,
        })
        .collect()
}

pub fn futures_balances(account: GateFuturesAccount) -> Vec<Balance> {
    vec![Balance {
        asset: account.currency,
        free: account.available,
        locked: (account.total - account.available).max(Decimal::ZERO),
    }]
}

pub fn spot_instrument(pair: GateCurrencyPair) -> Instrument {
    Instrument {
        trading: pair.trade_status == "tradable",
        symbol: pair.id,
        base_asset: pair.base,
        quote_asset: pair.quote,
    }
}

pub fn futures_instrument(contract: GateContract) -> Instrument {
    let (base, quote) = contract
        .name
        .split_once('_')
        .map(|(b, q)| (b.to_string(), q.to_string()))
        .unwrap_or_else(|| (contract.name.clone(), String::new()));
    Instrument {
        trading: !contract.in_delisting,
        symbol: contract.name,
        base_asset: base,
        quote_asset: quote,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spot_order_body() {
        let order = OrderRequest::limit(
            "btc_usdt",
            OrderSide::Buy,
            "0.001".parse().unwrap(),
            "30000".parse().unwrap(),
        )
        .client_order_id("abc");
        assert_eq!(
            spot_order_body(&order),
            json!({
                "currency_pair": "BTC_USDT",
                "side": "buy",
                "type": "limit",
                "amount": "0.001",
                "price": "30000",
                "time_in_force": "gtc",
                "text": "t-abc"
            })
        );
    }

    #[test]
    fn test_futures_size_is_signed() {
        let order = OrderRequest::market("BTC_USDT", OrderSide::Sell, Decimal::from(3));
        let body = futures_order_body(&order).unwrap();
        assert_eq!(body["size"], -3);
        assert_eq!(body["price"], "0");
        assert_eq!(body["tif"], "ioc");

        let fractional = OrderRequest::market("BTC_USDT", OrderSide::Buy, "0.5".parse().unwrap());
        assert!(futures_order_body(&fractional).is_err());
    }

    #[test]
    fn test_order_ack_accepts_numeric_ids() {
        let ack = order_ack("btc_usdt", json!({"id": 123456, "text": "t-abc", "status": "open"})).unwrap();
        assert_eq!(ack.order_id, "123456");
        assert_eq!(ack.client_order_id.as_deref(), Some("t-abc"));
        assert_eq!(ack.symbol, "BTC_USDT");
    }

    #[test]
    fn test_order_list() {
        let acks = order_acks(
            "BTC_USDT",
            json!([
                {"id": "1", "text": "t-a", "status": "cancelled"},
                {"id": 2, "text": "web", "finish_as": "cancelled"}
            ]),
        )
        .unwrap();
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[1].order_id, "2");
        assert_eq!(acks[1].client_order_id, None);
        assert_eq!(acks[1].status, "cancelled");

        assert!(order_acks("BTC_USDT", json!({"id": "1"})).is_err());
    }
}
