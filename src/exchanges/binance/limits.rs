//! Binance request-weight tables.
//!
//! Spot: 6000 weight per minute and 100 orders per 10 seconds per account.
//! USDⓈ-M futures: 2400 weight per minute and 300 orders per 10 seconds.

use crate::core::config::BucketConfig;
use crate::core::kernel::gateway::EndpointCost;
use reqwest::Method;
use std::time::Duration;

pub const WEIGHT: &str = "weight";
pub const ORDERS: &str = "orders";

pub fn spot_buckets() -> Vec<BucketConfig> {
    vec![
        BucketConfig::new(WEIGHT, 6000, 100, Duration::from_secs(1)),
        BucketConfig::new(ORDERS, 100, 10, Duration::from_secs(1)),
    ]
}

pub fn perp_buckets() -> Vec<BucketConfig> {
    vec![
        BucketConfig::new(WEIGHT, 2400, 40, Duration::from_secs(1)),
        BucketConfig::new(ORDERS, 300, 30, Duration::from_secs(1)),
    ]
}

pub fn spot_cost(method: &Method, path: &str) -> EndpointCost {
    match (method.as_str(), path) {
        // counts as one order and one unit of request weight
        ("POST", "/api/v3/order") => EndpointCost::new(ORDERS, 1).and(WEIGHT, 1),
        ("GET", "/api/v3/order") => EndpointCost::new(WEIGHT, 4),
        // with a symbol; the all-symbols form costs 80 and is never sent
        ("GET", "/api/v3/openOrders") => EndpointCost::new(WEIGHT, 6),
        ("DELETE", "/api/v3/openOrders") => EndpointCost::new(WEIGHT, 1),
        ("GET", "/api/v3/account") => EndpointCost::new(WEIGHT, 20),
        ("GET", "/api/v3/exchangeInfo") => EndpointCost::new(WEIGHT, 20),
        (_, "/api/v3/userDataStream") => EndpointCost::new(WEIGHT, 2),
        _ => EndpointCost::new(WEIGHT, 1),
    }
}

pub fn perp_cost(method: &Method, path: &str) -> EndpointCost {
    match (method.as_str(), path) {
        // order placement carries no IP weight on futures
        ("POST", "/fapi/v1/order") => EndpointCost::new(ORDERS, 1),
        ("GET", "/fapi/v1/order") => EndpointCost::new(WEIGHT, 1),
        ("GET", "/fapi/v1/openOrders") => EndpointCost::new(WEIGHT, 1),
        ("DELETE", "/fapi/v1/allOpenOrders") => EndpointCost::new(WEIGHT, 1),
        ("GET", "/fapi/v2/account") => EndpointCost::new(WEIGHT, 5),
        ("GET", "/fapi/v1/exchangeInfo") => EndpointCost::new(WEIGHT, 1),
        _ => EndpointCost::new(WEIGHT, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compound_endpoints_are_weighted() {
        assert_eq!(spot_cost(&Method::GET, "/api/v3/account").weight, 20);
        assert_eq!(spot_cost(&Method::DELETE, "/api/v3/order").class, WEIGHT);
        assert_eq!(spot_cost(&Method::GET, "/api/v3/order").weight, 4);
        assert_eq!(spot_cost(&Method::GET, "/api/v3/openOrders").weight, 6);
        assert_eq!(perp_cost(&Method::GET, "/fapi/v2/account").weight, 5);
        assert_eq!(perp_cost(&Method::GET, "/fapi/v1/exchangeInfo").charges(), vec![(WEIGHT, 1)]);
    }

    #[test]
    fn test_spot_order_counts_against_both_limits() {
        assert_eq!(
            spot_cost(&Method::POST, "/api/v3/order").charges(),
            vec![(ORDERS, 1), (WEIGHT, 1)]
        );
        assert_eq!(
            perp_cost(&Method::POST, "/fapi/v1/order").charges(),
            vec![(ORDERS, 1)]
        );
    }
}
