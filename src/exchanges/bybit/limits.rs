//! Bybit V5 rate limits.
//!
//! Per-UID order endpoints allow 10-20 requests per second depending on category;
//! everything else shares the IP limit of 600 requests per 5 seconds.

use crate::core::config::BucketConfig;
use crate::core::kernel::gateway::EndpointCost;
use reqwest::Method;
use std::time::Duration;

pub const REQUESTS: &str = "requests";
pub const ORDERS: &str = "orders";

pub fn buckets() -> Vec<BucketConfig> {
    vec![
        BucketConfig::new(REQUESTS, 600, 120, Duration::from_secs(1)),
        BucketConfig::new(ORDERS, 10, 10, Duration::from_secs(1)),
    ]
}

pub fn cost(method: &Method, path: &str) -> EndpointCost {
    match (method.as_str(), path) {
        ("POST", "/v5/order/create" | "/v5/order/cancel" | "/v5/order/cancel-all") => {
            EndpointCost::new(ORDERS, 1)
        }
        _ => EndpointCost::new(REQUESTS, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_endpoints_use_order_bucket() {
        assert_eq!(cost(&Method::POST, "/v5/order/create").class, ORDERS);
        assert_eq!(cost(&Method::POST, "/v5/order/cancel").class, ORDERS);
        assert_eq!(cost(&Method::POST, "/v5/order/cancel-all").class, ORDERS);
        assert_eq!(cost(&Method::GET, "/v5/order/realtime").class, REQUESTS);
        assert_eq!(cost(&Method::GET, "/v5/account/wallet-balance").class, REQUESTS);
    }
}
