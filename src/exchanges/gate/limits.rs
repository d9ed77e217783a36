//! Gate.io APIv4 rate limits.
//!
//! Order placement and cancellation allow 10 requests per second per market;
//! other private endpoints share 200 requests per 10 seconds.

use crate::core::config::BucketConfig;
use crate::core::kernel::gateway::EndpointCost;
use reqwest::Method;
use std::time::Duration;

pub const REQUESTS: &str = "requests";
pub const ORDERS: &str = "orders";

pub fn buckets() -> Vec<BucketConfig> {
    vec![
        BucketConfig::new(REQUESTS, 200, 20, Duration::from_secs(1)),
        BucketConfig::new(ORDERS, 10, 10, Duration::from_secs(1)),
    ]
}

pub fn cost(method: &Method, path: &str) -> EndpointCost {
    let order_path = path.starts_with("/api/v4/spot/orders")
        || path.starts_with("/api/v4/futures/usdt/orders");
    if order_path && (method == Method::POST || method == Method::DELETE) {
        EndpointCost::new(ORDERS, 1)
    } else {
        EndpointCost::new(REQUESTS, 1)
    }
}
