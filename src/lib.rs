pub mod core;
pub mod exchanges;
pub mod utils;

pub use crate::core::config::{AccountConfig, ConnectivityConfig, Credentials, KeyType};
pub use crate::core::errors::{ErrorKind, ExchangeError, NormalizedError};
pub use crate::core::registry::ConnectivityRegistry;
pub use crate::core::traits::{
    AccountInfo, ExchangeClient, MarketData, MarketStreams, OrderPlacer, ResponseCache,
    StreamHandler,
};
pub use crate::core::types::*;
pub use exchanges::binance::BinanceClient;
pub use exchanges::bybit::BybitClient;
pub use exchanges::gate::GateClient;
pub use utils::ExchangeFactory;
