pub mod cache;
pub mod exchange_factory;

pub use cache::MemoryCache;
pub use exchange_factory::ExchangeFactory;
