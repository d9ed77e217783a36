pub mod client;
pub mod codec;
pub mod converters;
pub mod errors;
pub mod limits;
pub mod signer;
pub mod types;

// Re-export main types for easier importing
pub use client::BinanceClient;
pub use codec::BinanceCodec;
pub use errors::BinanceErrors;
pub use signer::BinanceSigner;
