pub mod client;
pub mod codec;
pub mod converters;
pub mod errors;
pub mod limits;
pub mod signer;
pub mod types;

pub use client::GateClient;
pub use codec::GateCodec;
pub use errors::GateErrors;
pub use signer::GateSigner;
