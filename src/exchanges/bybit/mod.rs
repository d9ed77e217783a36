pub mod client;
pub mod codec;
pub mod converters;
pub mod errors;
pub mod limits;
pub mod signer;
pub mod types;

pub use client::BybitClient;
pub use codec::BybitCodec;
pub use errors::BybitErrors;
pub use signer::BybitSigner;
