// memring-proto - Command descriptors and text-protocol codec for memring
//
// This crate defines the wire-level half of the client: the command model,
// the memcached text-protocol encoder/decoder, and the protocol error type.

pub mod codec;
pub mod command;
pub mod error;

// Re-export for convenience
pub use codec::*;
pub use command::*;
pub use error::*;
