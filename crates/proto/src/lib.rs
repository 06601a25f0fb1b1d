//! TensorServe protocol types
//!
//! Transport-agnostic shapes of the V2 inference protocol, shared by the
//! REST and RPC adapters, plus the codec registry that converts tensor
//! payloads into richer native values.

pub mod codecs;
pub mod types;

pub use codecs::{Codec, CodecRegistry, NativeValue};
pub use types::*;
