//! Wire protocol types and codec for Peerline.

pub mod call;
pub mod codec;
pub mod message;
