//! Transport layer
//!
//! One TransportLink per TCP socket: tag + length-prefixed framing,
//! optional password-derived frame encryption, outbound queueing while
//! connecting, bounded reconnection, and a reply inbox for blocking
//! request/response exchanges.

mod crypto;
mod frame;
mod link;

pub use crypto::*;
pub use frame::*;
pub use link::*;
