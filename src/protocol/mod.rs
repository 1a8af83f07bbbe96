//! Wire protocol for the mesh
//!
//! Defines the typed, addressed message unit (Envelope) exchanged over
//! transport links, plus the small string codecs used inside payloads
//! (status broadcasts, task descriptors, kill orders).

mod codec;
mod envelope;

pub use codec::*;
pub use envelope::*;
