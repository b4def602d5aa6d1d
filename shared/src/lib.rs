//! Burrow Shared Library
//!
//! Protocol types and errors common to the tunnel client and its peer.

pub mod protocol;
pub mod error;

pub use error::{Error, Result};
pub use protocol::{Envelope, Event, Payload};
