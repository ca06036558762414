//! Wire-level message types and topic rules
//!
//! Envelopes, event frames and the settings/control documents, plus the
//! well-known topics and the validation applied to topics and identities.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
