//! Per-client session state for the nanobot aggregator.
//!
//! A [`Session`] is the context-and-attribute bag threaded through all
//! message handling: attributes with typed JSON encoding, an environment
//! map inherited by child sessions, ordered inbound filters, the in-flight
//! request registry, and the outbound exchange machinery.

mod error;
mod session;

pub use error::{Result, SessionError};
pub use session::{
    DEFAULT_EXCHANGE_TIMEOUT, ExchangeOptions, MAX_EXCHANGE_TIMEOUT, MessageFilter, Session,
};
