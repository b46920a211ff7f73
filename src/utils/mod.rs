//! The `utils` module provides the pieces shared by every other module of
//! `pubsub_brew`: the error types surfaced by the transport and the brew hooks,
//! and the tracing initialisation used by the binary and by tests.

pub mod error;
pub mod logging;

pub use error::{BrewError, TransportError};
