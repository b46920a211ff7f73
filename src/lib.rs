//! # pubsub_brew
//!
//! `pubsub_brew` is a transport plugin ("brew") that lets a publish/subscribe
//! messaging host use an external pub/sub service as its backend. Publishers
//! ("brewers") map to topics, and subscribers ("patrons") map to one
//! subscription per (patron, topic), created on first interest and deleted
//! on last.
//!
//! ## Core Modules
//!
//! - `brew`: The host lifecycle contract and the pub/sub implementation of it.
//! - `ledger`: Reference counting that decides when a subscription resource must exist.
//! - `transport`: The client capabilities the brew consumes, plus an in-memory transport.
//! - `config`: Layered settings and credential discovery.
//! - `utils`: Error types and logging initialisation.

pub mod brew;
pub mod config;
pub mod ledger;
pub mod transport;
pub mod utils;

pub use brew::{Brew, BrewerDescriptor, DataCallback, PatronDescriptor, PubSubBrew};
pub use ledger::SubscriptionLedger;
pub use utils::{BrewError, TransportError};
