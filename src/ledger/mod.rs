//! The `ledger` module decides when an external subscription resource must
//! exist. It counts live interest per (consumer group, topic) and drives the
//! create/delete calls through the `SubscriptionResources` seam.

pub mod engine;
pub mod naming;

pub use engine::{SubscriptionKey, SubscriptionLedger, SubscriptionResources};
pub use naming::ResourceNames;

#[cfg(test)]
mod tests;
