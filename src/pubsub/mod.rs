//! Pub/sub adapter
//!
//! - [`registry`] - topic to listener bookkeeping with reference-counted broker subscriptions
//! - [`manager`] - the shared connection and its event task
//! - [`adapter`] - the facade consumers use

pub mod adapter;
pub mod manager;
pub mod registry;

pub use adapter::PubSubAdapter;
pub use manager::{ConnectionInfo, ConnectionManager, ConnectionState};
pub use registry::{listener, Dispatch, ListenerHandle, MessageListener, SubscriptionRegistry};
