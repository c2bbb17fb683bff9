//! Observable key/value state container for refbus services.
//!
//! Every service that publishes state owns a [`StateStore`]: a keyed map of
//! JSON values with change notification. Local consumers subscribe with
//! [`StateStore::on_changed`] or [`StateStore::already`]; the RPC layer
//! subscribes to the whole store and forwards change events to remote
//! processes as event envelopes.

pub mod error;
pub mod store;

pub use error::{Result, StateError};
pub use store::{ChangeEvent, StateStore, Subscription};
