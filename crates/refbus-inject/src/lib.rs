//! Dependency-injection container for refbus services.
//!
//! A process declares its service singletons as [`Descriptor`]s — plain data
//! naming each service's id, its ordered dependency ids, and a build closure.
//! [`register_all`] validates the resulting graph (no duplicates, no missing
//! ids, no cycles) before constructing anything, then instantiates every
//! service in topological order and returns the finished [`ServiceMap`].
//!
//! Container errors are fatal at startup: a broken service graph cannot
//! safely serve any API, so nothing is partially constructed.

pub mod container;
pub mod error;

pub use container::{register_all, Descriptor, ServiceMap, Shared};
pub use error::{InjectError, Result};
