//! Common types for Nimbus: CRDs, errors, events, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;

pub use error::Error;
pub use kube_utils::{controller_of, has_orphan_finalizer, object_key, ORPHAN_FINALIZER};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
