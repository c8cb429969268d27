//! Nimbus operator: keeps VirtualMachineInstances aligned with the
//! intent declared on VirtualMachineDefinitions
//!
//! The controller follows the classic reconciliation shape: informer
//! events feed a de-duplicated work queue, parallel workers reconcile
//! one definition per key, and an expectations store bridges issued
//! API operations with the eventually-consistent cache.

pub mod adoption;
pub mod controller;
pub mod expectations;
pub mod queue;
pub mod sidecar;
pub mod stores;
pub mod watch;

mod handlers;

pub use nimbus_common::{Error, Result};
