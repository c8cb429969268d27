//! Shared Kubernetes metadata helpers
//!
//! Small utilities over `ObjectMeta` used by the controllers: cache
//! keys, controller owner-reference lookup, and finalizer checks.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

/// Finalizer requesting that dependents are released instead of
/// cascade-deleted when the owner goes away.
pub const ORPHAN_FINALIZER: &str = "orphan";

/// Compute the cache key (`namespace/name`) for an object.
///
/// Returns `None` when the object has no name, which only happens for
/// objects that never reached the API server.
pub fn object_key(meta: &ObjectMeta) -> Option<String> {
    let name = meta.name.as_deref()?;
    match meta.namespace.as_deref() {
        Some(namespace) => Some(format!("{namespace}/{name}")),
        None => Some(name.to_string()),
    }
}

/// Return the owner reference marked as the controlling owner, if any.
///
/// At most one owner reference may carry `controller: true`; the API
/// server enforces this, so the first hit is the controller.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Check whether the object carries the orphan-dependents finalizer.
pub fn has_orphan_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == ORPHAN_FINALIZER))
}
