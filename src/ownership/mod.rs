//! Ownership
//!
//! Owner references tie a child's lifetime to its parent. A child carries at
//! most one controller reference; adding a second controller is rejected at
//! write time so the ownership graph stays a forest.

pub mod ephemeral;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::domain::ports::{Kinded, ObjectKey};
use crate::error::{Error, Result};

pub use ephemeral::{apply_ephemerals, child_metadata, EphemeralOutcome};

/// The controller reference of `meta`, if any.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Whether `child` is controlled by the object described by `owner`.
pub fn is_controlled_by(child: &ObjectMeta, owner: &ObjectMeta) -> bool {
    match (controller_of(child), owner.uid.as_deref()) {
        (Some(reference), Some(uid)) => reference.uid == uid,
        _ => false,
    }
}

/// Add an owner reference to `child` pointing at `owner`.
///
/// With `controller` set, fails with [`Error::AlreadyControlled`] if the child
/// already has a different controller. Re-adding the same owner is a no-op.
pub fn set_owner_reference<T: Kinded>(
    child: &mut ObjectMeta,
    owner: &T,
    controller: bool,
) -> Result<()> {
    let mut reference = owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::Invariant(format!(
            "owner {} has no uid yet",
            ObjectKey::of(owner)
        ))
    })?;

    if controller {
        if let Some(existing) = controller_of(child) {
            if existing.uid != reference.uid {
                return Err(Error::AlreadyControlled {
                    child: child.name.clone().unwrap_or_default(),
                    owner: format!("{} {}", existing.kind, existing.name),
                });
            }
        }
    } else {
        reference.controller = None;
        reference.block_owner_deletion = None;
    }

    let references = child.owner_references.get_or_insert_with(Vec::new);
    match references.iter_mut().find(|r| r.uid == reference.uid) {
        Some(existing) => {
            if controller {
                *existing = reference;
            }
        }
        None => references.push(reference),
    }
    Ok(())
}

/// Make `owner` the controller of `child`.
pub fn set_controller_reference<T: Kinded>(child: &mut ObjectMeta, owner: &T) -> Result<()> {
    set_owner_reference(child, owner, true)
}
