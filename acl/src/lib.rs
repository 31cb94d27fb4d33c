//! # Access control for the weft directory
//!
//! Permissions are small integers grouped into a 128-bit [`PermissionMask`].
//! A node in the document directory owns a set of [`AclSheet`]s, one per
//! account: the sheet's `mask` marks which permissions the sheet decides
//! explicitly and `perms` holds their values. Bits outside `mask` are
//! inherited.
//!
//! The effective permission of an account at a node is computed by walking
//! from the node to the root. At every level the account's own sheet is
//! consulted before the default account's sheet; the first sheet whose mask
//! covers the permission decides. The root node's sheet for the default
//! account must mask every permission in [`PermissionMask::default_set`],
//! which guarantees the walk terminates with an answer.

#![warn(missing_docs)]

mod mask;
mod sheet;

pub use crate::mask::{Permission, PermissionMask};
pub use crate::sheet::{effective_permission, verify_root_sheets, AccountId, AclSheet, AclSheetSet};

use thiserror::Error;

/// Errors produced when manipulating ACL data.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// A permission name or index was not recognised.
    #[error("unknown permission {0:?}")]
    UnknownPermission(String),
    /// The root node's default sheet leaves a permission undecided.
    #[error("root default sheet does not mask {0:?}")]
    IncompleteRootSheet(Permission),
}
