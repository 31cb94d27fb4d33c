//! ACL sheets: explicit permission decisions for one account at one node.
use crate::{Error, Permission, PermissionMask};
use fnv::FnvHashMap;
use std::sync::Arc;

/// A runtime-interned account identifier.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AccountId(Arc<str>);

impl AccountId {
    /// The well-known id of the default account, which supplies fallback
    /// permissions for accounts without an own sheet.
    pub fn default_account() -> Self {
        Self::from("default")
    }

    /// The textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The explicit permission decisions of one account at one node: `mask`
/// marks which bits this sheet decides, `perms` holds their values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AclSheet {
    /// Which permissions this sheet decides.
    pub mask: PermissionMask,
    /// The decided values; only bits inside `mask` are meaningful.
    pub perms: PermissionMask,
}

impl AclSheet {
    /// Returns a sheet deciding nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the sheet decides nothing.
    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    /// The sheet's decision on `permission`, if it makes one.
    pub fn get(&self, permission: Permission) -> Option<bool> {
        self.mask
            .has(permission)
            .then(|| self.perms.has(permission))
    }

    /// Decides `permission` to `value`.
    pub fn set(&mut self, permission: Permission, value: bool) {
        self.mask.set(permission, true);
        self.perms.set(permission, value);
    }

    /// Removes the decision on `permission`.
    pub fn unset(&mut self, permission: Permission) {
        self.mask.set(permission, false);
        self.perms.set(permission, false);
    }
}

/// The sheets of one node, indexed by account.
#[derive(Clone, Debug, Default)]
pub struct AclSheetSet {
    sheets: FnvHashMap<AccountId, AclSheet>,
}

impl AclSheetSet {
    /// Returns a set with no sheets.
    pub fn new() -> Self {
        Self::default()
    }

    /// The sheet for `account`, if present.
    pub fn sheet(&self, account: &AccountId) -> Option<&AclSheet> {
        self.sheets.get(account)
    }

    /// Installs `sheet` for `account`. An empty sheet clears the entry.
    pub fn set_sheet(&mut self, account: AccountId, sheet: AclSheet) {
        if sheet.is_empty() {
            self.sheets.remove(&account);
        } else {
            self.sheets.insert(account, sheet);
        }
    }

    /// Merges every sheet of `other` into this set.
    pub fn merge(&mut self, other: &AclSheetSet) {
        for (account, sheet) in other.iter() {
            self.set_sheet(account.clone(), *sheet);
        }
    }

    /// Whether the set holds no sheets.
    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty()
    }

    /// Iterates all sheets.
    pub fn iter(&self) -> impl Iterator<Item = (&AccountId, &AclSheet)> {
        self.sheets.iter()
    }

    /// Restricts every sheet to the permissions in `allowed`, dropping
    /// sheets that end up deciding nothing.
    pub fn restrict(&mut self, allowed: &PermissionMask) {
        self.sheets.retain(|_, sheet| {
            sheet.mask = sheet.mask.and(allowed);
            sheet.perms = sheet.perms.and(allowed);
            !sheet.is_empty()
        });
    }
}

/// Verifies that the root node's sheet for the default account decides
/// every permission in [`PermissionMask::default_set`].
pub fn verify_root_sheets(root: &AclSheetSet, default_account: &AccountId) -> Result<(), Error> {
    let sheet = root.sheet(default_account).copied().unwrap_or_default();
    for permission in PermissionMask::default_set().iter() {
        if sheet.get(permission).is_none() {
            return Err(Error::IncompleteRootSheet(permission));
        }
    }
    Ok(())
}

/// Computes the effective permission of `account` along `chain`, which
/// walks sheet sets from the queried node up to the root. At every level
/// the account's own sheet is consulted before the default account's; the
/// first explicit decision wins. Returns `false` if nothing decides, which
/// cannot happen when the root sheets pass [`verify_root_sheets`].
pub fn effective_permission<'a>(
    chain: impl IntoIterator<Item = &'a AclSheetSet>,
    account: &AccountId,
    default_account: &AccountId,
    permission: Permission,
) -> bool {
    for set in chain {
        if let Some(value) = set.sheet(account).and_then(|s| s.get(permission)) {
            return value;
        }
        if let Some(value) = set
            .sheet(default_account)
            .and_then(|s| s.get(permission))
        {
            return value;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(decisions: &[(Permission, bool)]) -> AclSheet {
        let mut sheet = AclSheet::new();
        for (permission, value) in decisions {
            sheet.set(*permission, *value);
        }
        sheet
    }

    #[test]
    fn acl_inheritance_walk() {
        let default = AccountId::default_account();
        let alice = AccountId::from("alice");
        let bob = AccountId::from("bob");

        // Root: everyone may explore.
        let mut root = AclSheetSet::new();
        let mut root_default = AclSheet::new();
        for permission in PermissionMask::default_set().iter() {
            root_default.set(permission, permission == Permission::ExploreNode);
        }
        root.set_sheet(default.clone(), root_default);
        verify_root_sheets(&root, &default).unwrap();

        // /priv: exploring is off for everyone but alice.
        let mut private = AclSheetSet::new();
        private.set_sheet(default.clone(), sheet(&[(Permission::ExploreNode, false)]));
        private.set_sheet(alice.clone(), sheet(&[(Permission::ExploreNode, true)]));

        // /priv/child and /public carry no sheets of their own.
        let child = AclSheetSet::new();
        let public = AclSheetSet::new();

        let under_private = [&child, &private, &root];
        assert!(effective_permission(
            under_private,
            &alice,
            &default,
            Permission::ExploreNode
        ));
        assert!(!effective_permission(
            under_private,
            &bob,
            &default,
            Permission::ExploreNode
        ));
        assert!(effective_permission(
            [&public, &root],
            &bob,
            &default,
            Permission::ExploreNode
        ));
    }

    #[test]
    fn effective_mask_is_direction_independent() {
        // Computing the full effective mask bottom-up must agree with a
        // top-down accumulation where deeper sheets override shallower
        // ones.
        let default = AccountId::default_account();
        let account = AccountId::from("carol");

        let mut root = AclSheetSet::new();
        let mut root_default = AclSheet::new();
        for permission in Permission::ALL {
            root_default.set(permission, permission.bit() % 2 == 0);
        }
        root.set_sheet(default.clone(), root_default);

        let mut middle = AclSheetSet::new();
        middle.set_sheet(
            account.clone(),
            sheet(&[(Permission::AddDocument, true), (Permission::SetAcl, false)]),
        );

        let mut leaf = AclSheetSet::new();
        leaf.set_sheet(
            default.clone(),
            sheet(&[(Permission::AddDocument, false), (Permission::JoinUser, true)]),
        );

        // Bottom-up: first decision on the walk wins.
        let bottom_up: Vec<bool> = Permission::ALL
            .into_iter()
            .map(|p| effective_permission([&leaf, &middle, &root], &account, &default, p))
            .collect();

        // Top-down: later (deeper) decisions override earlier ones.
        let mut top_down = Vec::new();
        for permission in Permission::ALL {
            let mut value = false;
            for set in [&root, &middle, &leaf] {
                let decision = set
                    .sheet(&account)
                    .and_then(|s| s.get(permission))
                    .or_else(|| set.sheet(&default).and_then(|s| s.get(permission)));
                if let Some(v) = decision {
                    value = v;
                }
            }
            top_down.push(value);
        }
        assert_eq!(bottom_up, top_down);
    }

    #[test]
    fn empty_sheet_clears_entry() {
        let mut set = AclSheetSet::new();
        let account = AccountId::from("dave");
        set.set_sheet(account.clone(), sheet(&[(Permission::QueryAcl, true)]));
        assert!(set.sheet(&account).is_some());
        set.set_sheet(account.clone(), AclSheet::new());
        assert!(set.sheet(&account).is_none());
    }

    #[test]
    fn restrict_drops_foreign_bits() {
        let mut set = AclSheetSet::new();
        let account = AccountId::from("erin");
        set.set_sheet(
            account.clone(),
            sheet(&[
                (Permission::ExploreNode, true),
                (Permission::CreateAccount, true),
            ]),
        );
        set.restrict(&PermissionMask::subdirectory_set());
        let restricted = set.sheet(&account).unwrap();
        assert_eq!(restricted.get(Permission::ExploreNode), Some(true));
        assert_eq!(restricted.get(Permission::CreateAccount), None);
    }

    #[test]
    fn incomplete_root_sheet_is_reported() {
        let default = AccountId::default_account();
        let mut root = AclSheetSet::new();
        root.set_sheet(default.clone(), sheet(&[(Permission::ExploreNode, true)]));
        assert!(matches!(
            verify_root_sheets(&root, &default),
            Err(Error::IncompleteRootSheet(_))
        ));
    }
}
