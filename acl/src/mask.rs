//! Permissions and the 128-bit mask they live in.
use crate::Error;

/// One gated directory or account operation.
///
/// The discriminants are wire-stable bit indices into a
/// [`PermissionMask`]; they must stay below 128.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum Permission {
    /// Create a subdirectory beneath a node.
    AddSubdirectory = 0,
    /// Create a document beneath a node.
    AddDocument = 1,
    /// Upload existing content into a new document.
    SyncIn = 2,
    /// Remove a node and everything beneath it.
    RemoveNode = 3,
    /// List the children of a subdirectory.
    ExploreNode = 4,
    /// Subscribe to the server-wide chat.
    SubscribeChat = 5,
    /// Subscribe to a document session.
    SubscribeSession = 6,
    /// Join a user into a subscribed session.
    JoinUser = 7,
    /// Enumerate the accounts known to the server.
    QueryAccountList = 8,
    /// Create a new account.
    CreateAccount = 9,
    /// Replace the certificate binding of an existing account.
    OverrideAccount = 10,
    /// Delete an account.
    RemoveAccount = 11,
    /// Read a node's ACL sheets.
    QueryAcl = 12,
    /// Replace a node's ACL sheets.
    SetAcl = 13,
}

impl Permission {
    /// All permissions in bit order.
    pub const ALL: [Permission; 14] = [
        Permission::AddSubdirectory,
        Permission::AddDocument,
        Permission::SyncIn,
        Permission::RemoveNode,
        Permission::ExploreNode,
        Permission::SubscribeChat,
        Permission::SubscribeSession,
        Permission::JoinUser,
        Permission::QueryAccountList,
        Permission::CreateAccount,
        Permission::OverrideAccount,
        Permission::RemoveAccount,
        Permission::QueryAcl,
        Permission::SetAcl,
    ];

    /// The bit index of this permission.
    pub fn bit(self) -> u8 {
        self as u8
    }

    /// The kebab-case wire name, used as an XML attribute name.
    pub fn name(self) -> &'static str {
        match self {
            Permission::AddSubdirectory => "can-add-subdirectory",
            Permission::AddDocument => "can-add-document",
            Permission::SyncIn => "can-sync-in",
            Permission::RemoveNode => "can-remove-node",
            Permission::ExploreNode => "can-explore-node",
            Permission::SubscribeChat => "can-subscribe-chat",
            Permission::SubscribeSession => "can-subscribe-session",
            Permission::JoinUser => "can-join-user",
            Permission::QueryAccountList => "can-query-account-list",
            Permission::CreateAccount => "can-create-account",
            Permission::OverrideAccount => "can-override-account",
            Permission::RemoveAccount => "can-remove-account",
            Permission::QueryAcl => "can-query-acl",
            Permission::SetAcl => "can-set-acl",
        }
    }

    /// Resolves a wire name back to the permission.
    pub fn from_name(name: &str) -> Result<Self, Error> {
        Permission::ALL
            .into_iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| Error::UnknownPermission(name.to_owned()))
    }
}

/// A 128-bit permission set.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct PermissionMask {
    bits: [u64; 2],
}

impl PermissionMask {
    /// The empty mask.
    pub const EMPTY: PermissionMask = PermissionMask { bits: [0, 0] };

    /// Returns a mask holding exactly `permissions`.
    pub fn of(permissions: &[Permission]) -> Self {
        let mut mask = Self::EMPTY;
        for permission in permissions {
            mask.set(*permission, true);
        }
        mask
    }

    /// Every known permission.
    pub fn all() -> Self {
        Self::of(&Permission::ALL)
    }

    /// Permissions meaningful on every node and granted to new accounts by
    /// default policy decisions; the root node's default sheet must mask
    /// all of them.
    pub fn default_set() -> Self {
        Self::of(&[
            Permission::AddSubdirectory,
            Permission::AddDocument,
            Permission::SyncIn,
            Permission::RemoveNode,
            Permission::ExploreNode,
            Permission::SubscribeChat,
            Permission::SubscribeSession,
            Permission::JoinUser,
        ])
    }

    /// Permissions only meaningful on the root node.
    pub fn root_set() -> Self {
        Self::of(&[
            Permission::SubscribeChat,
            Permission::QueryAccountList,
            Permission::CreateAccount,
            Permission::OverrideAccount,
            Permission::RemoveAccount,
        ])
    }

    /// Permissions only meaningful on subdirectory nodes.
    pub fn subdirectory_set() -> Self {
        Self::of(&[
            Permission::AddSubdirectory,
            Permission::AddDocument,
            Permission::SyncIn,
            Permission::RemoveNode,
            Permission::ExploreNode,
        ])
    }

    /// Permissions only meaningful on document nodes.
    pub fn leaf_set() -> Self {
        Self::of(&[Permission::SubscribeSession, Permission::JoinUser])
    }

    /// Clears every bit.
    pub fn clear(&mut self) {
        self.bits = [0, 0];
    }

    /// Whether no bit is set.
    pub fn is_empty(&self) -> bool {
        self.bits == [0, 0]
    }

    /// Whether the bit for `permission` is set.
    pub fn has(&self, permission: Permission) -> bool {
        let bit = permission.bit() as usize;
        self.bits[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    /// Sets or clears the bit for `permission`.
    pub fn set(&mut self, permission: Permission, value: bool) {
        let bit = permission.bit() as usize;
        if value {
            self.bits[bit / 64] |= 1u64 << (bit % 64);
        } else {
            self.bits[bit / 64] &= !(1u64 << (bit % 64));
        }
    }

    /// Bitwise and.
    pub fn and(&self, other: &Self) -> Self {
        Self {
            bits: [self.bits[0] & other.bits[0], self.bits[1] & other.bits[1]],
        }
    }

    /// Bits of `self` not set in `other`.
    pub fn and_not(&self, other: &Self) -> Self {
        Self {
            bits: [self.bits[0] & !other.bits[0], self.bits[1] & !other.bits[1]],
        }
    }

    /// Bitwise or.
    pub fn or(&self, other: &Self) -> Self {
        Self {
            bits: [self.bits[0] | other.bits[0], self.bits[1] | other.bits[1]],
        }
    }

    /// Bits of `self` plus the complement of `other`.
    pub fn or_not(&self, other: &Self) -> Self {
        Self {
            bits: [self.bits[0] | !other.bits[0], self.bits[1] | !other.bits[1]],
        }
    }

    /// Bitwise complement.
    pub fn negate(&self) -> Self {
        Self {
            bits: [!self.bits[0], !self.bits[1]],
        }
    }

    /// Iterates the known permissions whose bits are set.
    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        Permission::ALL.into_iter().filter(|p| self.has(*p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_mask() -> impl Strategy<Value = PermissionMask> {
        prop::collection::vec(0usize..Permission::ALL.len(), 0..8).prop_map(|bits| {
            let perms: Vec<Permission> = bits.into_iter().map(|b| Permission::ALL[b]).collect();
            PermissionMask::of(&perms)
        })
    }

    #[test]
    fn wire_names_roundtrip() {
        for permission in Permission::ALL {
            assert_eq!(Permission::from_name(permission.name()).unwrap(), permission);
        }
        assert!(Permission::from_name("can-fly").is_err());
    }

    #[test]
    fn named_sets_cover_expected_permissions() {
        assert!(PermissionMask::root_set().has(Permission::CreateAccount));
        assert!(!PermissionMask::root_set().has(Permission::JoinUser));
        assert!(PermissionMask::leaf_set().has(Permission::SubscribeSession));
        assert!(!PermissionMask::leaf_set().has(Permission::ExploreNode));
        assert!(PermissionMask::subdirectory_set().has(Permission::ExploreNode));
        for permission in Permission::ALL {
            assert!(PermissionMask::all().has(permission));
        }
    }

    proptest! {
        #[test]
        fn and_not_splits_cleanly(a in arb_mask(), b in arb_mask()) {
            let kept = a.and_not(&b);
            let dropped = a.and(&b);
            prop_assert_eq!(kept.or(&dropped), a);
            prop_assert_eq!(kept.and(&dropped), PermissionMask::EMPTY);
        }

        #[test]
        fn negate_is_involutive(a in arb_mask()) {
            prop_assert_eq!(a.negate().negate(), a);
        }

        #[test]
        fn or_not_matches_definition(a in arb_mask(), b in arb_mask()) {
            prop_assert_eq!(a.or_not(&b), a.or(&b.negate()));
        }
    }
}
