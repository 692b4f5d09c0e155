//! Pure access-control evaluation: owner/group/ACL resolution with a strict
//! privilege hierarchy (admin ⊇ write ⊇ read). No I/O, no clock; every check
//! is a deterministic function of the identity, the ACL, and the owner.
//!
//! Callers that hide entity existence from unauthorized principals translate
//! `Unauthorized` into `NotFound` themselves; this module only ever says
//! whether the identity satisfies the level.

use serde::{Deserialize, Serialize};

use crate::{Error, Identity, Result, EVERYONE};

/// Privilege levels, strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
    Admin,
}

/// Principal lists attached to a controller or workload. The owner is not
/// listed; ownership implies every level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    #[serde(default)]
    pub admin: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
    #[serde(default)]
    pub read: Vec<String>,
}

impl Acl {
    fn list(&self, level: AccessLevel) -> &Vec<String> {
        match level {
            AccessLevel::Admin => &self.admin,
            AccessLevel::Write => &self.write,
            AccessLevel::Read => &self.read,
        }
    }

    fn list_mut(&mut self, level: AccessLevel) -> &mut Vec<String> {
        match level {
            AccessLevel::Admin => &mut self.admin,
            AccessLevel::Write => &mut self.write,
            AccessLevel::Read => &mut self.read,
        }
    }

    /// Add a principal at the given level. Idempotent.
    pub fn grant(&mut self, principal: &str, level: AccessLevel) {
        let list = self.list_mut(level);
        if !list.iter().any(|p| p == principal) {
            list.push(principal.to_string());
        }
    }

    /// Remove a principal from the given level and every level below it, so
    /// a revoke cannot leave a higher grant shadowing it.
    pub fn revoke(&mut self, principal: &str, level: AccessLevel) {
        for l in [AccessLevel::Admin, AccessLevel::Write, AccessLevel::Read] {
            if l <= level {
                self.list_mut(l).retain(|p| p != principal);
            }
        }
    }
}

fn list_matches(identity: &dyn Identity, list: &[String]) -> bool {
    list.iter().any(|principal| {
        principal == identity.id() || principal == EVERYONE || identity.is_member_of(principal)
    })
}

/// Whether the identity is the owner namespace itself.
pub fn is_owner(identity: &dyn Identity, owner: &str) -> bool {
    identity.id() == owner || identity.is_member_of(owner)
}

/// Whether the identity satisfies `level` on an entity owned by `owner`.
///
/// A level is satisfied by ownership, by membership in its own list, or by
/// membership in any higher list.
pub fn has_level(identity: &dyn Identity, acl: &Acl, owner: &str, level: AccessLevel) -> bool {
    if is_owner(identity, owner) {
        return true;
    }
    [AccessLevel::Admin, AccessLevel::Write, AccessLevel::Read]
        .into_iter()
        .filter(|l| *l >= level)
        .any(|l| list_matches(identity, acl.list(l)))
}

pub fn can_read(identity: &dyn Identity, acl: &Acl, owner: &str) -> Result<()> {
    require(has_level(identity, acl, owner, AccessLevel::Read))
}

pub fn can_write(identity: &dyn Identity, acl: &Acl, owner: &str) -> Result<()> {
    require(has_level(identity, acl, owner, AccessLevel::Write))
}

pub fn can_admin(identity: &dyn Identity, acl: &Acl, owner: &str) -> Result<()> {
    require(has_level(identity, acl, owner, AccessLevel::Admin))
}

/// Owner-only check for operations with no ACL escape hatch, such as
/// creating entities inside a namespace.
pub fn require_owner(identity: &dyn Identity, owner: &str) -> Result<()> {
    require(is_owner(identity, owner))
}

fn require(ok: bool) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticIdentity;

    fn acl(admin: &[&str], write: &[&str], read: &[&str]) -> Acl {
        Acl {
            admin: admin.iter().map(ToString::to_string).collect(),
            write: write.iter().map(ToString::to_string).collect(),
            read: read.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn owner_has_every_level() {
        let alice = StaticIdentity::new("alice");
        let empty = Acl::default();
        assert!(can_read(&alice, &empty, "alice").is_ok());
        assert!(can_write(&alice, &empty, "alice").is_ok());
        assert!(can_admin(&alice, &empty, "alice").is_ok());
    }

    #[test]
    fn hierarchy_is_strict() {
        let bob = StaticIdentity::new("bob");
        let read_only = acl(&[], &[], &["bob"]);
        assert!(can_read(&bob, &read_only, "alice").is_ok());
        assert!(can_write(&bob, &read_only, "alice").is_err());
        assert!(can_admin(&bob, &read_only, "alice").is_err());

        let writer = acl(&[], &["bob"], &[]);
        assert!(can_read(&bob, &writer, "alice").is_ok());
        assert!(can_write(&bob, &writer, "alice").is_ok());
        assert!(can_admin(&bob, &writer, "alice").is_err());

        let admin = acl(&["bob"], &[], &[]);
        assert!(can_admin(&bob, &admin, "alice").is_ok());
        assert!(can_read(&bob, &admin, "alice").is_ok());
    }

    #[test]
    fn everyone_sentinel_matches_any_identity() {
        let mallory = StaticIdentity::new("mallory");
        let open = acl(&[], &[], &[EVERYONE]);
        assert!(can_read(&mallory, &open, "alice").is_ok());
        assert!(can_write(&mallory, &open, "alice").is_err());
    }

    #[test]
    fn group_membership_counts() {
        let carol = StaticIdentity::with_groups("carol", &["ops-team"]);
        let team = acl(&[], &["ops-team"], &[]);
        assert!(can_write(&carol, &team, "alice").is_ok());

        let dave = StaticIdentity::new("dave");
        assert!(can_write(&dave, &team, "alice").is_err());
    }

    #[test]
    fn unknown_principal_is_unauthorized() {
        let eve = StaticIdentity::new("eve");
        let closed = acl(&["alice"], &["bob"], &["carol"]);
        let err = can_read(&eve, &closed, "frank").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Unauthorized);
    }

    #[test]
    fn revoke_clears_lower_levels_too() {
        let mut acl = acl(&["bob"], &["bob"], &["bob"]);
        acl.revoke("bob", AccessLevel::Write);
        assert!(acl.admin.contains(&"bob".to_string()));
        assert!(acl.write.is_empty());
        assert!(acl.read.is_empty());

        acl.revoke("bob", AccessLevel::Admin);
        assert!(acl.admin.is_empty());
    }

    #[test]
    fn grant_is_idempotent() {
        let mut acl = Acl::default();
        acl.grant("bob", AccessLevel::Read);
        acl.grant("bob", AccessLevel::Read);
        assert_eq!(acl.read, vec!["bob".to_string()]);
    }

    proptest::proptest! {
        // Whatever the ACL contents, a satisfied level implies every level
        // below it: admin ⊇ write ⊇ read can never invert.
        #[test]
        fn hierarchy_is_monotone(
            id in "[a-z]{1,8}",
            owner in "[a-z]{1,8}",
            admin in proptest::collection::vec("[a-z]{1,8}", 0..4),
            write in proptest::collection::vec("[a-z]{1,8}", 0..4),
            read in proptest::collection::vec("[a-z]{1,8}", 0..4),
        ) {
            let identity = StaticIdentity::new(id);
            let acl = Acl { admin, write, read };
            if has_level(&identity, &acl, &owner, AccessLevel::Admin) {
                proptest::prop_assert!(has_level(&identity, &acl, &owner, AccessLevel::Write));
            }
            if has_level(&identity, &acl, &owner, AccessLevel::Write) {
                proptest::prop_assert!(has_level(&identity, &acl, &owner, AccessLevel::Read));
            }
        }
    }
}
