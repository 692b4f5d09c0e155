//! Persisted records and their identities. These are the documents the
//! record store holds; all mutation goes through the store so its
//! single-document atomicity applies.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::Acl;

/// Identity of a controller: owner namespace plus name, globally unique.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ControllerTag {
    pub owner: String,
    pub name: String,
}

impl ControllerTag {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ControllerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Identity of a credential: cloud plus owner namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CredentialTag {
    pub cloud: String,
    pub owner: String,
    pub name: String,
}

impl CredentialTag {
    pub fn new(
        cloud: impl Into<String>,
        owner: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cloud: cloud.into(),
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CredentialTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cloud, self.owner, self.name)
    }
}

/// Identity of a workload: owner namespace plus name, globally unique.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadTag {
    pub owner: String,
    pub name: String,
}

impl WorkloadTag {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// The `(holder, expiry)` pair embedded in a controller record. Not a
/// standalone entity: it is only ever manipulated through the store's CAS.
///
/// A holding with an empty holder, or an expiry at or before "now", is
/// logically free regardless of what the fields say.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseHolding {
    pub holder: String,
    pub expiry: DateTime<Utc>,
}

impl LeaseHolding {
    /// The free holding: empty holder, zero expiry.
    pub fn free() -> Self {
        Self {
            holder: String::new(),
            expiry: DateTime::UNIX_EPOCH,
        }
    }

    pub fn held_by(holder: impl Into<String>, expiry: DateTime<Utc>) -> Self {
        Self {
            holder: holder.into(),
            expiry,
        }
    }

    /// Lazy expiry: there is no background sweep, any reader compares the
    /// stored expiry to its own clock.
    pub fn is_free(&self, now: DateTime<Utc>) -> bool {
        self.holder.is_empty() || self.expiry <= now
    }

    pub fn is_held_by(&self, holder: &str, now: DateTime<Utc>) -> bool {
        !self.is_free(now) && self.holder == holder
    }
}

impl Default for LeaseHolding {
    fn default() -> Self {
        Self::free()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRecord {
    pub tag: ControllerTag,
    pub cloud: String,
    pub region: String,
    /// Network endpoints the RPC connector dials, in preference order.
    pub endpoints: Vec<String>,
    /// Trust anchor (CA certificate, PEM) for those endpoints.
    pub ca_cert: String,
    pub admin_user: String,
    pub admin_secret: String,
    /// Visible to every caller, not just those on the ACL.
    pub public: bool,
    /// Excluded from placement candidate sets.
    pub deprecated: bool,
    /// Set when a connection attempt first fails, cleared on the next
    /// successful connection. Records the start of an outage.
    pub unavailable_since: Option<DateTime<Utc>>,
    /// Monitor lease, CAS-only.
    pub lease: LeaseHolding,
    pub acl: Acl,
}

impl ControllerRecord {
    pub fn new(tag: ControllerTag, cloud: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            tag,
            cloud: cloud.into(),
            region: region.into(),
            endpoints: Vec::new(),
            ca_cert: String::new(),
            admin_user: String::new(),
            admin_secret: String::new(),
            public: false,
            deprecated: false,
            unavailable_since: None,
            lease: LeaseHolding::free(),
            acl: Acl::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub tag: CredentialTag,
    pub auth_type: String,
    /// Opaque provider attributes. Empty when the bag lives in a secrets
    /// backend, and always empty once the credential is revoked.
    pub attributes: BTreeMap<String, String>,
    pub revoked: bool,
    /// Controllers this credential is currently deployed on.
    pub controllers: BTreeSet<ControllerTag>,
    /// Controllers whose copy has not been confirmed up to date: marked
    /// before a propagation attempt, cleared when that controller's update
    /// RPC succeeds.
    pub update_needed: BTreeSet<ControllerTag>,
}

impl CredentialRecord {
    pub fn new(tag: CredentialTag, auth_type: impl Into<String>) -> Self {
        Self {
            tag,
            auth_type: auth_type.into(),
            attributes: BTreeMap::new(),
            revoked: false,
            controllers: BTreeSet::new(),
            update_needed: BTreeSet::new(),
        }
    }
}

/// Lifecycle status of a workload record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadStatus {
    /// Placeholder reserved, remote creation not yet confirmed.
    Creating,
    Ready,
    /// Created remotely but the service's own admin grant failed; the
    /// workload needs out-of-band remediation.
    MissingAdminGrant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRecord {
    pub tag: WorkloadTag,
    /// Globally unique external identifier. Starts as a locally generated
    /// `creating-<uuid>` placeholder and is replaced (or the record deleted)
    /// before the creating operation returns.
    pub external_id: String,
    /// Owning controller. `None` only while the record is a reservation
    /// placeholder that no controller has accepted yet.
    pub controller: Option<ControllerTag>,
    pub credential: Option<CredentialTag>,
    pub cloud: String,
    pub region: String,
    pub created_at: DateTime<Utc>,
    pub status: WorkloadStatus,
    pub acl: Acl,
}
