#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod access;
pub mod credential;
pub mod error;
pub mod lease;
pub mod placement;
pub mod record;
pub mod rpc;
pub mod secrets;
pub mod store;
pub mod time;

pub mod test_utils;

pub use error::{Error, ErrorKind, Result};

/// Sentinel principal that grants a level to every authenticated caller when
/// it appears in the corresponding ACL list.
pub const EVERYONE: &str = "everyone";

/// An authenticated caller, as supplied by the identity subsystem.
///
/// The core never authenticates anyone itself; it only evaluates what an
/// already-authenticated identity may do.
pub trait Identity: Send + Sync {
    /// Stable principal id, e.g. `alice@external`.
    fn id(&self) -> &str;

    /// Whether this identity belongs to the named group principal.
    fn is_member_of(&self, group: &str) -> bool;
}

/// A plain identity with a fixed group list. Sufficient for embedders whose
/// identity subsystem resolves memberships up front, and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    pub id: String,
    pub groups: Vec<String>,
}

impl StaticIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_groups(id: impl Into<String>, groups: &[&str]) -> Self {
        Self {
            id: id.into(),
            groups: groups.iter().map(ToString::to_string).collect(),
        }
    }
}

impl Identity for StaticIdentity {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_member_of(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}
