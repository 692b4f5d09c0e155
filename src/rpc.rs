//! The wire seam to remote controllers. The protocol itself is out of
//! scope: the core only needs an opaque client whose operations succeed or
//! fail with a classified [`Error`](crate::Error), and a connector that
//! dials one connection per task so every fan-out task owns and releases
//! its own connection.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::access::AccessLevel;
use crate::record::{ControllerRecord, CredentialTag, WorkloadTag};
use crate::Result;

/// What a controller needs to create a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub tag: WorkloadTag,
    pub cloud: String,
    pub region: String,
    pub credential: Option<CredentialTag>,
    /// Opaque model configuration, passed through to the controller.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A successful remote creation: the real external identifier plus whatever
/// metadata the controller reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedWorkload {
    pub external_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Credential material as sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPayload {
    pub tag: CredentialTag,
    pub auth_type: String,
    pub attributes: BTreeMap<String, String>,
}

/// Outcome of a credential check or update for one dependent workload on
/// one controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadCredentialResult {
    pub workload: String,
    /// `None` means the workload accepted (or would accept) the credential.
    pub error: Option<String>,
}

impl WorkloadCredentialResult {
    pub fn ok(workload: impl Into<String>) -> Self {
        Self {
            workload: workload.into(),
            error: None,
        }
    }

    pub fn failed(workload: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            workload: workload.into(),
            error: Some(error.into()),
        }
    }
}

/// One live connection to one controller. Dropping the client releases the
/// connection.
#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<CreatedWorkload>;

    async fn grant_access(
        &self,
        external_id: &str,
        principal: &str,
        level: AccessLevel,
    ) -> Result<()>;

    async fn revoke_access(
        &self,
        external_id: &str,
        principal: &str,
        level: AccessLevel,
    ) -> Result<()>;

    /// Push new credential material; returns the per-workload outcomes for
    /// every dependent workload on this controller.
    async fn update_credential(
        &self,
        payload: &CredentialPayload,
    ) -> Result<Vec<WorkloadCredentialResult>>;

    async fn revoke_credential(&self, tag: &CredentialTag) -> Result<()>;

    /// Dry-run validation: would dependent workloads still function with
    /// this credential material? Mutates nothing.
    async fn check_credential_models(
        &self,
        payload: &CredentialPayload,
    ) -> Result<Vec<WorkloadCredentialResult>>;
}

/// Dials a fresh connection to a controller. Fan-out code calls this once
/// per task; failures classify as `Transient` so callers can try another
/// candidate.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, controller: &ControllerRecord) -> Result<Box<dyn ControllerClient>>;
}
