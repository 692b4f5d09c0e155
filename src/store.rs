//! The record store seam. The core treats persistence as a transactional
//! key/document store whose only synchronization primitive is the atomic
//! single-document update; `MemoryStore` provides that with one dashmap
//! entry lock per document, which is all the CAS semantics require.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::record::{
    ControllerRecord, ControllerTag, CredentialRecord, CredentialTag, LeaseHolding,
    WorkloadRecord, WorkloadTag,
};
use crate::{Error, Result};

#[async_trait]
pub trait Store: Send + Sync {
    // Controllers.

    async fn insert_controller(&self, record: ControllerRecord) -> Result<()>;
    async fn controller(&self, tag: &ControllerTag) -> Result<ControllerRecord>;
    async fn controllers(&self) -> Result<Vec<ControllerRecord>>;
    /// Refused while the controller still hosts workloads.
    async fn remove_controller(&self, tag: &ControllerTag) -> Result<()>;

    /// Atomically replace the controller's lease pair, but only if the
    /// stored pair exactly equals `expected`. On mismatch returns
    /// `ConditionFailed` carrying the pair actually stored.
    async fn compare_and_set_lease(
        &self,
        tag: &ControllerTag,
        expected: &LeaseHolding,
        next: &LeaseHolding,
    ) -> Result<()>;

    /// Record the start of an outage. Keeps an earlier timestamp if one is
    /// already set, so the field marks when the outage began.
    async fn mark_controller_unavailable(
        &self,
        tag: &ControllerTag,
        at: DateTime<Utc>,
    ) -> Result<()>;
    async fn clear_controller_unavailable(&self, tag: &ControllerTag) -> Result<()>;

    // Workloads.

    async fn insert_workload(&self, record: WorkloadRecord) -> Result<()>;
    async fn workload(&self, tag: &WorkloadTag) -> Result<WorkloadRecord>;
    /// Full-document replace of an existing workload.
    async fn update_workload(&self, record: WorkloadRecord) -> Result<()>;
    async fn remove_workload(&self, tag: &WorkloadTag) -> Result<()>;
    async fn count_workloads_using(&self, credential: &CredentialTag) -> Result<usize>;
    async fn count_workloads_on(&self, controller: &ControllerTag) -> Result<usize>;

    // Credentials.

    /// Insert or replace; credential writes are last-writer-wins upserts.
    async fn put_credential(&self, record: CredentialRecord) -> Result<()>;
    async fn credential(&self, tag: &CredentialTag) -> Result<CredentialRecord>;
    async fn credentials_for_owner(
        &self,
        owner: &str,
        cloud: &str,
    ) -> Result<Vec<CredentialRecord>>;
    async fn add_credential_controller(
        &self,
        tag: &CredentialTag,
        controller: &ControllerTag,
    ) -> Result<()>;
    async fn remove_credential_controller(
        &self,
        tag: &CredentialTag,
        controller: &ControllerTag,
    ) -> Result<()>;
    /// Replace the auth type and attribute bag in one document update,
    /// marking every currently-deployed controller as holding a stale
    /// copy. Returns the deployed set captured by that same update, so a
    /// deployment recorded concurrently is either in the returned set or
    /// untouched by the write, never lost.
    async fn set_credential_attributes(
        &self,
        tag: &CredentialTag,
        auth_type: &str,
        attributes: BTreeMap<String, String>,
    ) -> Result<BTreeSet<ControllerTag>>;
    async fn clear_update_needed(
        &self,
        tag: &CredentialTag,
        controller: &ControllerTag,
    ) -> Result<()>;
    /// Flip the revoked flag and empty the attribute bag in one document
    /// update.
    async fn set_credential_revoked(&self, tag: &CredentialTag) -> Result<()>;
}

/// Dashmap-backed store. Every mutation happens under the entry lock for its
/// document, which gives the atomic single-document update the trait
/// promises.
#[derive(Debug, Default)]
pub struct MemoryStore {
    controllers: DashMap<String, ControllerRecord>,
    workloads: DashMap<String, WorkloadRecord>,
    credentials: DashMap<String, CredentialRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_credential<T>(
        &self,
        tag: &CredentialTag,
        f: impl FnOnce(&mut CredentialRecord) -> T,
    ) -> Result<T> {
        let mut entry = self
            .credentials
            .get_mut(&tag.to_string())
            .ok_or_else(|| Error::not_found(format!("credential {tag}")))?;
        Ok(f(entry.value_mut()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_controller(&self, record: ControllerRecord) -> Result<()> {
        let key = record.tag.to_string();
        match self.controllers.entry(key) {
            Entry::Occupied(_) => Err(Error::already_exists(format!(
                "controller {}",
                record.tag
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn controller(&self, tag: &ControllerTag) -> Result<ControllerRecord> {
        self.controllers
            .get(&tag.to_string())
            .map(|r| r.clone())
            .ok_or_else(|| Error::not_found(format!("controller {tag}")))
    }

    async fn controllers(&self) -> Result<Vec<ControllerRecord>> {
        Ok(self.controllers.iter().map(|r| r.clone()).collect())
    }

    async fn remove_controller(&self, tag: &ControllerTag) -> Result<()> {
        let hosted = self.count_workloads_on(tag).await?;
        if hosted > 0 {
            return Err(Error::Forbidden(format!(
                "controller {tag} still hosts {hosted} workload(s)"
            )));
        }
        self.controllers
            .remove(&tag.to_string())
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("controller {tag}")))
    }

    async fn compare_and_set_lease(
        &self,
        tag: &ControllerTag,
        expected: &LeaseHolding,
        next: &LeaseHolding,
    ) -> Result<()> {
        let mut entry = self
            .controllers
            .get_mut(&tag.to_string())
            .ok_or_else(|| Error::not_found(format!("controller {tag}")))?;
        let record = entry.value_mut();
        if record.lease != *expected {
            return Err(Error::ConditionFailed {
                holder: record.lease.holder.clone(),
                expiry: record.lease.expiry,
            });
        }
        record.lease = next.clone();
        Ok(())
    }

    async fn mark_controller_unavailable(
        &self,
        tag: &ControllerTag,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut entry = self
            .controllers
            .get_mut(&tag.to_string())
            .ok_or_else(|| Error::not_found(format!("controller {tag}")))?;
        let record = entry.value_mut();
        if record.unavailable_since.is_none() {
            record.unavailable_since = Some(at);
        }
        Ok(())
    }

    async fn clear_controller_unavailable(&self, tag: &ControllerTag) -> Result<()> {
        let mut entry = self
            .controllers
            .get_mut(&tag.to_string())
            .ok_or_else(|| Error::not_found(format!("controller {tag}")))?;
        entry.value_mut().unavailable_since = None;
        Ok(())
    }

    async fn insert_workload(&self, record: WorkloadRecord) -> Result<()> {
        let key = record.tag.to_string();
        match self.workloads.entry(key) {
            Entry::Occupied(_) => {
                Err(Error::already_exists(format!("workload {}", record.tag)))
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn workload(&self, tag: &WorkloadTag) -> Result<WorkloadRecord> {
        self.workloads
            .get(&tag.to_string())
            .map(|r| r.clone())
            .ok_or_else(|| Error::not_found(format!("workload {tag}")))
    }

    async fn update_workload(&self, record: WorkloadRecord) -> Result<()> {
        let mut entry = self
            .workloads
            .get_mut(&record.tag.to_string())
            .ok_or_else(|| Error::not_found(format!("workload {}", record.tag)))?;
        *entry.value_mut() = record;
        Ok(())
    }

    async fn remove_workload(&self, tag: &WorkloadTag) -> Result<()> {
        self.workloads
            .remove(&tag.to_string())
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("workload {tag}")))
    }

    async fn count_workloads_using(&self, credential: &CredentialTag) -> Result<usize> {
        Ok(self
            .workloads
            .iter()
            .filter(|w| w.credential.as_ref() == Some(credential))
            .count())
    }

    async fn count_workloads_on(&self, controller: &ControllerTag) -> Result<usize> {
        Ok(self
            .workloads
            .iter()
            .filter(|w| w.controller.as_ref() == Some(controller))
            .count())
    }

    async fn put_credential(&self, record: CredentialRecord) -> Result<()> {
        self.credentials.insert(record.tag.to_string(), record);
        Ok(())
    }

    async fn credential(&self, tag: &CredentialTag) -> Result<CredentialRecord> {
        self.credentials
            .get(&tag.to_string())
            .map(|r| r.clone())
            .ok_or_else(|| Error::not_found(format!("credential {tag}")))
    }

    async fn credentials_for_owner(
        &self,
        owner: &str,
        cloud: &str,
    ) -> Result<Vec<CredentialRecord>> {
        Ok(self
            .credentials
            .iter()
            .filter(|c| c.tag.owner == owner && c.tag.cloud == cloud)
            .map(|c| c.clone())
            .collect())
    }

    async fn add_credential_controller(
        &self,
        tag: &CredentialTag,
        controller: &ControllerTag,
    ) -> Result<()> {
        self.with_credential(tag, |c| {
            c.controllers.insert(controller.clone());
        })
    }

    async fn remove_credential_controller(
        &self,
        tag: &CredentialTag,
        controller: &ControllerTag,
    ) -> Result<()> {
        self.with_credential(tag, |c| {
            c.controllers.remove(controller);
            c.update_needed.remove(controller);
        })
    }

    async fn set_credential_attributes(
        &self,
        tag: &CredentialTag,
        auth_type: &str,
        attributes: BTreeMap<String, String>,
    ) -> Result<BTreeSet<ControllerTag>> {
        self.with_credential(tag, |c| {
            c.auth_type = auth_type.to_string();
            c.attributes = attributes;
            let deployed = c.controllers.clone();
            c.update_needed.extend(deployed.iter().cloned());
            deployed
        })
    }

    async fn clear_update_needed(
        &self,
        tag: &CredentialTag,
        controller: &ControllerTag,
    ) -> Result<()> {
        self.with_credential(tag, |c| {
            c.update_needed.remove(controller);
        })
    }

    async fn set_credential_revoked(&self, tag: &CredentialTag) -> Result<()> {
        self.with_credential(tag, |c| {
            c.revoked = true;
            c.attributes.clear();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ControllerRecord, WorkloadStatus};

    #[tokio::test]
    async fn insert_is_unique_per_tag() {
        let store = MemoryStore::new();
        let tag = ControllerTag::new("alice", "eu-1");
        let record = ControllerRecord::new(tag.clone(), "aws", "eu-west-1");

        store.insert_controller(record.clone()).await.unwrap();
        let err = store.insert_controller(record).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn cas_reports_the_stored_pair_on_mismatch() {
        let store = MemoryStore::new();
        let tag = ControllerTag::new("alice", "eu-1");
        store
            .insert_controller(ControllerRecord::new(tag.clone(), "aws", "eu-west-1"))
            .await
            .unwrap();

        let now = Utc::now();
        let held = LeaseHolding::held_by("worker-1", now + chrono::Duration::seconds(15));
        store
            .compare_and_set_lease(&tag, &LeaseHolding::free(), &held)
            .await
            .unwrap();

        // Losing CAS sees the winner's pair.
        let rival = LeaseHolding::held_by("worker-2", now + chrono::Duration::seconds(30));
        let err = store
            .compare_and_set_lease(&tag, &LeaseHolding::free(), &rival)
            .await
            .unwrap_err();
        match err {
            Error::ConditionFailed { holder, expiry } => {
                assert_eq!(holder, "worker-1");
                assert_eq!(expiry, held.expiry);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn controller_removal_refused_while_it_hosts_workloads() {
        let store = MemoryStore::new();
        let tag = ControllerTag::new("alice", "eu-1");
        store
            .insert_controller(ControllerRecord::new(tag.clone(), "aws", "eu-west-1"))
            .await
            .unwrap();

        let workload = WorkloadTag::new("alice", "db");
        store
            .insert_workload(WorkloadRecord {
                tag: workload.clone(),
                external_id: "ext-1".into(),
                controller: Some(tag.clone()),
                credential: None,
                cloud: "aws".into(),
                region: "eu-west-1".into(),
                created_at: Utc::now(),
                status: WorkloadStatus::Ready,
                acl: Default::default(),
            })
            .await
            .unwrap();

        let err = store.remove_controller(&tag).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Forbidden);
        assert!(store.controller(&tag).await.is_ok());

        // Once the last hosted workload is gone the removal goes through.
        store.remove_workload(&workload).await.unwrap();
        store.remove_controller(&tag).await.unwrap();
        assert!(store.controller(&tag).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn attribute_write_marks_the_deployed_set_it_captured() {
        let store = MemoryStore::new();
        let tag = CredentialTag::new("aws", "alice", "default");
        let a = ControllerTag::new("admin", "a");
        let b = ControllerTag::new("admin", "b");
        let mut record = CredentialRecord::new(tag.clone(), "access-key");
        record.controllers = BTreeSet::from([a.clone(), b.clone()]);
        store.put_credential(record).await.unwrap();

        let attributes = BTreeMap::from([("access-key".to_string(), "AKIA-2".to_string())]);
        let deployed = store
            .set_credential_attributes(&tag, "access-key", attributes.clone())
            .await
            .unwrap();
        assert_eq!(deployed, BTreeSet::from([a.clone(), b.clone()]));

        let stored = store.credential(&tag).await.unwrap();
        assert_eq!(stored.attributes, attributes);
        assert_eq!(stored.update_needed, deployed);
        assert_eq!(stored.controllers, deployed);
    }

    #[tokio::test]
    async fn unavailable_since_keeps_the_first_timestamp() {
        let store = MemoryStore::new();
        let tag = ControllerTag::new("alice", "eu-1");
        store
            .insert_controller(ControllerRecord::new(tag.clone(), "aws", "eu-west-1"))
            .await
            .unwrap();

        let first = Utc::now();
        store.mark_controller_unavailable(&tag, first).await.unwrap();
        store
            .mark_controller_unavailable(&tag, first + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(
            store.controller(&tag).await.unwrap().unavailable_since,
            Some(first)
        );

        store.clear_controller_unavailable(&tag).await.unwrap();
        assert_eq!(store.controller(&tag).await.unwrap().unavailable_since, None);
    }
}
