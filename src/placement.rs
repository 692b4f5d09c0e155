//! Workload placement: pick a controller out of a filtered, shuffled
//! candidate set, reserve the workload's identity locally, create it
//! remotely with failover across candidates, and reconcile or roll back.

use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::access::{self, AccessLevel};
use crate::credential::{connect, Distributor};
use crate::record::{
    ControllerRecord, ControllerTag, CredentialTag, WorkloadRecord, WorkloadStatus, WorkloadTag,
};
use crate::rpc::{Connector, ControllerClient, CreatedWorkload, WorkloadSpec};
use crate::store::Store;
use crate::time::Clock;
use crate::{Error, ErrorKind, Identity, Result};

#[derive(Debug, Clone)]
pub struct PlacerConfig {
    /// The service's own principal, granted admin on every remote workload
    /// so subsequent management calls function.
    pub service_principal: String,
}

impl Default for PlacerConfig {
    fn default() -> Self {
        Self {
            service_principal: "fleetcore-admin".into(),
        }
    }
}

/// Caller-supplied parameters for `create_workload`.
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub owner: String,
    pub name: String,
    pub cloud: String,
    /// Empty means any region in the cloud.
    pub region: String,
    /// Pin to one controller instead of enumerating candidates.
    pub controller: Option<ControllerTag>,
    /// Explicit credential; otherwise the caller's credentials for the
    /// cloud are scanned.
    pub credential: Option<CredentialTag>,
    /// Opaque model configuration forwarded to the controller untouched.
    pub config: serde_json::Value,
}

pub struct Placer {
    store: Arc<dyn Store>,
    connector: Arc<dyn Connector>,
    distributor: Arc<Distributor>,
    clock: Arc<dyn Clock>,
    config: PlacerConfig,
}

impl Placer {
    pub fn new(
        store: Arc<dyn Store>,
        connector: Arc<dyn Connector>,
        distributor: Arc<Distributor>,
        clock: Arc<dyn Clock>,
        config: PlacerConfig,
    ) -> Self {
        Self {
            store,
            connector,
            distributor,
            clock,
            config,
        }
    }

    /// Create a workload on some eligible controller.
    ///
    /// The owner/name pair is reserved locally (placeholder external id)
    /// before any controller is contacted, so concurrent calls for the
    /// same pair are serialized by the store's insert uniqueness: one wins
    /// the reservation, the rest get `AlreadyExists` immediately.
    ///
    /// A failed post-creation admin grant leaves the record finalized in
    /// `MissingAdminGrant` status and returns the grant error, so the
    /// defect is both observable and surfaced.
    pub async fn create_workload(
        &self,
        identity: &dyn Identity,
        params: CreateParams,
    ) -> Result<WorkloadRecord> {
        access::require_owner(identity, &params.owner)?;

        let credential = self.select_credential(identity, &params).await?;
        let candidates = self.eligible_controllers(identity, &params).await?;

        let tag = WorkloadTag::new(params.owner.clone(), params.name.clone());
        let placeholder = WorkloadRecord {
            tag: tag.clone(),
            external_id: format!("creating-{}", uuid::Uuid::new_v4()),
            controller: None,
            credential: credential.clone(),
            cloud: params.cloud.clone(),
            region: params.region.clone(),
            created_at: self.clock.now(),
            status: WorkloadStatus::Creating,
            acl: Default::default(),
        };
        self.store.insert_workload(placeholder.clone()).await?;
        debug!(workload = %tag, external_id = %placeholder.external_id, "reserved workload identity");

        match self
            .try_candidates(&tag, &candidates, credential.as_ref(), &params)
            .await
        {
            Ok((controller, client, created)) => {
                self.finalize(placeholder, controller, client.as_ref(), created)
                    .await
            }
            Err(e) => {
                self.rollback(&tag).await;
                Err(e)
            }
        }
    }

    /// Grant a principal a level on a workload, remotely then locally.
    /// Admin-level callers only; the workload is invisible (`NotFound`) to
    /// callers without read access.
    pub async fn grant_access(
        &self,
        identity: &dyn Identity,
        tag: &WorkloadTag,
        principal: &str,
        level: AccessLevel,
    ) -> Result<()> {
        let mut workload = self.visible_workload(identity, tag).await?;
        access::can_admin(identity, &workload.acl, &workload.tag.owner)?;

        if let Some(controller) = &workload.controller {
            let client = connect(&self.store, &self.connector, &self.clock, controller).await?;
            client
                .grant_access(&workload.external_id, principal, level)
                .await?;
        }
        workload.acl.grant(principal, level);
        self.store.update_workload(workload).await?;
        info!(workload = %tag, principal, ?level, "access granted");
        Ok(())
    }

    /// Retract a principal's level (and everything below it), remotely then
    /// locally.
    pub async fn revoke_access(
        &self,
        identity: &dyn Identity,
        tag: &WorkloadTag,
        principal: &str,
        level: AccessLevel,
    ) -> Result<()> {
        let mut workload = self.visible_workload(identity, tag).await?;
        access::can_admin(identity, &workload.acl, &workload.tag.owner)?;

        if let Some(controller) = &workload.controller {
            let client = connect(&self.store, &self.connector, &self.clock, controller).await?;
            client
                .revoke_access(&workload.external_id, principal, level)
                .await?;
        }
        workload.acl.revoke(principal, level);
        self.store.update_workload(workload).await?;
        info!(workload = %tag, principal, ?level, "access revoked");
        Ok(())
    }

    /// Load a workload, presenting `NotFound` to callers who cannot read
    /// it so existence never leaks.
    async fn visible_workload(
        &self,
        identity: &dyn Identity,
        tag: &WorkloadTag,
    ) -> Result<WorkloadRecord> {
        let workload = self.store.workload(tag).await?;
        if access::can_read(identity, &workload.acl, &workload.tag.owner).is_err() {
            return Err(Error::not_found(format!("workload {tag}")));
        }
        Ok(workload)
    }

    /// Resolve which credential the new workload will use.
    ///
    /// Explicit tags must belong to the caller and not be revoked; with no
    /// explicit tag, the caller's credentials for the cloud are scanned —
    /// exactly one match selects it, none is allowed (some backends need no
    /// credential), more than one is an ambiguity the caller must resolve.
    async fn select_credential(
        &self,
        identity: &dyn Identity,
        params: &CreateParams,
    ) -> Result<Option<CredentialTag>> {
        if let Some(tag) = &params.credential {
            if !access::is_owner(identity, &tag.owner) {
                // Hide other namespaces' credentials.
                return Err(Error::not_found(format!("credential {tag}")));
            }
            let record = self.store.credential(tag).await?;
            if record.revoked {
                return Err(Error::Forbidden(format!("credential {tag} is revoked")));
            }
            return Ok(Some(tag.clone()));
        }

        let mut matches: Vec<CredentialTag> = self
            .store
            .credentials_for_owner(&params.owner, &params.cloud)
            .await?
            .into_iter()
            .filter(|c| !c.revoked)
            .map(|c| c.tag)
            .collect();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches.remove(0))),
            _ => Err(Error::AmbiguousChoice {
                what: format!("credential for cloud {}", params.cloud),
                matches: matches.iter().map(ToString::to_string).collect(),
            }),
        }
    }

    /// Controllers eligible to host the new workload: matching cloud and
    /// region, visible to the caller, not deprecated — shuffled so load
    /// spreads across equally-eligible candidates.
    async fn eligible_controllers(
        &self,
        identity: &dyn Identity,
        params: &CreateParams,
    ) -> Result<Vec<ControllerRecord>> {
        if let Some(tag) = &params.controller {
            let record = self.store.controller(tag).await?;
            if !visible_to(identity, &record) {
                return Err(Error::not_found(format!("controller {tag}")));
            }
            if record.deprecated {
                return Err(Error::InvalidRequest(format!(
                    "controller {tag} is deprecated"
                )));
            }
            return Ok(vec![record]);
        }

        let mut candidates: Vec<ControllerRecord> = self
            .store
            .controllers()
            .await?
            .into_iter()
            .filter(|c| c.cloud == params.cloud)
            .filter(|c| params.region.is_empty() || c.region == params.region)
            .filter(|c| !c.deprecated)
            .filter(|c| visible_to(identity, c))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        Ok(candidates)
    }

    /// The failover loop: try each candidate in shuffled order until one
    /// accepts the workload or an outcome terminal for the whole placement
    /// appears.
    async fn try_candidates(
        &self,
        tag: &WorkloadTag,
        candidates: &[ControllerRecord],
        credential: Option<&CredentialTag>,
        params: &CreateParams,
    ) -> Result<(ControllerTag, Box<dyn ControllerClient>, CreatedWorkload)> {
        let spec = WorkloadSpec {
            tag: tag.clone(),
            cloud: params.cloud.clone(),
            region: params.region.clone(),
            credential: credential.cloned(),
            config: params.config.clone(),
        };

        for candidate in candidates {
            // The credential reaches the controller before the workload
            // that needs it.
            if let Some(cred) = credential {
                match self.distributor.deploy_to_controller(cred, candidate).await {
                    Ok(_) => {}
                    Err(e) if retriable(&e) => {
                        debug!(controller = %candidate.tag, error = %e, "credential push failed, trying next candidate");
                        continue;
                    }
                    Err(e) => {
                        return Err(e.context(format!(
                            "deploying credential {cred} to {}",
                            candidate.tag
                        )))
                    }
                }
            }

            let client =
                match connect(&self.store, &self.connector, &self.clock, &candidate.tag).await {
                    Ok(client) => client,
                    Err(e) => {
                        debug!(controller = %candidate.tag, error = %e, "controller unreachable, trying next candidate");
                        continue;
                    }
                };

            match client.create_workload(&spec).await {
                Ok(created) => {
                    info!(workload = %tag, controller = %candidate.tag, external_id = %created.external_id, "workload created");
                    return Ok((candidate.tag.clone(), client, created));
                }
                // The name is taken on the remote side: local and remote
                // state have diverged and need out-of-band reconciliation,
                // so no other candidate may be tried.
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    return Err(e.context(format!(
                        "workload name {tag} already in use on {}",
                        candidate.tag
                    )));
                }
                Err(e) if retriable(&e) => {
                    debug!(controller = %candidate.tag, error = %e, "creation failed, trying next candidate");
                    continue;
                }
                // Request-shaped rejection: no candidate can do better.
                Err(e) => {
                    return Err(e.context(format!("creating workload {tag} on {}", candidate.tag)))
                }
            }
        }

        Err(Error::not_found(format!(
            "no suitable controller for workload {tag} in cloud {}",
            params.cloud
        )))
    }

    /// Patch the reservation into the real workload record and grant the
    /// service its administrative access on the remote side.
    async fn finalize(
        &self,
        mut record: WorkloadRecord,
        controller: ControllerTag,
        client: &dyn ControllerClient,
        created: CreatedWorkload,
    ) -> Result<WorkloadRecord> {
        record.external_id = created.external_id;
        record.controller = Some(controller);
        record.status = WorkloadStatus::Ready;

        let grant = client
            .grant_access(
                &record.external_id,
                &self.config.service_principal,
                AccessLevel::Admin,
            )
            .await;
        if let Err(e) = grant {
            // Known defect state: the workload exists remotely without the
            // expected administrative grant. Finalize anyway, flag it, and
            // surface the failure for remediation.
            warn!(workload = %record.tag, error = %e, "admin grant failed; workload flagged");
            record.status = WorkloadStatus::MissingAdminGrant;
            self.store.update_workload(record.clone()).await?;
            return Err(e.context(format!(
                "granting {} admin on workload {}",
                self.config.service_principal, record.tag
            )));
        }

        self.store.update_workload(record.clone()).await?;
        Ok(record)
    }

    /// Best-effort removal of the reservation placeholder. An orphaned
    /// placeholder is preferred over masking the primary failure, so a
    /// rollback error is logged and swallowed.
    async fn rollback(&self, tag: &WorkloadTag) {
        if let Err(e) = self.store.remove_workload(tag).await {
            warn!(workload = %tag, error = %e, "failed to roll back workload reservation");
        }
    }
}

fn visible_to(identity: &dyn Identity, controller: &ControllerRecord) -> bool {
    controller.public
        || access::can_read(identity, &controller.acl, &controller.tag.owner).is_ok()
}

/// Remote transient conditions (unreachable, mid-upgrade, timed out) are
/// terminal for one attempt but not for the placement.
fn retriable(e: &Error) -> bool {
    matches!(e.kind(), ErrorKind::Transient | ErrorKind::Timeout)
}
