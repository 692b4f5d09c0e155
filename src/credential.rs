//! Credential distribution: propagate an update or revocation to every
//! controller a credential is deployed on, one task per controller, and
//! join the results under a deadline. Task completion order is unspecified,
//! so everything is aggregated keyed by controller identity, never by
//! arrival sequence.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::access::require_owner;
use crate::record::{ControllerRecord, ControllerTag, CredentialRecord, CredentialTag};
use crate::rpc::{Connector, ControllerClient, CredentialPayload, WorkloadCredentialResult};
use crate::secrets::SecretsStore;
use crate::store::Store;
use crate::time::Clock;
use crate::{Error, Identity, Result};

/// Whether to validate new attributes against dependent workloads before
/// persisting anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckMode {
    #[default]
    Skip,
    /// Run `check_credential_models` on every deployed controller first and
    /// abort, mutating nothing, if any workload would break.
    Require,
}

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Deadline for a whole fan-out. On expiry the join returns `Timeout`;
    /// already-dispatched tasks are detached and run to completion on their
    /// own connections, their results discarded.
    pub fanout_deadline: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            fanout_deadline: Duration::from_secs(30),
        }
    }
}

/// Outcome of an update fan-out: per-workload results keyed by controller,
/// plus the first classified error observed across the tasks. Partial
/// success is never discarded; a caller distinguishes "some controllers not
/// reachable" from "credential rejected" by the error's kind.
#[derive(Debug, Default)]
pub struct UpdateReport {
    pub results: BTreeMap<ControllerTag, Vec<WorkloadCredentialResult>>,
    pub first_error: Option<Error>,
}

impl UpdateReport {
    pub fn fully_applied(&self) -> bool {
        self.first_error.is_none()
    }
}

pub struct Distributor {
    store: Arc<dyn Store>,
    connector: Arc<dyn Connector>,
    secrets: Option<Arc<dyn SecretsStore>>,
    clock: Arc<dyn Clock>,
    config: DistributorConfig,
}

impl Distributor {
    pub fn new(
        store: Arc<dyn Store>,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
        config: DistributorConfig,
    ) -> Self {
        Self {
            store,
            connector,
            secrets: None,
            clock,
            config,
        }
    }

    /// Route attribute bags to a secrets backend instead of the record
    /// store; persisted records then carry an empty bag.
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretsStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Create or update a credential and push it to every controller it is
    /// deployed on.
    ///
    /// Under `CheckMode::Require` every deployed controller first validates
    /// the new attributes in parallel; one controller's validation failure
    /// does not stop the others, but any failure aborts the update before
    /// any persisted state changes.
    pub async fn update_credential(
        &self,
        identity: &dyn Identity,
        tag: &CredentialTag,
        auth_type: &str,
        attributes: BTreeMap<String, String>,
        mode: CheckMode,
    ) -> Result<UpdateReport> {
        require_owner(identity, &tag.owner)?;

        let existing = match self.store.credential(tag).await {
            Ok(record) => {
                if record.revoked {
                    return Err(Error::Forbidden(format!("credential {tag} is revoked")));
                }
                Some(record)
            }
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let deployed: Vec<ControllerTag> = existing
            .as_ref()
            .map(|r| r.controllers.iter().cloned().collect())
            .unwrap_or_default();

        let payload = CredentialPayload {
            tag: tag.clone(),
            auth_type: auth_type.to_string(),
            attributes: attributes.clone(),
        };

        if mode == CheckMode::Require && !deployed.is_empty() {
            self.check_against_workloads(tag, &deployed, &payload).await?;
        }

        // Persist through a single-document update, never a whole-record
        // replace: a deployment recorded concurrently (placement pushing
        // this credential to a fresh controller) must survive the write.
        // Every controller deployed at write time stays marked
        // update-needed until its push is confirmed.
        let stored = match &self.secrets {
            Some(secrets) => {
                secrets.put(tag, attributes).await?;
                BTreeMap::new()
            }
            None => attributes,
        };
        let deployed = if existing.is_some() {
            self.store
                .set_credential_attributes(tag, auth_type, stored)
                .await?
        } else {
            let mut record = CredentialRecord::new(tag.clone(), auth_type);
            record.attributes = stored;
            self.store.put_credential(record).await?;
            BTreeSet::new()
        };
        info!(credential = %tag, controllers = deployed.len(), "credential persisted, propagating");

        if deployed.is_empty() {
            return Ok(UpdateReport::default());
        }

        let mut tasks: JoinSet<(ControllerTag, Result<Vec<WorkloadCredentialResult>>)> =
            JoinSet::new();
        for controller in deployed {
            let store = self.store.clone();
            let connector = self.connector.clone();
            let clock = self.clock.clone();
            let payload = payload.clone();
            let tag = tag.clone();
            tasks.spawn(async move {
                let outcome = async {
                    let client = connect(&store, &connector, &clock, &controller).await?;
                    let results = client.update_credential(&payload).await?;
                    store.clear_update_needed(&tag, &controller).await?;
                    Ok(results)
                }
                .await;
                (controller, outcome)
            });
        }

        let mut report = UpdateReport::default();
        self.join_keyed(&mut tasks, |controller, outcome| match outcome {
            Ok(results) => {
                report.results.insert(controller, results);
            }
            Err(e) => {
                warn!(controller = %controller, error = %e, "credential push failed");
                if report.first_error.is_none() {
                    report.first_error =
                        Some(e.context(format!("updating credential {tag} on {controller}")));
                }
            }
        })
        .await?;
        Ok(report)
    }

    /// Revoke a credential everywhere it is deployed.
    ///
    /// Refused while any workload still references the credential. The
    /// in-use check and the mutation are two separate store operations; a
    /// workload created with this credential in between slips through the
    /// gap (see DESIGN.md).
    pub async fn revoke_credential(
        &self,
        identity: &dyn Identity,
        tag: &CredentialTag,
    ) -> Result<()> {
        require_owner(identity, &tag.owner)?;
        let record = self.store.credential(tag).await?;
        if record.revoked && record.controllers.is_empty() {
            return Ok(());
        }

        let in_use = self.store.count_workloads_using(tag).await?;
        if in_use > 0 {
            return Err(Error::Forbidden(format!(
                "credential {tag} is in use by {in_use} workload(s)"
            )));
        }

        self.store.set_credential_revoked(tag).await?;
        if let Some(secrets) = &self.secrets {
            secrets.delete(tag).await?;
        }
        info!(credential = %tag, controllers = record.controllers.len(), "credential revoked, propagating");

        let mut tasks: JoinSet<(ControllerTag, Result<()>)> = JoinSet::new();
        for controller in record.controllers {
            let store = self.store.clone();
            let connector = self.connector.clone();
            let clock = self.clock.clone();
            let tag = tag.clone();
            tasks.spawn(async move {
                let outcome = async {
                    let client = connect(&store, &connector, &clock, &controller).await?;
                    client.revoke_credential(&tag).await?;
                    store.remove_credential_controller(&tag, &controller).await?;
                    Ok(())
                }
                .await;
                (controller, outcome)
            });
        }

        let mut first_error: Option<Error> = None;
        self.join_keyed(&mut tasks, |controller, outcome| {
            if let Err(e) = outcome {
                warn!(controller = %controller, error = %e, "credential revocation push failed");
                if first_error.is_none() {
                    first_error =
                        Some(e.context(format!("revoking credential {tag} on {controller}")));
                }
            }
        })
        .await?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Single-controller path used by placement: push the credential to one
    /// controller and record the deployment on success.
    pub async fn deploy_to_controller(
        &self,
        tag: &CredentialTag,
        controller: &ControllerRecord,
    ) -> Result<Vec<WorkloadCredentialResult>> {
        let record = self.store.credential(tag).await?;
        if record.revoked {
            return Err(Error::Forbidden(format!("credential {tag} is revoked")));
        }
        let payload = self.payload_of(&record).await?;

        let client = connect(&self.store, &self.connector, &self.clock, &controller.tag).await?;
        let results = client.update_credential(&payload).await?;
        self.store
            .add_credential_controller(tag, &controller.tag)
            .await?;
        debug!(credential = %tag, controller = %controller.tag, "credential deployed");
        Ok(results)
    }

    /// Wire payload for a stored credential, pulling the attribute bag back
    /// out of the secrets backend when one is configured.
    async fn payload_of(&self, record: &CredentialRecord) -> Result<CredentialPayload> {
        let attributes = match &self.secrets {
            Some(secrets) if record.attributes.is_empty() => secrets.get(&record.tag).await?,
            _ => record.attributes.clone(),
        };
        Ok(CredentialPayload {
            tag: record.tag.clone(),
            auth_type: record.auth_type.clone(),
            attributes,
        })
    }

    /// Parallel dry-run validation against every deployed controller. All
    /// controllers are consulted before any verdict: a rejection on one
    /// does not cut the others short. Checks dispatched when the deadline
    /// expires run to completion on their own, verdicts discarded.
    async fn check_against_workloads(
        &self,
        tag: &CredentialTag,
        deployed: &[ControllerTag],
        payload: &CredentialPayload,
    ) -> Result<()> {
        let mut tasks: JoinSet<(ControllerTag, Result<Vec<WorkloadCredentialResult>>)> =
            JoinSet::new();
        for controller in deployed {
            let store = self.store.clone();
            let connector = self.connector.clone();
            let clock = self.clock.clone();
            let payload = payload.clone();
            let controller = controller.clone();
            tasks.spawn(async move {
                let outcome = async {
                    let client = connect(&store, &connector, &clock, &controller).await?;
                    client.check_credential_models(&payload).await
                }
                .await;
                (controller, outcome)
            });
        }

        let mut first_error: Option<Error> = None;
        let mut rejected: Vec<String> = Vec::new();
        self.join_keyed(&mut tasks, |controller, outcome| match outcome {
            Ok(results) => {
                for r in results.iter().filter(|r| r.error.is_some()) {
                    rejected.push(format!("{} on {controller}", r.workload));
                }
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error =
                        Some(e.context(format!("checking credential {tag} on {controller}")));
                }
            }
        })
        .await?;

        if let Some(e) = first_error {
            return Err(e);
        }
        if !rejected.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "credential {tag} would break workload(s): {}",
                rejected.join(", ")
            )));
        }
        Ok(())
    }

    /// Join all fan-out tasks under the configured deadline, feeding each
    /// completed task's keyed outcome to `sink`. On deadline expiry the
    /// remaining tasks are detached (they run to completion and release
    /// their own connections) and the join fails with `Timeout`.
    async fn join_keyed<T: Send + 'static>(
        &self,
        tasks: &mut JoinSet<(ControllerTag, T)>,
        mut sink: impl FnMut(ControllerTag, T),
    ) -> Result<()> {
        let started = tokio::time::Instant::now();
        while !tasks.is_empty() {
            let remaining = self
                .config
                .fanout_deadline
                .saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, tasks.join_next()).await {
                Ok(Some(Ok((controller, outcome)))) => sink(controller, outcome),
                Ok(Some(Err(join_err))) => {
                    return Err(Error::Other(anyhow::anyhow!(
                        "fan-out task panicked: {join_err}"
                    )));
                }
                Ok(None) => break,
                Err(_) => {
                    tasks.detach_all();
                    return Err(Error::Timeout(format!(
                        "credential fan-out exceeded {:?}",
                        self.config.fanout_deadline
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Dial a controller, keeping its outage bookkeeping current: the first
/// failed dial stamps `unavailable_since`, the next success clears it.
pub(crate) async fn connect(
    store: &Arc<dyn Store>,
    connector: &Arc<dyn Connector>,
    clock: &Arc<dyn Clock>,
    controller: &ControllerTag,
) -> Result<Box<dyn ControllerClient>> {
    let record = store.controller(controller).await?;
    match connector.connect(&record).await {
        Ok(client) => {
            if record.unavailable_since.is_some() {
                store.clear_controller_unavailable(controller).await?;
            }
            Ok(client)
        }
        Err(e) => {
            // Best effort; the dial error is the one worth reporting.
            if let Err(mark_err) = store
                .mark_controller_unavailable(controller, clock.now())
                .await
            {
                warn!(controller = %controller, error = %mark_err, "failed to record controller outage");
            }
            Err(e)
        }
    }
}
