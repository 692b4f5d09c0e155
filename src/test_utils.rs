//! Simulated collaborators for tests: a scripted controller network that
//! stands in for the RPC seam, with programmable failures, injected
//! latency, and call recording.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::access::AccessLevel;
use crate::record::{ControllerRecord, ControllerTag, CredentialRecord, CredentialTag};
use crate::rpc::{
    Connector, ControllerClient, CreatedWorkload, CredentialPayload, WorkloadCredentialResult,
    WorkloadSpec,
};
use crate::{Error, ErrorKind, Result};

/// A scripted outcome: success value, or an error to synthesize.
#[derive(Debug, Clone)]
pub enum Scripted<T> {
    Ok(T),
    Fail(ErrorKind, String),
}

impl<T: Clone> Scripted<T> {
    fn resolve(&self) -> Result<T> {
        match self {
            Scripted::Ok(v) => Ok(v.clone()),
            Scripted::Fail(kind, msg) => Err(synthesize(*kind, msg)),
        }
    }
}

fn synthesize(kind: ErrorKind, msg: &str) -> Error {
    match kind {
        ErrorKind::NotFound => Error::NotFound(msg.into()),
        ErrorKind::AlreadyExists => Error::AlreadyExists(msg.into()),
        ErrorKind::Unauthorized => Error::Unauthorized,
        ErrorKind::Forbidden => Error::Forbidden(msg.into()),
        ErrorKind::Transient => Error::Transient(msg.into()),
        ErrorKind::InvalidRequest => Error::InvalidRequest(msg.into()),
        ErrorKind::Timeout => Error::Timeout(msg.into()),
        _ => Error::Other(anyhow::anyhow!("{msg}")),
    }
}

/// One simulated controller's behavior and call log.
#[derive(Debug, Default)]
pub struct ControllerSim {
    /// Fail this many dials with `Transient` before connecting normally.
    connect_failures: AtomicUsize,
    /// Injected latency before every RPC reply.
    latency: Mutex<Option<Duration>>,
    /// Queue of outcomes for successive `create_workload` calls; empty
    /// queue means succeed with a fresh external id.
    create_outcomes: Mutex<VecDeque<Scripted<CreatedWorkload>>>,
    update_outcome: Mutex<Option<Scripted<Vec<WorkloadCredentialResult>>>>,
    check_outcome: Mutex<Option<Scripted<Vec<WorkloadCredentialResult>>>>,
    revoke_outcome: Mutex<Option<Scripted<()>>>,
    grant_outcome: Mutex<Option<Scripted<()>>>,
    calls: Mutex<Vec<String>>,
}

impl ControllerSim {
    pub fn fail_connects(&self, times: usize) {
        self.connect_failures.store(times, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn push_create(&self, outcome: Scripted<CreatedWorkload>) {
        self.create_outcomes.lock().push_back(outcome);
    }

    pub fn fail_create(&self, kind: ErrorKind, msg: &str) {
        self.push_create(Scripted::Fail(kind, msg.into()));
    }

    pub fn set_update(&self, outcome: Scripted<Vec<WorkloadCredentialResult>>) {
        *self.update_outcome.lock() = Some(outcome);
    }

    pub fn set_check(&self, outcome: Scripted<Vec<WorkloadCredentialResult>>) {
        *self.check_outcome.lock() = Some(outcome);
    }

    pub fn set_revoke(&self, outcome: Scripted<()>) {
        *self.revoke_outcome.lock() = Some(outcome);
    }

    pub fn set_grant(&self, outcome: Scripted<()>) {
        *self.grant_outcome.lock() = Some(outcome);
    }

    /// Every RPC issued against this controller, in order, as
    /// `"<operation> <argument>"` strings.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_named(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(operation))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    async fn lag(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

/// The simulated fleet: hands out one client per dial, like a real
/// connector, all backed by the per-controller scripts.
#[derive(Debug, Default)]
pub struct SimNetwork {
    controllers: DashMap<String, Arc<ControllerSim>>,
    dials: AtomicUsize,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// The script for one controller, created on first use.
    pub fn controller(&self, tag: &ControllerTag) -> Arc<ControllerSim> {
        self.controllers
            .entry(tag.to_string())
            .or_insert_with(|| Arc::new(ControllerSim::default()))
            .clone()
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for SimNetwork {
    async fn connect(&self, controller: &ControllerRecord) -> Result<Box<dyn ControllerClient>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let sim = self.controller(&controller.tag);

        let remaining = sim.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            sim.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Transient(format!(
                "cannot dial controller {}",
                controller.tag
            )));
        }

        Ok(Box::new(SimClient { sim }))
    }
}

struct SimClient {
    sim: Arc<ControllerSim>,
}

#[async_trait]
impl ControllerClient for SimClient {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<CreatedWorkload> {
        self.sim.record(format!("create_workload {}", spec.tag));
        self.sim.lag().await;
        let scripted = self.sim.create_outcomes.lock().pop_front();
        match scripted {
            Some(outcome) => outcome.resolve(),
            None => Ok(CreatedWorkload {
                external_id: format!("ext-{}", uuid::Uuid::new_v4()),
                metadata: BTreeMap::new(),
            }),
        }
    }

    async fn grant_access(
        &self,
        external_id: &str,
        principal: &str,
        level: AccessLevel,
    ) -> Result<()> {
        self.sim
            .record(format!("grant_access {external_id} {principal} {level:?}"));
        self.sim.lag().await;
        match &*self.sim.grant_outcome.lock() {
            Some(outcome) => outcome.resolve(),
            None => Ok(()),
        }
    }

    async fn revoke_access(
        &self,
        external_id: &str,
        principal: &str,
        level: AccessLevel,
    ) -> Result<()> {
        self.sim
            .record(format!("revoke_access {external_id} {principal} {level:?}"));
        self.sim.lag().await;
        Ok(())
    }

    async fn update_credential(
        &self,
        payload: &CredentialPayload,
    ) -> Result<Vec<WorkloadCredentialResult>> {
        self.sim.record(format!("update_credential {}", payload.tag));
        self.sim.lag().await;
        match &*self.sim.update_outcome.lock() {
            Some(outcome) => outcome.resolve(),
            None => Ok(Vec::new()),
        }
    }

    async fn revoke_credential(&self, tag: &CredentialTag) -> Result<()> {
        self.sim.record(format!("revoke_credential {tag}"));
        self.sim.lag().await;
        match &*self.sim.revoke_outcome.lock() {
            Some(outcome) => outcome.resolve(),
            None => Ok(()),
        }
    }

    async fn check_credential_models(
        &self,
        payload: &CredentialPayload,
    ) -> Result<Vec<WorkloadCredentialResult>> {
        self.sim
            .record(format!("check_credential_models {}", payload.tag));
        self.sim.lag().await;
        match &*self.sim.check_outcome.lock() {
            Some(outcome) => outcome.resolve(),
            None => Ok(Vec::new()),
        }
    }
}

/// A public controller record ready for placement.
pub fn public_controller(owner: &str, name: &str, cloud: &str, region: &str) -> ControllerRecord {
    let mut record = ControllerRecord::new(ControllerTag::new(owner, name), cloud, region);
    record.public = true;
    record.endpoints = vec![format!("{name}.fleet.internal:17070")];
    record
}

/// A credential record already deployed on the given controllers.
pub fn deployed_credential(
    tag: CredentialTag,
    controllers: &[ControllerTag],
) -> CredentialRecord {
    let mut record = CredentialRecord::new(tag, "access-key");
    record
        .attributes
        .insert("access-key".into(), "AKIA-test".into());
    record.controllers = controllers.iter().cloned().collect();
    record
}
