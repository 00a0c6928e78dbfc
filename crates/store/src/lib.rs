//! StatusHA store: an in-memory cluster that serves the directory traits.
//!
//! A topology is described by a [`TopologySpec`] (members + services with
//! their partition owners), frozen into an immutable [`ClusterSnapshot`] and
//! published through an `ArcSwap`. Readers resolve a service against the
//! snapshot current at resolve time, so one service is always read from a
//! single snapshot while later deltas swap in new ones.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use arc_swap::ArcSwap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use statusha_core::{
    ClusterDirectory, ClusterError, Member, MemberId, PartitionedService, ServiceHandle, DISTRIBUTED_CACHE,
    FIRST_BACKUP,
};
use tracing::{debug, info};

/// Owners of one partition. Ids that do not resolve to a live member read as unowned.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionSpec {
    #[serde(default)]
    pub primary: Option<MemberId>,
    #[serde(default)]
    pub backup: Option<MemberId>,
}

impl PartitionSpec {
    pub fn owned(primary: MemberId, backup: MemberId) -> Self { Self { primary: Some(primary), backup: Some(backup) } }
}

fn default_service_type() -> String { DISTRIBUTED_CACHE.to_string() }
fn default_true() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_true")]
    pub placement_strategy: bool,
    /// `None` for services without a partition table (replicated, invocation, ...).
    #[serde(default)]
    pub partitions: Option<Vec<PartitionSpec>>,
}

impl ServiceSpec {
    pub fn distributed(name: &str, partitions: Vec<PartitionSpec>) -> Self {
        Self { name: name.to_string(), service_type: default_service_type(), placement_strategy: true, partitions: Some(partitions) }
    }

    pub fn other(name: &str, service_type: &str) -> Self {
        Self { name: name.to_string(), service_type: service_type.to_string(), placement_strategy: false, partitions: None }
    }

    pub fn without_strategy(mut self) -> Self { self.placement_strategy = false; self }
}

/// File/wire form of a cluster topology.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologySpec {
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

impl TopologySpec {
    /// Parse YAML or JSON (chosen by file extension; anything but `.json` is read as YAML).
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading topology file {}", path.display()))?;
        let is_json = path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("json")).unwrap_or(false);
        let spec = if is_json {
            serde_json::from_str(&text).with_context(|| format!("parsing {} as JSON", path.display()))?
        } else {
            serde_yaml::from_str(&text).with_context(|| format!("parsing {} as YAML", path.display()))?
        };
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = FxHashSet::default();
        for m in &self.members {
            if !seen.insert(m.id) { bail!("duplicate member id {}", m.id); }
        }
        let mut names = FxHashSet::default();
        for s in &self.services {
            if !names.insert(s.name.as_str()) { bail!("duplicate service name {}", s.name); }
            for (i, p) in s.partitions.iter().flatten().enumerate() {
                for id in p.primary.iter().chain(p.backup.iter()) {
                    if !seen.contains(id) {
                        bail!("partition {} of service {} references unknown member {}", i, s.name, id);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Topology changes applied on top of the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyDelta {
    MemberJoined(Member),
    /// Partitions owned by a departed member read as unowned until reassigned.
    MemberLeft(MemberId),
    ServiceStarted(ServiceSpec),
    ServiceStopped(String),
    PartitionMoved { service: String, partition: u32, owners: PartitionSpec },
}

/// Immutable cluster state served to readers.
#[derive(Debug, Default)]
pub struct ClusterSnapshot {
    pub epoch: u64,
    members: FxHashMap<MemberId, Member>,
    services: Vec<ServiceSpec>,
}

impl ClusterSnapshot {
    pub fn member(&self, id: MemberId) -> Option<&Member> { self.members.get(&id) }
    pub fn member_count(&self) -> usize { self.members.len() }
    pub fn services(&self) -> &[ServiceSpec] { &self.services }
}

/// Builds snapshots from a spec plus a stream of deltas.
pub struct TopologyBuilder {
    epoch: u64,
    members: FxHashMap<MemberId, Member>,
    services: Vec<ServiceSpec>,
}

impl TopologyBuilder {
    pub fn from_spec(spec: TopologySpec) -> Self {
        let members = spec.members.into_iter().map(|m| (m.id, m)).collect();
        Self { epoch: 0, members, services: spec.services }
    }

    /// Apply a batch of deltas in order. Unknown services or out-of-range partitions
    /// reject the whole batch; nothing is applied unless every delta succeeds.
    pub fn apply(&mut self, batch: Vec<TopologyDelta>) -> Result<()> {
        let mut members = self.members.clone();
        let mut services = self.services.clone();
        for d in batch {
            match d {
                TopologyDelta::MemberJoined(m) => { members.insert(m.id, m); }
                TopologyDelta::MemberLeft(id) => { members.remove(&id); }
                TopologyDelta::ServiceStarted(s) => {
                    services.retain(|x| x.name != s.name);
                    services.push(s);
                }
                TopologyDelta::ServiceStopped(name) => services.retain(|x| x.name != name),
                TopologyDelta::PartitionMoved { service, partition, owners } => {
                    let svc = services.iter_mut().find(|s| s.name == service).ok_or_else(|| anyhow!("unknown service {}", service))?;
                    let len = svc.partitions.as_ref().map(|p| p.len()).unwrap_or(0);
                    let slot = svc
                        .partitions
                        .as_mut()
                        .and_then(|p| p.get_mut(partition as usize))
                        .ok_or_else(|| anyhow!("partition {} out of range for service {} ({} partitions)", partition, service, len))?;
                    *slot = owners;
                }
            }
        }
        self.members = members;
        self.services = services;
        self.epoch = self.epoch.saturating_add(1);
        Ok(())
    }

    pub fn freeze(&self) -> Arc<ClusterSnapshot> {
        Arc::new(ClusterSnapshot { epoch: self.epoch, members: self.members.clone(), services: self.services.clone() })
    }
}

/// In-memory cluster directory. Deltas swap in a new snapshot; services
/// already resolved keep reading the snapshot they were resolved from.
pub struct InMemoryCluster {
    builder: std::sync::Mutex<TopologyBuilder>,
    snap: ArcSwap<ClusterSnapshot>,
    reachable: AtomicBool,
}

impl InMemoryCluster {
    pub fn new(spec: TopologySpec) -> Result<Self> {
        spec.validate()?;
        let builder = TopologyBuilder::from_spec(spec);
        let snap = ArcSwap::new(builder.freeze());
        info!(members = snap.load().member_count(), services = snap.load().services().len(), "store: cluster loaded");
        Ok(Self { builder: std::sync::Mutex::new(builder), snap, reachable: AtomicBool::new(true) })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::new(TopologySpec::load(path)?)
    }

    pub fn current(&self) -> Arc<ClusterSnapshot> { self.snap.load_full() }

    /// Apply deltas and publish the resulting snapshot.
    pub fn apply(&self, batch: Vec<TopologyDelta>) -> Result<u64> {
        let mut builder = self.builder.lock().map_err(|_| anyhow!("topology builder lock poisoned"))?;
        builder.apply(batch)?;
        let next = builder.freeze();
        let epoch = next.epoch;
        self.snap.store(next);
        debug!(epoch, "store: snapshot swapped");
        Ok(epoch)
    }

    /// Simulate losing (or regaining) the connection to the cluster.
    pub fn set_reachable(&self, on: bool) { self.reachable.store(on, Ordering::SeqCst); }
}

impl ClusterDirectory for InMemoryCluster {
    fn service_names(&self) -> Option<Vec<String>> {
        if !self.reachable.load(Ordering::SeqCst) { return None; }
        Some(self.snap.load().services().iter().map(|s| s.name.clone()).collect())
    }

    fn service(&self, name: &str) -> Result<Arc<dyn ServiceHandle>, ClusterError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ClusterError::Unreachable(format!("resolving service {}", name)));
        }
        let snap = self.snap.load_full();
        let idx = snap.services.iter().position(|s| s.name == name).ok_or_else(|| ClusterError::UnknownService(name.to_string()))?;
        Ok(Arc::new(StoreService { snap, idx }))
    }
}

/// A service bound to the snapshot it was resolved from.
pub struct StoreService {
    snap: Arc<ClusterSnapshot>,
    idx: usize,
}

impl StoreService {
    fn spec(&self) -> &ServiceSpec { &self.snap.services[self.idx] }

    fn owners(&self, partition: u32) -> PartitionSpec {
        self.spec().partitions.as_ref().and_then(|p| p.get(partition as usize).copied()).unwrap_or_default()
    }

    fn resolve(&self, id: Option<MemberId>) -> Option<Member> { id.and_then(|id| self.snap.member(id).cloned()) }
}

impl ServiceHandle for StoreService {
    fn name(&self) -> &str { &self.spec().name }
    fn service_type(&self) -> &str { &self.spec().service_type }
    fn has_partitioned_view(&self) -> bool { self.spec().partitions.is_some() }
    fn partitioned_view(&self) -> Option<&dyn PartitionedService> {
        if self.has_partitioned_view() { Some(self) } else { None }
    }
}

impl PartitionedService for StoreService {
    fn partition_count(&self) -> u32 { self.spec().partitions.as_ref().map(|p| p.len() as u32).unwrap_or(0) }
    fn primary_owner(&self, partition: u32) -> Option<Member> { self.resolve(self.owners(partition).primary) }
    fn backup_owner(&self, partition: u32, replica: u32) -> Option<Member> {
        // backup-count is 1; further replicas do not exist
        if replica != FIRST_BACKUP { return None; }
        self.resolve(self.owners(partition).backup)
    }
    fn has_placement_strategy(&self) -> bool { self.spec().placement_strategy }
}
