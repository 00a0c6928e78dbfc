//! StatusHA core types: cluster members, safety levels and the collaborator
//! traits the evaluator and aggregator read the cluster through.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Cluster member id. Unique among the live members of one cluster.
pub type MemberId = u32;

/// Service type tag of a partitioned (distributed) cache service.
pub const DISTRIBUTED_CACHE: &str = "DistributedCache";
/// Reserved name of the cluster coordination service.
pub const CLUSTER_SERVICE: &str = "Cluster";
/// Reserved name of the management service.
pub const MANAGEMENT_SERVICE: &str = "Management";

/// Replica index of the single backup copy evaluated (backup-count = 1).
pub const FIRST_BACKUP: u32 = 1;

/// Pseudo process id under which unowned partitions are counted.
pub const UNOWNED_PID: i64 = -1;

/// Returns true for the infrastructure services that are never evaluated.
pub fn is_reserved_service(name: &str) -> bool {
    name == CLUSTER_SERVICE || name == MANAGEMENT_SERVICE
}

/// A cache-hosting cluster member and its place in the topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rack_name: Option<String>,
    pub machine_id: i32,
    /// OS process identifier as reported by the member.
    pub process_name: String,
}

impl Member {
    pub fn site_name(&self) -> Option<&str> { self.site_name.as_deref() }
    pub fn rack_name(&self) -> Option<&str> { self.rack_name.as_deref() }

    /// Parse the process name as a numeric pid.
    pub fn process_id(&self) -> Result<i64, ClusterError> {
        self.process_name.trim().parse::<i64>().map_err(|_| ClusterError::InvalidProcessName {
            member: self.id,
            process_name: self.process_name.clone(),
        })
    }

    /// Same member identity (not structural equality).
    pub fn same_identity(&self, other: &Member) -> bool { self.id == other.id }
}

/// High-availability level of a service, ordered from least to most safe so
/// that `min` yields the weaker of two levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SafetyStatus {
    #[serde(rename = "ENDANGERED")]
    Endangered,
    #[serde(rename = "NODE-SAFE")]
    NodeSafe,
    #[serde(rename = "MACHINE-SAFE")]
    MachineSafe,
    #[serde(rename = "RACK-SAFE")]
    RackSafe,
    #[serde(rename = "SITE-SAFE")]
    SiteSafe,
}

impl SafetyStatus {
    pub const ALL: [SafetyStatus; 5] = [
        SafetyStatus::SiteSafe,
        SafetyStatus::RackSafe,
        SafetyStatus::MachineSafe,
        SafetyStatus::NodeSafe,
        SafetyStatus::Endangered,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            SafetyStatus::SiteSafe => "SITE-SAFE",
            SafetyStatus::RackSafe => "RACK-SAFE",
            SafetyStatus::MachineSafe => "MACHINE-SAFE",
            SafetyStatus::NodeSafe => "NODE-SAFE",
            SafetyStatus::Endangered => "ENDANGERED",
        }
    }
}

impl fmt::Display for SafetyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.label()) }
}

impl FromStr for SafetyStatus {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SafetyStatus::ALL
            .into_iter()
            .find(|st| st.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ClusterError::UnknownStatus(s.to_string()))
    }
}

/// Errors raised by cluster collaborators while a service is read.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("cluster unreachable: {0}")]
    Unreachable(String),
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("service {0} declares a partitioned type but exposes no partition view")]
    NotPartitioned(String),
    #[error("member {member} has non-numeric process name {process_name:?}")]
    InvalidProcessName { member: MemberId, process_name: String },
    #[error("unknown status label: {0}")]
    UnknownStatus(String),
}

// ---- collaborator traits ----

/// Read-only partition ownership table of one partitioned service.
///
/// Implementations return a best-effort point-in-time view; owners may move
/// between two calls.
pub trait PartitionedService: Send + Sync {
    fn partition_count(&self) -> u32;
    /// Primary owner of `partition`, `None` while unowned.
    fn primary_owner(&self, partition: u32) -> Option<Member>;
    /// Owner of backup `replica` (1-based) of `partition`.
    fn backup_owner(&self, partition: u32, replica: u32) -> Option<Member>;
    /// Whether a partition assignment strategy is configured for the service.
    fn has_placement_strategy(&self) -> bool;
}

/// A named service resolved from the directory.
pub trait ServiceHandle: Send + Sync {
    fn name(&self) -> &str;
    fn service_type(&self) -> &str;
    /// Capability check performed before narrowing to the partition view.
    fn has_partitioned_view(&self) -> bool;
    fn partitioned_view(&self) -> Option<&dyn PartitionedService>;
}

/// Entry point into a live cluster: service enumeration and resolution.
pub trait ClusterDirectory: Send + Sync {
    /// Names of all services known to the cluster; `None` when the directory
    /// itself is unavailable.
    fn service_names(&self) -> Option<Vec<String>>;
    fn service(&self, name: &str) -> Result<Arc<dyn ServiceHandle>, ClusterError>;
}

pub mod prelude {
    pub use super::{
        ClusterDirectory, ClusterError, Member, MemberId, PartitionedService, SafetyStatus, ServiceHandle,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_least_safe_first() {
        assert!(SafetyStatus::Endangered < SafetyStatus::NodeSafe);
        assert!(SafetyStatus::NodeSafe < SafetyStatus::MachineSafe);
        assert!(SafetyStatus::MachineSafe < SafetyStatus::RackSafe);
        assert!(SafetyStatus::RackSafe < SafetyStatus::SiteSafe);
        assert_eq!(SafetyStatus::SiteSafe.min(SafetyStatus::NodeSafe), SafetyStatus::NodeSafe);
    }

    #[test]
    fn labels_parse_back() {
        for st in SafetyStatus::ALL {
            assert_eq!(st.label().parse::<SafetyStatus>().unwrap(), st);
        }
        assert_eq!("machine-safe".parse::<SafetyStatus>().unwrap(), SafetyStatus::MachineSafe);
        assert!("SAFE".parse::<SafetyStatus>().is_err());
    }

    #[test]
    fn serde_uses_labels() {
        let v = serde_json::to_string(&SafetyStatus::RackSafe).unwrap();
        assert_eq!(v, "\"RACK-SAFE\"");
    }

    #[test]
    fn process_id_parsing() {
        let mut m = Member { id: 3, site_name: None, rack_name: None, machine_id: 7, process_name: " 4242".into() };
        assert_eq!(m.process_id().unwrap(), 4242);
        m.process_name = "4242@host".into();
        assert_eq!(
            m.process_id(),
            Err(ClusterError::InvalidProcessName { member: 3, process_name: "4242@host".into() })
        );
    }

    #[test]
    fn reserved_names() {
        assert!(is_reserved_service("Cluster"));
        assert!(is_reserved_service("Management"));
        assert!(!is_reserved_service("DistributedCache"));
    }
}
