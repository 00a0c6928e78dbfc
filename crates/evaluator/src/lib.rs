//! StatusHA evaluator: reduces a service's partition ownership table to the
//! weakest safety level found, and counts primary partitions per process.

#![forbid(unsafe_code)]

use rustc_hash::FxHashMap;
use statusha_core::{ClusterError, Member, PartitionedService, SafetyStatus, FIRST_BACKUP, UNOWNED_PID};
use tracing::debug;

/// Primary partitions owned per process id (`-1` = unowned).
pub type OwnershipDistribution = FxHashMap<i64, u32>;

/// Counters describing one status scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ScanDebugInfo {
    pub partitions: u32,
    pub scanned: u32,
    /// Level the scan started from (capped without a placement strategy).
    pub ceiling: SafetyStatus,
    /// First partition that brought the status down to its final value.
    pub weakest_partition: Option<u32>,
    pub short_circuited: bool,
}

/// Starting level for a service: without a placement strategy nothing better
/// than machine safety can be claimed.
pub fn initial_status(service: &dyn PartitionedService) -> SafetyStatus {
    if service.has_placement_strategy() { SafetyStatus::SiteSafe } else { SafetyStatus::MachineSafe }
}

/// Apply one partition's owners to the running `status`.
///
/// The site and rack steps only fire while the status is still at that level;
/// the machine check applies to every partition and pins the status to
/// `NodeSafe`.
pub fn classify_partition(primary: Option<&Member>, backup: Option<&Member>, status: SafetyStatus) -> SafetyStatus {
    let (primary, backup) = match (primary, backup) {
        (Some(p), Some(b)) if !p.same_identity(b) => (p, b),
        _ => return SafetyStatus::Endangered,
    };
    let mut status = status;
    if status == SafetyStatus::SiteSafe && !distinct_names(primary.site_name(), backup.site_name()) {
        status = SafetyStatus::RackSafe;
    }
    if status == SafetyStatus::RackSafe && !distinct_names(primary.rack_name(), backup.rack_name()) {
        status = SafetyStatus::MachineSafe;
    }
    if primary.machine_id == backup.machine_id {
        status = SafetyStatus::NodeSafe;
    }
    status
}

// Both named and different. A missing name never counts as isolation.
fn distinct_names(a: Option<&str>, b: Option<&str>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a != b)
}

/// Worst-case HA status of the service.
pub fn evaluate_status(service: &dyn PartitionedService) -> SafetyStatus {
    evaluate_status_with_debug(service).0
}

/// Like [`evaluate_status`], also returning how the scan went.
pub fn evaluate_status_with_debug(service: &dyn PartitionedService) -> (SafetyStatus, ScanDebugInfo) {
    let ceiling = initial_status(service);
    let count = service.partition_count();
    let mut dbg = ScanDebugInfo { partitions: count, scanned: 0, ceiling, weakest_partition: None, short_circuited: false };
    let mut status = ceiling;
    for i in 0..count {
        let primary = service.primary_owner(i);
        let backup = service.backup_owner(i, FIRST_BACKUP);
        let next = classify_partition(primary.as_ref(), backup.as_ref(), status);
        dbg.scanned += 1;
        if next < status {
            dbg.weakest_partition = Some(i);
        }
        status = next;
        if status == SafetyStatus::Endangered {
            debug!(partition = i, primary = ?primary.map(|m| m.id), backup = ?backup.map(|m| m.id), "endangered partition; stopping scan");
            dbg.short_circuited = i + 1 < count;
            break;
        }
    }
    (status, dbg)
}

/// Count primary partitions per owning process id.
///
/// Fails if an owner reports a process name that is not a number.
pub fn ownership_distribution(service: &dyn PartitionedService) -> Result<OwnershipDistribution, ClusterError> {
    let mut out = OwnershipDistribution::default();
    for i in 0..service.partition_count() {
        let pid = match service.primary_owner(i) {
            Some(owner) => owner.process_id()?,
            None => UNOWNED_PID,
        };
        *out.entry(pid).or_insert(0) += 1;
    }
    Ok(out)
}

/// Status and ownership of one service, computed in two independent passes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ServiceReport {
    pub status: SafetyStatus,
    pub partitions: u32,
    pub ownership: std::collections::BTreeMap<i64, u32>,
}

/// Status plus ownership distribution of one service.
pub fn report(service: &dyn PartitionedService) -> Result<ServiceReport, ClusterError> {
    let status = evaluate_status(service);
    let ownership = ownership_distribution(service)?.into_iter().collect();
    Ok(ServiceReport { status, partitions: service.partition_count(), ownership })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(id: u32, site: Option<&str>, rack: Option<&str>, machine: i32) -> Member {
        Member {
            id,
            site_name: site.map(str::to_string),
            rack_name: rack.map(str::to_string),
            machine_id: machine,
            process_name: format!("{}", 1000 + id),
        }
    }

    #[test]
    fn missing_or_shared_owner_is_endangered() {
        let a = m(1, Some("s1"), Some("r1"), 1);
        let b = m(2, Some("s2"), Some("r2"), 2);
        assert_eq!(classify_partition(None, Some(&b), SafetyStatus::SiteSafe), SafetyStatus::Endangered);
        assert_eq!(classify_partition(Some(&a), None, SafetyStatus::SiteSafe), SafetyStatus::Endangered);
        assert_eq!(classify_partition(Some(&a), Some(&a), SafetyStatus::SiteSafe), SafetyStatus::Endangered);
    }

    #[test]
    fn fully_separated_pair_keeps_site_safety() {
        let a = m(1, Some("s1"), Some("r1"), 1);
        let b = m(2, Some("s2"), Some("r2"), 2);
        assert_eq!(classify_partition(Some(&a), Some(&b), SafetyStatus::SiteSafe), SafetyStatus::SiteSafe);
    }

    #[test]
    fn unnamed_site_falls_through_to_rack() {
        let a = m(1, None, Some("r1"), 1);
        let b = m(2, Some("s2"), Some("r2"), 2);
        assert_eq!(classify_partition(Some(&a), Some(&b), SafetyStatus::SiteSafe), SafetyStatus::RackSafe);
        let c = m(3, None, None, 3);
        assert_eq!(classify_partition(Some(&a), Some(&c), SafetyStatus::SiteSafe), SafetyStatus::MachineSafe);
    }

    #[test]
    fn same_machine_overrides_other_levels() {
        let a = m(1, Some("s1"), Some("r1"), 9);
        let b = m(2, Some("s2"), Some("r2"), 9);
        assert_eq!(classify_partition(Some(&a), Some(&b), SafetyStatus::SiteSafe), SafetyStatus::NodeSafe);
        assert_eq!(classify_partition(Some(&a), Some(&b), SafetyStatus::MachineSafe), SafetyStatus::NodeSafe);
    }

    #[test]
    fn rack_step_is_skipped_below_rack_level() {
        let a = m(1, Some("s1"), Some("r1"), 1);
        let b = m(2, Some("s1"), Some("r1"), 2);
        assert_eq!(classify_partition(Some(&a), Some(&b), SafetyStatus::NodeSafe), SafetyStatus::NodeSafe);
        assert_eq!(classify_partition(Some(&a), Some(&b), SafetyStatus::MachineSafe), SafetyStatus::MachineSafe);
    }
}
