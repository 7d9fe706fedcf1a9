//! 全量宕机后重启 Cluster
//!
//! 所有成员都失去组复制（无任何分区拥有多数派）时，从 GTID 最全的成员
//! 重新引导同名组，其余可达成员依次加入。

use super::{commit_change, OperationReport, RebootOptions};
use crate::gtid::GtidSet;
use crate::metadata::{ClusterRecord, ClusterRole, ViewChangeReason};
use crate::probe::{ControlCommand, InstanceAddress, InstanceStatus};
use crate::recovery::RecoveryMethod;
use crate::session::Session;
use crate::{Result, TopologyError};

/// 参与比较的 GTID：去掉视图变更事件
fn comparable(record: &ClusterRecord, status: &InstanceStatus) -> GtidSet {
    let vcu = record
        .view_change_uuid
        .as_deref()
        .unwrap_or(record.group_name.as_str());
    status.gtid_executed.without_uuid(vcu)
}

pub(crate) fn reboot_cluster(session: &Session, name: &str, options: &RebootOptions) -> Result<OperationReport> {
    session.ensure_metadata_writable()?;
    let record = session
        .store()
        .read(|s| s.cluster_by_name(name).cloned())
        .ok_or_else(|| TopologyError::NotFound(format!("Cluster '{}' not found", name)))?;
    let _lock = session
        .store()
        .lock_topology(&record.topology().lock_key(), "rebootClusterFromCompleteOutage")?;
    let snap = session.refresh_cluster(&record.id)?;

    let mut report = OperationReport::new("rebootClusterFromCompleteOutage", name, options.dry_run);

    // 任一分区仍有多数派时不能重启
    for member in &snap.members {
        if let Some(view) = member.status.as_ref().and_then(|s| s.group.as_ref()) {
            if view.group_name.eq_ignore_ascii_case(&record.group_name) && view.has_quorum() {
                return Err(TopologyError::InvalidState(format!(
                    "Cluster '{}' still has quorum through {}; use rejoinInstance() for the missing members",
                    name,
                    member.address()
                )));
            }
        }
    }

    let reachable: Vec<(&InstanceAddress, &InstanceStatus)> = snap
        .members
        .iter()
        .filter_map(|m| m.status.as_ref().map(|s| (m.address(), s)))
        .collect();
    for member in snap.members.iter().filter(|m| !m.is_reachable()) {
        report.warn(format!(
            "Instance {} is not reachable and will not be rejoined",
            member.address()
        ));
    }
    if reachable.is_empty() {
        return Err(TopologyError::unreachable(
            name,
            "no member of the cluster is reachable",
        ));
    }

    let seed = match &options.primary {
        Some(requested) => {
            let address: InstanceAddress = requested.parse()?;
            reachable
                .iter()
                .find(|(a, _)| **a == address)
                .copied()
                .ok_or_else(|| {
                    TopologyError::ArgumentError(format!(
                        "Instance {} is not a reachable member of cluster '{}'",
                        address, name
                    ))
                })?
        }
        None => reachable
            .iter()
            .max_by_key(|(_, s)| comparable(&record, s).count())
            .copied()
            .ok_or_else(|| TopologyError::InternalError("no reboot candidate".to_string()))?,
    };
    let (seed_addr, seed_status) = seed;
    let seed_gtids = comparable(&record, seed_status);

    for (address, status) in reachable.iter().filter(|(a, _)| *a != seed_addr) {
        let extra = comparable(&record, status).subtract(&seed_gtids);
        if extra.is_empty() {
            continue;
        }
        let message = format!(
            "Instance {} has transactions not present on the selected seed {}: {}",
            address, seed_addr, extra
        );
        if options.force {
            report.warn(format!("{}; they will be lost", message));
        } else {
            return Err(TopologyError::RecoveryStateError(format!(
                "{}; pick that instance as primary or use force=true",
                message
            )));
        }
    }

    report.note(format!("Cluster '{}' will be rebooted from {}", name, seed_addr));
    if options.dry_run {
        return Ok(report);
    }

    let client = session.client();
    for (address, status) in &reachable {
        if status.is_group_member() {
            client.apply_control(address, ControlCommand::StopGroupReplication)?;
        }
    }

    client.apply_control(
        seed_addr,
        ControlCommand::StartGroupReplication {
            group_name: record.group_name.clone(),
            view_change_uuid: record.view_change_uuid.clone(),
            bootstrap: true,
            single_primary: record.single_primary,
            recovery: None,
        },
    )?;
    crate::record_failover!("reboot");

    for (address, _) in reachable.iter().filter(|(a, _)| *a != seed_addr) {
        let result = client.apply_control(
            address,
            ControlCommand::StartGroupReplication {
                group_name: record.group_name.clone(),
                view_change_uuid: record.view_change_uuid.clone(),
                bootstrap: false,
                single_primary: record.single_primary,
                recovery: Some(RecoveryMethod::Incremental),
            },
        );
        report.best_effort(&format!("rejoin {}", address), result);
    }

    // 副本 Cluster 与被失效的 Cluster 保持只读
    let writable = match &record.clusterset {
        None => true,
        Some(m) => m.role == ClusterRole::Primary && !m.invalidated,
    };
    let sro = client.apply_control(seed_addr, ControlCommand::SetSuperReadOnly { enabled: !writable });
    report.best_effort("set super_read_only on the primary", sro);
    if record.is_invalidated() {
        report.warn(format!(
            "Cluster '{}' is INVALIDATED in its ClusterSet; use ClusterSet.rejoinCluster() or removeCluster()",
            name
        ));
    }

    report.view_id = Some(commit_change(
        session,
        &record.topology(),
        ViewChangeReason::Reboot,
        &format!("rebooted from {}", seed_addr),
        |_| Ok(()),
    )?);
    report.note(format!("Cluster '{}' is back ONLINE", name));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::NonInteractive;
    use crate::metadata::MetadataStore;
    use crate::mutator::{AddInstanceOptions, CreateClusterOptions};
    use crate::probe::MemoryFleet;
    use crate::utils::config::TopologyConfig;
    use std::sync::Arc;

    fn cluster_of_three() -> (Arc<MemoryFleet>, Session, Vec<InstanceAddress>) {
        let fleet = Arc::new(MemoryFleet::new());
        let nodes: Vec<InstanceAddress> = ["a:3306", "b:3306", "c:3306"]
            .iter()
            .map(|n| fleet.add_node(n))
            .collect();
        let session = Session::new(
            TopologyConfig::default(),
            Arc::new(MetadataStore::in_memory()),
            fleet.clone(),
            Arc::new(NonInteractive),
        );
        session
            .create_cluster(
                "c1",
                "a:3306",
                CreateClusterOptions {
                    gtid_set_complete: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let cluster = session.get_cluster("c1").unwrap();
        cluster.add_instance("b:3306", AddInstanceOptions::default()).unwrap();
        cluster.add_instance("c:3306", AddInstanceOptions::default()).unwrap();
        (fleet, session, nodes)
    }

    #[test]
    fn test_reboot_refused_with_quorum() {
        let (_fleet, session, _) = cluster_of_three();
        let err = session
            .reboot_cluster_from_complete_outage("c1", RebootOptions::default())
            .unwrap_err();
        assert!(matches!(err, TopologyError::InvalidState(_)));
    }

    #[test]
    fn test_reboot_picks_most_advanced_member() {
        let (fleet, session, nodes) = cluster_of_three();
        fleet.kill(&nodes[1]);
        fleet.kill(&nodes[2]);
        // a 在失去多数派后仍写入了事务
        fleet.write_transactions(&nodes[0], 5);
        fleet.kill(&nodes[0]);
        for n in &nodes {
            fleet.restart(n);
        }
        let report = session
            .reboot_cluster_from_complete_outage("c1", RebootOptions::default())
            .unwrap();
        assert!(!report.has_warnings());
        assert_eq!(fleet.group_primary(&nodes[0]), Some(nodes[0].clone()));
        let cluster = session.get_cluster("c1").unwrap();
        let status = cluster.status().unwrap();
        assert_eq!(status.members.iter().filter(|m| m.state == crate::InstanceState::Online).count(), 3);
    }

    #[test]
    fn test_reboot_diverged_seed_requires_force() {
        let (fleet, session, nodes) = cluster_of_three();
        for n in &nodes {
            fleet.kill(n);
            fleet.restart(n);
        }
        fleet.inject_errant(&nodes[2], 2);
        let err = session
            .reboot_cluster_from_complete_outage(
                "c1",
                RebootOptions {
                    primary: Some("a:3306".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, TopologyError::RecoveryStateError(_)));

        let report = session
            .reboot_cluster_from_complete_outage(
                "c1",
                RebootOptions {
                    primary: Some("a:3306".to_string()),
                    force: true,
                    ..Default::default()
                },
            )
            .unwrap();
        // c 带有多余事务，加入失败只记为警告
        assert!(report.has_warnings());
        assert_eq!(fleet.group_primary(&nodes[0]), Some(nodes[0].clone()));
    }
}
