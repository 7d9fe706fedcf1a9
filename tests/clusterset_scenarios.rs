// ClusterSet 端到端场景
//
// 测试流程：
// 1. 主 Cluster + 副本 Cluster 组成 ClusterSet
// 2. 计划内切换主 Cluster，校验通道方向
// 3. 主 Cluster 整体宕机后强制切换，旧主 Cluster 被失效
// 4. 旧主 Cluster 重启后 rejoinCluster（干净 / 带多余事务两种情况）

mod common;

use std::sync::Arc;

use common::{fleet_with, session_on};
use qatopology::clusterset::{
    ClusterSetHealth, CreateReplicaClusterOptions, ForcePrimaryClusterOptions, RejoinClusterOptions,
    RemoveClusterOptions, SetPrimaryClusterOptions, CLUSTERSET_CHANNEL,
};
use qatopology::clusterset::status::ClusterGlobalStatus;
use qatopology::metadata::ClusterRole;
use qatopology::mutator::{AddInstanceOptions, CreateClusterOptions, CreateClusterSetOptions, RebootOptions};
use qatopology::probe::MemoryFleet;
use qatopology::utils::config::TopologyConfig;
use qatopology::{InstanceAddress, NonInteractive, Session, TopologyError};

/// 主 Cluster "east"（n1 + `extra` 个成员）与副本 Cluster "west"（种子为下一个节点）
fn clusterset(extra: usize) -> (Arc<MemoryFleet>, Session, Vec<InstanceAddress>) {
    let (fleet, nodes) = fleet_with(extra + 2);
    let session = session_on(&fleet, TopologyConfig::default(), Arc::new(NonInteractive));
    session
        .create_cluster(
            "east",
            "n1:3306",
            CreateClusterOptions {
                gtid_set_complete: true,
                ..Default::default()
            },
        )
        .unwrap();
    let east = session.get_cluster("east").unwrap();
    for node in nodes.iter().skip(1).take(extra) {
        east.add_instance(&node.to_string(), AddInstanceOptions::default())
            .unwrap();
    }
    east.create_cluster_set("global", CreateClusterSetOptions::default())
        .unwrap();
    fleet.write_transactions(&nodes[0], 5);

    let cs = session.get_cluster_set("global").unwrap();
    let seed = nodes[extra + 1].to_string();
    cs.create_replica_cluster(&seed, "west", CreateReplicaClusterOptions::default())
        .unwrap();
    (fleet, session, nodes)
}

#[test]
fn test_replica_cluster_replicates_from_primary() {
    let (fleet, session, nodes) = clusterset(1);
    let west_seed = &nodes[2];
    assert_eq!(fleet.channel_source(west_seed, CLUSTERSET_CHANNEL), Some(nodes[0].clone()));
    assert!(fleet.super_read_only(west_seed));

    let written = fleet.write_transactions(&nodes[0], 3);
    assert!(written.is_subset_of(&fleet.gtid_executed(west_seed)));

    let cs = session.get_cluster_set("global").unwrap();
    let status = cs.status().unwrap();
    assert_eq!(status.status, ClusterSetHealth::Healthy, "{:?}", status);
    assert_eq!(status.primary_cluster, "east");
    assert_eq!(status.clusters["west"].role, ClusterRole::Replica);
    assert_eq!(status.clusters["west"].global_status, ClusterGlobalStatus::Ok);

    let described = cs.describe().unwrap();
    assert_eq!(described.clusters.len(), 2);

    // 名称冲突与重复种子
    assert!(matches!(
        cs.create_replica_cluster("n2:3306", "west", CreateReplicaClusterOptions::default()),
        Err(TopologyError::InvalidState(_))
    ));
}

#[test]
fn test_cluster_in_a_clusterset_can_not_be_dissolved() {
    let (_fleet, session, _) = clusterset(0);
    let west = session.get_cluster("west").unwrap();
    assert!(matches!(
        west.dissolve(Default::default()),
        Err(TopologyError::InvalidState(_))
    ));
    assert_eq!(west.status().unwrap().clusterset_role, Some(ClusterRole::Replica));
}

#[test]
fn test_switchover_reverses_the_channel() {
    let (fleet, session, nodes) = clusterset(1);
    let cs = session.get_cluster_set("global").unwrap();
    let view_before = cs.describe().unwrap().view_id;

    cs.set_primary_cluster("west", SetPrimaryClusterOptions::default())
        .unwrap();
    assert_eq!(fleet.channel_source(&nodes[2], CLUSTERSET_CHANNEL), None);
    assert!(!fleet.super_read_only(&nodes[2]));
    assert_eq!(fleet.channel_source(&nodes[0], CLUSTERSET_CHANNEL), Some(nodes[2].clone()));
    assert!(fleet.super_read_only(&nodes[0]));

    let written = fleet.write_transactions(&nodes[2], 4);
    assert!(written.is_subset_of(&fleet.gtid_executed(&nodes[1])));

    let status = cs.status().unwrap();
    assert_eq!(status.primary_cluster, "west");
    assert_eq!(status.status, ClusterSetHealth::Healthy, "{:?}", status);
    assert!(status.view_id > view_before);

    // 已是主 Cluster 时不做任何事
    let again = cs
        .set_primary_cluster("west", SetPrimaryClusterOptions::default())
        .unwrap();
    assert!(again.notes.iter().any(|n| n.contains("already")));
    assert_eq!(again.view_id, None);
}

#[test]
fn test_switchover_refused_with_errant_replica() {
    let (fleet, session, nodes) = clusterset(0);
    fleet.inject_errant(&nodes[1], 1);
    let cs = session.get_cluster_set("global").unwrap();

    let status = cs.status().unwrap();
    assert_eq!(status.clusters["west"].global_status, ClusterGlobalStatus::OkNotConsistent);
    assert!(status.clusters["west"].errant_gtids.is_some());

    assert!(matches!(
        cs.set_primary_cluster("west", SetPrimaryClusterOptions::default()),
        Err(TopologyError::RecoveryStateError(_))
    ));
    assert_eq!(cs.status().unwrap().primary_cluster, "east");
}

#[test]
fn test_failover_invalidate_and_rejoin() {
    let (fleet, session, nodes) = clusterset(0);
    let (east_node, west_node) = (nodes[0].clone(), nodes[1].clone());
    let cs = session.get_cluster_set("global").unwrap();

    // 主 Cluster 仍可用时不能强制切换
    assert!(matches!(
        cs.force_primary_cluster("west", ForcePrimaryClusterOptions::default()),
        Err(TopologyError::InvalidState(_))
    ));

    fleet.kill(&east_node);
    assert_eq!(cs.status().unwrap().status, ClusterSetHealth::Unavailable);

    let report = cs
        .force_primary_cluster("west", ForcePrimaryClusterOptions::default())
        .unwrap();
    assert!(report.has_warnings());
    assert!(!fleet.super_read_only(&west_node));
    assert_eq!(fleet.channel_source(&west_node, CLUSTERSET_CHANNEL), None);

    let status = cs.status().unwrap();
    assert_eq!(status.primary_cluster, "west");
    assert_eq!(status.status, ClusterSetHealth::Available);
    assert_eq!(status.clusters["east"].global_status, ClusterGlobalStatus::Invalidated);
    let after_failover = fleet.write_transactions(&west_node, 3);

    // 旧主 Cluster 恢复后仍是只读的失效副本
    fleet.restart(&east_node);
    let reboot = session
        .reboot_cluster_from_complete_outage("east", RebootOptions::default())
        .unwrap();
    assert!(reboot.warnings.iter().any(|w| w.contains("INVALIDATED")));
    assert!(fleet.super_read_only(&east_node));
    let east = session.get_cluster("east").unwrap();
    assert!(east.status().unwrap().invalidated);
    assert!(matches!(
        east.add_instance("n9:3306", AddInstanceOptions::default()),
        Err(TopologyError::InvalidState(_))
    ));

    cs.rejoin_cluster("east", RejoinClusterOptions::default()).unwrap();
    assert_eq!(fleet.channel_source(&east_node, CLUSTERSET_CHANNEL), Some(west_node.clone()));
    assert!(after_failover.is_subset_of(&fleet.gtid_executed(&east_node)));

    let status = cs.status().unwrap();
    assert_eq!(status.status, ClusterSetHealth::Healthy, "{:?}", status);
    assert_eq!(status.clusters["east"].role, ClusterRole::Replica);
    assert!(matches!(
        cs.rejoin_cluster("east", RejoinClusterOptions::default()),
        Err(TopologyError::InvalidState(_))
    ));
}

#[test]
fn test_rejoin_refused_for_diverged_cluster() {
    let (fleet, session, nodes) = clusterset(0);
    let east_node = nodes[0].clone();
    let cs = session.get_cluster_set("global").unwrap();

    fleet.kill(&east_node);
    cs.force_primary_cluster("west", ForcePrimaryClusterOptions::default())
        .unwrap();
    fleet.restart(&east_node);
    session
        .reboot_cluster_from_complete_outage("east", RebootOptions::default())
        .unwrap();
    fleet.inject_errant(&east_node, 2);

    match cs.rejoin_cluster("east", RejoinClusterOptions::default()) {
        Err(TopologyError::RecoveryStateError(msg)) => {
            assert!(msg.contains("inject empty transactions"), "{}", msg)
        }
        other => panic!("expected RecoveryStateError, got {:?}", other.map(|r| r.notes)),
    }
    assert_eq!(
        cs.status().unwrap().clusters["east"].global_status,
        ClusterGlobalStatus::Invalidated
    );

    // 只能移除
    cs.remove_cluster("east", RemoveClusterOptions::default()).unwrap();
    assert!(!fleet.is_group_member(&east_node));
    assert_eq!(cs.describe().unwrap().clusters.len(), 1);
    assert!(matches!(session.get_cluster("east"), Err(TopologyError::NotFound(_))));
}

#[test]
fn test_remove_replica_cluster() {
    let (fleet, session, nodes) = clusterset(1);
    let cs = session.get_cluster_set("global").unwrap();

    assert!(matches!(
        cs.remove_cluster("east", RemoveClusterOptions::default()),
        Err(TopologyError::InvalidState(_))
    ));
    cs.remove_cluster("west", RemoveClusterOptions::default()).unwrap();
    assert_eq!(fleet.channel_source(&nodes[2], CLUSTERSET_CHANNEL), None);
    assert!(!fleet.is_group_member(&nodes[2]));

    let described = cs.describe().unwrap();
    assert_eq!(described.clusters.len(), 1);
    assert_eq!(described.primary_cluster, "east");
}
