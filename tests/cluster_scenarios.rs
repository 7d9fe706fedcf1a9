// Cluster 端到端场景
//
// 测试流程：
// 1. 内存节点集上创建 3 / 4 节点单主 Cluster
// 2. 注入故障（宕机、分区、多余事务、复制停滞）
// 3. 执行 rejoin / forceQuorum / addInstance 等操作
// 4. 校验恢复方式选择、交互提示、回滚与元数据

mod common;

use std::sync::Arc;

use common::{cluster_fixture, fleet_with, session_on, with_interaction};
use qatopology::interaction::ScriptedAnswer;
use qatopology::mutator::{
    AddInstanceOptions, AddReplicaInstanceOptions, ClusterHealth, CreateClusterOptions, DissolveOptions, ForceQuorumOptions,
    RejoinInstanceOptions, RemoveInstanceOptions, RescanOptions, SetPrimaryOptions,
};
use qatopology::metadata::ReplicationSources;
use qatopology::probe::{ControlCommand, NodeClient};
use qatopology::topology::READ_REPLICA_CHANNEL;
use qatopology::utils::config::TopologyConfig;
use qatopology::{
    InstanceState, NonInteractive, RecoveryMethod, RecoveryPolicy, ScriptedInteraction, TopologyError,
};

#[test]
fn test_rejoin_behind_member_uses_incremental_without_prompt() {
    let fx = cluster_fixture("prod", 3);
    let n3 = fx.nodes[2].clone();

    fx.fleet.kill(&n3);
    let written = fx.fleet.write_transactions(&fx.nodes[0], 5);
    fx.fleet.restart(&n3);
    assert!(!written.is_subset_of(&fx.fleet.gtid_executed(&n3)));

    let script = Arc::new(ScriptedInteraction::new(vec![]));
    let session = with_interaction(&fx.session, &fx.fleet, script.clone());
    let cluster = session.get_cluster("prod").unwrap();

    let before = cluster.status().unwrap();
    let member = before.members.iter().find(|m| m.address == "n3:3306").unwrap();
    assert_ne!(member.state, InstanceState::Online);

    let report = cluster
        .rejoin_instance("n3:3306", RejoinInstanceOptions::default())
        .unwrap();
    assert_eq!(report.recovery_method, Some(RecoveryMethod::Incremental));
    assert!(script.asked().is_empty(), "no prompt expected: {:?}", script.asked());

    assert!(fx.fleet.is_group_member(&n3));
    assert!(written.is_subset_of(&fx.fleet.gtid_executed(&n3)));
    let status = cluster.status().unwrap();
    assert_eq!(status.status, ClusterHealth::Ok);
    assert!(status.members.iter().all(|m| m.state == InstanceState::Online));
}

#[test]
fn test_rejoin_with_errant_transactions() {
    let fx = cluster_fixture("prod", 3);
    let n3 = fx.nodes[2].clone();
    fx.fleet.kill(&n3);
    fx.fleet.restart(&n3);
    let errant = fx.fleet.inject_errant(&n3, 2);

    // 非交互：必须显式指定 clone
    let cluster = fx.session.get_cluster("prod").unwrap();
    match cluster.rejoin_instance("n3:3306", RejoinInstanceOptions::default()) {
        Err(TopologyError::ArgumentError(msg)) => assert!(msg.contains("recoveryMethod=clone"), "{}", msg),
        other => panic!("expected ArgumentError, got {:?}", other.map(|r| r.notes)),
    }

    // 显式 incremental 不可能成功
    let err = cluster
        .rejoin_instance(
            "n3:3306",
            RejoinInstanceOptions {
                recovery_method: Some(RecoveryPolicy::Incremental),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, TopologyError::RecoveryStateError(_)));
    assert!(!fx.fleet.is_group_member(&n3));

    // 交互：提示 Clone / Abort，选择 Clone
    let script = Arc::new(ScriptedInteraction::new(vec![ScriptedAnswer::Choose("Clone".to_string())]));
    let session = with_interaction(&fx.session, &fx.fleet, script.clone());
    let cluster = session.get_cluster("prod").unwrap();
    let report = cluster
        .rejoin_instance("n3:3306", RejoinInstanceOptions::default())
        .unwrap();
    assert_eq!(report.recovery_method, Some(RecoveryMethod::Clone));
    assert_eq!(script.asked().len(), 1);
    assert!(script.asked()[0].contains("errant"));
    assert_eq!(script.remaining(), 0);

    assert!(fx.fleet.is_group_member(&n3));
    assert!(!errant.is_subset_of(&fx.fleet.gtid_executed(&n3)));
}

#[test]
fn test_abort_choice_leaves_instance_untouched() {
    let fx = cluster_fixture("prod", 3);
    let n3 = fx.nodes[2].clone();
    fx.fleet.kill(&n3);
    fx.fleet.restart(&n3);
    let errant = fx.fleet.inject_errant(&n3, 1);

    let script = Arc::new(ScriptedInteraction::new(vec![ScriptedAnswer::Choose("Abort".to_string())]));
    let session = with_interaction(&fx.session, &fx.fleet, script);
    let cluster = session.get_cluster("prod").unwrap();
    let err = cluster
        .rejoin_instance("n3:3306", RejoinInstanceOptions::default())
        .unwrap_err();
    assert!(matches!(err, TopologyError::Cancelled(_)));
    assert!(errant.is_subset_of(&fx.fleet.gtid_executed(&n3)));
    assert!(!fx.fleet.is_group_member(&n3));
}

#[test]
fn test_exactly_half_partition_loses_quorum() {
    let fx = cluster_fixture("prod", 4);
    let spare = fx.fleet.add_node("n5:3306");
    fx.fleet.partition(&[fx.nodes[2].clone(), fx.nodes[3].clone()]);

    let cluster = fx.session.get_cluster("prod").unwrap();
    let status = cluster.status().unwrap();
    assert_eq!(status.status, ClusterHealth::NoQuorum);

    let err = cluster
        .add_instance(&spare.to_string(), AddInstanceOptions::default())
        .unwrap_err();
    assert!(matches!(err, TopologyError::QuorumError(_)));

    // 以 n1 所在分区恢复仲裁
    let report = cluster
        .force_quorum_using_partition_of("n1:3306", ForceQuorumOptions::default())
        .unwrap();
    assert!(report.view_id.is_some());
    let status = cluster.status().unwrap();
    assert_ne!(status.status, ClusterHealth::NoQuorum);
    assert!(status.primary.is_some());

    cluster
        .add_instance(&spare.to_string(), AddInstanceOptions::default())
        .unwrap();
    assert!(fx.fleet.is_group_member(&spare));
}

#[test]
fn test_force_quorum_refused_while_quorum_holds() {
    let fx = cluster_fixture("prod", 3);
    let cluster = fx.session.get_cluster("prod").unwrap();
    assert!(matches!(
        cluster.force_quorum_using_partition_of("n1:3306", ForceQuorumOptions::default()),
        Err(TopologyError::InvalidState(_))
    ));
}

#[test]
fn test_sync_timeout_rolls_back_add_instance() {
    let (fleet, nodes) = fleet_with(3);
    let mut config = TopologyConfig::default();
    config.timeouts.sync_timeout_ms = 50;
    let session = session_on(&fleet, config, Arc::new(NonInteractive));
    session
        .create_cluster(
            "prod",
            "n1:3306",
            CreateClusterOptions {
                gtid_set_complete: true,
                ..Default::default()
            },
        )
        .unwrap();
    let cluster = session.get_cluster("prod").unwrap();
    cluster.add_instance("n2:3306", AddInstanceOptions::default()).unwrap();
    fleet.write_transactions(&nodes[0], 10);

    fleet.stall_applier(&nodes[2], true);
    let err = cluster
        .add_instance("n3:3306", AddInstanceOptions::default())
        .unwrap_err();
    match err {
        TopologyError::SyncTimeout { instance, .. } => assert_eq!(instance, "n3:3306"),
        other => panic!("expected SyncTimeout, got {}", other),
    }

    // 回滚：既不在组内也不在元数据中
    assert!(!fleet.is_group_member(&nodes[2]));
    let status = cluster.status().unwrap();
    assert_eq!(status.members.len(), 2);
    assert!(status.members.iter().all(|m| m.address != "n3:3306"));

    fleet.stall_applier(&nodes[2], false);
    cluster.add_instance("n3:3306", AddInstanceOptions::default()).unwrap();
    assert_eq!(cluster.status().unwrap().members.len(), 3);
}

#[test]
fn test_switchover_and_remove_old_primary() {
    let fx = cluster_fixture("prod", 3);
    let cluster = fx.session.get_cluster("prod").unwrap();

    cluster.set_primary_instance("n2:3306", SetPrimaryOptions::default()).unwrap();
    assert_eq!(fx.fleet.group_primary(&fx.nodes[0]), Some(fx.nodes[1].clone()));
    assert_eq!(cluster.status().unwrap().primary.as_deref(), Some("n2:3306"));

    cluster.remove_instance("n1:3306", RemoveInstanceOptions::default()).unwrap();
    assert!(!fx.fleet.is_group_member(&fx.nodes[0]));
    let status = cluster.status().unwrap();
    assert_eq!(status.members.len(), 2);
    assert_eq!(status.primary.as_deref(), Some("n2:3306"));
}

#[test]
fn test_remove_unreachable_member_requires_force() {
    let fx = cluster_fixture("prod", 3);
    fx.fleet.kill(&fx.nodes[2]);
    let cluster = fx.session.get_cluster("prod").unwrap();

    assert!(matches!(
        cluster.remove_instance("n3:3306", RemoveInstanceOptions::default()),
        Err(TopologyError::Unreachable { .. })
    ));
    let report = cluster
        .remove_instance(
            "n3:3306",
            RemoveInstanceOptions {
                force: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(report.has_warnings());
    assert_eq!(cluster.status().unwrap().members.len(), 2);
}

#[test]
fn test_rescan_drops_member_that_left_the_group() {
    let fx = cluster_fixture("prod", 3);
    fx.fleet
        .apply_control(&fx.nodes[2], ControlCommand::StopGroupReplication)
        .unwrap();

    let cluster = fx.session.get_cluster("prod").unwrap();
    let dry = cluster
        .rescan(RescanOptions {
            dry_run: true,
            ..Default::default()
        })
        .unwrap();
    assert!(dry.notes.iter().any(|n| n.contains("n3:3306")));
    assert_eq!(cluster.status().unwrap().members.len(), 3);

    cluster
        .rescan(RescanOptions {
            remove_instances: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(cluster.status().unwrap().members.len(), 2);
}

#[test]
fn test_dissolve_removes_everything() {
    let fx = cluster_fixture("prod", 3);
    let cluster = fx.session.get_cluster("prod").unwrap();
    cluster.dissolve(DissolveOptions::default()).unwrap();

    for node in &fx.nodes {
        assert!(!fx.fleet.is_group_member(node));
    }
    assert!(matches!(fx.session.get_cluster("prod"), Err(TopologyError::NotFound(_))));
    // 名称可以复用
    fx.session
        .create_cluster(
            "prod",
            "n1:3306",
            CreateClusterOptions {
                gtid_set_complete: true,
                ..Default::default()
            },
        )
        .unwrap();
}

#[test]
fn test_read_replica_follows_primary_switch() {
    let fx = cluster_fixture("prod", 2);
    let replica = fx.fleet.add_node("n3:3306");
    let cluster = fx.session.get_cluster("prod").unwrap();

    let report = cluster
        .add_replica_instance(
            "n3:3306",
            AddReplicaInstanceOptions {
                label: Some("reporting".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(report.view_id.is_some());
    assert_eq!(fx.fleet.channel_source(&replica, READ_REPLICA_CHANNEL), Some(fx.nodes[0].clone()));
    assert!(fx.fleet.super_read_only(&replica));

    let status = cluster.status().unwrap();
    assert_eq!(status.members.len(), 2);
    assert_eq!(status.read_replicas.len(), 1);
    assert_eq!(status.read_replicas[0].label, "reporting");
    assert_eq!(status.read_replicas[0].sources, Some(vec!["PRIMARY".to_string()]));

    // 切换主节点后只读副本改为从新主节点复制
    cluster.set_primary_instance("n2:3306", SetPrimaryOptions::default()).unwrap();
    assert_eq!(fx.fleet.channel_source(&replica, READ_REPLICA_CHANNEL), Some(fx.nodes[1].clone()));
    let written = fx.fleet.write_transactions(&fx.nodes[1], 2);
    assert!(written.is_subset_of(&fx.fleet.gtid_executed(&replica)));

    cluster.remove_instance("n3:3306", RemoveInstanceOptions::default()).unwrap();
    assert_eq!(fx.fleet.channel_source(&replica, READ_REPLICA_CHANNEL), None);
    assert!(cluster.status().unwrap().read_replicas.is_empty());
}

#[test]
fn test_remove_source_of_unreachable_read_replica_warns() {
    let fx = cluster_fixture("prod", 3);
    let replica = fx.fleet.add_node("rr:3306");
    let cluster = fx.session.get_cluster("prod").unwrap();
    cluster
        .add_replica_instance(
            "rr:3306",
            AddReplicaInstanceOptions {
                sources: Some(ReplicationSources::Custom(vec![fx.nodes[1].clone()])),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(fx.fleet.channel_source(&replica, READ_REPLICA_CHANNEL), Some(fx.nodes[1].clone()));

    fx.fleet.kill(&replica);
    let report = cluster.remove_instance("n2:3306", RemoveInstanceOptions::default()).unwrap();
    assert!(
        report.warnings.iter().any(|w| w.contains("rr:3306")),
        "{:?}",
        report.warnings
    );

    // 元数据中的复制源已更新为跟随主节点
    let status = cluster.status().unwrap();
    assert_eq!(status.members.len(), 2);
    assert_eq!(status.read_replicas[0].sources, Some(vec!["PRIMARY".to_string()]));
}
