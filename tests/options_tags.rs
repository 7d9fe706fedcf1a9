// Cluster / 实例选项与标签
//
// 测试流程：
// 1. 内置标签的类型校验（_hidden 只接受 Bool）
// 2. null 删除标签
// 3. 组复制变量下发到所有成员
// 4. 重命名与标签冲突
// 5. dry run 不改变节点与元数据
// 6. 元数据提交失败时恢复已下发的变量

mod common;

use std::sync::Arc;

use common::{cluster_fixture, fleet_with};
use serde_json::{json, Value};

use qatopology::mutator::{AddInstanceOptions, CreateClusterOptions, SetOptionOptions};
use qatopology::utils::config::TopologyConfig;
use qatopology::{NonInteractive, Session, TopologyError};

#[test]
fn test_hidden_tag_requires_bool() {
    let fx = cluster_fixture("prod", 2);
    let cluster = fx.session.get_cluster("prod").unwrap();

    let err = cluster
        .set_instance_option("n2:3306", "tag:_hidden", json!("123"), SetOptionOptions::default())
        .unwrap_err();
    assert!(matches!(err, TopologyError::TypeError(ref m) if m.contains("Bool")));
    let err = cluster.set_option("tag:_hidden", json!("123"), SetOptionOptions::default()).unwrap_err();
    assert!(matches!(err, TopologyError::TypeError(_)));

    cluster
        .set_instance_option("n2:3306", "tag:_hidden", json!("true"), SetOptionOptions::default())
        .unwrap();
    let options = cluster.options().unwrap();
    assert_eq!(options.instances["n2:3306"].tags.get("_hidden"), Some(&Value::Bool(true)));

    // null 删除
    cluster
        .set_instance_option("n2:3306", "tag:_hidden", Value::Null, SetOptionOptions::default())
        .unwrap();
    let options = cluster.options().unwrap();
    assert!(options.instances["n2:3306"].tags.get("_hidden").is_none());
}

#[test]
fn test_custom_tags_and_reserved_names() {
    let fx = cluster_fixture("prod", 1);
    let cluster = fx.session.get_cluster("prod").unwrap();

    cluster.set_option("tag:owner", json!("dba-team"), SetOptionOptions::default()).unwrap();
    cluster.set_option("tag:tier", json!(1), SetOptionOptions::default()).unwrap();
    let options = cluster.options().unwrap();
    assert_eq!(options.tags.get("owner"), Some(&json!("dba-team")));
    assert_eq!(options.tags.get("tier"), Some(&json!(1)));

    assert!(matches!(
        cluster.set_option("tag:_secret", json!(true), SetOptionOptions::default()),
        Err(TopologyError::ArgumentError(_))
    ));
    assert!(matches!(
        cluster.set_option("tag:owner", json!({"a": 1}), SetOptionOptions::default()),
        Err(TopologyError::TypeError(_))
    ));
    assert!(matches!(
        cluster.set_option("noSuchOption", json!(1), SetOptionOptions::default()),
        Err(TopologyError::ArgumentError(_))
    ));

    cluster.set_option("tag:owner", Value::Null, SetOptionOptions::default()).unwrap();
    assert!(cluster.options().unwrap().tags.get("owner").is_none());
}

#[test]
fn test_group_variable_reaches_every_member() {
    let fx = cluster_fixture("prod", 3);
    let cluster = fx.session.get_cluster("prod").unwrap();

    cluster.set_option("memberWeight", json!(70), SetOptionOptions::default()).unwrap();
    for node in &fx.nodes {
        let status = fx.session.probe(node).unwrap();
        assert_eq!(status.variable("group_replication_member_weight"), Some("70"));
    }
    assert_eq!(cluster.options().unwrap().options.get("memberWeight"), Some(&json!(70)));

    assert!(matches!(
        cluster.set_option("memberWeight", json!(500), SetOptionOptions::default()),
        Err(TopologyError::ArgumentError(_)) | Err(TopologyError::TypeError(_))
    ));

    // 有成员不可达时拒绝
    fx.fleet.kill(&fx.nodes[2]);
    assert!(matches!(
        cluster.set_option("exitStateAction", json!("READ_ONLY"), SetOptionOptions::default()),
        Err(TopologyError::Unreachable { .. })
    ));
}

#[test]
fn test_rename_cluster_and_labels() {
    let fx = cluster_fixture("prod", 2);
    let cluster = fx.session.get_cluster("prod").unwrap();

    cluster.set_instance_option("n1:3306", "label", json!("east-1"), SetOptionOptions::default()).unwrap();
    assert!(matches!(
        cluster.set_instance_option("n2:3306", "label", json!("east-1"), SetOptionOptions::default()),
        Err(TopologyError::InvalidState(_)) | Err(TopologyError::ArgumentError(_))
    ));

    cluster.set_option("clusterName", json!("production"), SetOptionOptions::default()).unwrap();
    assert!(matches!(fx.session.get_cluster("prod"), Err(TopologyError::NotFound(_))));
    let renamed = fx.session.get_cluster("production").unwrap();
    let status = renamed.status().unwrap();
    assert_eq!(status.name, "production");
    assert!(status.members.iter().any(|m| m.label == "east-1"));
}

#[test]
fn test_dry_run_changes_nothing() {
    let fx = cluster_fixture("prod", 2);
    let cluster = fx.session.get_cluster("prod").unwrap();
    let dry = SetOptionOptions { dry_run: true };

    let report = cluster.set_option("memberWeight", json!(70), dry.clone()).unwrap();
    assert!(report.dry_run);
    assert!(report.view_id.is_none());
    cluster.set_option("tag:owner", json!("dba-team"), dry.clone()).unwrap();
    cluster
        .set_instance_option("n2:3306", "memberWeight", json!(20), dry.clone())
        .unwrap();
    cluster
        .set_instance_option("n2:3306", "tag:_hidden", json!(true), dry.clone())
        .unwrap();

    for node in &fx.nodes {
        let status = fx.session.probe(node).unwrap();
        assert_ne!(status.variable("group_replication_member_weight"), Some("70"));
        assert_ne!(status.variable("group_replication_member_weight"), Some("20"));
    }
    let options = cluster.options().unwrap();
    assert!(options.options.get("memberWeight").is_none());
    assert!(options.tags.get("owner").is_none());
    assert!(options.instances["n2:3306"].options.get("memberWeight").is_none());
    assert!(options.instances["n2:3306"].tags.get("_hidden").is_none());

    // dry run 仍然校验
    assert!(matches!(
        cluster.set_option("memberWeight", json!(500), dry.clone()),
        Err(TopologyError::ArgumentError(_)) | Err(TopologyError::TypeError(_))
    ));
    assert!(matches!(
        cluster.set_option("tag:_hidden", json!("123"), dry.clone()),
        Err(TopologyError::TypeError(_))
    ));
    fx.fleet.kill(&fx.nodes[1]);
    assert!(matches!(
        cluster.set_option("memberWeight", json!(70), dry),
        Err(TopologyError::Unreachable { .. })
    ));
}

#[test]
fn test_failed_commit_restores_variables() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metadata.json");
    let mut config = TopologyConfig::default();
    config.metadata.path = Some(path.to_string_lossy().to_string());

    let (fleet, nodes) = fleet_with(2);
    let session = Session::open(config, fleet, Arc::new(NonInteractive)).unwrap();
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
    cluster
        .set_option("memberWeight", json!(60), SetOptionOptions::default())
        .unwrap();

    // 临时文件位置被目录占用，元数据写盘失败
    let blocker = path.with_extension("tmp");
    std::fs::create_dir(&blocker).unwrap();
    assert!(matches!(
        cluster.set_option("memberWeight", json!(90), SetOptionOptions::default()),
        Err(TopologyError::IOError(_))
    ));
    assert!(matches!(
        cluster.set_instance_option("n2:3306", "memberWeight", json!(10), SetOptionOptions::default()),
        Err(TopologyError::IOError(_))
    ));
    for node in &nodes {
        let status = session.probe(node).unwrap();
        assert_eq!(status.variable("group_replication_member_weight"), Some("60"));
    }
    assert_eq!(cluster.options().unwrap().options.get("memberWeight"), Some(&json!(60)));

    std::fs::remove_dir(&blocker).unwrap();
    cluster
        .set_option("memberWeight", json!(90), SetOptionOptions::default())
        .unwrap();
    let status = session.probe(&nodes[1]).unwrap();
    assert_eq!(status.variable("group_replication_member_weight"), Some("90"));
}
