// 集成测试公共工具：内存节点集 + 会话构造

#![allow(dead_code)]

use std::sync::Arc;

use qatopology::interaction::{InteractionPort, NonInteractive};
use qatopology::mutator::{AddInstanceOptions, CreateClusterOptions};
use qatopology::probe::MemoryFleet;
use qatopology::utils::config::TopologyConfig;
use qatopology::{InstanceAddress, MetadataStore, Session};

/// 测试环境
pub struct Fixture {
    pub fleet: Arc<MemoryFleet>,
    pub session: Session,
    pub nodes: Vec<InstanceAddress>,
}

/// 创建 `count` 个节点 `n1:3306` .. `nN:3306`
pub fn fleet_with(count: usize) -> (Arc<MemoryFleet>, Vec<InstanceAddress>) {
    let fleet = Arc::new(MemoryFleet::new());
    let nodes = (1..=count)
        .map(|i| fleet.add_node(&format!("n{}:3306", i)))
        .collect();
    (fleet, nodes)
}

pub fn session_on(
    fleet: &Arc<MemoryFleet>,
    config: TopologyConfig,
    interaction: Arc<dyn InteractionPort>,
) -> Session {
    Session::new(config, Arc::new(MetadataStore::in_memory()), fleet.clone(), interaction)
}

/// 同一元数据与节点集上换一个交互端口
pub fn with_interaction(session: &Session, fleet: &Arc<MemoryFleet>, interaction: Arc<dyn InteractionPort>) -> Session {
    let store = Arc::new(MetadataStore::with_schema(session.store().snapshot()));
    Session::new(session.config().clone(), store, fleet.clone(), interaction)
}

/// `count` 个节点组成的单主 Cluster，n1 为主节点
pub fn cluster_fixture(name: &str, count: usize) -> Fixture {
    let (fleet, nodes) = fleet_with(count);
    let session = session_on(&fleet, TopologyConfig::default(), Arc::new(NonInteractive));
    session
        .create_cluster(
            name,
            &nodes[0].to_string(),
            CreateClusterOptions {
                gtid_set_complete: true,
                ..Default::default()
            },
        )
        .expect("create cluster");
    let cluster = session.get_cluster(name).expect("get cluster");
    for node in nodes.iter().skip(1) {
        cluster
            .add_instance(&node.to_string(), AddInstanceOptions::default())
            .expect("add instance");
    }
    Fixture { fleet, session, nodes }
}
