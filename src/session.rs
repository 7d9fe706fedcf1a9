//! 会话上下文
//!
//! 显式持有元数据存储、节点客户端、交互端口与配置，贯穿每一次调用；
//! 进程内没有全局可变状态（Prometheus registry 除外）。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::clusterset::ClusterSet;
use crate::interaction::InteractionPort;
use crate::metadata::{
    ClusterId, MetadataStore, MetadataUpgrader, ReplicaSetId, RouterId, TopologyRef, UpgradeReport,
};
use crate::mutator::{
    self, Cluster, CreateClusterOptions, CreateReplicaSetOptions, OperationReport, RebootOptions,
    ReplicaSet,
};
use crate::observability::OperationTimer;
use crate::probe::{
    check_configuration, describe_issues, ConfigIssue, InstanceAddress, InstanceStatus,
    NodeClient, ServerVersion,
};
use crate::topology::{
    refresh_cluster, refresh_replica_set, ClusterSnapshot, ProbeContext, ReplicaSetSnapshot,
    UnreachableTracker,
};
use crate::utils::config::TopologyConfig;
use crate::{Result, TopologyError};

#[derive(Clone)]
pub struct Session {
    config: Arc<TopologyConfig>,
    store: Arc<MetadataStore>,
    client: Arc<dyn NodeClient>,
    interaction: Arc<dyn InteractionPort>,
    tracker: Arc<UnreachableTracker>,
}

/// `listRouters()` 的单项
#[derive(Debug, Clone, Serialize)]
pub struct RouterSummary {
    pub id: RouterId,
    pub label: String,
    pub version: String,
    pub target: Option<String>,
    pub last_check_in: Option<DateTime<Utc>>,
    pub upgrade_required: bool,
}

impl Session {
    pub fn new(
        config: TopologyConfig,
        store: Arc<MetadataStore>,
        client: Arc<dyn NodeClient>,
        interaction: Arc<dyn InteractionPort>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            client,
            interaction,
            tracker: Arc::new(UnreachableTracker::new()),
        }
    }

    /// 按配置打开元数据存储（未配置路径时使用内存存储）
    pub fn open(
        config: TopologyConfig,
        client: Arc<dyn NodeClient>,
        interaction: Arc<dyn InteractionPort>,
    ) -> Result<Self> {
        let store = match &config.metadata.path {
            Some(path) => MetadataStore::open(
                path,
                &config.metadata.backup_suffix,
                config.metadata.max_commit_retries,
            )?,
            None => MetadataStore::in_memory(),
        };
        log::info!(
            "Session opened (metadata version {}, actor '{}')",
            store.version(),
            config.server.actor
        );
        Ok(Self::new(config, Arc::new(store), client, interaction))
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn client(&self) -> &dyn NodeClient {
        self.client.as_ref()
    }

    pub fn interaction(&self) -> &dyn InteractionPort {
        self.interaction.as_ref()
    }

    pub fn actor(&self) -> &str {
        &self.config.server.actor
    }

    pub fn is_interactive(&self) -> bool {
        self.interaction.is_interactive()
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        self.config.timeouts.sync_timeout()
    }

    pub fn clone_floor(&self) -> Result<ServerVersion> {
        self.config.recovery.clone_minimum_version()
    }

    pub(crate) fn probe_context(&self) -> ProbeContext<'_> {
        ProbeContext {
            client: self.client.as_ref(),
            tracker: self.tracker.as_ref(),
            failure_window: self.config.timeouts.failure_detection_window(),
        }
    }

    pub fn probe(&self, address: &InstanceAddress) -> Result<InstanceStatus> {
        self.client.get_status(address)
    }

    /// 变更操作前检查元数据版本
    pub fn ensure_metadata_writable(&self) -> Result<()> {
        self.store.ensure_writable()
    }

    /// 统一的操作入口：日志 + 指标
    pub(crate) fn run_operation<T>(
        &self,
        operation: &str,
        target: &str,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let timer = OperationTimer::start(operation);
        log::info!("[{}] {} started", target, operation);
        let result = f();
        match &result {
            Ok(_) => {
                timer.observe("ok");
                log::info!("[{}] {} completed", target, operation);
            }
            Err(e) => {
                timer.observe("error");
                log::warn!("[{}] {} failed: {} (code {})", target, operation, e, e.code());
            }
        }
        result
    }

    pub fn refresh_cluster(&self, id: &ClusterId) -> Result<ClusterSnapshot> {
        let schema = self.store.snapshot();
        refresh_cluster(&self.probe_context(), &schema, id)
    }

    pub fn refresh_replica_set(&self, id: &ReplicaSetId) -> Result<ReplicaSetSnapshot> {
        let schema = self.store.snapshot();
        refresh_replica_set(&self.probe_context(), &schema, id)
    }

    // ═══════════════════════════════════════════════════════════════════
    // 拓扑入口
    // ═══════════════════════════════════════════════════════════════════

    pub fn create_cluster(
        &self,
        name: &str,
        seed: &str,
        options: CreateClusterOptions,
    ) -> Result<OperationReport> {
        self.run_operation("createCluster", seed, || {
            mutator::cluster::create_cluster(self, name, seed, &options)
        })
    }

    pub fn get_cluster(&self, name: &str) -> Result<Cluster> {
        let record = self
            .store
            .read(|s| s.cluster_by_name(name).cloned())
            .ok_or_else(|| TopologyError::NotFound(format!("Cluster '{}' not found", name)))?;
        Ok(Cluster::new(self.clone(), record.id, record.name))
    }

    pub fn create_replica_set(
        &self,
        name: &str,
        seed: &str,
        options: CreateReplicaSetOptions,
    ) -> Result<OperationReport> {
        self.run_operation("createReplicaSet", seed, || {
            mutator::replicaset::create_replica_set(self, name, seed, &options)
        })
    }

    pub fn get_replica_set(&self, name: &str) -> Result<ReplicaSet> {
        let record = self
            .store
            .read(|s| s.replicaset_by_name(name).cloned())
            .ok_or_else(|| TopologyError::NotFound(format!("ReplicaSet '{}' not found", name)))?;
        Ok(ReplicaSet::new(self.clone(), record.id, record.name))
    }

    pub fn get_cluster_set(&self, domain: &str) -> Result<ClusterSet> {
        let record = self
            .store
            .read(|s| {
                s.clustersets
                    .values()
                    .find(|cs| cs.domain_name.eq_ignore_ascii_case(domain))
                    .cloned()
            })
            .ok_or_else(|| TopologyError::NotFound(format!("ClusterSet '{}' not found", domain)))?;
        Ok(ClusterSet::new(self.clone(), record.id, record.domain_name))
    }

    pub fn reboot_cluster_from_complete_outage(
        &self,
        name: &str,
        options: RebootOptions,
    ) -> Result<OperationReport> {
        self.run_operation("rebootClusterFromCompleteOutage", name, || {
            mutator::reboot::reboot_cluster(self, name, &options)
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // 元数据与 Router
    // ═══════════════════════════════════════════════════════════════════

    pub fn upgrade_metadata(&self, dry_run: bool) -> Result<UpgradeReport> {
        let floor = self.config.routers.minimum_version()?;
        self.run_operation("upgradeMetadata", "metadata", || {
            MetadataUpgrader::new(&self.store, self.interaction.as_ref(), floor).run(dry_run)
        })
    }

    pub fn check_instance_configuration(&self, instance: &str) -> Result<Vec<ConfigIssue>> {
        let address: InstanceAddress = instance.parse()?;
        let status = self.probe(&address)?;
        let issues = check_configuration(&status);
        if issues.is_empty() {
            log::info!("[{}] Instance configuration is valid", address);
        } else {
            log::warn!(
                "[{}] Instance configuration needs changes: {}",
                address,
                describe_issues(&issues)
            );
        }
        Ok(issues)
    }

    /// Router 启动时注册自身；`target` 为 Cluster / ReplicaSet 名称或 ClusterSet 域名
    pub fn register_router(
        &self,
        name: &str,
        address: &str,
        version: &str,
        target: Option<&str>,
    ) -> Result<RouterId> {
        let topology = match target {
            Some(t) => Some(self.resolve_target(t)?),
            None => None,
        };
        self.store.update(|schema| {
            Ok(schema.register_router(name, address, version, topology.clone()))
        })
    }

    pub fn list_routers(&self) -> Result<Vec<RouterSummary>> {
        let floor = self.config.routers.minimum_version()?;
        let schema = self.store.snapshot();
        let mut routers: Vec<RouterSummary> = schema
            .routers
            .values()
            .map(|r| RouterSummary {
                id: r.id.clone(),
                label: r.label(),
                version: r.version.clone(),
                target: r.topology.as_ref().map(|t| describe_target(&schema, t)),
                last_check_in: r.last_check_in,
                upgrade_required: r
                    .version
                    .parse::<ServerVersion>()
                    .map(|v| v < floor)
                    .unwrap_or(true),
            })
            .collect();
        routers.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(routers)
    }

    /// 按 `address::name` 标签或 ID 删除 Router 记录
    pub fn remove_router_metadata(&self, router: &str) -> Result<()> {
        self.ensure_metadata_writable()?;
        self.store.update(|schema| {
            let id = schema
                .routers
                .values()
                .find(|r| r.label() == router || r.id.as_str() == router)
                .map(|r| r.id.clone())
                .ok_or_else(|| {
                    TopologyError::NotFound(format!("Router '{}' is not registered", router))
                })?;
            schema.routers.remove(&id);
            Ok(())
        })?;
        log::info!("Router '{}' removed from the metadata", router);
        Ok(())
    }

    fn resolve_target(&self, target: &str) -> Result<TopologyRef> {
        self.store.read(|s| {
            if let Some(c) = s.cluster_by_name(target) {
                return Ok(c.topology());
            }
            if let Some(r) = s.replicaset_by_name(target) {
                return Ok(r.topology());
            }
            s.clustersets
                .values()
                .find(|cs| cs.domain_name.eq_ignore_ascii_case(target))
                .map(|cs| TopologyRef::ClusterSet(cs.id.clone()))
                .ok_or_else(|| TopologyError::NotFound(format!("Topology '{}' not found", target)))
        })
    }
}

fn describe_target(schema: &crate::metadata::MetadataSchema, topology: &TopologyRef) -> String {
    match topology {
        TopologyRef::Cluster(id) => schema
            .cluster(id)
            .map(|c| format!("cluster:{}", c.name))
            .unwrap_or_else(|_| format!("cluster:{}", id)),
        TopologyRef::ReplicaSet(id) => schema
            .replicaset(id)
            .map(|r| format!("replicaset:{}", r.name))
            .unwrap_or_else(|_| format!("replicaset:{}", id)),
        TopologyRef::ClusterSet(id) => schema
            .clusterset(id)
            .map(|cs| format!("clusterset:{}", cs.domain_name))
            .unwrap_or_else(|_| format!("clusterset:{}", id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::NonInteractive;
    use crate::probe::MemoryFleet;

    fn session() -> (Arc<MemoryFleet>, Session) {
        let fleet = Arc::new(MemoryFleet::new());
        let session = Session::new(
            TopologyConfig::default(),
            Arc::new(MetadataStore::in_memory()),
            fleet.clone(),
            Arc::new(NonInteractive),
        );
        (fleet, session)
    }

    #[test]
    fn test_check_instance_configuration() {
        let (fleet, session) = session();
        let a = fleet.add_node("a:3306");
        assert!(session.check_instance_configuration("a:3306").unwrap().is_empty());

        fleet.set_variable(&a, "binlog_format", "MIXED");
        let issues = session.check_instance_configuration("a:3306").unwrap();
        assert_eq!(issues.len(), 1);
        assert!(!issues[0].restart_required);
    }

    #[test]
    fn test_router_registration_and_removal() {
        let (_fleet, session) = session();
        session.register_router("r1", "app1", "8.0.18", None).unwrap();
        session.register_router("r2", "app2", "8.0.35", None).unwrap();

        let routers = session.list_routers().unwrap();
        assert_eq!(routers.len(), 2);
        assert!(routers[0].upgrade_required);
        assert!(!routers[1].upgrade_required);

        session.remove_router_metadata("app1::r1").unwrap();
        assert_eq!(session.list_routers().unwrap().len(), 1);
        assert!(matches!(
            session.remove_router_metadata("app1::r1"),
            Err(TopologyError::NotFound(_))
        ));
    }

    #[test]
    fn test_unknown_topologies() {
        let (_fleet, session) = session();
        assert!(matches!(session.get_cluster("nope"), Err(TopologyError::NotFound(_))));
        assert!(matches!(session.get_replica_set("nope"), Err(TopologyError::NotFound(_))));
        assert!(matches!(session.get_cluster_set("nope"), Err(TopologyError::NotFound(_))));
    }
}
