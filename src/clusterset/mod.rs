//! ClusterSet
//!
//! 一个主 Cluster 加若干副本 Cluster，副本经 managed 异步通道从主 Cluster 的主节点复制。
//!
//! - [`channel`]: 通道的建立、校验、迁移与拆除
//! - [`manager`]: 创建、移除、切换、强制切换、重新加入
//! - [`status`]: 全局状态与事务一致性

pub mod channel;
pub(crate) mod manager;
pub mod status;

pub use channel::{ChannelHealth, ChannelManager, CLUSTERSET_CHANNEL};
pub use status::{ClusterSetDescription, ClusterSetHealth, ClusterSetStatus, MemberClusterStatus};

use crate::metadata::{ClusterRecord, ClusterSetId, ClusterSetRecord, OperationLock, TopologyRef};
use crate::mutator::{Cluster, OperationReport};
use crate::recovery::RecoveryPolicy;
use crate::session::Session;
use crate::{Result, TopologyError};

#[derive(Debug, Clone, Default)]
pub struct CreateReplicaClusterOptions {
    pub dry_run: bool,
    pub recovery_method: Option<RecoveryPolicy>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveClusterOptions {
    pub dry_run: bool,
    /// 副本 Cluster 不可达时只删除元数据
    pub force: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SetPrimaryClusterOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ForcePrimaryClusterOptions {
    pub dry_run: bool,
    /// 直接失效而不重新指向的副本 Cluster
    pub invalidate_replica_clusters: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RejoinClusterOptions {
    pub dry_run: bool,
}

/// ClusterSet 句柄
#[derive(Clone)]
pub struct ClusterSet {
    session: Session,
    id: ClusterSetId,
    domain: String,
}

impl ClusterSet {
    pub(crate) fn new(session: Session, id: ClusterSetId, domain: String) -> Self {
        Self { session, id, domain }
    }

    pub fn id(&self) -> &ClusterSetId {
        &self.id
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn topology(&self) -> TopologyRef {
        TopologyRef::ClusterSet(self.id.clone())
    }

    /// ClusterSet 记录与其全部 Cluster
    pub(crate) fn load(&self) -> Result<(ClusterSetRecord, Vec<ClusterRecord>)> {
        self.session.store().read(|schema| {
            let record = schema.clusterset(&self.id)?.clone();
            let clusters = schema
                .clusters_in_set(&self.id)
                .into_iter()
                .cloned()
                .collect();
            Ok((record, clusters))
        })
    }

    pub(crate) fn find_cluster<'a>(clusters: &'a [ClusterRecord], name: &str) -> Result<&'a ClusterRecord> {
        clusters
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                TopologyError::NotFound(format!("Cluster '{}' is not part of the ClusterSet", name))
            })
    }

    /// ClusterSet 锁，再加上涉及的 Cluster 锁
    pub(crate) fn lock_for(
        &self,
        operation: &str,
        clusters: &[&ClusterRecord],
    ) -> Result<Vec<OperationLock<'_>>> {
        self.session.ensure_metadata_writable()?;
        let store = self.session.store();
        let mut locks = vec![store.lock_topology(&self.topology().lock_key(), operation)?];
        for cluster in clusters {
            locks.push(store.lock_topology(&cluster.topology().lock_key(), operation)?);
        }
        Ok(locks)
    }

    pub fn get_cluster(&self, name: &str) -> Result<Cluster> {
        let (_, clusters) = self.load()?;
        let record = Self::find_cluster(&clusters, name)?;
        Ok(Cluster::new(self.session.clone(), record.id.clone(), record.name.clone()))
    }

    // ═══════════════════════════════════════════════════════════════════
    // 变更
    // ═══════════════════════════════════════════════════════════════════

    /// 以 `instance` 为种子创建副本 Cluster
    pub fn create_replica_cluster(
        &self,
        instance: &str,
        name: &str,
        options: CreateReplicaClusterOptions,
    ) -> Result<OperationReport> {
        self.session.run_operation("createReplicaCluster", instance, || {
            manager::create_replica_cluster(self, instance, name, &options)
        })
    }

    pub fn remove_cluster(&self, name: &str, options: RemoveClusterOptions) -> Result<OperationReport> {
        self.session
            .run_operation("removeCluster", name, || manager::remove_cluster(self, name, &options))
    }

    /// 计划内切换主 Cluster
    pub fn set_primary_cluster(&self, name: &str, options: SetPrimaryClusterOptions) -> Result<OperationReport> {
        self.session.run_operation("setPrimaryCluster", name, || {
            manager::set_primary_cluster(self, name, &options)
        })
    }

    /// 主 Cluster 不可用时的故障转移
    pub fn force_primary_cluster(
        &self,
        name: &str,
        options: ForcePrimaryClusterOptions,
    ) -> Result<OperationReport> {
        self.session.run_operation("forcePrimaryCluster", name, || {
            manager::force_primary_cluster(self, name, &options)
        })
    }

    pub fn rejoin_cluster(&self, name: &str, options: RejoinClusterOptions) -> Result<OperationReport> {
        self.session
            .run_operation("rejoinCluster", name, || manager::rejoin_cluster(self, name, &options))
    }

    // ═══════════════════════════════════════════════════════════════════
    // 查询
    // ═══════════════════════════════════════════════════════════════════

    pub fn status(&self) -> Result<ClusterSetStatus> {
        status::cluster_set_status(self)
    }

    /// 只读元数据描述，不探测实例
    pub fn describe(&self) -> Result<ClusterSetDescription> {
        status::describe(self)
    }
}
