//! 元数据 schema
//!
//! 所有实体存放在以稳定 ID 为键的表中，实体之间只通过 ID 互相引用
//! （实例 → 拓扑，Cluster → ClusterSet），没有所有权环。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::version::MetadataVersion;
use crate::probe::InstanceAddress;
use crate::{Result, TopologyError};

macro_rules! entity_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

entity_id!(ClusterId);
entity_id!(InstanceId);
entity_id!(ReplicaSetId);
entity_id!(ClusterSetId);
entity_id!(RouterId);

/// 拓扑引用（闭合的拓扑种类）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TopologyRef {
    Cluster(ClusterId),
    ReplicaSet(ReplicaSetId),
    ClusterSet(ClusterSetId),
}

impl TopologyRef {
    /// 操作锁使用的键
    pub fn lock_key(&self) -> String {
        match self {
            TopologyRef::Cluster(id) => format!("cluster:{}", id),
            TopologyRef::ReplicaSet(id) => format!("replicaset:{}", id),
            TopologyRef::ClusterSet(id) => format!("clusterset:{}", id),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// 实体记录
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterRole {
    Primary,
    Replica,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterRole::Primary => f.write_str("PRIMARY"),
            ClusterRole::Replica => f.write_str("REPLICA"),
        }
    }
}

/// Cluster 在 ClusterSet 中的成员关系
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSetMembership {
    pub clusterset_id: ClusterSetId,
    pub role: ClusterRole,
    pub invalidated: bool,
    /// 受管通道使用的复制账号
    pub replication_user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: ClusterId,
    pub name: String,
    pub group_name: String,
    #[serde(default)]
    pub view_change_uuid: Option<String>,
    pub single_primary: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub view_id: u64,
    #[serde(default)]
    pub disable_clone: bool,
    /// 声明组的 GTID 集合完整，空实例可直接增量恢复
    #[serde(default)]
    pub gtid_set_complete: bool,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    #[serde(default)]
    pub tags: BTreeMap<String, Value>,
    /// 旧版本遗留的自由属性
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub clusterset: Option<ClusterSetMembership>,
}

impl ClusterRecord {
    pub fn topology(&self) -> TopologyRef {
        TopologyRef::Cluster(self.id.clone())
    }

    pub fn is_invalidated(&self) -> bool {
        self.clusterset.as_ref().map(|m| m.invalidated).unwrap_or(false)
    }

    pub fn clusterset_role(&self) -> Option<ClusterRole> {
        self.clusterset.as_ref().map(|m| m.role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceRole {
    /// 组成员（Cluster）或复制链成员（ReplicaSet）
    Member,
    ReadReplica,
}

/// 只读副本的复制源列表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationSources {
    /// 始终跟随 Cluster 主节点
    Primary,
    /// 按顺序尝试的固定源
    Custom(Vec<InstanceAddress>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub address: InstanceAddress,
    pub server_uuid: String,
    pub server_id: u32,
    pub topology: TopologyRef,
    pub role: InstanceRole,
    pub label: String,
    #[serde(default)]
    pub replication_user: Option<String>,
    #[serde(default)]
    pub sources: Option<ReplicationSources>,
    #[serde(default)]
    pub member_index: u32,
    #[serde(default)]
    pub invalidated: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, Value>,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSetRecord {
    pub id: ReplicaSetId,
    pub name: String,
    pub primary: Option<InstanceId>,
    #[serde(default)]
    pub view_id: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    #[serde(default)]
    pub tags: BTreeMap<String, Value>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl ReplicaSetRecord {
    pub fn topology(&self) -> TopologyRef {
        TopologyRef::ReplicaSet(self.id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSetRecord {
    pub id: ClusterSetId,
    pub domain_name: String,
    pub primary_cluster: ClusterId,
    /// 全局视图号，任何拓扑事件都会递增
    pub view_id: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterRecord {
    pub id: RouterId,
    /// 1.x 的 Router 记录没有名称
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
    pub version: String,
    #[serde(default)]
    pub topology: Option<TopologyRef>,
    #[serde(default)]
    pub last_check_in: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl RouterRecord {
    /// `address::name` 形式的唯一标识
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{}::{}", self.address, name),
            None => self.address.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// 视图变更
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewChangeReason {
    Create,
    AddInstance,
    RemoveInstance,
    RejoinInstance,
    SwitchActive,
    ForcePrimary,
    ForceQuorum,
    Reboot,
    Rescan,
    SetOption,
    Dissolve,
    CreateClusterSet,
    CreateReplicaCluster,
    RemoveCluster,
    SwitchPrimaryCluster,
    ForcePrimaryCluster,
    RejoinCluster,
    Invalidate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewChangeRecord {
    pub topology: TopologyRef,
    pub view_id: u64,
    #[serde(default)]
    pub clusterset_id: Option<ClusterSetId>,
    #[serde(default)]
    pub clusterset_view_id: Option<u64>,
    pub reason: ViewChangeReason,
    pub actor: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// 元数据升级进度
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UpgradeState {
    #[default]
    Idle,
    InProgress {
        from: MetadataVersion,
        to: MetadataVersion,
        started_at: DateTime<Utc>,
        /// 已完成的迁移步骤（目标版本）
        completed: Vec<MetadataVersion>,
    },
}

// ═══════════════════════════════════════════════════════════════════
// Schema
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSchema {
    pub version: MetadataVersion,
    #[serde(default)]
    pub upgrade: UpgradeState,
    /// 每次成功提交递增，用于乐观并发控制
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub clusters: BTreeMap<ClusterId, ClusterRecord>,
    #[serde(default)]
    pub instances: BTreeMap<InstanceId, InstanceRecord>,
    #[serde(default)]
    pub replicasets: BTreeMap<ReplicaSetId, ReplicaSetRecord>,
    #[serde(default)]
    pub clustersets: BTreeMap<ClusterSetId, ClusterSetRecord>,
    #[serde(default)]
    pub routers: BTreeMap<RouterId, RouterRecord>,
    #[serde(default)]
    pub view_changes: Vec<ViewChangeRecord>,
}

impl Default for MetadataSchema {
    fn default() -> Self {
        Self::new(MetadataVersion::ENGINE)
    }
}

impl MetadataSchema {
    pub fn new(version: MetadataVersion) -> Self {
        Self {
            version,
            upgrade: UpgradeState::Idle,
            revision: 0,
            clusters: BTreeMap::new(),
            instances: BTreeMap::new(),
            replicasets: BTreeMap::new(),
            clustersets: BTreeMap::new(),
            routers: BTreeMap::new(),
            view_changes: Vec::new(),
        }
    }

    // ───────────────────────────── 查询 ─────────────────────────────

    pub fn cluster(&self, id: &ClusterId) -> Result<&ClusterRecord> {
        self.clusters
            .get(id)
            .ok_or_else(|| TopologyError::NotFound(format!("Cluster {} not found in metadata", id)))
    }

    pub fn cluster_mut(&mut self, id: &ClusterId) -> Result<&mut ClusterRecord> {
        self.clusters
            .get_mut(id)
            .ok_or_else(|| TopologyError::NotFound(format!("Cluster {} not found in metadata", id)))
    }

    pub fn cluster_by_name(&self, name: &str) -> Option<&ClusterRecord> {
        self.clusters
            .values()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn replicaset(&self, id: &ReplicaSetId) -> Result<&ReplicaSetRecord> {
        self.replicasets
            .get(id)
            .ok_or_else(|| TopologyError::NotFound(format!("ReplicaSet {} not found in metadata", id)))
    }

    pub fn replicaset_mut(&mut self, id: &ReplicaSetId) -> Result<&mut ReplicaSetRecord> {
        self.replicasets
            .get_mut(id)
            .ok_or_else(|| TopologyError::NotFound(format!("ReplicaSet {} not found in metadata", id)))
    }

    pub fn replicaset_by_name(&self, name: &str) -> Option<&ReplicaSetRecord> {
        self.replicasets
            .values()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    pub fn clusterset(&self, id: &ClusterSetId) -> Result<&ClusterSetRecord> {
        self.clustersets
            .get(id)
            .ok_or_else(|| TopologyError::NotFound(format!("ClusterSet {} not found in metadata", id)))
    }

    pub fn clusterset_mut(&mut self, id: &ClusterSetId) -> Result<&mut ClusterSetRecord> {
        self.clustersets
            .get_mut(id)
            .ok_or_else(|| TopologyError::NotFound(format!("ClusterSet {} not found in metadata", id)))
    }

    /// 名称在 Cluster 与 ReplicaSet 之间唯一（大小写不敏感）
    pub fn is_name_taken(&self, name: &str) -> bool {
        self.cluster_by_name(name).is_some() || self.replicaset_by_name(name).is_some()
    }

    /// 拓扑内的实例，按加入顺序
    pub fn instances_of(&self, topology: &TopologyRef) -> Vec<&InstanceRecord> {
        let mut members: Vec<&InstanceRecord> = self
            .instances
            .values()
            .filter(|i| &i.topology == topology)
            .collect();
        members.sort_by_key(|i| i.member_index);
        members
    }

    pub fn instance(&self, id: &InstanceId) -> Result<&InstanceRecord> {
        self.instances
            .get(id)
            .ok_or_else(|| TopologyError::NotFound(format!("Instance {} not found in metadata", id)))
    }

    pub fn instance_mut(&mut self, id: &InstanceId) -> Result<&mut InstanceRecord> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| TopologyError::NotFound(format!("Instance {} not found in metadata", id)))
    }

    pub fn instance_by_address(&self, address: &InstanceAddress) -> Option<&InstanceRecord> {
        self.instances.values().find(|i| &i.address == address)
    }

    pub fn clusters_in_set(&self, id: &ClusterSetId) -> Vec<&ClusterRecord> {
        self.clusters
            .values()
            .filter(|c| c.clusterset.as_ref().map(|m| &m.clusterset_id) == Some(id))
            .collect()
    }

    pub fn next_member_index(&self, topology: &TopologyRef) -> u32 {
        self.instances_of(topology)
            .last()
            .map(|i| i.member_index + 1)
            .unwrap_or(0)
    }

    pub fn routers_of(&self, topology: &TopologyRef) -> Vec<&RouterRecord> {
        self.routers
            .values()
            .filter(|r| r.topology.as_ref() == Some(topology))
            .collect()
    }

    // ───────────────────────────── 修改 ─────────────────────────────

    /// 记录一次视图变更并递增视图号；所属 ClusterSet 的全局视图号同步递增
    pub fn record_view_change(
        &mut self,
        topology: &TopologyRef,
        reason: ViewChangeReason,
        actor: &str,
        detail: impl Into<String>,
    ) -> Result<u64> {
        let (view_id, clusterset_id) = match topology {
            TopologyRef::Cluster(id) => {
                let cluster = self.cluster_mut(id)?;
                cluster.view_id += 1;
                (
                    cluster.view_id,
                    cluster.clusterset.as_ref().map(|m| m.clusterset_id.clone()),
                )
            }
            TopologyRef::ReplicaSet(id) => {
                let rs = self.replicaset_mut(id)?;
                rs.view_id += 1;
                (rs.view_id, None)
            }
            TopologyRef::ClusterSet(id) => (0, Some(id.clone())),
        };

        let clusterset_view_id = match &clusterset_id {
            Some(cs_id) => {
                let cs = self.clusterset_mut(cs_id)?;
                cs.view_id += 1;
                Some(cs.view_id)
            }
            None => None,
        };

        let view_id = match topology {
            TopologyRef::ClusterSet(_) => clusterset_view_id.unwrap_or(0),
            _ => view_id,
        };

        self.view_changes.push(ViewChangeRecord {
            topology: topology.clone(),
            view_id,
            clusterset_id,
            clusterset_view_id,
            reason,
            actor: actor.to_string(),
            detail: detail.into(),
            at: Utc::now(),
        });
        Ok(view_id)
    }

    /// 注册（或刷新）一个 Router
    pub fn register_router(
        &mut self,
        name: &str,
        address: &str,
        version: &str,
        topology: Option<TopologyRef>,
    ) -> RouterId {
        if let Some(existing) = self
            .routers
            .values_mut()
            .find(|r| r.address == address && r.name.as_deref() == Some(name))
        {
            existing.version = version.to_string();
            existing.topology = topology;
            existing.last_check_in = Some(Utc::now());
            return existing.id.clone();
        }
        let id = RouterId::generate();
        self.routers.insert(
            id.clone(),
            RouterRecord {
                id: id.clone(),
                name: Some(name.to_string()),
                address: address.to_string(),
                version: version.to_string(),
                topology,
                last_check_in: Some(Utc::now()),
                attributes: BTreeMap::new(),
            },
        );
        id
    }

    pub fn view_changes_of(&self, topology: &TopologyRef) -> Vec<&ViewChangeRecord> {
        self.view_changes
            .iter()
            .filter(|v| &v.topology == topology)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(schema: &mut MetadataSchema, name: &str) -> ClusterId {
        let id = ClusterId::generate();
        schema.clusters.insert(
            id.clone(),
            ClusterRecord {
                id: id.clone(),
                name: name.to_string(),
                group_name: uuid::Uuid::new_v4().to_string(),
                view_change_uuid: None,
                single_primary: true,
                created_at: Utc::now(),
                view_id: 0,
                disable_clone: false,
                gtid_set_complete: false,
                options: BTreeMap::new(),
                tags: BTreeMap::new(),
                attributes: BTreeMap::new(),
                clusterset: None,
            },
        );
        id
    }

    #[test]
    fn test_names_case_insensitive() {
        let mut schema = MetadataSchema::default();
        cluster(&mut schema, "Prod_East");
        assert!(schema.is_name_taken("prod_east"));
        assert!(!schema.is_name_taken("prod_west"));
    }

    #[test]
    fn test_view_change_bumps_clusterset_view() {
        let mut schema = MetadataSchema::default();
        let c = cluster(&mut schema, "c1");
        let cs_id = ClusterSetId::generate();
        schema.clustersets.insert(
            cs_id.clone(),
            ClusterSetRecord {
                id: cs_id.clone(),
                domain_name: "dom".to_string(),
                primary_cluster: c.clone(),
                view_id: 1,
                created_at: Utc::now(),
            },
        );
        schema.cluster_mut(&c).unwrap().clusterset = Some(ClusterSetMembership {
            clusterset_id: cs_id.clone(),
            role: ClusterRole::Primary,
            invalidated: false,
            replication_user: None,
        });

        let topo = TopologyRef::Cluster(c.clone());
        assert_eq!(schema.record_view_change(&topo, ViewChangeReason::AddInstance, "t", "").unwrap(), 1);
        assert_eq!(schema.record_view_change(&topo, ViewChangeReason::AddInstance, "t", "").unwrap(), 2);
        assert_eq!(schema.clusterset(&cs_id).unwrap().view_id, 3);

        let cs_topo = TopologyRef::ClusterSet(cs_id.clone());
        assert_eq!(
            schema.record_view_change(&cs_topo, ViewChangeReason::Invalidate, "t", "").unwrap(),
            4
        );
        assert_eq!(schema.view_changes.len(), 3);
    }

    #[test]
    fn test_register_router_refreshes_existing() {
        let mut schema = MetadataSchema::default();
        let a = schema.register_router("r1", "app1", "8.0.18", None);
        let b = schema.register_router("r1", "app1", "8.0.30", None);
        assert_eq!(a, b);
        assert_eq!(schema.routers.len(), 1);
        assert_eq!(schema.routers[&a].version, "8.0.30");
    }

    #[test]
    fn test_json_round_trip_keeps_ids() {
        let mut schema = MetadataSchema::default();
        let id = cluster(&mut schema, "c1");
        let json = serde_json::to_string(&schema).unwrap();
        let back: MetadataSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cluster(&id).unwrap().name, "c1");
        assert_eq!(back.version, MetadataVersion::ENGINE);
    }
}
