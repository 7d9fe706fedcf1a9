//! 拓扑元数据
//!
//! - [`schema`]: 版本化的实体表（Cluster / 实例 / ReplicaSet / ClusterSet / Router）与视图变更记录
//! - [`store`]: 乐观事务、操作锁与原子持久化
//! - [`upgrade`]: schema 跨版本迁移
//! - [`version`]: 版本号与兼容性判断

pub mod schema;
pub mod store;
pub mod upgrade;
pub mod version;

pub use schema::{
    ClusterId, ClusterRecord, ClusterRole, ClusterSetId, ClusterSetMembership, ClusterSetRecord,
    InstanceId, InstanceRecord, InstanceRole, MetadataSchema, ReplicaSetId, ReplicaSetRecord,
    ReplicationSources, RouterId, RouterRecord, TopologyRef, UpgradeState, ViewChangeReason,
    ViewChangeRecord,
};
pub use store::{MetadataStore, MetadataTransaction, OperationLock};
pub use upgrade::{MetadataUpgrader, UpgradeReport, UpgradeStep};
pub use version::{Compatibility, MetadataVersion};
