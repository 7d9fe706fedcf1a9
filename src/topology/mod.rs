//! 拓扑视图
//!
//! - [`state`]: 实例状态分类
//! - [`quorum`]: 多数派判定
//! - [`snapshot`]: 基于元数据 + 实时探测的拓扑快照

pub mod quorum;
pub mod snapshot;
pub mod state;

pub use quorum::QuorumStatus;
pub use snapshot::{
    ensure_consistent, ensure_member_consistent, find_member, refresh_cluster,
    refresh_replica_set, unreachable_members, ClusterSnapshot, MemberSnapshot, Probe,
    ProbeContext, ReplicaSetSnapshot, TopologySnapshot,
};
pub use state::{
    classify_async_member, classify_group_member, AsyncObservation, GroupObservation,
    InstanceState, UnreachableTracker,
};

/// ReplicaSet 使用的默认异步通道
pub const ASYNC_CHANNEL: &str = "";

/// 只读副本的复制通道
pub const READ_REPLICA_CHANNEL: &str = "read_replica_replication";
