//! 实例探测
//!
//! - [`node`]: 节点状态模型与远端协议 [`NodeClient`]
//! - [`check`]: 加入拓扑前的配置检查
//! - [`memory`]: 进程内节点集群实现

pub mod check;
pub mod memory;
pub mod node;

pub use check::{
    check_configuration, describe_issues, ensure_standalone, ensure_unique_identity,
    ensure_valid_configuration, ConfigIssue,
};
pub use memory::MemoryFleet;
pub use node::{
    ChannelError, ChannelState, ChannelStatus, ControlCommand, GroupMember, GroupMemberState,
    GroupView, InstanceAddress, InstanceStatus, MemberRole, NodeClient, ReplicationCredentials,
    ServerVersion, ThreadState,
};
