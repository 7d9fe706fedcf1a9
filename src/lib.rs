//! # QATOPOLOGY-RS
//!
//! 复制型数据库集群的拓扑编排引擎
//!
//! ## 核心能力
//!
//! - **Cluster**: 基于组复制的多节点集群（自动选主、多数派仲裁）
//! - **ReplicaSet**: 单主异步复制链
//! - **ClusterSet**: 一个主 Cluster + 多个副本 Cluster，由受管异步通道连接（跨地域容灾）
//! - **元数据**: 版本化的拓扑元数据存储，事务化写入，支持跨版本升级
//!
//! ## 架构设计
//!
//! ```text
//! 调用方 (CLI / 脚本层)
//!     ↓
//! Session (session.rs)  ← 显式上下文：元数据 + 节点客户端 + 交互端口
//!     ↓
//! Cluster / ReplicaSet / ClusterSet 句柄 (mutator/, clusterset/)
//!     ↓                    ↓                         ↓
//! 状态分类 + 仲裁      恢复方式决策 (recovery/)    GTID 对账 (gtid/)
//! (topology/)
//!     ↓
//! 实例探测 (probe/)  →  远端节点协议 (NodeClient)
//!     ↓
//! 元数据存储 + 升级引擎 (metadata/)
//! ```

pub mod clusterset;
pub mod gtid;
pub mod interaction;
pub mod metadata;
pub mod mutator;
pub mod observability;
pub mod probe;
pub mod recovery;
pub mod session;
pub mod topology;
pub mod utils;

// ============================================================================
// 重导出常用类型
// ============================================================================

pub use clusterset::ClusterSet;
pub use gtid::GtidSet;
pub use interaction::{InteractionPort, NonInteractive, ScriptedInteraction};
pub use metadata::{MetadataStore, MetadataVersion};
pub use mutator::{Cluster, OperationReport, ReplicaSet};
pub use probe::{ConfigIssue, InstanceAddress, NodeClient};
pub use recovery::{RecoveryMethod, RecoveryPolicy};
pub use session::Session;
pub use topology::InstanceState;

// ============================================================================
// 全局错误类型
// ============================================================================

/// 拓扑编排错误类型
///
/// 每个变体都有稳定的错误码（见 [`TopologyError::code`]），供调用方自动化处理。
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// 参数/名称/选项格式错误，在任何远端调用之前检出
    #[error("Argument error: {0}")]
    ArgumentError(String),

    /// 选项值类型不匹配
    #[error("Type error: {0}")]
    TypeError(String),

    /// 目标实例配置检查未通过
    #[error("Instance check failed for {instance}: {}", crate::probe::describe_issues(.issues))]
    InstanceCheckFailed {
        instance: String,
        issues: Vec<ConfigIssue>,
    },

    /// 无仲裁 / 仲裁不足
    #[error("Quorum error: {0}")]
    QuorumError(String),

    /// GTID 状态与请求的（或自动选择的）恢复方式不兼容
    #[error("Recovery state error: {0}")]
    RecoveryStateError(String),

    /// 复制通道缺失或状态异常
    #[error("Replication channel error: {0}")]
    ReplicationChannelError(String),

    /// 必需节点连接失败/超时
    #[error("Instance {instance} is unreachable: {reason}")]
    Unreachable { instance: String, reason: String },

    /// server_uuid / group_name 不一致，可能发生脑裂（不可 force 绕过）
    #[error("Metadata consistency error: {0}")]
    MetadataConsistency(String),

    /// 等待同步超时
    #[error("Timeout waiting for {instance} to apply transactions from {reference}; still missing: {missing}")]
    SyncTimeout {
        instance: String,
        reference: String,
        missing: String,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// 乐观事务冲突，调用方需重新读取拓扑
    #[error("Metadata conflict: {0}")]
    MetadataConflict(String),

    #[error("Metadata version error: {0}")]
    MetadataVersion(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl TopologyError {
    /// 稳定的机器可读错误码
    pub fn code(&self) -> u32 {
        match self {
            TopologyError::ArgumentError(_) => 51101,
            TopologyError::TypeError(_) => 51102,
            TopologyError::InstanceCheckFailed { .. } => 51150,
            TopologyError::QuorumError(_) => 51011,
            TopologyError::RecoveryStateError(_) => 51160,
            TopologyError::ReplicationChannelError(_) => 51140,
            TopologyError::Unreachable { .. } => 51118,
            TopologyError::MetadataConsistency(_) => 51130,
            TopologyError::SyncTimeout { .. } => 51157,
            TopologyError::InvalidState(_) => 51300,
            TopologyError::NotFound(_) => 51301,
            TopologyError::MetadataConflict(_) => 51131,
            TopologyError::MetadataVersion(_) => 51132,
            TopologyError::Cancelled(_) => 51035,
            TopologyError::IOError(_) => 51400,
            TopologyError::SerializationError(_) => 51401,
            TopologyError::ConfigError(_) => 51402,
            TopologyError::InternalError(_) => 51999,
        }
    }

    /// 面向运维人员的修复提示
    pub fn remediation(&self) -> Option<String> {
        let hint = match self {
            TopologyError::InstanceCheckFailed { issues, .. } => {
                if issues.iter().any(|i| i.restart_required) {
                    "Fix the listed variables in the option file and restart the instance.".to_string()
                } else {
                    "The listed variables can be changed on the running instance.".to_string()
                }
            }
            TopologyError::QuorumError(_) => {
                "Restore connectivity to a majority of members, or use forceQuorumUsingPartitionOf() / rebootClusterFromCompleteOutage().".to_string()
            }
            TopologyError::RecoveryStateError(_) => {
                "Choose recoveryMethod=clone, or re-provision the instance.".to_string()
            }
            TopologyError::ReplicationChannelError(_) => {
                "Fix the replication channel or retry with force: true.".to_string()
            }
            TopologyError::Unreachable { .. } => {
                "Check that the instance is running and reachable, or retry with force: true where supported.".to_string()
            }
            TopologyError::MetadataConsistency(_) => {
                "Verify the instance identity and group membership manually; this check cannot be bypassed.".to_string()
            }
            TopologyError::SyncTimeout { .. } => {
                "Increase the timeout or investigate replication lag on the instance.".to_string()
            }
            TopologyError::MetadataConflict(_) => {
                "Another operation changed the topology; retry the operation.".to_string()
            }
            TopologyError::MetadataVersion(_) => {
                "Run upgradeMetadata() with a compatible engine version.".to_string()
            }
            _ => return None,
        };
        Some(hint)
    }

    /// 是否允许通过 `force` 选项降级为警告
    pub fn is_force_bypassable(&self) -> bool {
        matches!(
            self,
            TopologyError::ReplicationChannelError(_)
                | TopologyError::Unreachable { .. }
                | TopologyError::SyncTimeout { .. }
        )
    }

    pub(crate) fn unreachable(instance: impl ToString, reason: impl ToString) -> Self {
        TopologyError::Unreachable {
            instance: instance.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<std::io::Error> for TopologyError {
    fn from(e: std::io::Error) -> Self {
        TopologyError::IOError(e.to_string())
    }
}

impl From<serde_json::Error> for TopologyError {
    fn from(e: serde_json::Error) -> Self {
        TopologyError::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TopologyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct() {
        let errors = vec![
            TopologyError::ArgumentError(String::new()),
            TopologyError::TypeError(String::new()),
            TopologyError::QuorumError(String::new()),
            TopologyError::RecoveryStateError(String::new()),
            TopologyError::ReplicationChannelError(String::new()),
            TopologyError::unreachable("a:1", "down"),
            TopologyError::MetadataConsistency(String::new()),
            TopologyError::InvalidState(String::new()),
            TopologyError::NotFound(String::new()),
            TopologyError::MetadataConflict(String::new()),
        ];
        let codes: std::collections::HashSet<u32> = errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_consistency_error_not_bypassable() {
        assert!(!TopologyError::MetadataConsistency("uuid mismatch".into()).is_force_bypassable());
        assert!(TopologyError::unreachable("a:1", "down").is_force_bypassable());
        assert!(TopologyError::MetadataConsistency("x".into()).remediation().is_some());
    }
}
