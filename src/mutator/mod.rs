//! 拓扑变更
//!
//! Cluster / ReplicaSet 句柄上的 add / remove / rejoin / set-primary / force-primary 等操作。
//! 每个变更操作：
//!
//! 1. 检查元数据版本并获取拓扑级操作锁
//! 2. 重新探测拓扑（快照不跨操作复用）
//! 3. 校验仲裁、身份一致性与目标实例
//! 4. dry-run 到此为止：只返回决策结果
//! 5. 执行远端变更，失败时回滚已完成的步骤
//! 6. 事务化写入元数据并记录视图变更

pub mod cluster;
pub mod options;
pub mod reboot;
pub mod replicaset;

pub use cluster::{Cluster, ClusterHealth, ClusterOptionsView, ClusterStatus, MemberStatus};
pub use replicaset::{ReplicaSet, ReplicaSetHealth, ReplicaSetStatus};

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::metadata::{
    InstanceId, InstanceRecord, InstanceRole, MetadataSchema, ReplicationSources, TopologyRef,
    ViewChangeReason,
};
use crate::probe::{
    ensure_standalone, ensure_unique_identity, ensure_valid_configuration, ControlCommand,
    InstanceAddress, InstanceStatus, NodeClient, ServerVersion,
};
use crate::recovery::{RecoveryMethod, RecoveryPolicy};
use crate::session::Session;
use crate::{Result, TopologyError};

// ═══════════════════════════════════════════════════════════════════
// 操作报告
// ═══════════════════════════════════════════════════════════════════

/// 变更操作的结果
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub operation: String,
    pub target: String,
    pub dry_run: bool,
    pub recovery_method: Option<RecoveryMethod>,
    pub notes: Vec<String>,
    /// 降级为警告的尽力而为步骤
    pub warnings: Vec<String>,
    pub view_id: Option<u64>,
}

impl OperationReport {
    pub fn new(operation: &str, target: impl ToString, dry_run: bool) -> Self {
        Self {
            operation: operation.to_string(),
            target: target.to_string(),
            dry_run,
            recovery_method: None,
            notes: Vec::new(),
            warnings: Vec::new(),
            view_id: None,
        }
    }

    pub fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::info!("[{}] {}", self.target, message);
        self.notes.push(message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("[{}] {}", self.target, message);
        self.warnings.push(message);
    }

    /// 尽力而为的步骤：失败只记警告
    pub fn best_effort(&mut self, step: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                self.warn(format!("{} failed: {}", step, e));
                false
            }
        }
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════
// 操作选项
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct CreateClusterOptions {
    pub dry_run: bool,
    pub multi_primary: bool,
    /// 声明种子的 GTID 集合完整（空实例可直接增量恢复）
    pub gtid_set_complete: bool,
    pub disable_clone: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AddInstanceOptions {
    pub dry_run: bool,
    /// None 时使用配置中的默认策略
    pub recovery_method: Option<RecoveryPolicy>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AddReplicaInstanceOptions {
    pub dry_run: bool,
    pub recovery_method: Option<RecoveryPolicy>,
    pub label: Option<String>,
    /// None 表示跟随主节点
    pub sources: Option<ReplicationSources>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveInstanceOptions {
    pub dry_run: bool,
    pub force: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RejoinInstanceOptions {
    pub dry_run: bool,
    pub recovery_method: Option<RecoveryPolicy>,
}

#[derive(Debug, Clone, Default)]
pub struct SetPrimaryOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ForcePrimaryOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ForceQuorumOptions {
    pub dry_run: bool,
}

/// `setOption` / `setInstanceOption`
#[derive(Debug, Clone, Default)]
pub struct SetOptionOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RescanOptions {
    pub dry_run: bool,
    /// 把组内存在但元数据缺失的成员写入元数据
    pub add_instances: bool,
    /// 删除组内已不存在的成员记录
    pub remove_instances: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DissolveOptions {
    pub dry_run: bool,
    pub force: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RebootOptions {
    pub dry_run: bool,
    /// 指定新的种子（主节点）
    pub primary: Option<String>,
    /// 跳过 GTID 分歧检查
    pub force: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CreateReplicaSetOptions {
    pub dry_run: bool,
    pub gtid_set_complete: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CreateClusterSetOptions {
    pub dry_run: bool,
}

// ═══════════════════════════════════════════════════════════════════
// 公共校验
// ═══════════════════════════════════════════════════════════════════

/// 拓扑名称：字母/数字/`_-.`，不以数字开头，最长 63 个字符
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TopologyError::ArgumentError(format!("The {} name cannot be empty", kind)));
    }
    if name.chars().count() > 63 {
        return Err(TopologyError::ArgumentError(format!(
            "The {} name can not be greater than 63 characters",
            kind
        )));
    }
    if name.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        return Err(TopologyError::ArgumentError(format!(
            "The {} name can not start with a digit: '{}'",
            kind, name
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(TopologyError::ArgumentError(format!(
            "The {} name '{}' contains an invalid character '{}'; only alphanumeric characters, '_', '-' and '.' are allowed",
            kind, name, bad
        )));
    }
    Ok(())
}

pub(crate) fn parse_address(instance: &str) -> Result<InstanceAddress> {
    instance.parse()
}

/// 新加入实例的前置检查：配置、独立性、身份唯一、未被元数据管理
pub(crate) fn probe_candidate(
    session: &Session,
    schema: &MetadataSchema,
    address: &InstanceAddress,
) -> Result<InstanceStatus> {
    if let Some(existing) = schema.instance_by_address(address) {
        return Err(TopologyError::InvalidState(format!(
            "Instance {} is already managed by {:?}",
            address, existing.topology
        )));
    }
    let status = session.probe(address)?;
    ensure_valid_configuration(&status)?;
    ensure_standalone(&status)?;
    let known: Vec<(String, u32, &str)> = schema
        .instances
        .values()
        .map(|i| (i.address.to_string(), i.server_id, i.server_uuid.as_str()))
        .collect();
    ensure_unique_identity(
        &status,
        known.iter().map(|(a, id, uuid)| (a.as_str(), *id, *uuid)),
    )?;
    Ok(status)
}

/// 事务化写入元数据并记录一次视图变更，返回新的视图号
pub(crate) fn commit_change(
    session: &Session,
    topology: &TopologyRef,
    reason: ViewChangeReason,
    detail: &str,
    mut mutate: impl FnMut(&mut MetadataSchema) -> Result<()>,
) -> Result<u64> {
    let view_id = session.store().update(|schema| {
        mutate(schema)?;
        schema.record_view_change(topology, reason, session.actor(), detail)
    })?;
    publish_clusterset_view(session, topology);
    Ok(view_id)
}

/// 所属 ClusterSet 的视图号同步到指标
pub(crate) fn publish_clusterset_view(session: &Session, topology: &TopologyRef) {
    session.store().read(|schema| {
        let clusterset_id = match topology {
            TopologyRef::Cluster(id) => schema
                .cluster(id)
                .ok()
                .and_then(|c| c.clusterset.as_ref())
                .map(|m| m.clusterset_id.clone()),
            TopologyRef::ClusterSet(id) => Some(id.clone()),
            TopologyRef::ReplicaSet(_) => None,
        };
        if let Some(cs) = clusterset_id.and_then(|id| schema.clusterset(&id).ok()) {
            crate::record_clusterset_view!(cs.domain_name.as_str(), cs.view_id);
        }
    });
}

/// 新实例的元数据记录
pub(crate) fn instance_record(
    status: &InstanceStatus,
    topology: TopologyRef,
    role: InstanceRole,
    label: Option<String>,
    replication_user: Option<String>,
    member_index: u32,
) -> InstanceRecord {
    InstanceRecord {
        id: InstanceId::generate(),
        address: status.address.clone(),
        server_uuid: status.server_uuid.clone(),
        server_id: status.server_id,
        topology,
        role,
        label: label.unwrap_or_else(|| status.address.to_string()),
        replication_user,
        sources: None,
        member_index,
        invalidated: false,
        tags: BTreeMap::new(),
        options: BTreeMap::new(),
        attributes: BTreeMap::new(),
        added_at: Utc::now(),
    }
}

/// 标签在拓扑内唯一
pub(crate) fn ensure_label_free(
    schema: &MetadataSchema,
    topology: &TopologyRef,
    label: &str,
    except: Option<&InstanceAddress>,
) -> Result<()> {
    let taken = schema
        .instances_of(topology)
        .into_iter()
        .any(|i| i.label == label && Some(&i.address) != except);
    if taken {
        return Err(TopologyError::ArgumentError(format!(
            "An instance with label '{}' already exists in the topology",
            label
        )));
    }
    Ok(())
}

/// clone 是否可用：拓扑未禁用且双方版本都支持
pub(crate) fn clone_available(
    session: &Session,
    disabled: bool,
    target: ServerVersion,
    donor: ServerVersion,
) -> Result<bool> {
    if disabled {
        return Ok(false);
    }
    let floor = session.clone_floor()?;
    Ok(target >= floor && donor >= floor)
}

pub(crate) fn effective_policy(session: &Session, requested: Option<RecoveryPolicy>) -> RecoveryPolicy {
    requested.unwrap_or(session.config().recovery.default_policy)
}

/// 复制账号名
pub(crate) fn account_name(prefix: &str, server_id: u32) -> String {
    format!("{}_{}", prefix, server_id)
}

// ═══════════════════════════════════════════════════════════════════
// 实例锁
// ═══════════════════════════════════════════════════════════════════

/// 协调锁：按获取顺序记录，释放时逆序
pub(crate) struct InstanceLocks<'a> {
    client: &'a dyn NodeClient,
    owner: String,
    held: Vec<InstanceAddress>,
}

impl<'a> InstanceLocks<'a> {
    pub fn new(client: &'a dyn NodeClient, operation: &str) -> Self {
        Self {
            client,
            owner: format!("{}:{}", operation, uuid::Uuid::new_v4()),
            held: Vec::new(),
        }
    }

    pub fn acquire(&mut self, address: &InstanceAddress) -> Result<()> {
        self.client.apply_control(
            address,
            ControlCommand::AcquireLock {
                owner: self.owner.clone(),
            },
        )?;
        log::debug!("[{}] Lock acquired ({})", address, self.owner);
        self.held.push(address.clone());
        Ok(())
    }
}

impl Drop for InstanceLocks<'_> {
    fn drop(&mut self) {
        for address in self.held.iter().rev() {
            let result = self.client.apply_control(
                address,
                ControlCommand::ReleaseLock {
                    owner: self.owner.clone(),
                },
            );
            if let Err(e) = result {
                log::warn!("[{}] Failed to release lock {}: {}", address, self.owner, e);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// 变量回滚
// ═══════════════════════════════════════════════════════════════════

/// 已下发的系统变量修改；未 `keep` 即被丢弃时逆序恢复旧值
pub(crate) struct VariableChanges<'a> {
    client: &'a dyn NodeClient,
    name: String,
    applied: Vec<(InstanceAddress, Option<String>)>,
    kept: bool,
}

impl<'a> VariableChanges<'a> {
    pub fn new(client: &'a dyn NodeClient, name: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
            applied: Vec::new(),
            kept: false,
        }
    }

    /// `previous` 为修改前探测到的值
    pub fn set(&mut self, address: &InstanceAddress, previous: Option<&str>, value: &str) -> Result<()> {
        self.client.apply_control(
            address,
            ControlCommand::SetVariable {
                name: self.name.clone(),
                value: value.to_string(),
            },
        )?;
        self.applied.push((address.clone(), previous.map(str::to_string)));
        Ok(())
    }

    /// 元数据已提交，保留修改
    pub fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for VariableChanges<'_> {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        for (address, previous) in self.applied.iter().rev() {
            let Some(previous) = previous else {
                log::warn!("[{}] No previous value of {} to restore", address, self.name);
                continue;
            };
            let result = self.client.apply_control(
                address,
                ControlCommand::SetVariable {
                    name: self.name.clone(),
                    value: previous.clone(),
                },
            );
            match result {
                Ok(()) => log::info!("[{}] Restored {} to {}", address, self.name, previous),
                Err(e) => log::warn!("[{}] Failed to restore {}: {}", address, self.name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MemoryFleet;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("Cluster", "prod_east-1.a").is_ok());
        assert!(validate_name("Cluster", "").is_err());
        assert!(validate_name("Cluster", "1abc").is_err());
        assert!(validate_name("Cluster", "bad name").is_err());
        assert!(validate_name("Cluster", &"a".repeat(63)).is_ok());
        assert!(validate_name("Cluster", &"a".repeat(64)).is_err());
    }

    #[test]
    fn test_locks_are_released_in_reverse() {
        let fleet = MemoryFleet::new();
        let a = fleet.add_node("a:3306");
        let b = fleet.add_node("b:3306");
        {
            let mut locks = InstanceLocks::new(&fleet, "test");
            locks.acquire(&a).unwrap();
            locks.acquire(&b).unwrap();
            // 其他持有者无法获取
            let mut other = InstanceLocks::new(&fleet, "other");
            assert!(other.acquire(&a).is_err());
        }
        let mut again = InstanceLocks::new(&fleet, "again");
        again.acquire(&a).unwrap();
        again.acquire(&b).unwrap();
    }

    #[test]
    fn test_variable_changes_restored_unless_kept() {
        let fleet = MemoryFleet::new();
        let a = fleet.add_node("a:3306");
        let b = fleet.add_node("b:3306");
        let c = fleet.add_node("c:3306");
        for node in [&a, &b, &c] {
            fleet.set_variable(node, "group_replication_member_weight", "50");
        }
        let weight = |node: &InstanceAddress| {
            fleet
                .get_status(node)
                .unwrap()
                .variable("group_replication_member_weight")
                .map(str::to_string)
        };

        // 中途失败：已修改的节点恢复旧值
        fleet.kill(&c);
        {
            let mut changes = VariableChanges::new(&fleet, "group_replication_member_weight");
            changes.set(&a, Some("50"), "80").unwrap();
            changes.set(&b, Some("50"), "80").unwrap();
            assert_eq!(weight(&a).as_deref(), Some("80"));
            assert!(changes.set(&c, Some("50"), "80").is_err());
        }
        assert_eq!(weight(&a).as_deref(), Some("50"));
        assert_eq!(weight(&b).as_deref(), Some("50"));

        let mut changes = VariableChanges::new(&fleet, "group_replication_member_weight");
        changes.set(&a, Some("50"), "80").unwrap();
        changes.keep();
        assert_eq!(weight(&a).as_deref(), Some("80"));
    }

    #[test]
    fn test_report_collects_warnings() {
        let mut report = OperationReport::new("removeInstance", "a:3306", false);
        assert!(report.best_effort("re-point", Ok(())));
        assert!(!report.best_effort(
            "re-point",
            Err(TopologyError::unreachable("b:3306", "down"))
        ));
        assert!(report.has_warnings());
    }
}
