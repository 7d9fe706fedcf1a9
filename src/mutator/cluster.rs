//! Cluster 句柄
//!
//! 组复制集群上的全部操作。所有变更都先重新探测拓扑，再按
//! "校验 → 决策 → 远端变更（失败回滚）→ 元数据" 的顺序执行。

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::options::{apply_tag, variable_value, ClusterOption, InstanceOption};
use super::{
    account_name, clone_available, commit_change, effective_policy, ensure_label_free,
    instance_record, parse_address, probe_candidate, validate_name, AddInstanceOptions,
    AddReplicaInstanceOptions, CreateClusterOptions, CreateClusterSetOptions, DissolveOptions,
    ForceQuorumOptions, InstanceLocks, OperationReport, RejoinInstanceOptions,
    RemoveInstanceOptions, RescanOptions, SetOptionOptions, SetPrimaryOptions, VariableChanges,
};
use crate::clusterset::channel::{ChannelManager, CLUSTERSET_CHANNEL};
use crate::clusterset::{self, ClusterSet};
use crate::gtid::wait_for_sync;
use crate::metadata::{
    ClusterId, ClusterRecord, ClusterRole, InstanceRole, MetadataSchema, OperationLock,
    ReplicationSources, TopologyRef, ViewChangeReason,
};
use crate::probe::{
    ControlCommand, GroupMemberState, InstanceAddress, InstanceStatus, MemberRole,
    ReplicationCredentials,
};
use crate::recovery::{choose_recovery_method, RecoveryInput, RecoveryMethod, RecoveryPolicy, RecoverySelection};
use crate::session::Session;
use crate::topology::{
    ensure_member_consistent, find_member, ClusterSnapshot, InstanceState, MemberSnapshot,
    TopologySnapshot, READ_REPLICA_CHANNEL,
};
use crate::{Result, TopologyError};

pub(crate) const MEMBER_ACCOUNT_PREFIX: &str = "mysql_innodb_cluster";
const READ_REPLICA_ACCOUNT_PREFIX: &str = "mysql_innodb_rr";

/// Cluster 句柄（只持有 ID，状态每次重新读取）
#[derive(Clone)]
pub struct Cluster {
    session: Session,
    id: ClusterId,
    name: String,
}

// ═══════════════════════════════════════════════════════════════════
// 状态报告
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterHealth {
    Ok,
    OkPartial,
    OkNoTolerance,
    NoQuorum,
    Unreachable,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub address: String,
    pub label: String,
    pub role: String,
    /// `R/W`、`R/O` 或 `n/a`
    pub mode: String,
    pub state: InstanceState,
    pub version: Option<String>,
    /// 只读副本的复制源
    pub sources: Option<Vec<String>>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub name: String,
    pub status: ClusterHealth,
    pub status_text: String,
    pub primary: Option<String>,
    pub topology_mode: String,
    pub failure_tolerance: usize,
    pub members: Vec<MemberStatus>,
    pub read_replicas: Vec<MemberStatus>,
    pub clusterset_role: Option<ClusterRole>,
    pub invalidated: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceOptionsView {
    pub label: String,
    pub options: BTreeMap<String, Value>,
    pub tags: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterOptionsView {
    pub name: String,
    pub options: BTreeMap<String, Value>,
    pub tags: BTreeMap<String, Value>,
    pub instances: BTreeMap<String, InstanceOptionsView>,
}

// ═══════════════════════════════════════════════════════════════════
// createCluster
// ═══════════════════════════════════════════════════════════════════

pub(crate) fn create_cluster(
    session: &Session,
    name: &str,
    seed: &str,
    options: &CreateClusterOptions,
) -> Result<OperationReport> {
    session.ensure_metadata_writable()?;
    validate_name("Cluster", name)?;
    let address = parse_address(seed)?;

    let schema = session.store().snapshot();
    if schema.is_name_taken(name) {
        return Err(TopologyError::InvalidState(format!(
            "A topology named '{}' already exists",
            name
        )));
    }
    let status = probe_candidate(session, &schema, &address)?;

    let mut report = OperationReport::new("createCluster", &address, options.dry_run);
    let group_name = uuid::Uuid::new_v4().to_string();
    let view_change_uuid = uuid::Uuid::new_v4().to_string();
    report.note(format!(
        "Cluster '{}' will use group {} with seed {}",
        name, group_name, address
    ));
    if options.dry_run {
        return Ok(report);
    }

    let _guard = session
        .store()
        .lock_topology(&format!("cluster-name:{}", name.to_ascii_lowercase()), "createCluster")?;

    session.client().apply_control(
        &address,
        ControlCommand::StartGroupReplication {
            group_name: group_name.clone(),
            view_change_uuid: Some(view_change_uuid.clone()),
            bootstrap: true,
            single_primary: !options.multi_primary,
            recovery: None,
        },
    )?;

    let account = account_name(MEMBER_ACCOUNT_PREFIX, status.server_id);
    let created = session
        .client()
        .apply_control(
            &address,
            ControlCommand::CreateReplicationAccount {
                credentials: ReplicationCredentials::generate(&account),
            },
        )
        .and_then(|_| {
            let id = ClusterId::generate();
            let topology = TopologyRef::Cluster(id.clone());
            commit_change(session, &topology, ViewChangeReason::Create, "cluster created", |schema| {
                if schema.is_name_taken(name) {
                    return Err(TopologyError::InvalidState(format!(
                        "A topology named '{}' already exists",
                        name
                    )));
                }
                schema.clusters.insert(
                    id.clone(),
                    ClusterRecord {
                        id: id.clone(),
                        name: name.to_string(),
                        group_name: group_name.clone(),
                        view_change_uuid: Some(view_change_uuid.clone()),
                        single_primary: !options.multi_primary,
                        created_at: chrono::Utc::now(),
                        view_id: 0,
                        disable_clone: options.disable_clone,
                        gtid_set_complete: options.gtid_set_complete,
                        options: BTreeMap::new(),
                        tags: BTreeMap::new(),
                        attributes: BTreeMap::new(),
                        clusterset: None,
                    },
                );
                let record = instance_record(
                    &status,
                    topology.clone(),
                    InstanceRole::Member,
                    None,
                    Some(account.clone()),
                    0,
                );
                schema.instances.insert(record.id.clone(), record);
                Ok(())
            })
        });

    match created {
        Ok(view_id) => {
            report.view_id = Some(view_id);
            report.note(format!("Cluster '{}' created", name));
            Ok(report)
        }
        Err(e) => {
            if let Err(rollback) = session
                .client()
                .apply_control(&address, ControlCommand::StopGroupReplication)
            {
                log::warn!("[{}] Rollback of group bootstrap failed: {}", address, rollback);
            }
            Err(e)
        }
    }
}

impl Cluster {
    pub(crate) fn new(session: Session, id: ClusterId, name: String) -> Self {
        Self { session, id, name }
    }

    pub fn id(&self) -> &ClusterId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn topology(&self) -> TopologyRef {
        TopologyRef::Cluster(self.id.clone())
    }

    /// 当前拓扑快照（只读）
    pub fn snapshot(&self) -> Result<ClusterSnapshot> {
        self.session.refresh_cluster(&self.id)
    }

    /// 变更前置：元数据可写、拓扑锁、重新探测
    fn preflight(&self, operation: &str) -> Result<(OperationLock<'_>, ClusterSnapshot)> {
        self.session.ensure_metadata_writable()?;
        let lock = self
            .session
            .store()
            .lock_topology(&self.topology().lock_key(), operation)?;
        let snapshot = self.snapshot()?;
        if snapshot.record.is_invalidated() {
            return Err(TopologyError::InvalidState(format!(
                "Cluster '{}' is INVALIDATED in its ClusterSet; use ClusterSet.rejoinCluster() or removeCluster()",
                snapshot.record.name
            )));
        }
        Ok((lock, snapshot))
    }

    fn choose_recovery(
        &self,
        record: &ClusterRecord,
        target: &InstanceStatus,
        donor: &InstanceStatus,
        requested: Option<RecoveryPolicy>,
    ) -> Result<RecoverySelection> {
        let clone_ok = clone_available(&self.session, record.disable_clone, target.version, donor.version)?;
        let input = RecoveryInput {
            target: &target.gtid_executed,
            source_executed: &donor.gtid_executed,
            source_purged: &donor.gtid_purged,
            policy: effective_policy(&self.session, requested),
            interactive: self.session.is_interactive(),
            clone_available: clone_ok,
            source_complete: record.gtid_set_complete,
        };
        choose_recovery_method(&input, self.session.interaction())
    }

    fn join_group(&self, record: &ClusterRecord, address: &InstanceAddress, method: RecoveryMethod) -> Result<()> {
        self.session.client().apply_control(
            address,
            ControlCommand::StartGroupReplication {
                group_name: record.group_name.clone(),
                view_change_uuid: record.view_change_uuid.clone(),
                bootstrap: false,
                single_primary: record.single_primary,
                recovery: Some(method),
            },
        )
    }

    /// 等待 `address` 追上主节点；超时由调用方回滚
    fn sync_with_primary(&self, address: &InstanceAddress, primary: &InstanceAddress) -> Result<()> {
        let reference = self.session.probe(primary)?.gtid_executed;
        wait_for_sync(
            self.session.client(),
            address,
            &reference,
            &primary.to_string(),
            self.session.sync_timeout(),
        )
    }

    fn leave_group_quietly(&self, address: &InstanceAddress, report: &mut OperationReport) {
        let result = self
            .session
            .client()
            .apply_control(address, ControlCommand::StopGroupReplication);
        report.best_effort("rollback (leave group)", result);
    }

    // ═══════════════════════════════════════════════════════════════════
    // addInstance
    // ═══════════════════════════════════════════════════════════════════

    pub fn add_instance(&self, instance: &str, options: AddInstanceOptions) -> Result<OperationReport> {
        let address = parse_address(instance)?;
        self.session.run_operation("addInstance", instance, || {
            self.do_add_instance(&address, &options)
        })
    }

    fn do_add_instance(&self, address: &InstanceAddress, options: &AddInstanceOptions) -> Result<OperationReport> {
        let (_lock, snap) = self.preflight("addInstance")?;
        snap.require_quorum("addInstance")?;
        let primary = snap.require_primary()?;
        let primary_addr = primary.address().clone();
        let primary_status = primary.require_status()?;

        let schema = self.session.store().snapshot();
        if let Some(label) = &options.label {
            ensure_label_free(&schema, &snap.topology(), label, None)?;
        }
        let status = probe_candidate(&self.session, &schema, address)?;

        let mut report = OperationReport::new("addInstance", address, options.dry_run);
        let selection = self.choose_recovery(&snap.record, &status, primary_status, options.recovery_method)?;
        report.recovery_method = Some(selection.method);
        report.note(format!("Recovery method {}: {}", selection.method, selection.reason));
        if options.dry_run {
            return Ok(report);
        }

        let account = account_name(MEMBER_ACCOUNT_PREFIX, status.server_id);
        let client = self.session.client();
        client.apply_control(
            &primary_addr,
            ControlCommand::CreateReplicationAccount {
                credentials: ReplicationCredentials::generate(&account),
            },
        )?;
        let drop_account = |report: &mut OperationReport| {
            let result = client.apply_control(
                &primary_addr,
                ControlCommand::DropReplicationAccount { user: account.clone() },
            );
            report.best_effort("rollback (drop replication account)", result);
        };

        if let Err(e) = self.join_group(&snap.record, address, selection.method) {
            drop_account(&mut report);
            return Err(e);
        }
        if let Err(e) = self.sync_with_primary(address, &primary_addr) {
            self.leave_group_quietly(address, &mut report);
            drop_account(&mut report);
            return Err(e);
        }
        if snap.record.clusterset_role() == Some(ClusterRole::Replica) {
            let result = client.apply_control(address, ControlCommand::SetSuperReadOnly { enabled: true });
            report.best_effort("enable super_read_only", result);
        }

        let status = self.session.probe(address)?;
        let topology = snap.topology();
        let view_id = commit_change(
            &self.session,
            &topology,
            ViewChangeReason::AddInstance,
            &format!("added {}", address),
            |schema| {
                let index = schema.next_member_index(&topology);
                let record = instance_record(
                    &status,
                    topology.clone(),
                    InstanceRole::Member,
                    options.label.clone(),
                    Some(account.clone()),
                    index,
                );
                schema.instances.insert(record.id.clone(), record);
                Ok(())
            },
        )?;
        report.view_id = Some(view_id);
        report.note(format!("Instance {} added to cluster '{}'", address, self.name));
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════
    // addReplicaInstance
    // ═══════════════════════════════════════════════════════════════════

    /// 只读副本：异步通道跟随主节点或自定义源列表
    pub fn add_replica_instance(
        &self,
        instance: &str,
        options: AddReplicaInstanceOptions,
    ) -> Result<OperationReport> {
        let address = parse_address(instance)?;
        self.session.run_operation("addReplicaInstance", instance, || {
            self.do_add_replica_instance(&address, &options)
        })
    }

    fn do_add_replica_instance(
        &self,
        address: &InstanceAddress,
        options: &AddReplicaInstanceOptions,
    ) -> Result<OperationReport> {
        let (_lock, snap) = self.preflight("addReplicaInstance")?;
        snap.require_quorum("addReplicaInstance")?;
        let primary = snap.require_primary()?;
        let primary_addr = primary.address().clone();

        let sources = options.sources.clone().unwrap_or(ReplicationSources::Primary);
        let (source, managed) = match &sources {
            ReplicationSources::Primary => (primary_addr.clone(), true),
            ReplicationSources::Custom(list) => {
                let first = list.first().ok_or_else(|| {
                    TopologyError::ArgumentError("replicationSources can not be an empty list".to_string())
                })?;
                if let Some(bad) = list.iter().find(|s| {
                    snap.members
                        .iter()
                        .all(|m| m.address() != *s)
                }) {
                    return Err(TopologyError::ArgumentError(format!(
                        "Replication source {} is not a member of cluster '{}'",
                        bad, self.name
                    )));
                }
                (first.clone(), false)
            }
        };
        let source_status = match snap.member(&source) {
            Some(m) => m.require_status()?.clone(),
            None => self.session.probe(&source)?,
        };

        let schema = self.session.store().snapshot();
        if let Some(label) = &options.label {
            ensure_label_free(&schema, &snap.topology(), label, None)?;
        }
        let status = probe_candidate(&self.session, &schema, address)?;

        let mut report = OperationReport::new("addReplicaInstance", address, options.dry_run);
        let selection = self.choose_recovery(&snap.record, &status, &source_status, options.recovery_method)?;
        report.recovery_method = Some(selection.method);
        report.note(format!("Recovery method {}: {}", selection.method, selection.reason));
        if options.dry_run {
            return Ok(report);
        }

        let client = self.session.client();
        let account = account_name(READ_REPLICA_ACCOUNT_PREFIX, status.server_id);
        let credentials = ReplicationCredentials::generate(&account);
        client.apply_control(
            &primary_addr,
            ControlCommand::CreateReplicationAccount {
                credentials: credentials.clone(),
            },
        )?;

        let provisioned = (|| {
            if selection.method == RecoveryMethod::Clone {
                client.apply_control(address, ControlCommand::Clone { donor: source.clone() })?;
            }
            client.apply_control(
                address,
                ControlCommand::ChangeReplicationSource {
                    channel: READ_REPLICA_CHANNEL.to_string(),
                    source: source.clone(),
                    credentials: credentials.clone(),
                    delay: 0,
                    managed,
                },
            )?;
            client.apply_control(
                address,
                ControlCommand::StartReplica {
                    channel: READ_REPLICA_CHANNEL.to_string(),
                },
            )?;
            client.apply_control(address, ControlCommand::SetSuperReadOnly { enabled: true })?;
            self.sync_with_primary(address, &source)
        })();
        if let Err(e) = provisioned {
            let stop = client.apply_control(
                address,
                ControlCommand::StopReplica {
                    channel: READ_REPLICA_CHANNEL.to_string(),
                },
            );
            report.best_effort("rollback (stop replica)", stop);
            let reset = client.apply_control(
                address,
                ControlCommand::ResetReplica {
                    channel: READ_REPLICA_CHANNEL.to_string(),
                },
            );
            report.best_effort("rollback (reset replica)", reset);
            let drop = client.apply_control(
                &primary_addr,
                ControlCommand::DropReplicationAccount { user: account.clone() },
            );
            report.best_effort("rollback (drop replication account)", drop);
            return Err(e);
        }

        let topology = snap.topology();
        let view_id = commit_change(
            &self.session,
            &topology,
            ViewChangeReason::AddInstance,
            &format!("added read replica {}", address),
            |schema| {
                let index = schema.next_member_index(&topology);
                let mut record = instance_record(
                    &status,
                    topology.clone(),
                    InstanceRole::ReadReplica,
                    options.label.clone(),
                    Some(account.clone()),
                    index,
                );
                record.sources = Some(sources.clone());
                schema.instances.insert(record.id.clone(), record);
                Ok(())
            },
        )?;
        report.view_id = Some(view_id);
        report.note(format!("Read replica {} added, replicating from {}", address, source));
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════
    // removeInstance
    // ═══════════════════════════════════════════════════════════════════

    pub fn remove_instance(&self, instance: &str, options: RemoveInstanceOptions) -> Result<OperationReport> {
        let address = parse_address(instance)?;
        self.session.run_operation("removeInstance", instance, || {
            self.do_remove_instance(&address, &options)
        })
    }

    fn do_remove_instance(
        &self,
        address: &InstanceAddress,
        options: &RemoveInstanceOptions,
    ) -> Result<OperationReport> {
        let (_lock, snap) = self.preflight("removeInstance")?;
        let topo = TopologySnapshot::Cluster(snap.clone());
        let member = find_member(&topo, address)?.clone();
        let mut report = OperationReport::new("removeInstance", address, options.dry_run);

        if member.record.role == InstanceRole::ReadReplica {
            return self.remove_read_replica(&snap, &member, options, report);
        }

        if snap.members.len() == 1 {
            return Err(TopologyError::InvalidState(format!(
                "The instance '{}' is the last member of cluster '{}'; use dissolve() to remove the cluster",
                address, self.name
            )));
        }
        snap.require_quorum("removeInstance")?;
        ensure_member_consistent(&topo, address)?;

        let leaving_channel = member
            .status
            .as_ref()
            .and_then(|s| s.channel(CLUSTERSET_CHANNEL))
            .cloned();

        if !member.is_reachable() {
            if !options.force {
                return Err(TopologyError::unreachable(
                    address,
                    format!(
                        "{}; use force=true to remove it from the metadata only",
                        member.error.clone().unwrap_or_else(|| "instance is not reachable".to_string())
                    ),
                ));
            }
            report.warn(format!(
                "Instance {} is unreachable; it will only be removed from the metadata",
                address
            ));
        } else if member.is_online() && snap.primary.as_ref() != Some(address) {
            let primary = snap.require_primary()?.address().clone();
            match self.sync_with_primary(address, &primary) {
                Ok(()) => {}
                Err(e) if options.force => report.warn(format!("{}; continuing because force=true", e)),
                Err(e) => return Err(e),
            }
        }
        if options.dry_run {
            return Ok(report);
        }

        let client = self.session.client();
        if member.is_reachable() {
            if member.status.as_ref().map(|s| s.is_group_member()).unwrap_or(false) {
                match client.apply_control(address, ControlCommand::StopGroupReplication) {
                    Ok(()) => {}
                    Err(e) if options.force => report.warn(format!("Failed to leave the group: {}", e)),
                    Err(e) => return Err(e),
                }
            }
        }

        // 当前主节点（被移除的可能就是原主节点）
        let new_primary = snap
            .members
            .iter()
            .filter(|m| m.address() != address)
            .find_map(|m| self.session.probe(m.address()).ok().and_then(|s| s.group_primary().cloned()));

        if let (Some(user), Some(primary)) = (&member.record.replication_user, &new_primary) {
            let result = client.apply_control(primary, ControlCommand::DropReplicationAccount { user: user.clone() });
            report.best_effort("drop replication account", result);
        }

        if let Some(channel) = leaving_channel {
            match &new_primary {
                Some(primary) => {
                    let result = ChannelManager::new(client).rehome(address, primary, &channel.source, &channel.user);
                    report.best_effort("re-home the ClusterSet channel", result);
                }
                None => report.warn("No primary available to take over the ClusterSet channel"),
            }
        }

        // 依赖该实例的只读副本
        let mut repoint = Vec::new();
        for rr in &snap.read_replicas {
            if let Some(ReplicationSources::Custom(list)) = &rr.record.sources {
                if list.contains(address) {
                    let remaining: Vec<InstanceAddress> =
                        list.iter().filter(|s| *s != address).cloned().collect();
                    repoint.push((rr.clone(), remaining));
                }
            }
        }
        for (rr, remaining) in &repoint {
            if !rr.is_reachable() {
                report.warn(format!(
                    "Read replica {} is unreachable; its sources were updated in the metadata only",
                    rr.address()
                ));
                continue;
            }
            let source = remaining.first().cloned().or_else(|| new_primary.clone());
            let current = rr
                .status
                .as_ref()
                .and_then(|s| s.channel(READ_REPLICA_CHANNEL))
                .map(|c| c.source.clone());
            if current.as_ref() == Some(address) {
                match (&source, &new_primary) {
                    (Some(source), Some(primary)) => {
                        let result = self.repoint_read_replica(rr, source, primary, remaining.is_empty());
                        report.best_effort(&format!("re-point read replica {}", rr.address()), result);
                    }
                    _ => report.warn(format!("Read replica {} has no source left", rr.address())),
                }
            }
        }

        let record_id = member.record.id.clone();
        let view_id = commit_change(
            &self.session,
            &snap.topology(),
            ViewChangeReason::RemoveInstance,
            &format!("removed {}", address),
            |schema| {
                schema.instances.remove(&record_id);
                for (rr, remaining) in &repoint {
                    let rec = schema.instance_mut(&rr.record.id)?;
                    rec.sources = Some(if remaining.is_empty() {
                        ReplicationSources::Primary
                    } else {
                        ReplicationSources::Custom(remaining.clone())
                    });
                }
                Ok(())
            },
        )?;
        report.view_id = Some(view_id);
        report.note(format!("Instance {} removed from cluster '{}'", address, self.name));
        Ok(report)
    }

    fn repoint_read_replica(
        &self,
        replica: &MemberSnapshot,
        source: &InstanceAddress,
        primary: &InstanceAddress,
        follow_primary: bool,
    ) -> Result<()> {
        let client = self.session.client();
        let user = replica
            .record
            .replication_user
            .clone()
            .unwrap_or_else(|| account_name(READ_REPLICA_ACCOUNT_PREFIX, replica.record.server_id));
        let credentials = ReplicationCredentials::generate(&user);
        client.apply_control(
            primary,
            ControlCommand::SetReplicationPassword {
                credentials: credentials.clone(),
            },
        )?;
        let channel = READ_REPLICA_CHANNEL.to_string();
        client.apply_control(replica.address(), ControlCommand::StopReplica { channel: channel.clone() })?;
        client.apply_control(
            replica.address(),
            ControlCommand::ChangeReplicationSource {
                channel: channel.clone(),
                source: source.clone(),
                credentials,
                delay: 0,
                managed: follow_primary,
            },
        )?;
        client.apply_control(replica.address(), ControlCommand::StartReplica { channel })
    }

    fn remove_read_replica(
        &self,
        snap: &ClusterSnapshot,
        member: &MemberSnapshot,
        options: &RemoveInstanceOptions,
        mut report: OperationReport,
    ) -> Result<OperationReport> {
        let address = member.address();
        if !member.is_reachable() {
            if !options.force {
                return Err(TopologyError::unreachable(
                    address,
                    "read replica is not reachable; use force=true to remove it from the metadata only",
                ));
            }
            report.warn(format!("Read replica {} is unreachable; removing metadata only", address));
        }
        if options.dry_run {
            return Ok(report);
        }
        let client = self.session.client();
        if member.is_reachable() {
            let channel = READ_REPLICA_CHANNEL.to_string();
            client.apply_control(address, ControlCommand::StopReplica { channel: channel.clone() })?;
            client.apply_control(address, ControlCommand::ResetReplica { channel })?;
        }
        if let (Some(user), Some(primary)) = (&member.record.replication_user, &snap.primary) {
            let result = client.apply_control(primary, ControlCommand::DropReplicationAccount { user: user.clone() });
            report.best_effort("drop replication account", result);
        }
        let record_id = member.record.id.clone();
        report.view_id = Some(commit_change(
            &self.session,
            &snap.topology(),
            ViewChangeReason::RemoveInstance,
            &format!("removed read replica {}", address),
            |schema| {
                schema.instances.remove(&record_id);
                Ok(())
            },
        )?);
        report.note(format!("Read replica {} removed", address));
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════
    // rejoinInstance
    // ═══════════════════════════════════════════════════════════════════

    pub fn rejoin_instance(&self, instance: &str, options: RejoinInstanceOptions) -> Result<OperationReport> {
        let address = parse_address(instance)?;
        self.session.run_operation("rejoinInstance", instance, || {
            self.do_rejoin_instance(&address, &options)
        })
    }

    fn do_rejoin_instance(
        &self,
        address: &InstanceAddress,
        options: &RejoinInstanceOptions,
    ) -> Result<OperationReport> {
        let (_lock, snap) = self.preflight("rejoinInstance")?;
        let topo = TopologySnapshot::Cluster(snap.clone());
        let member = find_member(&topo, address)?.clone();

        match member.state {
            InstanceState::Online => {
                return Err(TopologyError::InvalidState(format!(
                    "The instance '{}' is already ONLINE in cluster '{}'",
                    address, self.name
                )))
            }
            InstanceState::Recovering => {
                return Err(TopologyError::InvalidState(format!(
                    "The instance '{}' is RECOVERING; wait for distributed recovery to finish",
                    address
                )))
            }
            _ => {}
        }
        ensure_member_consistent(&topo, address)?;
        let status = member.require_status()?.clone();
        if let Some(group) = &status.group {
            if !group.group_name.eq_ignore_ascii_case(&snap.record.group_name) {
                return Err(TopologyError::MetadataConsistency(format!(
                    "Instance {} belongs to group {} but cluster '{}' uses group {}",
                    address, group.group_name, self.name, snap.record.group_name
                )));
            }
        }

        snap.require_quorum("rejoinInstance")?;
        let primary = snap.require_primary()?;
        let primary_addr = primary.address().clone();
        let primary_status = primary.require_status()?.clone();

        if member.record.role == InstanceRole::ReadReplica {
            return self.rejoin_read_replica(&snap, &member, &status, &primary_addr, options);
        }

        let mut report = OperationReport::new("rejoinInstance", address, options.dry_run);
        let selection = self.choose_recovery(&snap.record, &status, &primary_status, options.recovery_method)?;
        report.recovery_method = Some(selection.method);
        report.note(format!("Recovery method {}: {}", selection.method, selection.reason));
        if options.dry_run {
            return Ok(report);
        }

        let client = self.session.client();
        if status.is_group_member() {
            client.apply_control(address, ControlCommand::StopGroupReplication)?;
        }
        let user = member
            .record
            .replication_user
            .clone()
            .unwrap_or_else(|| account_name(MEMBER_ACCOUNT_PREFIX, status.server_id));
        client.apply_control(
            &primary_addr,
            ControlCommand::SetReplicationPassword {
                credentials: ReplicationCredentials::generate(&user),
            },
        )?;
        self.join_group(&snap.record, address, selection.method)?;
        if let Err(e) = self.sync_with_primary(address, &primary_addr) {
            self.leave_group_quietly(address, &mut report);
            return Err(e);
        }

        let record_id = member.record.id.clone();
        report.view_id = Some(commit_change(
            &self.session,
            &snap.topology(),
            ViewChangeReason::RejoinInstance,
            &format!("rejoined {}", address),
            |schema| {
                let rec = schema.instance_mut(&record_id)?;
                rec.invalidated = false;
                rec.replication_user = Some(user.clone());
                Ok(())
            },
        )?);
        report.note(format!("Instance {} rejoined cluster '{}'", address, self.name));
        Ok(report)
    }

    fn rejoin_read_replica(
        &self,
        snap: &ClusterSnapshot,
        member: &MemberSnapshot,
        status: &InstanceStatus,
        primary: &InstanceAddress,
        options: &RejoinInstanceOptions,
    ) -> Result<OperationReport> {
        let address = member.address();
        let (source, follow_primary) = match &member.record.sources {
            Some(ReplicationSources::Custom(list)) => match list.first() {
                Some(s) => (s.clone(), false),
                None => (primary.clone(), true),
            },
            _ => (primary.clone(), true),
        };
        let source_status = self.session.probe(&source)?;

        let mut report = OperationReport::new("rejoinInstance", address, options.dry_run);
        let selection = self.choose_recovery(&snap.record, status, &source_status, options.recovery_method)?;
        report.recovery_method = Some(selection.method);
        report.note(format!("Recovery method {}: {}", selection.method, selection.reason));
        if options.dry_run {
            return Ok(report);
        }

        let client = self.session.client();
        if let Some(channel) = status.channel(READ_REPLICA_CHANNEL) {
            if let Some(error) = &channel.last_error {
                report.note(format!(
                    "Replication channel error {} ({}); credentials will be regenerated",
                    error.code, error.message
                ));
            }
        }
        if selection.method == RecoveryMethod::Clone {
            let channel = READ_REPLICA_CHANNEL.to_string();
            client.apply_control(address, ControlCommand::StopReplica { channel: channel.clone() })?;
            client.apply_control(address, ControlCommand::ResetReplica { channel })?;
            client.apply_control(address, ControlCommand::Clone { donor: source.clone() })?;
        }
        self.repoint_read_replica(member, &source, primary, follow_primary)?;
        client.apply_control(address, ControlCommand::SetSuperReadOnly { enabled: true })?;
        self.sync_with_primary(address, &source)?;

        let record_id = member.record.id.clone();
        report.view_id = Some(commit_change(
            &self.session,
            &snap.topology(),
            ViewChangeReason::RejoinInstance,
            &format!("rejoined read replica {}", address),
            |schema| {
                schema.instance_mut(&record_id)?.invalidated = false;
                Ok(())
            },
        )?);
        report.note(format!("Read replica {} is replicating from {} again", address, source));
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════
    // setPrimaryInstance
    // ═══════════════════════════════════════════════════════════════════

    pub fn set_primary_instance(&self, instance: &str, options: SetPrimaryOptions) -> Result<OperationReport> {
        let address = parse_address(instance)?;
        self.session.run_operation("setPrimaryInstance", instance, || {
            self.do_set_primary_instance(&address, &options)
        })
    }

    fn do_set_primary_instance(
        &self,
        address: &InstanceAddress,
        options: &SetPrimaryOptions,
    ) -> Result<OperationReport> {
        let (_lock, snap) = self.preflight("setPrimaryInstance")?;
        snap.require_quorum("setPrimaryInstance")?;
        if !snap.record.single_primary {
            return Err(TopologyError::InvalidState(format!(
                "Cluster '{}' is running in multi-primary mode",
                self.name
            )));
        }
        let topo = TopologySnapshot::Cluster(snap.clone());
        let target = find_member(&topo, address)?.clone();
        if target.record.role != InstanceRole::Member {
            return Err(TopologyError::ArgumentError(format!(
                "Instance {} is a read replica and can not become the primary",
                address
            )));
        }
        let not_online: Vec<String> = snap
            .members
            .iter()
            .filter(|m| !m.is_online())
            .map(|m| format!("{} ({})", m.address(), m.state))
            .collect();
        if !not_online.is_empty() {
            return Err(TopologyError::InvalidState(format!(
                "All members of cluster '{}' must be ONLINE to switch the primary: {}",
                self.name,
                not_online.join(", ")
            )));
        }
        ensure_member_consistent(&topo, address)?;

        let mut report = OperationReport::new("setPrimaryInstance", address, options.dry_run);
        let primary = snap.require_primary()?.address().clone();
        if &primary == address {
            report.note(format!("Instance {} is already the primary", address));
            return Ok(report);
        }
        if options.dry_run {
            report.note(format!("Primary would switch from {} to {}", primary, address));
            return Ok(report);
        }

        // 先让所有从节点追上当前主节点
        for secondary in snap.members.iter().filter(|m| m.address() != &primary) {
            self.sync_with_primary(secondary.address(), &primary)?;
        }

        let client = self.session.client();
        let mut locks = InstanceLocks::new(client, "setPrimaryInstance");
        locks.acquire(&primary)?;
        for secondary in snap.members.iter().filter(|m| m.address() != &primary) {
            locks.acquire(secondary.address())?;
        }

        client.apply_control(
            address,
            ControlCommand::SetPrimary {
                server_uuid: target.record.server_uuid.clone(),
            },
        )?;
        let elected = self.session.probe(address)?.group_primary().cloned();
        if elected.as_ref() != Some(address) {
            return Err(TopologyError::InternalError(format!(
                "Primary election did not promote {} (current primary: {})",
                address,
                elected.map(|a| a.to_string()).unwrap_or_else(|| "none".to_string())
            )));
        }

        for rr in &snap.read_replicas {
            if !matches!(rr.record.sources, None | Some(ReplicationSources::Primary)) {
                continue;
            }
            let source = self
                .session
                .probe(rr.address())
                .ok()
                .and_then(|s| s.channel(READ_REPLICA_CHANNEL).map(|c| c.source.clone()));
            if source.as_ref() != Some(address) {
                let result = self.repoint_read_replica(rr, address, address, true);
                report.best_effort(&format!("re-point read replica {}", rr.address()), result);
            }
        }

        if let Some(membership) = &snap.record.clusterset {
            if membership.role == ClusterRole::Replica {
                let result = self.verify_clusterset_channel(address, membership.replication_user.as_deref());
                report.best_effort("verify the ClusterSet channel", result);
            }
        }
        drop(locks);

        report.view_id = Some(commit_change(
            &self.session,
            &snap.topology(),
            ViewChangeReason::SwitchActive,
            &format!("primary switched from {} to {}", primary, address),
            |_| Ok(()),
        )?);
        report.note(format!("Instance {} is the new primary of cluster '{}'", address, self.name));
        Ok(report)
    }

    /// 副本 Cluster 换主后确认通道已随主节点迁移
    fn verify_clusterset_channel(&self, new_primary: &InstanceAddress, user: Option<&str>) -> Result<()> {
        let status = self.session.probe(new_primary)?;
        let Some(channel) = status.channel(CLUSTERSET_CHANNEL) else {
            return Err(TopologyError::ReplicationChannelError(format!(
                "ClusterSet channel did not move to the new primary {}",
                new_primary
            )));
        };
        let user = user.map(str::to_string).unwrap_or_else(|| channel.user.clone());
        let health = ChannelManager::new(self.session.client()).verify(new_primary, &channel.source, &user)?;
        log::info!("[{}] ClusterSet channel {}", new_primary, health);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // forceQuorumUsingPartitionOf
    // ═══════════════════════════════════════════════════════════════════

    pub fn force_quorum_using_partition_of(
        &self,
        instance: &str,
        options: ForceQuorumOptions,
    ) -> Result<OperationReport> {
        let address = parse_address(instance)?;
        self.session.run_operation("forceQuorumUsingPartitionOf", instance, || {
            self.do_force_quorum(&address, &options)
        })
    }

    fn do_force_quorum(&self, address: &InstanceAddress, options: &ForceQuorumOptions) -> Result<OperationReport> {
        self.session.ensure_metadata_writable()?;
        let _lock = self
            .session
            .store()
            .lock_topology(&self.topology().lock_key(), "forceQuorumUsingPartitionOf")?;
        let snap = self.snapshot()?;
        if snap.quorum.has_quorum {
            return Err(TopologyError::InvalidState(format!(
                "Cluster '{}' has quorum ({} of {} members ONLINE); forceQuorumUsingPartitionOf is not needed",
                self.name, snap.quorum.online, snap.quorum.total
            )));
        }
        let topo = TopologySnapshot::Cluster(snap.clone());
        find_member(&topo, address)?;
        ensure_member_consistent(&topo, address)?;

        let status = self.session.probe(address)?;
        let view = status
            .group
            .as_ref()
            .filter(|g| g.group_name.eq_ignore_ascii_case(&snap.record.group_name))
            .filter(|_| status.member_state == GroupMemberState::Online)
            .ok_or_else(|| {
                TopologyError::InvalidState(format!(
                    "Instance {} is not ONLINE in group {}; it can not define the partition",
                    address, snap.record.group_name
                ))
            })?;
        let partition: Vec<InstanceAddress> = view
            .members
            .iter()
            .filter(|m| m.state == GroupMemberState::Online)
            .map(|m| m.address.clone())
            .collect();
        let lost: Vec<String> = view
            .members
            .iter()
            .filter(|m| m.state != GroupMemberState::Online)
            .map(|m| m.address.to_string())
            .collect();

        let mut report = OperationReport::new("forceQuorumUsingPartitionOf", address, options.dry_run);
        report.note(format!(
            "Restoring quorum with partition [{}]; members [{}] will be removed from the group",
            partition.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", "),
            lost.join(", ")
        ));
        if self.session.is_interactive() {
            let question = format!(
                "Restoring cluster '{}' from the partition of {} ({} members) discards the other partitions. Continue?",
                self.name,
                address,
                partition.len()
            );
            if !self.session.interaction().confirm(&question, false)? {
                return Err(TopologyError::Cancelled("forceQuorumUsingPartitionOf cancelled".to_string()));
            }
        }
        if options.dry_run {
            return Ok(report);
        }

        self.session
            .client()
            .apply_control(address, ControlCommand::ForceMembers { members: partition })?;
        crate::record_failover!("force_quorum");

        report.view_id = Some(commit_change(
            &self.session,
            &snap.topology(),
            ViewChangeReason::ForceQuorum,
            &format!("quorum restored from partition of {}", address),
            |_| Ok(()),
        )?);
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════
    // rescan
    // ═══════════════════════════════════════════════════════════════════

    pub fn rescan(&self, options: RescanOptions) -> Result<OperationReport> {
        self.session
            .run_operation("rescan", &self.name, || self.do_rescan(&options))
    }

    fn do_rescan(&self, options: &RescanOptions) -> Result<OperationReport> {
        let (_lock, snap) = self.preflight("rescan")?;
        snap.require_quorum("rescan")?;
        let view = snap.view.clone().ok_or_else(|| {
            TopologyError::QuorumError(format!("No group view available for cluster '{}'", self.name))
        })?;
        let mut report = OperationReport::new("rescan", &self.name, options.dry_run);
        let interactive = self.session.is_interactive();
        let port = self.session.interaction();

        let mut to_add = Vec::new();
        for gm in &view.members {
            if snap.members.iter().any(|m| m.address() == &gm.address) {
                continue;
            }
            report.note(format!("Instance {} is part of the group but missing from the metadata", gm.address));
            let accepted = options.add_instances
                || (interactive
                    && port.confirm(&format!("Add instance {} to the metadata?", gm.address), true)?);
            if accepted {
                to_add.push(self.session.probe(&gm.address)?);
            }
        }

        let mut to_remove = Vec::new();
        for m in &snap.members {
            if view.member(m.address()).is_some() {
                continue;
            }
            report.note(format!("Instance {} is in the metadata but no longer part of the group", m.address()));
            let accepted = options.remove_instances
                || (interactive
                    && port.confirm(&format!("Remove instance {} from the metadata?", m.address()), true)?);
            if accepted {
                to_remove.push(m.record.id.clone());
            }
        }

        let fix_vcu = snap.record.view_change_uuid.is_none() && view.view_change_uuid.is_some();
        if fix_vcu {
            report.note("The group view_change_uuid will be recorded in the metadata");
        }

        if options.dry_run || (to_add.is_empty() && to_remove.is_empty() && !fix_vcu) {
            return Ok(report);
        }

        let topology = snap.topology();
        let cluster_id = self.id.clone();
        let vcu = view.view_change_uuid.clone();
        report.view_id = Some(commit_change(
            &self.session,
            &topology,
            ViewChangeReason::Rescan,
            &format!("rescan: +{} -{}", to_add.len(), to_remove.len()),
            |schema| {
                for status in &to_add {
                    let index = schema.next_member_index(&topology);
                    let record = instance_record(status, topology.clone(), InstanceRole::Member, None, None, index);
                    schema.instances.insert(record.id.clone(), record);
                }
                for id in &to_remove {
                    schema.instances.remove(id);
                }
                if fix_vcu {
                    schema.cluster_mut(&cluster_id)?.view_change_uuid = vcu.clone();
                }
                Ok(())
            },
        )?);
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════
    // dissolve
    // ═══════════════════════════════════════════════════════════════════

    pub fn dissolve(&self, options: DissolveOptions) -> Result<OperationReport> {
        self.session
            .run_operation("dissolve", &self.name, || self.do_dissolve(&options))
    }

    fn do_dissolve(&self, options: &DissolveOptions) -> Result<OperationReport> {
        self.session.ensure_metadata_writable()?;
        let _lock = self
            .session
            .store()
            .lock_topology(&self.topology().lock_key(), "dissolve")?;
        let snap = self.snapshot()?;
        if snap.record.clusterset.is_some() {
            return Err(TopologyError::InvalidState(format!(
                "Cluster '{}' is a member of a ClusterSet; remove it from the ClusterSet first",
                self.name
            )));
        }
        let mut report = OperationReport::new("dissolve", &self.name, options.dry_run);
        let unreachable: Vec<String> = snap
            .members
            .iter()
            .chain(snap.read_replicas.iter())
            .filter(|m| !m.is_reachable())
            .map(|m| m.address().to_string())
            .collect();
        if !unreachable.is_empty() {
            if !options.force {
                return Err(TopologyError::unreachable(
                    unreachable.join(", "),
                    "members are not reachable; use force=true to dissolve anyway",
                ));
            }
            report.warn(format!("Unreachable members will be left untouched: {}", unreachable.join(", ")));
        }
        if options.dry_run {
            return Ok(report);
        }

        let client = self.session.client();
        for rr in snap.read_replicas.iter().filter(|m| m.is_reachable()) {
            let channel = READ_REPLICA_CHANNEL.to_string();
            let result = client
                .apply_control(rr.address(), ControlCommand::StopReplica { channel: channel.clone() })
                .and_then(|_| client.apply_control(rr.address(), ControlCommand::ResetReplica { channel }));
            report.best_effort(&format!("stop read replica {}", rr.address()), result);
        }
        // 从节点先离开，主节点最后
        let mut order: Vec<&MemberSnapshot> = snap
            .members
            .iter()
            .filter(|m| m.is_reachable() && snap.primary.as_ref() != Some(m.address()))
            .collect();
        order.extend(snap.primary_member());
        for member in order {
            let in_group = member.status.as_ref().map(|s| s.is_group_member()).unwrap_or(false);
            if !in_group {
                continue;
            }
            match client.apply_control(member.address(), ControlCommand::StopGroupReplication) {
                Ok(()) => {}
                Err(e) if options.force => report.warn(format!("{} failed to leave the group: {}", member.address(), e)),
                Err(e) => return Err(e),
            }
        }

        let topology = snap.topology();
        let cluster_id = self.id.clone();
        self.session.store().update(|schema| {
            schema.record_view_change(&topology, ViewChangeReason::Dissolve, self.session.actor(), "dissolved")?;
            remove_cluster_records(schema, &cluster_id, &topology);
            Ok(())
        })?;
        report.note(format!("Cluster '{}' dissolved", self.name));
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════
    // status / options
    // ═══════════════════════════════════════════════════════════════════

    pub fn status(&self) -> Result<ClusterStatus> {
        let snap = self.snapshot()?;
        Ok(describe_cluster(&snap))
    }

    pub fn options(&self) -> Result<ClusterOptionsView> {
        let topology = self.topology();
        self.session.store().read(|schema| {
            let record = schema.cluster(&self.id)?;
            let mut options = record.options.clone();
            options.insert("clusterName".to_string(), Value::from(record.name.clone()));
            options.insert("disableClone".to_string(), Value::from(record.disable_clone));
            options.insert("groupName".to_string(), Value::from(record.group_name.clone()));
            let instances = schema
                .instances_of(&topology)
                .into_iter()
                .map(|i| {
                    (
                        i.address.to_string(),
                        InstanceOptionsView {
                            label: i.label.clone(),
                            options: i.options.clone(),
                            tags: i.tags.clone(),
                        },
                    )
                })
                .collect();
            Ok(ClusterOptionsView {
                name: record.name.clone(),
                options,
                tags: record.tags.clone(),
                instances,
            })
        })
    }

    pub fn set_option(&self, key: &str, value: Value, options: SetOptionOptions) -> Result<OperationReport> {
        let option = ClusterOption::parse(key, &value)?;
        self.session.run_operation("setOption", &self.name, || {
            self.do_set_option(key, option.clone(), &options)
        })
    }

    fn do_set_option(&self, key: &str, option: ClusterOption, options: &SetOptionOptions) -> Result<OperationReport> {
        let (_lock, snap) = self.preflight("setOption")?;
        let mut report = OperationReport::new("setOption", &self.name, options.dry_run);
        let cluster_id = self.id.clone();

        if let ClusterOption::Variable { .. } = &option {
            snap.require_quorum("setOption")?;
            let unreachable: Vec<String> = snap
                .members
                .iter()
                .filter(|m| !m.is_reachable())
                .map(|m| m.address().to_string())
                .collect();
            if !unreachable.is_empty() {
                return Err(TopologyError::unreachable(
                    unreachable.join(", "),
                    "all members must be reachable to change a cluster-wide option",
                ));
            }
        }
        if let ClusterOption::ClusterName(new_name) = &option {
            let taken = self
                .session
                .store()
                .read(|s| s.is_name_taken(new_name) && !new_name.eq_ignore_ascii_case(&self.name));
            if taken {
                return Err(TopologyError::InvalidState(format!(
                    "A topology named '{}' already exists",
                    new_name
                )));
            }
        }
        if options.dry_run {
            report.note(format!("Option '{}' would be updated", key));
            return Ok(report);
        }

        // 元数据提交失败时 drop 会恢复各成员的旧值
        let changes = match &option {
            ClusterOption::Variable { variable, value, .. } => {
                let mut changes = VariableChanges::new(self.session.client(), variable);
                let value = variable_value(value);
                for member in &snap.members {
                    let previous = member.status.as_ref().and_then(|s| s.variable(variable));
                    changes.set(member.address(), previous, &value)?;
                }
                Some(changes)
            }
            _ => None,
        };

        report.view_id = Some(commit_change(
            &self.session,
            &snap.topology(),
            ViewChangeReason::SetOption,
            &format!("set {}", key),
            |schema| {
                let record = schema.cluster_mut(&cluster_id)?;
                match &option {
                    ClusterOption::ClusterName(name) => record.name = name.clone(),
                    ClusterOption::DisableClone(b) => record.disable_clone = *b,
                    ClusterOption::Variable { key, value, .. } => {
                        record.options.insert(key.to_string(), value.clone());
                    }
                    ClusterOption::Tag { name, value } => apply_tag(&mut record.tags, name, value.clone()),
                }
                Ok(())
            },
        )?);
        if let Some(changes) = changes {
            changes.keep();
        }
        report.note(format!("Option '{}' updated", key));
        Ok(report)
    }

    pub fn set_instance_option(
        &self,
        instance: &str,
        key: &str,
        value: Value,
        options: SetOptionOptions,
    ) -> Result<OperationReport> {
        let address = parse_address(instance)?;
        let option = InstanceOption::parse(key, &value)?;
        self.session.run_operation("setInstanceOption", instance, || {
            self.do_set_instance_option(&address, key, option.clone(), &options)
        })
    }

    fn do_set_instance_option(
        &self,
        address: &InstanceAddress,
        key: &str,
        option: InstanceOption,
        options: &SetOptionOptions,
    ) -> Result<OperationReport> {
        let (_lock, snap) = self.preflight("setInstanceOption")?;
        let topo = TopologySnapshot::Cluster(snap.clone());
        let member = find_member(&topo, address)?.clone();
        let mut report = OperationReport::new("setInstanceOption", address, options.dry_run);

        match &option {
            InstanceOption::Variable { .. } => {
                member.require_status()?;
            }
            InstanceOption::Label(label) => {
                self.session
                    .store()
                    .read(|s| ensure_label_free(s, &snap.topology(), label, Some(address)))?;
            }
            InstanceOption::Tag { .. } => {}
        }
        if options.dry_run {
            report.note(format!("Option '{}' would be updated on {}", key, address));
            return Ok(report);
        }

        let changes = match &option {
            InstanceOption::Variable { variable, value, .. } => {
                let mut changes = VariableChanges::new(self.session.client(), variable);
                let previous = member.status.as_ref().and_then(|s| s.variable(variable));
                changes.set(address, previous, &variable_value(value))?;
                Some(changes)
            }
            _ => None,
        };

        let record_id = member.record.id.clone();
        report.view_id = Some(commit_change(
            &self.session,
            &snap.topology(),
            ViewChangeReason::SetOption,
            &format!("set {} on {}", key, address),
            |schema| {
                let rec = schema.instance_mut(&record_id)?;
                match &option {
                    InstanceOption::Label(label) => rec.label = label.clone(),
                    InstanceOption::Variable { key, value, .. } => {
                        rec.options.insert(key.to_string(), value.clone());
                    }
                    InstanceOption::Tag { name, value } => apply_tag(&mut rec.tags, name, value.clone()),
                }
                Ok(())
            },
        )?);
        if let Some(changes) = changes {
            changes.keep();
        }
        report.note(format!("Option '{}' updated on {}", key, address));
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════
    // ClusterSet
    // ═══════════════════════════════════════════════════════════════════

    pub fn create_cluster_set(&self, domain: &str, options: CreateClusterSetOptions) -> Result<OperationReport> {
        self.session.run_operation("createClusterSet", domain, || {
            clusterset::manager::create_cluster_set(self, domain, &options)
        })
    }

    pub fn get_cluster_set(&self) -> Result<ClusterSet> {
        let found = self.session.store().read(|schema| {
            let record = schema.cluster(&self.id)?;
            let membership = record.clusterset.as_ref().ok_or_else(|| {
                TopologyError::NotFound(format!("Cluster '{}' is not part of a ClusterSet", self.name))
            })?;
            let cs = schema.clusterset(&membership.clusterset_id)?;
            Ok::<_, TopologyError>((cs.id.clone(), cs.domain_name.clone()))
        })?;
        Ok(ClusterSet::new(self.session.clone(), found.0, found.1))
    }

    pub(crate) fn preflight_for_clusterset(
        &self,
        operation: &str,
    ) -> Result<(OperationLock<'_>, ClusterSnapshot)> {
        self.preflight(operation)
    }
}

/// 删除 Cluster 及其实例；Router 指向它的记录清空目标
pub(crate) fn remove_cluster_records(schema: &mut MetadataSchema, id: &ClusterId, topology: &TopologyRef) {
    schema.instances.retain(|_, i| &i.topology != topology);
    schema.clusters.remove(id);
    for router in schema.routers.values_mut() {
        if router.topology.as_ref() == Some(topology) {
            router.topology = None;
        }
    }
}

/// 由快照生成状态报告
pub fn describe_cluster(snap: &ClusterSnapshot) -> ClusterStatus {
    let mut errors: Vec<String> = snap.consistency_errors.clone();
    let any_reachable = snap.members.iter().any(|m| m.is_reachable());
    let online = snap.online_members().count();
    let tolerance = snap.quorum.tolerance();

    let (status, text) = if !any_reachable {
        (ClusterHealth::Unreachable, "Cluster is not reachable".to_string())
    } else if !snap.quorum.has_quorum {
        (
            ClusterHealth::NoQuorum,
            format!(
                "Cluster has no quorum as visible from the reachable members ({} of {} ONLINE)",
                snap.quorum.online, snap.quorum.total
            ),
        )
    } else if tolerance == 0 {
        let partial = if online < snap.members.len() { " and is partially available" } else { "" };
        (
            ClusterHealth::OkNoTolerance,
            format!("Cluster is NOT tolerant to any failures{}", partial),
        )
    } else if online < snap.members.len() {
        (
            ClusterHealth::OkPartial,
            format!(
                "Cluster is ONLINE and can tolerate up to {} failure(s); some members are not active",
                tolerance
            ),
        )
    } else {
        (
            ClusterHealth::Ok,
            format!("Cluster is ONLINE and can tolerate up to {} failure(s)", tolerance),
        )
    };

    let members = snap
        .members
        .iter()
        .map(|m| {
            let mut member_errors = Vec::new();
            if let Some(e) = &m.error {
                member_errors.push(e.clone());
            }
            if let Some(channel) = m.status.as_ref().and_then(|s| s.channel(CLUSTERSET_CHANNEL)) {
                if let Some(e) = &channel.last_error {
                    member_errors.push(format!("ClusterSet channel error {}: {}", e.code, e.message));
                }
            }
            if let Some(group) = m.status.as_ref().and_then(|s| s.group.as_ref()) {
                if !group.group_name.eq_ignore_ascii_case(&snap.record.group_name) {
                    member_errors.push(format!(
                        "Instance belongs to group {}; possible split-brain",
                        group.group_name
                    ));
                }
            }
            let mode = match (m.state, m.role) {
                (InstanceState::Online, Some(MemberRole::Primary)) => "R/W",
                (InstanceState::Online, _) => "R/O",
                _ => "n/a",
            };
            MemberStatus {
                address: m.address().to_string(),
                label: m.record.label.clone(),
                role: m.role.map(|r| r.to_string()).unwrap_or_else(|| "HA".to_string()),
                mode: mode.to_string(),
                state: m.state,
                version: m.status.as_ref().map(|s| s.version.to_string()),
                sources: None,
                errors: member_errors,
            }
        })
        .collect();

    let read_replicas = snap
        .read_replicas
        .iter()
        .map(|m| {
            let channel = m.status.as_ref().and_then(|s| s.channel(READ_REPLICA_CHANNEL));
            let mut member_errors = Vec::new();
            if let Some(e) = &m.error {
                member_errors.push(e.clone());
            }
            if let Some(e) = channel.and_then(|c| c.last_error.as_ref()) {
                member_errors.push(format!("Replication channel error {}: {}", e.code, e.message));
            }
            let sources = match &m.record.sources {
                Some(ReplicationSources::Custom(list)) => list.iter().map(|a| a.to_string()).collect(),
                _ => vec!["PRIMARY".to_string()],
            };
            MemberStatus {
                address: m.address().to_string(),
                label: m.record.label.clone(),
                role: "READ_REPLICA".to_string(),
                mode: if m.is_online() { "R/O" } else { "n/a" }.to_string(),
                state: m.state,
                version: m.status.as_ref().map(|s| s.version.to_string()),
                sources: Some(sources),
                errors: member_errors,
            }
        })
        .collect();

    if snap.record.is_invalidated() {
        errors.push("Cluster is INVALIDATED in its ClusterSet".to_string());
    }

    ClusterStatus {
        name: snap.record.name.clone(),
        status,
        status_text: text,
        primary: snap.primary.as_ref().map(|p| p.to_string()),
        topology_mode: if snap.record.single_primary { "Single-Primary" } else { "Multi-Primary" }.to_string(),
        failure_tolerance: tolerance,
        members,
        read_replicas,
        clusterset_role: snap.record.clusterset_role(),
        invalidated: snap.record.is_invalidated(),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::NonInteractive;
    use crate::metadata::MetadataStore;
    use crate::probe::{MemoryFleet, NodeClient};
    use crate::utils::config::TopologyConfig;
    use std::sync::Arc;

    fn setup(nodes: &[&str]) -> (Arc<MemoryFleet>, Session) {
        let fleet = Arc::new(MemoryFleet::new());
        for n in nodes {
            fleet.add_node(n);
        }
        let session = Session::new(
            TopologyConfig::default(),
            Arc::new(MetadataStore::in_memory()),
            fleet.clone(),
            Arc::new(NonInteractive),
        );
        (fleet, session)
    }

    fn complete() -> CreateClusterOptions {
        CreateClusterOptions {
            gtid_set_complete: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_add() {
        let (fleet, session) = setup(&["a:3306", "b:3306"]);
        session.create_cluster("c1", "a:3306", complete()).unwrap();
        let cluster = session.get_cluster("c1").unwrap();
        let report = cluster.add_instance("b:3306", AddInstanceOptions::default()).unwrap();
        assert_eq!(report.recovery_method, Some(RecoveryMethod::Incremental));

        let b: InstanceAddress = "b:3306".parse().unwrap();
        assert!(fleet.is_group_member(&b));
        let status = cluster.status().unwrap();
        assert_eq!(status.members.len(), 2);
        assert_eq!(status.status, ClusterHealth::OkNoTolerance);
        assert_eq!(status.primary.as_deref(), Some("a:3306"));
    }

    #[test]
    fn test_duplicate_name_and_bad_seed() {
        let (_fleet, session) = setup(&["a:3306", "b:3306"]);
        session.create_cluster("c1", "a:3306", complete()).unwrap();
        assert!(matches!(
            session.create_cluster("C1", "b:3306", complete()),
            Err(TopologyError::InvalidState(_))
        ));
        assert!(matches!(
            session.create_cluster("9bad", "b:3306", complete()),
            Err(TopologyError::ArgumentError(_))
        ));
        // 已经是成员的实例不能再作种子
        assert!(session.create_cluster("c2", "a:3306", complete()).is_err());
    }

    #[test]
    fn test_dry_run_has_no_effect() {
        let (fleet, session) = setup(&["a:3306", "b:3306"]);
        let report = session
            .create_cluster(
                "c1",
                "a:3306",
                CreateClusterOptions {
                    dry_run: true,
                    ..complete()
                },
            )
            .unwrap();
        assert!(report.dry_run);
        assert!(!fleet.is_group_member(&"a:3306".parse().unwrap()));
        assert!(session.get_cluster("c1").is_err());
    }

    #[test]
    fn test_operation_lock_conflict() {
        let (_fleet, session) = setup(&["a:3306", "b:3306"]);
        session.create_cluster("c1", "a:3306", complete()).unwrap();
        let cluster = session.get_cluster("c1").unwrap();
        let _held = session
            .store()
            .lock_topology(&cluster.topology().lock_key(), "rescan")
            .unwrap();
        let err = cluster.add_instance("b:3306", AddInstanceOptions::default()).unwrap_err();
        assert!(matches!(err, TopologyError::InvalidState(ref m) if m.contains("already in progress")));
    }

    #[test]
    fn test_multi_primary_rejects_set_primary() {
        let (_fleet, session) = setup(&["a:3306", "b:3306"]);
        session
            .create_cluster(
                "c1",
                "a:3306",
                CreateClusterOptions {
                    multi_primary: true,
                    ..complete()
                },
            )
            .unwrap();
        let cluster = session.get_cluster("c1").unwrap();
        cluster.add_instance("b:3306", AddInstanceOptions::default()).unwrap();
        assert!(matches!(
            cluster.set_primary_instance("b:3306", SetPrimaryOptions::default()),
            Err(TopologyError::InvalidState(_))
        ));
    }

    #[test]
    fn test_set_instance_option_label() {
        let (fleet, session) = setup(&["a:3306", "b:3306"]);
        session.create_cluster("c1", "a:3306", complete()).unwrap();
        let cluster = session.get_cluster("c1").unwrap();
        cluster.add_instance("b:3306", AddInstanceOptions::default()).unwrap();

        cluster
            .set_instance_option("b:3306", "label", Value::from("replica-b"), SetOptionOptions::default())
            .unwrap();
        assert!(cluster
            .set_instance_option("a:3306", "label", Value::from("replica-b"), SetOptionOptions::default())
            .is_err());
        cluster
            .set_instance_option("b:3306", "memberWeight", Value::from(80), SetOptionOptions::default())
            .unwrap();
        let b: InstanceAddress = "b:3306".parse().unwrap();
        let status = fleet.get_status(&b).unwrap();
        assert_eq!(status.variable("group_replication_member_weight"), Some("80"));

        let opts = cluster.options().unwrap();
        let view = &opts.instances["b:3306"];
        assert_eq!(view.label, "replica-b");
        assert_eq!(view.options["memberWeight"], Value::from(80));
    }
}
