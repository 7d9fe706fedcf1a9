//! ReplicaSet 句柄
//!
//! 单主异步复制链：每个从节点在默认通道上复制主节点，
//! 各自使用独立的复制账号（创建在主节点上，经复制传播到其余成员）。

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::cluster::{InstanceOptionsView, MemberStatus};
use super::options::{apply_tag, coerce_tag, tag_name, InstanceOption};
use super::{
    account_name, clone_available, commit_change, effective_policy, ensure_label_free,
    parse_address, probe_candidate, validate_name, instance_record, AddInstanceOptions,
    CreateReplicaSetOptions, ForcePrimaryOptions, InstanceLocks, OperationReport,
    RejoinInstanceOptions, RemoveInstanceOptions, SetOptionOptions, SetPrimaryOptions,
};
use crate::gtid::{wait_for_sync, GtidSet};
use crate::metadata::{
    InstanceRole, OperationLock, ReplicaSetId, ReplicaSetRecord, TopologyRef, ViewChangeReason,
};
use crate::probe::{ControlCommand, InstanceAddress, InstanceStatus, ReplicationCredentials};
use crate::recovery::{choose_recovery_method, RecoveryInput, RecoveryMethod, RecoveryPolicy, RecoverySelection};
use crate::session::Session;
use crate::topology::{
    ensure_member_consistent, find_member, InstanceState, MemberSnapshot, ReplicaSetSnapshot,
    TopologySnapshot, ASYNC_CHANNEL,
};
use crate::{Result, TopologyError};

const ACCOUNT_PREFIX: &str = "mysql_innodb_rs";

/// 元数据 options 中记录 GTID 集合完整性的键
const GTID_COMPLETE_OPTION: &str = "gtidSetIsComplete";

#[derive(Clone)]
pub struct ReplicaSet {
    session: Session,
    id: ReplicaSetId,
    name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaSetHealth {
    Available,
    AvailablePartial,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaSetStatus {
    pub name: String,
    pub status: ReplicaSetHealth,
    pub status_text: String,
    pub primary: Option<String>,
    pub members: Vec<MemberStatus>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaSetOptionsView {
    pub name: String,
    pub options: BTreeMap<String, Value>,
    pub tags: BTreeMap<String, Value>,
    pub instances: BTreeMap<String, InstanceOptionsView>,
}

// ═══════════════════════════════════════════════════════════════════
// createReplicaSet
// ═══════════════════════════════════════════════════════════════════

pub(crate) fn create_replica_set(
    session: &Session,
    name: &str,
    seed: &str,
    options: &CreateReplicaSetOptions,
) -> Result<OperationReport> {
    session.ensure_metadata_writable()?;
    validate_name("ReplicaSet", name)?;
    let address = parse_address(seed)?;
    let schema = session.store().snapshot();
    if schema.is_name_taken(name) {
        return Err(TopologyError::InvalidState(format!(
            "A topology named '{}' already exists",
            name
        )));
    }
    let status = probe_candidate(session, &schema, &address)?;
    if let Some(channel) = status.channel(ASYNC_CHANNEL) {
        return Err(TopologyError::InvalidState(format!(
            "Instance {} is already replicating from {}",
            address, channel.source
        )));
    }

    let mut report = OperationReport::new("createReplicaSet", &address, options.dry_run);
    report.note(format!("ReplicaSet '{}' will use {} as its primary", name, address));
    if options.dry_run {
        return Ok(report);
    }

    let _guard = session.store().lock_topology(
        &format!("replicaset-name:{}", name.to_ascii_lowercase()),
        "createReplicaSet",
    )?;
    let client = session.client();
    client.apply_control(&address, ControlCommand::SetSuperReadOnly { enabled: false })?;
    let account = account_name(ACCOUNT_PREFIX, status.server_id);
    client.apply_control(
        &address,
        ControlCommand::CreateReplicationAccount {
            credentials: ReplicationCredentials::generate(&account),
        },
    )?;

    let id = ReplicaSetId::generate();
    let topology = TopologyRef::ReplicaSet(id.clone());
    let view_id = commit_change(session, &topology, ViewChangeReason::Create, "replicaset created", |schema| {
        if schema.is_name_taken(name) {
            return Err(TopologyError::InvalidState(format!(
                "A topology named '{}' already exists",
                name
            )));
        }
        let record = instance_record(&status, topology.clone(), InstanceRole::Member, None, Some(account.clone()), 0);
        let mut options_map = BTreeMap::new();
        options_map.insert(GTID_COMPLETE_OPTION.to_string(), Value::Bool(options.gtid_set_complete));
        schema.replicasets.insert(
            id.clone(),
            ReplicaSetRecord {
                id: id.clone(),
                name: name.to_string(),
                primary: Some(record.id.clone()),
                view_id: 0,
                created_at: chrono::Utc::now(),
                options: options_map,
                tags: BTreeMap::new(),
                attributes: BTreeMap::new(),
            },
        );
        schema.instances.insert(record.id.clone(), record);
        Ok(())
    })?;
    report.view_id = Some(view_id);
    report.note(format!("ReplicaSet '{}' created", name));
    Ok(report)
}

impl ReplicaSet {
    pub(crate) fn new(session: Session, id: ReplicaSetId, name: String) -> Self {
        Self { session, id, name }
    }

    pub fn id(&self) -> &ReplicaSetId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topology(&self) -> TopologyRef {
        TopologyRef::ReplicaSet(self.id.clone())
    }

    pub fn snapshot(&self) -> Result<ReplicaSetSnapshot> {
        self.session.refresh_replica_set(&self.id)
    }

    fn preflight(&self, operation: &str) -> Result<(OperationLock<'_>, ReplicaSetSnapshot)> {
        self.session.ensure_metadata_writable()?;
        let lock = self
            .session
            .store()
            .lock_topology(&self.topology().lock_key(), operation)?;
        Ok((lock, self.snapshot()?))
    }

    fn gtid_set_complete(snap: &ReplicaSetSnapshot) -> bool {
        snap.record
            .options
            .get(GTID_COMPLETE_OPTION)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn choose_recovery(
        &self,
        snap: &ReplicaSetSnapshot,
        target: &InstanceStatus,
        donor: &InstanceStatus,
        requested: Option<RecoveryPolicy>,
    ) -> Result<RecoverySelection> {
        let input = RecoveryInput {
            target: &target.gtid_executed,
            source_executed: &donor.gtid_executed,
            source_purged: &donor.gtid_purged,
            policy: effective_policy(&self.session, requested),
            interactive: self.session.is_interactive(),
            clone_available: clone_available(&self.session, false, target.version, donor.version)?,
            source_complete: Self::gtid_set_complete(snap),
        };
        choose_recovery_method(&input, self.session.interaction())
    }

    fn user_of(member: &MemberSnapshot) -> String {
        member
            .record
            .replication_user
            .clone()
            .unwrap_or_else(|| account_name(ACCOUNT_PREFIX, member.record.server_id))
    }

    /// 在 `replica` 上把默认通道指向 `source`（密码在源端重新生成）
    fn point_to(&self, replica: &InstanceAddress, source: &InstanceAddress, user: &str) -> Result<()> {
        let client = self.session.client();
        let credentials = ReplicationCredentials::generate(user);
        client.apply_control(
            source,
            ControlCommand::SetReplicationPassword {
                credentials: credentials.clone(),
            },
        )?;
        client.apply_control(
            replica,
            ControlCommand::StopReplica {
                channel: ASYNC_CHANNEL.to_string(),
            },
        )?;
        client.apply_control(
            replica,
            ControlCommand::ChangeReplicationSource {
                channel: ASYNC_CHANNEL.to_string(),
                source: source.clone(),
                credentials,
                delay: 0,
                managed: false,
            },
        )?;
        client.apply_control(
            replica,
            ControlCommand::StartReplica {
                channel: ASYNC_CHANNEL.to_string(),
            },
        )
    }

    fn stop_channel(&self, address: &InstanceAddress) -> Result<()> {
        let client = self.session.client();
        client.apply_control(
            address,
            ControlCommand::StopReplica {
                channel: ASYNC_CHANNEL.to_string(),
            },
        )?;
        client.apply_control(
            address,
            ControlCommand::ResetReplica {
                channel: ASYNC_CHANNEL.to_string(),
            },
        )
    }

    fn sync_with(&self, address: &InstanceAddress, reference: &InstanceAddress) -> Result<()> {
        let gtids = self.session.probe(reference)?.gtid_executed;
        wait_for_sync(
            self.session.client(),
            address,
            &gtids,
            &reference.to_string(),
            self.session.sync_timeout(),
        )
    }

    // ═══════════════════════════════════════════════════════════════════
    // addInstance
    // ═══════════════════════════════════════════════════════════════════

    pub fn add_instance(&self, instance: &str, options: AddInstanceOptions) -> Result<OperationReport> {
        let address = parse_address(instance)?;
        self.session
            .run_operation("addInstance", instance, || self.do_add_instance(&address, &options))
    }

    fn do_add_instance(&self, address: &InstanceAddress, options: &AddInstanceOptions) -> Result<OperationReport> {
        let (_lock, snap) = self.preflight("addInstance")?;
        let primary = snap.require_primary()?;
        let primary_addr = primary.address().clone();
        let primary_status = primary.require_status()?.clone();

        let schema = self.session.store().snapshot();
        if let Some(label) = &options.label {
            ensure_label_free(&schema, &snap.topology(), label, None)?;
        }
        let status = probe_candidate(&self.session, &schema, address)?;
        if let Some(channel) = status.channel(ASYNC_CHANNEL) {
            return Err(TopologyError::InvalidState(format!(
                "Instance {} already has a replication channel from {}",
                address, channel.source
            )));
        }

        let mut report = OperationReport::new("addInstance", address, options.dry_run);
        let selection = self.choose_recovery(&snap, &status, &primary_status, options.recovery_method)?;
        report.recovery_method = Some(selection.method);
        report.note(format!("Recovery method {}: {}", selection.method, selection.reason));
        if options.dry_run {
            return Ok(report);
        }

        let client = self.session.client();
        let account = account_name(ACCOUNT_PREFIX, status.server_id);
        let credentials = ReplicationCredentials::generate(&account);
        client.apply_control(
            &primary_addr,
            ControlCommand::CreateReplicationAccount {
                credentials: credentials.clone(),
            },
        )?;

        let provisioned = (|| {
            if selection.method == RecoveryMethod::Clone {
                client.apply_control(address, ControlCommand::Clone { donor: primary_addr.clone() })?;
            }
            client.apply_control(address, ControlCommand::SetSuperReadOnly { enabled: true })?;
            client.apply_control(
                address,
                ControlCommand::ChangeReplicationSource {
                    channel: ASYNC_CHANNEL.to_string(),
                    source: primary_addr.clone(),
                    credentials: credentials.clone(),
                    delay: 0,
                    managed: false,
                },
            )?;
            client.apply_control(
                address,
                ControlCommand::StartReplica {
                    channel: ASYNC_CHANNEL.to_string(),
                },
            )?;
            self.sync_with(address, &primary_addr)
        })();
        if let Err(e) = provisioned {
            report.best_effort("rollback (reset replication channel)", self.stop_channel(address));
            let drop = client.apply_control(
                &primary_addr,
                ControlCommand::DropReplicationAccount { user: account.clone() },
            );
            report.best_effort("rollback (drop replication account)", drop);
            return Err(e);
        }

        let topology = snap.topology();
        report.view_id = Some(commit_change(
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
        )?);
        report.note(format!("Instance {} added to ReplicaSet '{}'", address, self.name));
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════
    // removeInstance
    // ═══════════════════════════════════════════════════════════════════

    pub fn remove_instance(&self, instance: &str, options: RemoveInstanceOptions) -> Result<OperationReport> {
        let address = parse_address(instance)?;
        self.session
            .run_operation("removeInstance", instance, || self.do_remove_instance(&address, &options))
    }

    fn do_remove_instance(
        &self,
        address: &InstanceAddress,
        options: &RemoveInstanceOptions,
    ) -> Result<OperationReport> {
        let (_lock, snap) = self.preflight("removeInstance")?;
        let topo = TopologySnapshot::ReplicaSet(snap.clone());
        let member = find_member(&topo, address)?.clone();
        if snap.primary.as_ref() == Some(address) {
            return Err(TopologyError::InvalidState(format!(
                "The instance '{}' is the PRIMARY of ReplicaSet '{}'; switch the primary first",
                address, self.name
            )));
        }
        ensure_member_consistent(&topo, address)?;
        let mut report = OperationReport::new("removeInstance", address, options.dry_run);

        if !member.is_reachable() {
            if !options.force {
                return Err(TopologyError::unreachable(
                    address,
                    "instance is not reachable; use force=true to remove it from the metadata only",
                ));
            }
            report.warn(format!("Instance {} is unreachable; removing metadata only", address));
        } else if member.is_online() {
            if let Some(primary) = &snap.primary {
                match self.sync_with(address, primary) {
                    Ok(()) => {}
                    Err(e) if options.force => report.warn(format!("{}; continuing because force=true", e)),
                    Err(e) => return Err(e),
                }
            }
        }
        if options.dry_run {
            return Ok(report);
        }

        if member.is_reachable() {
            match self.stop_channel(address) {
                Ok(()) => {}
                Err(e) if options.force => report.warn(format!("Failed to stop replication: {}", e)),
                Err(e) => return Err(e),
            }
        }
        if let Some(primary) = snap.primary_member().filter(|p| p.is_reachable()) {
            let result = self.session.client().apply_control(
                primary.address(),
                ControlCommand::DropReplicationAccount {
                    user: Self::user_of(&member),
                },
            );
            report.best_effort("drop replication account", result);
        }

        let record_id = member.record.id.clone();
        report.view_id = Some(commit_change(
            &self.session,
            &snap.topology(),
            ViewChangeReason::RemoveInstance,
            &format!("removed {}", address),
            |schema| {
                schema.instances.remove(&record_id);
                Ok(())
            },
        )?);
        report.note(format!("Instance {} removed from ReplicaSet '{}'", address, self.name));
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════
    // rejoinInstance
    // ═══════════════════════════════════════════════════════════════════

    pub fn rejoin_instance(&self, instance: &str, options: RejoinInstanceOptions) -> Result<OperationReport> {
        let address = parse_address(instance)?;
        self.session
            .run_operation("rejoinInstance", instance, || self.do_rejoin_instance(&address, &options))
    }

    fn do_rejoin_instance(
        &self,
        address: &InstanceAddress,
        options: &RejoinInstanceOptions,
    ) -> Result<OperationReport> {
        let (_lock, snap) = self.preflight("rejoinInstance")?;
        let topo = TopologySnapshot::ReplicaSet(snap.clone());
        let member = find_member(&topo, address)?.clone();
        if snap.primary.as_ref() == Some(address) {
            return Err(TopologyError::InvalidState(format!(
                "The instance '{}' is the PRIMARY of ReplicaSet '{}'",
                address, self.name
            )));
        }
        if member.state == InstanceState::Online {
            return Err(TopologyError::InvalidState(format!(
                "The instance '{}' is already ONLINE in ReplicaSet '{}'",
                address, self.name
            )));
        }
        ensure_member_consistent(&topo, address)?;
        let status = member.require_status()?.clone();
        let primary = snap.require_primary()?;
        let primary_addr = primary.address().clone();
        let primary_status = primary.require_status()?.clone();

        let mut report = OperationReport::new("rejoinInstance", address, options.dry_run);
        if let Some(error) = status.channel(ASYNC_CHANNEL).and_then(|c| c.last_error.as_ref()) {
            report.note(format!(
                "Replication channel error {} ({}); credentials will be regenerated",
                error.code, error.message
            ));
        }
        let selection = self.choose_recovery(&snap, &status, &primary_status, options.recovery_method)?;
        report.recovery_method = Some(selection.method);
        report.note(format!("Recovery method {}: {}", selection.method, selection.reason));
        if options.dry_run {
            return Ok(report);
        }

        let client = self.session.client();
        self.stop_channel(address)?;
        if selection.method == RecoveryMethod::Clone {
            client.apply_control(address, ControlCommand::Clone { donor: primary_addr.clone() })?;
        }
        client.apply_control(address, ControlCommand::SetSuperReadOnly { enabled: true })?;
        let user = Self::user_of(&member);
        self.point_to(address, &primary_addr, &user)?;
        if let Err(e) = self.sync_with(address, &primary_addr) {
            report.best_effort("rollback (stop replication)", self.stop_channel(address));
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
        report.note(format!("Instance {} is replicating from {} again", address, primary_addr));
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
        let topo = TopologySnapshot::ReplicaSet(snap.clone());
        let target = find_member(&topo, address)?.clone();
        let old = snap.require_primary()?.clone();
        let old_addr = old.address().clone();
        let mut report = OperationReport::new("setPrimaryInstance", address, options.dry_run);
        if &old_addr == address {
            report.note(format!("Instance {} is already the primary", address));
            return Ok(report);
        }
        let not_online: Vec<String> = snap
            .members
            .iter()
            .filter(|m| m.state != InstanceState::Online && m.state != InstanceState::Invalidated)
            .map(|m| format!("{} ({})", m.address(), m.state))
            .collect();
        if !not_online.is_empty() {
            return Err(TopologyError::InvalidState(format!(
                "All members of ReplicaSet '{}' must be ONLINE to switch the primary: {}",
                self.name,
                not_online.join(", ")
            )));
        }
        if target.state != InstanceState::Online {
            return Err(TopologyError::InvalidState(format!(
                "Instance {} is {} and can not become the primary",
                address, target.state
            )));
        }
        ensure_member_consistent(&topo, address)?;
        let secondaries: Vec<MemberSnapshot> = snap
            .secondaries()
            .filter(|m| m.state == InstanceState::Online && m.address() != address)
            .cloned()
            .collect();
        if options.dry_run {
            report.note(format!("Primary would switch from {} to {}", old_addr, address));
            return Ok(report);
        }

        // 预同步，缩短持锁时间
        self.sync_with(address, &old_addr)?;
        for s in &secondaries {
            self.sync_with(s.address(), &old_addr)?;
        }

        let client = self.session.client();
        let mut locks = InstanceLocks::new(client, "setPrimaryInstance");
        locks.acquire(&old_addr)?;
        locks.acquire(address)?;
        for s in &secondaries {
            locks.acquire(s.address())?;
        }

        client.apply_control(&old_addr, ControlCommand::SetSuperReadOnly { enabled: true })?;
        let switched = (|| {
            self.sync_with(address, &old_addr)?;
            self.stop_channel(address)?;
            client.apply_control(address, ControlCommand::SetSuperReadOnly { enabled: false })
        })();
        if let Err(e) = switched {
            let result = client.apply_control(&old_addr, ControlCommand::SetSuperReadOnly { enabled: false });
            report.best_effort("rollback (re-enable writes on the old primary)", result);
            return Err(e);
        }

        // 先改从节点，最后改旧主节点
        let mut repointed: Vec<(InstanceAddress, String)> = Vec::new();
        let mut failure = None;
        for s in &secondaries {
            let user = Self::user_of(s);
            match self.point_to(s.address(), address, &user) {
                Ok(()) => repointed.push((s.address().clone(), user)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_none() {
            let user = Self::user_of(&old);
            if let Err(e) = self.point_to(&old_addr, address, &user) {
                failure = Some(e);
            }
        }
        if let Some(e) = failure {
            log::warn!("[{}] Primary switch failed, rolling back: {}", address, e);
            for (replica, user) in repointed.iter().rev() {
                let result = self.point_to(replica, &old_addr, user);
                report.best_effort(&format!("rollback (re-point {})", replica), result);
            }
            let back = client
                .apply_control(address, ControlCommand::SetSuperReadOnly { enabled: true })
                .and_then(|_| self.point_to(address, &old_addr, &Self::user_of(&target)))
                .and_then(|_| {
                    self.stop_channel(&old_addr)?;
                    client.apply_control(&old_addr, ControlCommand::SetSuperReadOnly { enabled: false })
                });
            report.best_effort("rollback (restore the old primary)", back);
            return Err(e);
        }
        drop(locks);

        let target_id = target.record.id.clone();
        let rs_id = self.id.clone();
        report.view_id = Some(commit_change(
            &self.session,
            &snap.topology(),
            ViewChangeReason::SwitchActive,
            &format!("primary switched from {} to {}", old_addr, address),
            |schema| {
                schema.replicaset_mut(&rs_id)?.primary = Some(target_id.clone());
                Ok(())
            },
        )?);
        report.note(format!("Instance {} is the new primary of ReplicaSet '{}'", address, self.name));
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════
    // forcePrimaryInstance
    // ═══════════════════════════════════════════════════════════════════

    /// 主节点失联时的故障转移；`instance` 为空时选择 GTID 最全的从节点
    pub fn force_primary_instance(
        &self,
        instance: Option<&str>,
        options: ForcePrimaryOptions,
    ) -> Result<OperationReport> {
        let requested = instance.map(parse_address).transpose()?;
        self.session.run_operation("forcePrimaryInstance", instance.unwrap_or(&self.name), || {
            self.do_force_primary(requested.as_ref(), &options)
        })
    }

    fn do_force_primary(
        &self,
        requested: Option<&InstanceAddress>,
        options: &ForcePrimaryOptions,
    ) -> Result<OperationReport> {
        let (_lock, snap) = self.preflight("forcePrimaryInstance")?;
        if let Some(primary) = snap.primary_member() {
            if primary.is_reachable() {
                return Err(TopologyError::InvalidState(format!(
                    "The PRIMARY {} of ReplicaSet '{}' is still reachable; use setPrimaryInstance() instead",
                    primary.address(),
                    self.name
                )));
            }
        }
        let old_addr = snap.primary.clone();

        let reachable: Vec<(&MemberSnapshot, &InstanceStatus)> = snap
            .secondaries()
            .filter(|m| m.state != InstanceState::Invalidated)
            .filter_map(|m| m.status.as_ref().map(|s| (m, s)))
            .collect();
        if reachable.is_empty() {
            return Err(TopologyError::InvalidState(format!(
                "ReplicaSet '{}' has no reachable secondary to promote",
                self.name
            )));
        }

        // 先让每个从节点应用完 relay log 中已接收的事务，再重新探测
        let mut refreshed = Vec::with_capacity(reachable.len());
        for (member, status) in &reachable {
            let received = status
                .channel(ASYNC_CHANNEL)
                .map(|c| c.received_gtid_set.clone())
                .unwrap_or_default();
            wait_for_sync(
                self.session.client(),
                member.address(),
                &received,
                "its relay log",
                self.session.sync_timeout(),
            )?;
            refreshed.push((*member, self.session.probe(member.address())?));
        }
        let candidates: Vec<(&MemberSnapshot, &InstanceStatus)> =
            refreshed.iter().map(|(m, s)| (*m, s)).collect();

        // 所有可达从节点的 GTID 并集；新主节点必须包含它
        let mut union = GtidSet::new();
        for (_, s) in &candidates {
            union = union.union(&s.gtid_executed);
        }
        let (chosen, chosen_status) = match requested {
            Some(address) => *candidates
                .iter()
                .find(|(m, _)| m.address() == address)
                .ok_or_else(|| {
                    TopologyError::ArgumentError(format!(
                        "Instance {} is not a reachable secondary of ReplicaSet '{}'",
                        address, self.name
                    ))
                })?,
            None => *candidates
                .iter()
                .max_by_key(|(_, s)| s.gtid_executed.count())
                .ok_or_else(|| TopologyError::InternalError("no promotion candidate".to_string()))?,
        };
        let missing = union.subtract(&chosen_status.gtid_executed);
        if !missing.is_empty() {
            return Err(TopologyError::RecoveryStateError(format!(
                "Instance {} is missing transactions present on other secondaries: {}",
                chosen.address(),
                missing
            )));
        }
        let new_addr = chosen.address().clone();

        let mut report = OperationReport::new("forcePrimaryInstance", &new_addr, options.dry_run);
        report.note(format!(
            "Instance {} will be promoted; unreachable members will be invalidated",
            new_addr
        ));
        if options.dry_run {
            return Ok(report);
        }

        let client = self.session.client();
        self.stop_channel(&new_addr)?;
        client.apply_control(&new_addr, ControlCommand::SetSuperReadOnly { enabled: false })?;
        crate::record_failover!("replicaset_force_primary");

        let mut invalidate = Vec::new();
        for m in snap.members.iter() {
            if m.address() == &new_addr || m.state == InstanceState::Invalidated {
                continue;
            }
            if !m.is_reachable() {
                report.warn(format!("Instance {} is unreachable and will be INVALIDATED", m.address()));
                invalidate.push(m.record.id.clone());
                continue;
            }
            let result = self.point_to(m.address(), &new_addr, &Self::user_of(m));
            if !report.best_effort(&format!("re-point {}", m.address()), result) {
                invalidate.push(m.record.id.clone());
            }
        }

        let new_id = chosen.record.id.clone();
        let rs_id = self.id.clone();
        let detail = format!(
            "failover to {} (old primary {})",
            new_addr,
            old_addr.map(|a| a.to_string()).unwrap_or_else(|| "unknown".to_string())
        );
        report.view_id = Some(commit_change(
            &self.session,
            &snap.topology(),
            ViewChangeReason::ForcePrimary,
            &detail,
            |schema| {
                schema.replicaset_mut(&rs_id)?.primary = Some(new_id.clone());
                for id in &invalidate {
                    schema.instance_mut(id)?.invalidated = true;
                }
                Ok(())
            },
        )?);
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════
    // status / options
    // ═══════════════════════════════════════════════════════════════════

    pub fn status(&self) -> Result<ReplicaSetStatus> {
        let snap = self.snapshot()?;
        Ok(describe_replica_set(&snap))
    }

    pub fn options(&self) -> Result<ReplicaSetOptionsView> {
        let topology = self.topology();
        self.session.store().read(|schema| {
            let record = schema.replicaset(&self.id)?;
            let mut options = record.options.clone();
            options.insert("replicaSetName".to_string(), Value::from(record.name.clone()));
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
            Ok(ReplicaSetOptionsView {
                name: record.name.clone(),
                options,
                tags: record.tags.clone(),
                instances,
            })
        })
    }

    /// 支持 `replicaSetName` 与 `tag:<name>`
    pub fn set_option(&self, key: &str, value: Value, options: SetOptionOptions) -> Result<OperationReport> {
        let tag = match tag_name(key)? {
            Some(name) => Some((coerce_tag(&name, &value)?, name)),
            None => None,
        };
        let new_name = match (key, &tag) {
            (_, Some(_)) => None,
            ("replicaSetName", None) => {
                let name = value.as_str().map(str::to_string).ok_or_else(|| {
                    TopologyError::TypeError("Option 'replicaSetName' is expected to be of type String".to_string())
                })?;
                validate_name("ReplicaSet", &name)?;
                Some(name)
            }
            _ => {
                return Err(TopologyError::ArgumentError(format!(
                    "Option '{}' not supported",
                    key
                )))
            }
        };

        self.session.run_operation("setOption", &self.name, || {
            let (_lock, snap) = self.preflight("setOption")?;
            if let Some(name) = &new_name {
                let taken = self
                    .session
                    .store()
                    .read(|s| s.is_name_taken(name) && !name.eq_ignore_ascii_case(&self.name));
                if taken {
                    return Err(TopologyError::InvalidState(format!(
                        "A topology named '{}' already exists",
                        name
                    )));
                }
            }
            let rs_id = self.id.clone();
            let mut report = OperationReport::new("setOption", &self.name, options.dry_run);
            if options.dry_run {
                report.note(format!("Option '{}' would be updated", key));
                return Ok(report);
            }
            report.view_id = Some(commit_change(
                &self.session,
                &snap.topology(),
                ViewChangeReason::SetOption,
                &format!("set {}", key),
                |schema| {
                    let record = schema.replicaset_mut(&rs_id)?;
                    if let Some(name) = &new_name {
                        record.name = name.clone();
                    }
                    if let Some((value, name)) = &tag {
                        apply_tag(&mut record.tags, name, value.clone());
                    }
                    Ok(())
                },
            )?);
            Ok(report)
        })
    }

    /// 支持 `label` 与 `tag:<name>`
    pub fn set_instance_option(
        &self,
        instance: &str,
        key: &str,
        value: Value,
        options: SetOptionOptions,
    ) -> Result<OperationReport> {
        let address = parse_address(instance)?;
        let option = InstanceOption::parse(key, &value)?;
        if matches!(option, InstanceOption::Variable { .. }) {
            return Err(TopologyError::ArgumentError(format!(
                "Option '{}' is not supported for ReplicaSet instances",
                key
            )));
        }
        self.session.run_operation("setInstanceOption", instance, || {
            let (_lock, snap) = self.preflight("setInstanceOption")?;
            let topo = TopologySnapshot::ReplicaSet(snap.clone());
            let record_id = find_member(&topo, &address)?.record.id.clone();
            if let InstanceOption::Label(label) = &option {
                self.session
                    .store()
                    .read(|s| ensure_label_free(s, &snap.topology(), label, Some(&address)))?;
            }
            let mut report = OperationReport::new("setInstanceOption", &address, options.dry_run);
            if options.dry_run {
                report.note(format!("Option '{}' would be updated on {}", key, address));
                return Ok(report);
            }
            report.view_id = Some(commit_change(
                &self.session,
                &snap.topology(),
                ViewChangeReason::SetOption,
                &format!("set {} on {}", key, address),
                |schema| {
                    let rec = schema.instance_mut(&record_id)?;
                    match &option {
                        InstanceOption::Label(label) => rec.label = label.clone(),
                        InstanceOption::Tag { name, value } => apply_tag(&mut rec.tags, name, value.clone()),
                        InstanceOption::Variable { .. } => {}
                    }
                    Ok(())
                },
            )?);
            Ok(report)
        })
    }
}

pub fn describe_replica_set(snap: &ReplicaSetSnapshot) -> ReplicaSetStatus {
    let mut errors = snap.consistency_errors.clone();
    let primary_ok = snap
        .primary_member()
        .map(|p| p.state == InstanceState::Online)
        .unwrap_or(false);
    let all_ok = snap.members.iter().all(|m| m.state == InstanceState::Online);

    let (status, text) = if !primary_ok {
        (ReplicaSetHealth::Unavailable, "PRIMARY instance is not available".to_string())
    } else if all_ok {
        (ReplicaSetHealth::Available, "All instances available".to_string())
    } else {
        (
            ReplicaSetHealth::AvailablePartial,
            "The PRIMARY instance is available, but one or more SECONDARY instances are not".to_string(),
        )
    };

    let members = snap
        .members
        .iter()
        .map(|m| {
            let is_primary = snap.primary.as_ref() == Some(m.address());
            let channel = m.status.as_ref().and_then(|s| s.channel(ASYNC_CHANNEL));
            let mut member_errors = Vec::new();
            if let Some(e) = &m.error {
                member_errors.push(e.clone());
            }
            if let Some(e) = channel.and_then(|c| c.last_error.as_ref()) {
                member_errors.push(format!("Replication channel error {}: {}", e.code, e.message));
            }
            if !is_primary && m.is_reachable() && channel.is_none() {
                member_errors.push("Replication channel is missing".to_string());
            }
            if let (Some(c), Some(p)) = (channel, &snap.primary) {
                if !is_primary && &c.source != p {
                    member_errors.push(format!("Replicating from {} instead of the PRIMARY {}", c.source, p));
                }
            }
            MemberStatus {
                address: m.address().to_string(),
                label: m.record.label.clone(),
                role: if is_primary { "PRIMARY" } else { "SECONDARY" }.to_string(),
                mode: match (m.state, is_primary) {
                    (InstanceState::Online, true) => "R/W",
                    (InstanceState::Online, false) => "R/O",
                    _ => "n/a",
                }
                .to_string(),
                state: m.state,
                version: m.status.as_ref().map(|s| s.version.to_string()),
                sources: channel.map(|c| vec![c.source.to_string()]),
                errors: member_errors,
            }
        })
        .collect();

    if snap.members.iter().any(|m| m.state == InstanceState::Invalidated) {
        errors.push("One or more instances are INVALIDATED; rejoin or remove them".to_string());
    }

    ReplicaSetStatus {
        name: snap.record.name.clone(),
        status,
        status_text: text,
        primary: snap.primary.as_ref().map(|p| p.to_string()),
        members,
        errors,
    }
}
