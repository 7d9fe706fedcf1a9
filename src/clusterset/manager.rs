//! ClusterSet 拓扑变更
//!
//! 顺序约束：切换时先让旧主 Cluster 只读，等新主 Cluster 追平后再拆通道、开写；
//! 其余副本最后重新指向新的源。

use chrono::Utc;
use std::collections::BTreeMap;

use super::channel::{channel_health, ChannelHealth, ChannelManager, CLUSTERSET_CHANNEL};
use super::status::errant_against;
use super::{
    ClusterSet, CreateReplicaClusterOptions, ForcePrimaryClusterOptions, RejoinClusterOptions,
    RemoveClusterOptions, SetPrimaryClusterOptions,
};
use crate::gtid::{purged_gap, wait_for_sync};
use crate::metadata::{
    ClusterId, ClusterRecord, ClusterRole, ClusterSetId, ClusterSetMembership, ClusterSetRecord,
    InstanceRole, TopologyRef, ViewChangeReason,
};
use crate::mutator::cluster::{remove_cluster_records, MEMBER_ACCOUNT_PREFIX};
use crate::mutator::{
    account_name, clone_available, commit_change, effective_policy, instance_record,
    parse_address, probe_candidate, validate_name, Cluster, CreateClusterSetOptions,
    OperationReport,
};
use crate::probe::{ControlCommand, InstanceAddress, InstanceStatus, ReplicationCredentials};
use crate::recovery::{choose_recovery_method, RecoveryInput, RecoveryMethod};
use crate::session::Session;
use crate::topology::{ClusterSnapshot, MemberSnapshot};
use crate::{Result, TopologyError};

const CLUSTERSET_ACCOUNT_PREFIX: &str = "mysql_innodb_cs";

/// 可达的主节点地址与状态
fn primary_endpoint(snap: &ClusterSnapshot) -> Result<(InstanceAddress, InstanceStatus)> {
    let primary = snap.require_primary()?;
    let status = primary.require_status()?.clone();
    Ok((primary.address().clone(), status))
}

fn primary_cluster<'a>(record: &ClusterSetRecord, clusters: &'a [ClusterRecord]) -> Result<&'a ClusterRecord> {
    clusters
        .iter()
        .find(|c| c.id == record.primary_cluster)
        .ok_or_else(|| {
            TopologyError::MetadataConsistency(format!(
                "ClusterSet '{}' has no record of its PRIMARY cluster",
                record.domain_name
            ))
        })
}

fn channel_user(record: &ClusterRecord, primary: &InstanceStatus) -> String {
    record
        .clusterset
        .as_ref()
        .and_then(|m| m.replication_user.clone())
        .unwrap_or_else(|| account_name(CLUSTERSET_ACCOUNT_PREFIX, primary.server_id))
}

fn sync_with(session: &Session, address: &InstanceAddress, source: &InstanceAddress) -> Result<()> {
    let reference = session.probe(source)?.gtid_executed;
    wait_for_sync(
        session.client(),
        address,
        &reference,
        &source.to_string(),
        session.sync_timeout(),
    )
}

fn membership_mut<'a>(
    schema: &'a mut crate::metadata::MetadataSchema,
    id: &ClusterId,
) -> Result<&'a mut ClusterSetMembership> {
    let cluster = schema.cluster_mut(id)?;
    let name = cluster.name.clone();
    cluster.clusterset.as_mut().ok_or_else(|| {
        TopologyError::MetadataConsistency(format!("Cluster '{}' is not part of a ClusterSet", name))
    })
}

// ═══════════════════════════════════════════════════════════════════
// createClusterSet
// ═══════════════════════════════════════════════════════════════════

pub(crate) fn create_cluster_set(
    cluster: &Cluster,
    domain: &str,
    options: &CreateClusterSetOptions,
) -> Result<OperationReport> {
    validate_name("ClusterSet", domain)?;
    let session = cluster.session();
    let (_lock, snap) = cluster.preflight_for_clusterset("createClusterSet")?;
    if snap.record.clusterset.is_some() {
        return Err(TopologyError::InvalidState(format!(
            "Cluster '{}' is already part of a ClusterSet",
            snap.record.name
        )));
    }
    if !snap.record.single_primary {
        return Err(TopologyError::InvalidState(format!(
            "Cluster '{}' runs in multi-primary mode; a ClusterSet requires single-primary mode",
            snap.record.name
        )));
    }
    snap.require_quorum("createClusterSet")?;
    snap.require_primary()?;
    let taken = session.store().read(|schema| {
        schema
            .clustersets
            .values()
            .any(|cs| cs.domain_name.eq_ignore_ascii_case(domain))
    });
    if taken {
        return Err(TopologyError::InvalidState(format!(
            "A ClusterSet named '{}' already exists",
            domain
        )));
    }

    let mut report = OperationReport::new("createClusterSet", domain, options.dry_run);
    report.note(format!("Cluster '{}' will become the PRIMARY cluster of '{}'", snap.record.name, domain));
    if options.dry_run {
        return Ok(report);
    }

    let id = ClusterSetId::generate();
    let cluster_id = snap.record.id.clone();
    report.view_id = Some(commit_change(
        session,
        &TopologyRef::ClusterSet(id.clone()),
        ViewChangeReason::CreateClusterSet,
        &format!("clusterset created around '{}'", snap.record.name),
        |schema| {
            schema.clustersets.insert(
                id.clone(),
                ClusterSetRecord {
                    id: id.clone(),
                    domain_name: domain.to_string(),
                    primary_cluster: cluster_id.clone(),
                    view_id: 0,
                    created_at: Utc::now(),
                },
            );
            schema.cluster_mut(&cluster_id)?.clusterset = Some(ClusterSetMembership {
                clusterset_id: id.clone(),
                role: ClusterRole::Primary,
                invalidated: false,
                replication_user: None,
            });
            Ok(())
        },
    )?);
    report.note(format!("ClusterSet '{}' created", domain));
    Ok(report)
}

// ═══════════════════════════════════════════════════════════════════
// createReplicaCluster
// ═══════════════════════════════════════════════════════════════════

pub(crate) fn create_replica_cluster(
    cs: &ClusterSet,
    instance: &str,
    name: &str,
    options: &CreateReplicaClusterOptions,
) -> Result<OperationReport> {
    validate_name("Cluster", name)?;
    let address = parse_address(instance)?;
    let session = cs.session();
    let (cs_record, clusters) = cs.load()?;
    let primary_record = primary_cluster(&cs_record, &clusters)?;
    let _locks = cs.lock_for("createReplicaCluster", &[primary_record])?;
    let _name_lock = session.store().lock_topology(
        &format!("cluster-name:{}", name.to_ascii_lowercase()),
        "createReplicaCluster",
    )?;

    let schema = session.store().snapshot();
    if schema.is_name_taken(name) {
        return Err(TopologyError::InvalidState(format!(
            "A topology named '{}' already exists",
            name
        )));
    }
    let p_snap = session.refresh_cluster(&primary_record.id)?;
    p_snap.require_quorum("createReplicaCluster")?;
    let (p_addr, p_status) = primary_endpoint(&p_snap)?;
    let status = probe_candidate(session, &schema, &address)?;

    let mut report = OperationReport::new("createReplicaCluster", &address, options.dry_run);
    let selection = choose_recovery_method(
        &RecoveryInput {
            target: &status.gtid_executed,
            source_executed: &p_status.gtid_executed,
            source_purged: &p_status.gtid_purged,
            policy: effective_policy(session, options.recovery_method),
            interactive: session.is_interactive(),
            clone_available: clone_available(session, p_snap.record.disable_clone, status.version, p_status.version)?,
            source_complete: p_snap.record.gtid_set_complete,
        },
        session.interaction(),
    )?;
    report.recovery_method = Some(selection.method);
    report.note(format!("Recovery method {}: {}", selection.method, selection.reason));
    if options.dry_run {
        return Ok(report);
    }

    let client = session.client();
    let channels = ChannelManager::new(client);
    let user = account_name(CLUSTERSET_ACCOUNT_PREFIX, status.server_id);
    let member_account = account_name(MEMBER_ACCOUNT_PREFIX, status.server_id);
    let group_name = uuid::Uuid::new_v4().to_string();
    let view_change_uuid = uuid::Uuid::new_v4().to_string();

    // 账号建在主 Cluster 上，经通道复制到副本
    let credentials = channels.provision_account(&p_addr, &user)?;
    let provisioned = (|| {
        client.apply_control(
            &p_addr,
            ControlCommand::CreateReplicationAccount {
                credentials: ReplicationCredentials::generate(&member_account),
            },
        )?;
        if selection.method == RecoveryMethod::Clone {
            client.apply_control(&address, ControlCommand::Clone { donor: p_addr.clone() })?;
        }
        client.apply_control(
            &address,
            ControlCommand::StartGroupReplication {
                group_name: group_name.clone(),
                view_change_uuid: Some(view_change_uuid.clone()),
                bootstrap: true,
                single_primary: true,
                recovery: None,
            },
        )?;
        client.apply_control(&address, ControlCommand::SetSuperReadOnly { enabled: true })?;
        channels.establish(&address, &p_addr, credentials.clone())?;
        sync_with(session, &address, &p_addr)
    })();
    if let Err(e) = provisioned {
        report.best_effort("rollback (remove ClusterSet channel)", channels.teardown(&address));
        let leave = client.apply_control(&address, ControlCommand::StopGroupReplication);
        report.best_effort("rollback (leave group)", leave);
        report.best_effort("rollback (drop ClusterSet account)", channels.drop_account(&p_addr, &user));
        report.best_effort(
            "rollback (drop member account)",
            channels.drop_account(&p_addr, &member_account),
        );
        return Err(e);
    }

    let cluster_id = ClusterId::generate();
    let topology = TopologyRef::Cluster(cluster_id.clone());
    let cs_id = cs.id().clone();
    let disable_clone = p_snap.record.disable_clone;
    let gtid_set_complete = p_snap.record.gtid_set_complete;
    report.view_id = Some(commit_change(
        session,
        &topology,
        ViewChangeReason::CreateReplicaCluster,
        &format!("replica cluster '{}' created from {}", name, address),
        |schema| {
            if schema.is_name_taken(name) {
                return Err(TopologyError::InvalidState(format!(
                    "A topology named '{}' already exists",
                    name
                )));
            }
            schema.clusters.insert(
                cluster_id.clone(),
                ClusterRecord {
                    id: cluster_id.clone(),
                    name: name.to_string(),
                    group_name: group_name.clone(),
                    view_change_uuid: Some(view_change_uuid.clone()),
                    single_primary: true,
                    created_at: Utc::now(),
                    view_id: 0,
                    disable_clone,
                    gtid_set_complete,
                    options: BTreeMap::new(),
                    tags: BTreeMap::new(),
                    attributes: BTreeMap::new(),
                    clusterset: Some(ClusterSetMembership {
                        clusterset_id: cs_id.clone(),
                        role: ClusterRole::Replica,
                        invalidated: false,
                        replication_user: Some(user.clone()),
                    }),
                },
            );
            let record = instance_record(
                &status,
                topology.clone(),
                InstanceRole::Member,
                None,
                Some(member_account.clone()),
                0,
            );
            schema.instances.insert(record.id.clone(), record);
            Ok(())
        },
    )?);
    report.note(format!("Replica cluster '{}' is replicating from {}", name, p_addr));
    Ok(report)
}

// ═══════════════════════════════════════════════════════════════════
// removeCluster
// ═══════════════════════════════════════════════════════════════════

pub(crate) fn remove_cluster(cs: &ClusterSet, name: &str, options: &RemoveClusterOptions) -> Result<OperationReport> {
    let session = cs.session();
    let (cs_record, clusters) = cs.load()?;
    let target = ClusterSet::find_cluster(&clusters, name)?.clone();
    if target.id == cs_record.primary_cluster {
        return Err(TopologyError::InvalidState(format!(
            "Cluster '{}' is the PRIMARY cluster of ClusterSet '{}'; switch the primary cluster first",
            target.name, cs_record.domain_name
        )));
    }
    let primary_record = primary_cluster(&cs_record, &clusters)?;
    let _locks = cs.lock_for("removeCluster", &[&target])?;

    let snap = session.refresh_cluster(&target.id)?;
    let p_snap = session.refresh_cluster(&primary_record.id)?;
    let replica_primary = snap
        .primary_member()
        .filter(|m| m.is_reachable())
        .map(|m| m.address().clone());
    let p_primary = p_snap
        .primary_member()
        .filter(|m| m.is_reachable())
        .map(|m| m.address().clone());

    let mut report = OperationReport::new("removeCluster", &target.name, options.dry_run);
    match &replica_primary {
        None if !options.force => {
            return Err(TopologyError::unreachable(
                &target.name,
                "the cluster has no reachable primary; use force=true to remove it from the metadata only",
            ));
        }
        None => report.warn(format!(
            "Cluster '{}' is not reachable; removing it from the metadata only",
            target.name
        )),
        Some(r) => {
            if let (false, Some(p)) = (target.is_invalidated(), &p_primary) {
                match sync_with(session, r, p) {
                    Ok(()) => {}
                    Err(e) if options.force => report.warn(format!("{}; continuing because force=true", e)),
                    Err(e) => return Err(e),
                }
            }
        }
    }
    if options.dry_run {
        return Ok(report);
    }

    let client = session.client();
    let channels = ChannelManager::new(client);
    if let Some(r) = &replica_primary {
        match channels.teardown(r) {
            Ok(()) => {}
            Err(e) if options.force => report.warn(format!("Failed to remove the ClusterSet channel: {}", e)),
            Err(e) => return Err(e),
        }
    }
    let user = target.clusterset.as_ref().and_then(|m| m.replication_user.clone());
    if let (Some(p), Some(user)) = (&p_primary, user) {
        report.best_effort("drop ClusterSet replication account", channels.drop_account(p, &user));
    }

    // 解散副本 Cluster 的组：先从节点，最后主节点
    let mut group_members: Vec<&MemberSnapshot> = snap
        .members
        .iter()
        .filter(|m| m.status.as_ref().map(|s| s.is_group_member()).unwrap_or(false))
        .collect();
    group_members.sort_by_key(|m| snap.primary.as_ref() == Some(m.address()));
    for member in group_members {
        let result = client.apply_control(member.address(), ControlCommand::StopGroupReplication);
        report.best_effort(&format!("stop group replication on {}", member.address()), result);
    }

    let target_id = target.id.clone();
    let topology = target.topology();
    report.view_id = Some(commit_change(
        session,
        &cs.topology(),
        ViewChangeReason::RemoveCluster,
        &format!("removed cluster '{}'", target.name),
        |schema| {
            remove_cluster_records(schema, &target_id, &topology);
            Ok(())
        },
    )?);
    report.note(format!("Cluster '{}' removed from ClusterSet '{}'", target.name, cs_record.domain_name));
    Ok(report)
}

// ═══════════════════════════════════════════════════════════════════
// setPrimaryCluster
// ═══════════════════════════════════════════════════════════════════

pub(crate) fn set_primary_cluster(
    cs: &ClusterSet,
    name: &str,
    options: &SetPrimaryClusterOptions,
) -> Result<OperationReport> {
    let session = cs.session();
    let (cs_record, clusters) = cs.load()?;
    let target = ClusterSet::find_cluster(&clusters, name)?.clone();
    let mut report = OperationReport::new("setPrimaryCluster", &target.name, options.dry_run);
    if target.id == cs_record.primary_cluster {
        report.note(format!("Cluster '{}' is already the PRIMARY cluster", target.name));
        return Ok(report);
    }
    if target.is_invalidated() {
        return Err(TopologyError::InvalidState(format!(
            "Cluster '{}' is INVALIDATED; rejoin it before promoting it",
            target.name
        )));
    }
    let old = primary_cluster(&cs_record, &clusters)?.clone();
    let _locks = cs.lock_for("setPrimaryCluster", &[&old, &target])?;

    let p_snap = session.refresh_cluster(&old.id)?;
    p_snap.require_quorum("setPrimaryCluster")?;
    let (p_addr, p_status) = primary_endpoint(&p_snap)?;
    let r_snap = session.refresh_cluster(&target.id)?;
    r_snap.require_quorum("setPrimaryCluster")?;
    let (r_addr, r_status) = primary_endpoint(&r_snap)?;
    let health = channel_health(Some(&r_status), false);
    if health != ChannelHealth::Ok {
        return Err(TopologyError::ReplicationChannelError(format!(
            "The ClusterSet channel of cluster '{}' is {}; it must be OK before the cluster can be promoted",
            target.name, health
        )));
    }
    let errant = errant_against(&target, &r_status.gtid_executed, &p_status.gtid_executed);
    if !errant.is_empty() {
        return Err(TopologyError::RecoveryStateError(format!(
            "Cluster '{}' has transactions not present in the PRIMARY cluster: {}",
            target.name, errant
        )));
    }
    let others: Vec<ClusterRecord> = clusters
        .iter()
        .filter(|c| c.id != old.id && c.id != target.id)
        .cloned()
        .collect();

    report.note(format!(
        "PRIMARY cluster will switch from '{}' to '{}'",
        old.name, target.name
    ));
    if options.dry_run {
        return Ok(report);
    }

    // 预同步缩短只读窗口
    sync_with(session, &r_addr, &p_addr)?;

    let client = session.client();
    let channels = ChannelManager::new(client);
    client.apply_control(&p_addr, ControlCommand::SetSuperReadOnly { enabled: true })?;
    let switched = (|| {
        sync_with(session, &r_addr, &p_addr)?;
        channels.teardown(&r_addr)?;
        client.apply_control(&r_addr, ControlCommand::SetSuperReadOnly { enabled: false })
    })();
    if let Err(e) = switched {
        let user = channel_user(&target, &r_status);
        let restore = channels
            .rotate_password(&p_addr, &user)
            .and_then(|c| channels.establish(&r_addr, &p_addr, c))
            .and_then(|_| client.apply_control(&r_addr, ControlCommand::SetSuperReadOnly { enabled: true }));
        report.best_effort("rollback (restore the ClusterSet channel)", restore);
        let writable = client.apply_control(&p_addr, ControlCommand::SetSuperReadOnly { enabled: false });
        report.best_effort("rollback (re-enable writes on the old primary)", writable);
        return Err(e);
    }

    // 旧主 Cluster 改为从新主 Cluster 复制
    let old_user = channel_user(&old, &p_status);
    let demoted = channels
        .provision_account(&r_addr, &old_user)
        .and_then(|c| channels.establish(&p_addr, &r_addr, c));
    report.best_effort(&format!("re-point cluster '{}'", old.name), demoted);

    for other in others.iter().filter(|c| !c.is_invalidated()) {
        let snap = session.refresh_cluster(&other.id)?;
        match snap.primary_member().and_then(|m| m.status.as_ref().map(|s| (m.address(), s))) {
            Some((address, status)) => {
                let user = channel_user(other, status);
                let result = channels
                    .rotate_password(&r_addr, &user)
                    .and_then(|c| channels.establish(address, &r_addr, c));
                report.best_effort(&format!("re-point cluster '{}'", other.name), result);
            }
            None => report.warn(format!(
                "Cluster '{}' has no reachable primary; its channel was not re-pointed",
                other.name
            )),
        }
    }

    let cs_id = cs.id().clone();
    let (old_id, target_id) = (old.id.clone(), target.id.clone());
    report.view_id = Some(commit_change(
        session,
        &cs.topology(),
        ViewChangeReason::SwitchPrimaryCluster,
        &format!("primary cluster switched from '{}' to '{}'", old.name, target.name),
        |schema| {
            schema.clusterset_mut(&cs_id)?.primary_cluster = target_id.clone();
            let demoted = membership_mut(schema, &old_id)?;
            demoted.role = ClusterRole::Replica;
            demoted.replication_user = Some(old_user.clone());
            let promoted = membership_mut(schema, &target_id)?;
            promoted.role = ClusterRole::Primary;
            Ok(())
        },
    )?);
    report.note(format!("Cluster '{}' is the new PRIMARY cluster", target.name));
    Ok(report)
}

// ═══════════════════════════════════════════════════════════════════
// forcePrimaryCluster
// ═══════════════════════════════════════════════════════════════════

pub(crate) fn force_primary_cluster(
    cs: &ClusterSet,
    name: &str,
    options: &ForcePrimaryClusterOptions,
) -> Result<OperationReport> {
    let session = cs.session();
    let (cs_record, clusters) = cs.load()?;
    let target = ClusterSet::find_cluster(&clusters, name)?.clone();
    if target.id == cs_record.primary_cluster {
        return Err(TopologyError::InvalidState(format!(
            "Cluster '{}' is already the PRIMARY cluster",
            target.name
        )));
    }
    if target.is_invalidated() {
        return Err(TopologyError::InvalidState(format!(
            "Cluster '{}' is INVALIDATED and can not be promoted",
            target.name
        )));
    }
    let old = primary_cluster(&cs_record, &clusters)?.clone();

    let mut invalidate: Vec<ClusterId> = Vec::new();
    for requested in &options.invalidate_replica_clusters {
        let cluster = ClusterSet::find_cluster(&clusters, requested)?;
        if cluster.id == target.id || cluster.id == old.id {
            return Err(TopologyError::ArgumentError(format!(
                "Cluster '{}' can not be listed in invalidateReplicaClusters",
                cluster.name
            )));
        }
        invalidate.push(cluster.id.clone());
    }

    let _locks = cs.lock_for("forcePrimaryCluster", &[&old, &target])?;
    let p_snap = session.refresh_cluster(&old.id)?;
    let primary_available = p_snap.quorum.has_quorum
        && p_snap.primary_member().map(|m| m.is_reachable()).unwrap_or(false);
    if primary_available {
        return Err(TopologyError::InvalidState(format!(
            "The PRIMARY cluster '{}' is still available; use setPrimaryCluster() instead",
            old.name
        )));
    }
    let r_snap = session.refresh_cluster(&target.id)?;
    r_snap.require_quorum("forcePrimaryCluster")?;
    let (r_addr, r_status) = primary_endpoint(&r_snap)?;

    let mut report = OperationReport::new("forcePrimaryCluster", &target.name, options.dry_run);
    report.warn(format!(
        "PRIMARY cluster '{}' is unavailable; it will be INVALIDATED",
        old.name
    ));

    // 其余副本：能否从新主 Cluster 继续复制
    let mut repoint: Vec<(ClusterRecord, InstanceAddress, String)> = Vec::new();
    for other in clusters.iter().filter(|c| c.id != old.id && c.id != target.id) {
        if other.is_invalidated() || invalidate.contains(&other.id) {
            continue;
        }
        let snap = session.refresh_cluster(&other.id)?;
        let Some((address, status)) = snap
            .primary_member()
            .and_then(|m| m.status.as_ref().map(|s| (m.address().clone(), s.clone())))
        else {
            report.warn(format!("Cluster '{}' is unreachable and will be INVALIDATED", other.name));
            invalidate.push(other.id.clone());
            continue;
        };
        let errant = errant_against(other, &status.gtid_executed, &r_status.gtid_executed);
        if !errant.is_empty() {
            report.warn(format!(
                "Cluster '{}' has transactions missing from '{}' ({}) and will be INVALIDATED",
                other.name, target.name, errant
            ));
            invalidate.push(other.id.clone());
            continue;
        }
        repoint.push((other.clone(), address, channel_user(other, &status)));
    }
    if options.dry_run {
        return Ok(report);
    }

    let client = session.client();
    let channels = ChannelManager::new(client);
    channels.teardown(&r_addr)?;
    client.apply_control(&r_addr, ControlCommand::SetSuperReadOnly { enabled: false })?;
    crate::record_failover!("clusterset_force_primary");

    for (other, address, user) in &repoint {
        let result = channels
            .provision_account(&r_addr, user)
            .and_then(|c| channels.establish(address, &r_addr, c));
        if !report.best_effort(&format!("re-point cluster '{}'", other.name), result) {
            invalidate.push(other.id.clone());
        }
    }

    let cs_id = cs.id().clone();
    let (old_id, target_id) = (old.id.clone(), target.id.clone());
    report.view_id = Some(commit_change(
        session,
        &cs.topology(),
        ViewChangeReason::ForcePrimaryCluster,
        &format!("failover from '{}' to '{}'", old.name, target.name),
        |schema| {
            schema.clusterset_mut(&cs_id)?.primary_cluster = target_id.clone();
            let demoted = membership_mut(schema, &old_id)?;
            demoted.role = ClusterRole::Replica;
            demoted.invalidated = true;
            let promoted = membership_mut(schema, &target_id)?;
            promoted.role = ClusterRole::Primary;
            promoted.invalidated = false;
            for id in &invalidate {
                membership_mut(schema, id)?.invalidated = true;
            }
            Ok(())
        },
    )?);
    report.note(format!("Cluster '{}' is the new PRIMARY cluster", target.name));
    Ok(report)
}

// ═══════════════════════════════════════════════════════════════════
// rejoinCluster
// ═══════════════════════════════════════════════════════════════════

pub(crate) fn rejoin_cluster(cs: &ClusterSet, name: &str, options: &RejoinClusterOptions) -> Result<OperationReport> {
    let session = cs.session();
    let (cs_record, clusters) = cs.load()?;
    let target = ClusterSet::find_cluster(&clusters, name)?.clone();
    if target.id == cs_record.primary_cluster {
        return Err(TopologyError::InvalidState(format!(
            "Cluster '{}' is the PRIMARY cluster and can not be rejoined",
            target.name
        )));
    }
    let primary_record = primary_cluster(&cs_record, &clusters)?.clone();
    let _locks = cs.lock_for("rejoinCluster", &[&target])?;

    let p_snap = session.refresh_cluster(&primary_record.id)?;
    p_snap.require_quorum("rejoinCluster")?;
    let (p_addr, p_status) = primary_endpoint(&p_snap)?;
    let r_snap = session.refresh_cluster(&target.id)?;
    let (r_addr, r_status) = primary_endpoint(&r_snap)?;

    let replicating_from_primary = r_status
        .channel(CLUSTERSET_CHANNEL)
        .map(|c| c.source == p_addr)
        .unwrap_or(false);
    if !target.is_invalidated()
        && replicating_from_primary
        && channel_health(Some(&r_status), false) == ChannelHealth::Ok
    {
        return Err(TopologyError::InvalidState(format!(
            "Cluster '{}' is already replicating from the PRIMARY cluster '{}'",
            target.name, primary_record.name
        )));
    }

    let errant = errant_against(&target, &r_status.gtid_executed, &p_status.gtid_executed);
    if !errant.is_empty() {
        return Err(TopologyError::RecoveryStateError(format!(
            "Cluster '{}' has errant transactions that do not exist in the PRIMARY cluster '{}': {}; \
             inject empty transactions for them on the PRIMARY cluster or remove and re-create the cluster",
            target.name, primary_record.name, errant
        )));
    }
    let gap = purged_gap(&p_status.gtid_purged, &r_status.gtid_executed);
    if !gap.is_empty() {
        return Err(TopologyError::RecoveryStateError(format!(
            "Cluster '{}' is missing transactions already purged from the PRIMARY cluster '{}': {}; \
             remove and re-create the cluster",
            target.name, primary_record.name, gap
        )));
    }

    let mut report = OperationReport::new("rejoinCluster", &target.name, options.dry_run);
    report.note(format!(
        "Cluster '{}' will replicate from {} ({})",
        target.name, p_addr, primary_record.name
    ));
    if options.dry_run {
        return Ok(report);
    }

    let client = session.client();
    let channels = ChannelManager::new(client);
    let user = channel_user(&target, &r_status);
    client.apply_control(&r_addr, ControlCommand::SetSuperReadOnly { enabled: true })?;
    let credentials = channels.provision_account(&p_addr, &user)?;
    channels.establish(&r_addr, &p_addr, credentials)?;
    if let Err(e) = sync_with(session, &r_addr, &p_addr) {
        report.best_effort("rollback (remove ClusterSet channel)", channels.teardown(&r_addr));
        return Err(e);
    }

    let target_id = target.id.clone();
    report.view_id = Some(commit_change(
        session,
        &target.topology(),
        ViewChangeReason::RejoinCluster,
        &format!("rejoined from {}", p_addr),
        |schema| {
            let membership = membership_mut(schema, &target_id)?;
            membership.role = ClusterRole::Replica;
            membership.invalidated = false;
            membership.replication_user = Some(user.clone());
            Ok(())
        },
    )?);
    report.note(format!("Cluster '{}' rejoined the ClusterSet", target.name));
    Ok(report)
}
