//! 拓扑快照
//!
//! 每次操作从元数据读取拓扑，再逐个探测成员，得到一次性的快照。
//! Cluster 与 ReplicaSet 共享 [`TopologySnapshot`] 上的自由函数。

use std::time::Duration;

use super::quorum::QuorumStatus;
use super::state::{
    classify_async_member, classify_group_member, AsyncObservation, GroupObservation,
    InstanceState, UnreachableTracker,
};
use super::{ASYNC_CHANNEL, READ_REPLICA_CHANNEL};
use crate::gtid::GtidSet;
use crate::metadata::{
    ClusterId, ClusterRecord, InstanceRecord, InstanceRole, MetadataSchema, ReplicaSetId,
    ReplicaSetRecord, ReplicationSources, TopologyRef,
};
use crate::probe::{GroupMemberState, GroupView, InstanceAddress, InstanceStatus, MemberRole, NodeClient};
use crate::{Result, TopologyError};

/// 探测所需的上下文
#[derive(Clone, Copy)]
pub struct ProbeContext<'a> {
    pub client: &'a dyn NodeClient,
    pub tracker: &'a UnreachableTracker,
    pub failure_window: Duration,
}

/// 单个实例的探测结果
#[derive(Debug, Clone)]
pub struct Probe {
    pub status: Option<InstanceStatus>,
    pub error: Option<String>,
    pub unreachable_for: Option<Duration>,
}

impl ProbeContext<'_> {
    pub fn probe(&self, address: &InstanceAddress) -> Probe {
        match self.client.get_status(address) {
            Ok(status) => {
                self.tracker.observe(address, true);
                Probe {
                    status: Some(status),
                    error: None,
                    unreachable_for: None,
                }
            }
            Err(e) => {
                log::debug!("[{}] Probe failed: {}", address, e);
                Probe {
                    status: None,
                    error: Some(e.to_string()),
                    unreachable_for: self.tracker.observe(address, false),
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// 成员快照
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct MemberSnapshot {
    pub record: InstanceRecord,
    pub status: Option<InstanceStatus>,
    /// 探测失败原因
    pub error: Option<String>,
    pub state: InstanceState,
    pub role: Option<MemberRole>,
}

impl MemberSnapshot {
    pub fn address(&self) -> &InstanceAddress {
        &self.record.address
    }

    pub fn is_online(&self) -> bool {
        self.state == InstanceState::Online
    }

    pub fn is_reachable(&self) -> bool {
        self.status.is_some()
    }

    /// 探测到的状态；不可达时返回 Unreachable 错误
    pub fn require_status(&self) -> Result<&InstanceStatus> {
        self.status.as_ref().ok_or_else(|| {
            TopologyError::unreachable(
                self.address(),
                self.error.clone().unwrap_or_else(|| "no status available".to_string()),
            )
        })
    }

    pub fn gtid_executed(&self) -> Option<&GtidSet> {
        self.status.as_ref().map(|s| &s.gtid_executed)
    }

    /// 实例实际身份与元数据记录不一致
    fn identity_error(&self) -> Option<String> {
        let status = self.status.as_ref()?;
        if !status.server_uuid.eq_ignore_ascii_case(&self.record.server_uuid) {
            return Some(format!(
                "Instance {} reports server_uuid {} but the metadata records {}; the instance may have been re-provisioned or a split-brain occurred",
                self.address(),
                status.server_uuid,
                self.record.server_uuid
            ));
        }
        None
    }
}

// ═══════════════════════════════════════════════════════════════════
// Cluster
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub record: ClusterRecord,
    pub members: Vec<MemberSnapshot>,
    pub read_replicas: Vec<MemberSnapshot>,
    /// 从 ONLINE 成员读取到的权威组视图
    pub view: Option<GroupView>,
    pub quorum: QuorumStatus,
    pub primary: Option<InstanceAddress>,
    /// 身份或组名不一致（不可绕过）
    pub consistency_errors: Vec<String>,
}

impl ClusterSnapshot {
    pub fn topology(&self) -> TopologyRef {
        self.record.topology()
    }

    pub fn member(&self, address: &InstanceAddress) -> Option<&MemberSnapshot> {
        self.members
            .iter()
            .chain(self.read_replicas.iter())
            .find(|m| m.address() == address)
    }

    pub fn primary_member(&self) -> Option<&MemberSnapshot> {
        let primary = self.primary.as_ref()?;
        self.members.iter().find(|m| m.address() == primary)
    }

    /// 主节点快照；没有 ONLINE 主节点时报仲裁错误
    pub fn require_primary(&self) -> Result<&MemberSnapshot> {
        self.primary_member().ok_or_else(|| {
            TopologyError::QuorumError(format!(
                "Cluster '{}' has no ONLINE primary",
                self.record.name
            ))
        })
    }

    pub fn require_quorum(&self, operation: &str) -> Result<()> {
        self.quorum.require(operation, &self.record.name)
    }

    pub fn online_members(&self) -> impl Iterator<Item = &MemberSnapshot> {
        self.members.iter().filter(|m| m.is_online())
    }
}

pub fn refresh_cluster(
    ctx: &ProbeContext<'_>,
    schema: &MetadataSchema,
    id: &ClusterId,
) -> Result<ClusterSnapshot> {
    let record = schema.cluster(id)?.clone();
    let records = schema.instances_of(&record.topology());

    let probes: Vec<(InstanceRecord, Probe)> = records
        .into_iter()
        .map(|r| (r.clone(), ctx.probe(&r.address)))
        .collect();

    // 取 ONLINE 成员最多的视图
    let view = probes
        .iter()
        .filter(|(r, _)| r.role == InstanceRole::Member)
        .filter_map(|(_, p)| p.status.as_ref())
        .filter(|s| s.member_state == GroupMemberState::Online)
        .filter_map(|s| s.group.as_ref())
        .filter(|g| g.group_name.eq_ignore_ascii_case(&record.group_name))
        .max_by_key(|g| g.online_count())
        .cloned();

    let member_count = probes
        .iter()
        .filter(|(r, _)| r.role == InstanceRole::Member)
        .count();
    let quorum = match &view {
        Some(v) => QuorumStatus::evaluate(v.members.len(), v.online_count()),
        None => QuorumStatus::evaluate(member_count, 0),
    };
    let primary = view.as_ref().and_then(|v| v.primary()).map(|m| m.address.clone());
    let invalidated = record.is_invalidated();

    let mut members = Vec::new();
    let mut read_replicas = Vec::new();
    let mut consistency_errors = Vec::new();

    for (rec, probe) in probes {
        let state = match rec.role {
            InstanceRole::Member => classify_group_member(&GroupObservation {
                address: &rec.address,
                expected_group: &record.group_name,
                invalidated: invalidated || rec.invalidated,
                status: probe.status.as_ref(),
                view: view.as_ref(),
                unreachable_for: probe.unreachable_for,
                failure_window: ctx.failure_window,
            }),
            InstanceRole::ReadReplica => {
                let expected = match &rec.sources {
                    Some(ReplicationSources::Custom(_)) => None,
                    _ => primary.as_ref(),
                };
                classify_async_member(&AsyncObservation {
                    invalidated: invalidated || rec.invalidated,
                    is_primary: false,
                    status: probe.status.as_ref(),
                    channel: READ_REPLICA_CHANNEL,
                    expected_source: expected,
                    unreachable_for: probe.unreachable_for,
                    failure_window: ctx.failure_window,
                })
            }
        };

        if let Some(group) = probe.status.as_ref().and_then(|s| s.group.as_ref()) {
            if !group.group_name.eq_ignore_ascii_case(&record.group_name) {
                consistency_errors.push(format!(
                    "Instance {} belongs to group {} but cluster '{}' uses group {}",
                    rec.address, group.group_name, record.name, record.group_name
                ));
            }
        }

        let role = match rec.role {
            InstanceRole::Member if state == InstanceState::Online => view
                .as_ref()
                .and_then(|v| v.member(&rec.address))
                .map(|m| m.role),
            _ => None,
        };

        let snapshot = MemberSnapshot {
            record: rec,
            status: probe.status,
            error: probe.error,
            state,
            role,
        };
        if let Some(e) = snapshot.identity_error() {
            consistency_errors.push(e);
        }
        match snapshot.record.role {
            InstanceRole::Member => members.push(snapshot),
            InstanceRole::ReadReplica => read_replicas.push(snapshot),
        }
    }

    Ok(ClusterSnapshot {
        record,
        members,
        read_replicas,
        view,
        quorum,
        primary,
        consistency_errors,
    })
}

// ═══════════════════════════════════════════════════════════════════
// ReplicaSet
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ReplicaSetSnapshot {
    pub record: ReplicaSetRecord,
    pub members: Vec<MemberSnapshot>,
    /// 元数据记录的主节点
    pub primary: Option<InstanceAddress>,
    pub consistency_errors: Vec<String>,
}

impl ReplicaSetSnapshot {
    pub fn topology(&self) -> TopologyRef {
        self.record.topology()
    }

    pub fn member(&self, address: &InstanceAddress) -> Option<&MemberSnapshot> {
        self.members.iter().find(|m| m.address() == address)
    }

    pub fn primary_member(&self) -> Option<&MemberSnapshot> {
        let primary = self.primary.as_ref()?;
        self.member(primary)
    }

    /// 可达的主节点
    pub fn require_primary(&self) -> Result<&MemberSnapshot> {
        let primary = self.primary_member().ok_or_else(|| {
            TopologyError::InvalidState(format!(
                "ReplicaSet '{}' has no primary recorded in the metadata",
                self.record.name
            ))
        })?;
        primary.require_status()?;
        Ok(primary)
    }

    pub fn secondaries(&self) -> impl Iterator<Item = &MemberSnapshot> {
        let primary = self.primary.clone();
        self.members
            .iter()
            .filter(move |m| Some(m.address()) != primary.as_ref())
    }
}

pub fn refresh_replica_set(
    ctx: &ProbeContext<'_>,
    schema: &MetadataSchema,
    id: &ReplicaSetId,
) -> Result<ReplicaSetSnapshot> {
    let record = schema.replicaset(id)?.clone();
    let primary = match &record.primary {
        Some(pid) => Some(schema.instance(pid)?.address.clone()),
        None => None,
    };

    let mut members = Vec::new();
    let mut consistency_errors = Vec::new();
    for rec in schema.instances_of(&record.topology()) {
        let probe = ctx.probe(&rec.address);
        let is_primary = Some(&rec.address) == primary.as_ref();
        let state = classify_async_member(&AsyncObservation {
            invalidated: rec.invalidated,
            is_primary,
            status: probe.status.as_ref(),
            channel: ASYNC_CHANNEL,
            expected_source: primary.as_ref(),
            unreachable_for: probe.unreachable_for,
            failure_window: ctx.failure_window,
        });
        let role = match state {
            InstanceState::Online if is_primary => Some(MemberRole::Primary),
            InstanceState::Online => Some(MemberRole::Secondary),
            _ => None,
        };
        let snapshot = MemberSnapshot {
            record: rec.clone(),
            status: probe.status,
            error: probe.error,
            state,
            role,
        };
        if let Some(e) = snapshot.identity_error() {
            consistency_errors.push(e);
        }
        members.push(snapshot);
    }

    Ok(ReplicaSetSnapshot {
        record,
        members,
        primary,
        consistency_errors,
    })
}

// ═══════════════════════════════════════════════════════════════════
// 通用快照
// ═══════════════════════════════════════════════════════════════════

/// 拓扑种类上的闭合和类型
#[derive(Debug, Clone)]
pub enum TopologySnapshot {
    Cluster(ClusterSnapshot),
    ReplicaSet(ReplicaSetSnapshot),
}

impl TopologySnapshot {
    pub fn topology(&self) -> TopologyRef {
        match self {
            TopologySnapshot::Cluster(c) => c.topology(),
            TopologySnapshot::ReplicaSet(r) => r.topology(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TopologySnapshot::Cluster(c) => &c.record.name,
            TopologySnapshot::ReplicaSet(r) => &r.record.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TopologySnapshot::Cluster(_) => "Cluster",
            TopologySnapshot::ReplicaSet(_) => "ReplicaSet",
        }
    }

    pub fn primary(&self) -> Option<&InstanceAddress> {
        match self {
            TopologySnapshot::Cluster(c) => c.primary.as_ref(),
            TopologySnapshot::ReplicaSet(r) => r.primary.as_ref(),
        }
    }

    pub fn consistency_errors(&self) -> &[String] {
        match self {
            TopologySnapshot::Cluster(c) => &c.consistency_errors,
            TopologySnapshot::ReplicaSet(r) => &r.consistency_errors,
        }
    }

    pub fn members(&self) -> Box<dyn Iterator<Item = &MemberSnapshot> + '_> {
        match self {
            TopologySnapshot::Cluster(c) => Box::new(c.members.iter().chain(c.read_replicas.iter())),
            TopologySnapshot::ReplicaSet(r) => Box::new(r.members.iter()),
        }
    }
}

pub fn find_member<'a>(
    snapshot: &'a TopologySnapshot,
    address: &InstanceAddress,
) -> Result<&'a MemberSnapshot> {
    snapshot
        .members()
        .find(|m| m.address() == address)
        .ok_or_else(|| {
            TopologyError::NotFound(format!(
                "The instance '{}' does not belong to the {} '{}'",
                address,
                snapshot.kind(),
                snapshot.name()
            ))
        })
}

/// 任何身份不一致都终止操作
pub fn ensure_consistent(snapshot: &TopologySnapshot) -> Result<()> {
    match snapshot.consistency_errors().first() {
        Some(e) => Err(TopologyError::MetadataConsistency(e.clone())),
        None => Ok(()),
    }
}

/// 只检查单个成员
pub fn ensure_member_consistent(snapshot: &TopologySnapshot, address: &InstanceAddress) -> Result<()> {
    let member = find_member(snapshot, address)?;
    match member.identity_error() {
        Some(e) => Err(TopologyError::MetadataConsistency(e)),
        None => Ok(()),
    }
}

pub fn unreachable_members(snapshot: &TopologySnapshot) -> Vec<&MemberSnapshot> {
    snapshot.members().filter(|m| !m.is_reachable()).collect()
}
