//! ClusterSet 状态

use serde::Serialize;
use std::collections::BTreeMap;

use super::channel::{channel_health, ChannelHealth, CLUSTERSET_CHANNEL};
use super::ClusterSet;
use crate::gtid::{errant, GtidSet};
use crate::metadata::{ClusterRecord, ClusterRole};
use crate::mutator::cluster::describe_cluster;
use crate::mutator::ClusterHealth;
use crate::{Result, TopologyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterSetHealth {
    /// 所有 Cluster 可用、通道正常且事务一致
    Healthy,
    /// 主 Cluster 可用，但有副本存在问题
    Available,
    Unavailable,
}

/// 单个 Cluster 在 ClusterSet 中的全局状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterGlobalStatus {
    Ok,
    OkNotReplicating,
    OkNotConsistent,
    OkMisconfigured,
    NotOk,
    Invalidated,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberClusterStatus {
    pub name: String,
    pub role: ClusterRole,
    pub global_status: ClusterGlobalStatus,
    pub cluster_status: ClusterHealth,
    pub primary: Option<String>,
    /// 仅副本 Cluster
    pub channel: Option<ChannelHealth>,
    pub channel_source: Option<String>,
    /// 主 Cluster 中不存在的事务
    pub errant_gtids: Option<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSetStatus {
    pub domain: String,
    pub status: ClusterSetHealth,
    pub status_text: String,
    pub primary_cluster: String,
    pub view_id: u64,
    pub clusters: BTreeMap<String, MemberClusterStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DescribedCluster {
    pub name: String,
    pub role: ClusterRole,
    pub invalidated: bool,
    pub instances: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSetDescription {
    pub domain: String,
    pub primary_cluster: String,
    pub view_id: u64,
    pub clusters: Vec<DescribedCluster>,
}

/// 副本相对主 Cluster 的多余事务；副本自身的视图变更事件不计入
pub(crate) fn errant_against(record: &ClusterRecord, replica: &GtidSet, primary: &GtidSet) -> GtidSet {
    let own = record
        .view_change_uuid
        .as_deref()
        .unwrap_or(record.group_name.as_str());
    errant(&replica.without_uuid(own), primary)
}

fn is_available(health: ClusterHealth) -> bool {
    matches!(
        health,
        ClusterHealth::Ok | ClusterHealth::OkPartial | ClusterHealth::OkNoTolerance
    )
}

pub(crate) fn cluster_set_status(cs: &ClusterSet) -> Result<ClusterSetStatus> {
    let session = cs.session();
    let (record, clusters) = cs.load()?;
    let primary_record = clusters
        .iter()
        .find(|c| c.id == record.primary_cluster)
        .ok_or_else(|| {
            TopologyError::MetadataConsistency(format!(
                "ClusterSet '{}' has no record of its PRIMARY cluster",
                record.domain_name
            ))
        })?;

    let p_snap = session.refresh_cluster(&primary_record.id)?;
    let p_primary = p_snap.primary_member().filter(|m| m.is_reachable());
    let p_exec = p_primary.and_then(|m| m.gtid_executed()).cloned();
    let p_addr = p_primary.map(|m| m.address().clone());
    let primary_ok = p_snap.quorum.has_quorum && p_addr.is_some();

    let mut out = BTreeMap::new();
    let mut all_ok = primary_ok;
    for cluster in &clusters {
        let is_primary = cluster.id == primary_record.id;
        let snap = if is_primary {
            p_snap.clone()
        } else {
            session.refresh_cluster(&cluster.id)?
        };
        let described = describe_cluster(&snap);
        let primary_status = snap.primary_member().and_then(|m| m.status.as_ref());
        let invalidated = cluster.is_invalidated();
        let mut errors = described.errors.clone();

        let (channel, channel_source) = if is_primary {
            (None, None)
        } else {
            let health = channel_health(primary_status, invalidated);
            let source = primary_status
                .and_then(|s| s.channel(CLUSTERSET_CHANNEL))
                .map(|c| c.source.clone());
            (Some(health), source)
        };
        let misconfigured = match (&channel_source, &p_addr) {
            (Some(source), Some(expected)) if !invalidated && source != expected => {
                errors.push(format!(
                    "ClusterSet channel replicates from {} instead of the PRIMARY cluster's primary {}",
                    source, expected
                ));
                true
            }
            _ => false,
        };
        let errant_gtids = match (is_primary, primary_status, &p_exec) {
            (false, Some(status), Some(reference)) => {
                let extra = errant_against(cluster, &status.gtid_executed, reference);
                if extra.is_empty() {
                    None
                } else {
                    errors.push(format!("Errant transactions detected: {}", extra));
                    Some(extra.to_string())
                }
            }
            _ => None,
        };

        let global_status = if invalidated {
            ClusterGlobalStatus::Invalidated
        } else if !is_available(described.status) {
            ClusterGlobalStatus::NotOk
        } else if errant_gtids.is_some() {
            ClusterGlobalStatus::OkNotConsistent
        } else if misconfigured {
            ClusterGlobalStatus::OkMisconfigured
        } else if channel.map(|h| h != ChannelHealth::Ok).unwrap_or(false) {
            ClusterGlobalStatus::OkNotReplicating
        } else {
            ClusterGlobalStatus::Ok
        };
        all_ok &= global_status == ClusterGlobalStatus::Ok;

        out.insert(
            cluster.name.clone(),
            MemberClusterStatus {
                name: cluster.name.clone(),
                role: cluster.clusterset_role().unwrap_or(ClusterRole::Replica),
                global_status,
                cluster_status: described.status,
                primary: described.primary.clone(),
                channel,
                channel_source: channel_source.map(|s| s.to_string()),
                errant_gtids,
                errors,
            },
        );
    }

    let (status, status_text) = if !primary_ok {
        (
            ClusterSetHealth::Unavailable,
            format!("PRIMARY cluster '{}' is not available", primary_record.name),
        )
    } else if all_ok {
        (ClusterSetHealth::Healthy, "All Clusters available".to_string())
    } else {
        (
            ClusterSetHealth::Available,
            "PRIMARY cluster is available, but one or more replica clusters need attention".to_string(),
        )
    };
    crate::record_clusterset_view!(record.domain_name.as_str(), record.view_id);

    Ok(ClusterSetStatus {
        domain: record.domain_name.clone(),
        status,
        status_text,
        primary_cluster: primary_record.name.clone(),
        view_id: record.view_id,
        clusters: out,
    })
}

pub(crate) fn describe(cs: &ClusterSet) -> Result<ClusterSetDescription> {
    cs.session().store().read(|schema| {
        let record = schema.clusterset(cs.id())?;
        let primary_cluster = schema.cluster(&record.primary_cluster)?.name.clone();
        let clusters = schema
            .clusters_in_set(cs.id())
            .into_iter()
            .map(|c| DescribedCluster {
                name: c.name.clone(),
                role: c.clusterset_role().unwrap_or(ClusterRole::Replica),
                invalidated: c.is_invalidated(),
                instances: schema
                    .instances_of(&c.topology())
                    .into_iter()
                    .map(|i| i.address.to_string())
                    .collect(),
            })
            .collect();
        Ok(ClusterSetDescription {
            domain: record.domain_name.clone(),
            primary_cluster,
            view_id: record.view_id,
            clusters,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ClusterId;

    fn record(vcu: &str) -> ClusterRecord {
        ClusterRecord {
            id: ClusterId::generate(),
            name: "r1".to_string(),
            group_name: "11111111-1111-1111-1111-111111111111".to_string(),
            view_change_uuid: Some(vcu.to_string()),
            single_primary: true,
            created_at: chrono::Utc::now(),
            view_id: 0,
            disable_clone: false,
            gtid_set_complete: false,
            options: BTreeMap::new(),
            tags: BTreeMap::new(),
            attributes: BTreeMap::new(),
            clusterset: None,
        }
    }

    #[test]
    fn test_own_view_changes_are_not_errant() {
        let vcu = "22222222-2222-2222-2222-222222222222";
        let primary = GtidSet::parse("aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa:1-10").unwrap();
        let replica = GtidSet::parse(&format!(
            "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa:1-8,{}:1-3",
            vcu
        ))
        .unwrap();
        assert!(errant_against(&record(vcu), &replica, &primary).is_empty());

        let diverged = GtidSet::parse(&format!(
            "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa:1-8,{}:1-3,bbbbbbbb-bbbb-bbbb-bbbb-bbbbbbbbbbbb:1-2",
            vcu
        ))
        .unwrap();
        let extra = errant_against(&record(vcu), &diverged, &primary);
        assert_eq!(extra.count(), 2);
    }
}
