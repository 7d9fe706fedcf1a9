//! 实例状态分类
//!
//! 每次变更操作之前都基于最新探测结果重新分类，过期的分类结果不能驱动决策。

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::probe::{ChannelState, GroupMemberState, GroupView, InstanceAddress, InstanceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "RECOVERING")]
    Recovering,
    #[serde(rename = "OFFLINE")]
    Offline,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "UNREACHABLE")]
    Unreachable,
    #[serde(rename = "(MISSING)")]
    Missing,
    #[serde(rename = "INVALIDATED")]
    Invalidated,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Online => "ONLINE",
            InstanceState::Recovering => "RECOVERING",
            InstanceState::Offline => "OFFLINE",
            InstanceState::Error => "ERROR",
            InstanceState::Unreachable => "UNREACHABLE",
            InstanceState::Missing => "(MISSING)",
            InstanceState::Invalidated => "INVALIDATED",
        };
        f.write_str(s)
    }
}

impl InstanceState {
    pub fn is_reachable(&self) -> bool {
        !matches!(self, InstanceState::Unreachable | InstanceState::Missing)
    }
}

/// 记录实例首次探测失败的时间
#[derive(Debug, Default)]
pub struct UnreachableTracker {
    since: DashMap<InstanceAddress, Instant>,
}

impl UnreachableTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 更新一次探测结果；不可达时返回已持续的时长
    pub fn observe(&self, address: &InstanceAddress, reachable: bool) -> Option<Duration> {
        if reachable {
            self.since.remove(address);
            return None;
        }
        let since = *self
            .since
            .entry(address.clone())
            .or_insert_with(Instant::now);
        Some(since.elapsed())
    }
}

/// 组复制成员的分类输入
#[derive(Debug, Clone, Copy)]
pub struct GroupObservation<'a> {
    pub address: &'a InstanceAddress,
    /// 元数据中记录的组名
    pub expected_group: &'a str,
    pub invalidated: bool,
    /// 探测结果，不可达时为 None
    pub status: Option<&'a InstanceStatus>,
    /// 从健康成员读取到的权威视图
    pub view: Option<&'a GroupView>,
    pub unreachable_for: Option<Duration>,
    pub failure_window: Duration,
}

pub fn classify_group_member(obs: &GroupObservation<'_>) -> InstanceState {
    if obs.invalidated {
        return InstanceState::Invalidated;
    }

    match obs.status {
        Some(status) => match &status.group {
            Some(group) if !group.group_name.eq_ignore_ascii_case(obs.expected_group) => {
                InstanceState::Invalidated
            }
            Some(_) => match status.member_state {
                GroupMemberState::Online => InstanceState::Online,
                GroupMemberState::Recovering => InstanceState::Recovering,
                GroupMemberState::Error => InstanceState::Error,
                GroupMemberState::Offline => InstanceState::Offline,
                GroupMemberState::Unreachable => InstanceState::Unreachable,
            },
            None => match status.member_state {
                GroupMemberState::Error => InstanceState::Error,
                _ => InstanceState::Offline,
            },
        },
        None => {
            let in_view = obs
                .view
                .and_then(|v| v.member(obs.address))
                .is_some();
            if in_view {
                return InstanceState::Unreachable;
            }
            // 已离开组且超过故障检测窗口
            match obs.unreachable_for {
                Some(elapsed) if elapsed >= obs.failure_window => InstanceState::Missing,
                _ => InstanceState::Unreachable,
            }
        }
    }
}

/// 异步复制成员（ReplicaSet 成员、只读副本）的分类输入
#[derive(Debug, Clone, Copy)]
pub struct AsyncObservation<'a> {
    pub invalidated: bool,
    pub is_primary: bool,
    pub status: Option<&'a InstanceStatus>,
    pub channel: &'a str,
    /// 该成员应当复制的源，None 表示未知
    pub expected_source: Option<&'a InstanceAddress>,
    pub unreachable_for: Option<Duration>,
    pub failure_window: Duration,
}

pub fn classify_async_member(obs: &AsyncObservation<'_>) -> InstanceState {
    if obs.invalidated {
        return InstanceState::Invalidated;
    }
    let Some(status) = obs.status else {
        return match obs.unreachable_for {
            Some(elapsed) if elapsed >= obs.failure_window => InstanceState::Missing,
            _ => InstanceState::Unreachable,
        };
    };

    if obs.is_primary {
        // 主节点不应再从别处复制
        return match status.channel(obs.channel) {
            Some(c) if c.state != ChannelState::Off => InstanceState::Error,
            _ => InstanceState::Online,
        };
    }

    match status.channel(obs.channel) {
        None => InstanceState::Offline,
        Some(channel) => match channel.state {
            ChannelState::Off => InstanceState::Offline,
            ChannelState::Error => InstanceState::Error,
            ChannelState::Connecting => InstanceState::Error,
            ChannelState::On => match obs.expected_source {
                Some(source) if source != &channel.source => InstanceState::Error,
                _ => InstanceState::Online,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtid::GtidSet;
    use crate::probe::{ChannelStatus, GroupMember, MemberRole, ServerVersion, ThreadState};
    use std::collections::BTreeMap;

    const GROUP: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";

    fn addr(s: &str) -> InstanceAddress {
        s.parse().unwrap()
    }

    fn status(address: &str, group: Option<&str>, state: GroupMemberState) -> InstanceStatus {
        InstanceStatus {
            address: addr(address),
            server_uuid: "uuid".to_string(),
            server_id: 11,
            version: ServerVersion::new(8, 0, 35),
            gtid_executed: GtidSet::new(),
            gtid_purged: GtidSet::new(),
            group: group.map(|g| GroupView {
                group_name: g.to_string(),
                view_change_uuid: None,
                view_id: "1:1".to_string(),
                single_primary: true,
                members: vec![],
            }),
            member_state: state,
            last_group_name: None,
            channels: vec![],
            super_read_only: false,
            variables: BTreeMap::new(),
        }
    }

    fn obs<'a>(
        address: &'a InstanceAddress,
        status: Option<&'a InstanceStatus>,
        view: Option<&'a GroupView>,
        unreachable_for: Option<Duration>,
    ) -> GroupObservation<'a> {
        GroupObservation {
            address,
            expected_group: GROUP,
            invalidated: false,
            status,
            view,
            unreachable_for,
            failure_window: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_reachable_member_states() {
        let a = addr("a:3306");
        let online = status("a:3306", Some(GROUP), GroupMemberState::Online);
        assert_eq!(classify_group_member(&obs(&a, Some(&online), None, None)), InstanceState::Online);

        let offline = status("a:3306", None, GroupMemberState::Offline);
        assert_eq!(classify_group_member(&obs(&a, Some(&offline), None, None)), InstanceState::Offline);

        let other = status("a:3306", Some("11111111-2222-3333-4444-555555555555"), GroupMemberState::Online);
        assert_eq!(
            classify_group_member(&obs(&a, Some(&other), None, None)),
            InstanceState::Invalidated
        );
    }

    #[test]
    fn test_unreachable_transitions_to_missing() {
        let a = addr("a:3306");
        let view = GroupView {
            group_name: GROUP.to_string(),
            view_change_uuid: None,
            view_id: "1:3".to_string(),
            single_primary: true,
            members: vec![GroupMember {
                address: a.clone(),
                server_uuid: "uuid".to_string(),
                state: GroupMemberState::Unreachable,
                role: MemberRole::Secondary,
            }],
        };
        // 仍在视图中：UNREACHABLE
        assert_eq!(
            classify_group_member(&obs(&a, None, Some(&view), Some(Duration::from_secs(60)))),
            InstanceState::Unreachable
        );
        // 已被驱逐，但未超过检测窗口
        assert_eq!(
            classify_group_member(&obs(&a, None, None, Some(Duration::from_secs(1)))),
            InstanceState::Unreachable
        );
        // 超过检测窗口
        assert_eq!(
            classify_group_member(&obs(&a, None, None, Some(Duration::from_secs(6)))),
            InstanceState::Missing
        );
    }

    #[test]
    fn test_invalidated_flag_wins() {
        let a = addr("a:3306");
        let online = status("a:3306", Some(GROUP), GroupMemberState::Online);
        let mut o = obs(&a, Some(&online), None, None);
        o.invalidated = true;
        assert_eq!(classify_group_member(&o), InstanceState::Invalidated);
    }

    #[test]
    fn test_async_member_classification() {
        let primary = addr("p:3306");
        let mut s = status("s:3306", None, GroupMemberState::Offline);
        let o = |st: &InstanceStatus| {
            classify_async_member(&AsyncObservation {
                invalidated: false,
                is_primary: false,
                status: Some(st),
                channel: "",
                expected_source: Some(&primary),
                unreachable_for: None,
                failure_window: Duration::from_secs(5),
            })
        };
        assert_eq!(o(&s), InstanceState::Offline);

        s.channels.push(ChannelStatus {
            name: String::new(),
            source: primary.clone(),
            state: ChannelState::On,
            receiver: ThreadState::On,
            applier: ThreadState::On,
            delay: 0,
            last_error: None,
            user: "repl".to_string(),
            managed: false,
            received_gtid_set: GtidSet::new(),
        });
        assert_eq!(o(&s), InstanceState::Online);

        s.channels[0].source = addr("other:3306");
        assert_eq!(o(&s), InstanceState::Error);
    }

    #[test]
    fn test_tracker_measures_outage() {
        let tracker = UnreachableTracker::new();
        let a = addr("a:3306");
        assert!(tracker.observe(&a, false).is_some());
        assert!(tracker.observe(&a, true).is_none());
        assert!(tracker.observe(&a, false).unwrap() < Duration::from_secs(1));
    }
}
