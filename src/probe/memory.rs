//! 内存节点集群
//!
//! 实现 [`NodeClient`]，在进程内模拟一组数据库节点：组复制（自动选主、
//! 多数派、驱逐失联成员）、异步复制通道（账号校验、purged 检查、随主迁移）
//! 以及故障注入。用于测试与演示。

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

use super::node::*;
use crate::gtid::GtidSet;
use crate::recovery::RecoveryMethod;
use crate::{Result, TopologyError};

const MAX_PROPAGATION_ROUNDS: usize = 32;

struct MemoryChannel {
    source: InstanceAddress,
    /// 配置时源节点所在的组（managed 通道据此跟随组主节点）
    source_group: Option<String>,
    credentials: ReplicationCredentials,
    delay: u32,
    running: bool,
    managed: bool,
    state: ChannelState,
    last_error: Option<ChannelError>,
    /// relay log：已接收的事务
    received: GtidSet,
}

struct MemoryNode {
    server_uuid: String,
    server_id: u32,
    version: ServerVersion,
    reachable: bool,
    gtid_executed: GtidSet,
    gtid_purged: GtidSet,
    group: Option<String>,
    member_state: GroupMemberState,
    last_group_name: Option<String>,
    channels: BTreeMap<String, MemoryChannel>,
    accounts: BTreeMap<String, String>,
    super_read_only: bool,
    variables: BTreeMap<String, String>,
    applier_stalled: bool,
    lock_owner: Option<String>,
}

struct MemoryGroup {
    view_change_uuid: Option<String>,
    single_primary: bool,
    /// 组视图中的成员（按加入顺序）
    members: Vec<InstanceAddress>,
    primary: Option<InstanceAddress>,
    view_seq: u64,
}

#[derive(Default)]
struct FleetState {
    nodes: BTreeMap<InstanceAddress, MemoryNode>,
    groups: BTreeMap<String, MemoryGroup>,
    next_server_id: u32,
}

/// 内存节点集群
#[derive(Default)]
pub struct MemoryFleet {
    state: Mutex<FleetState>,
}

impl MemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    // ═══════════════════════════════════════════════════════════════════
    // 节点管理与故障注入
    // ═══════════════════════════════════════════════════════════════════

    /// 添加一个配置正确的独立节点
    pub fn add_node(&self, address: &str) -> InstanceAddress {
        self.add_node_with_version(address, ServerVersion::new(8, 0, 35))
    }

    pub fn add_node_with_version(&self, address: &str, version: ServerVersion) -> InstanceAddress {
        let addr: InstanceAddress = address
            .parse()
            .unwrap_or_else(|_| InstanceAddress::new(address, 3306));
        let mut state = self.state.lock();
        state.next_server_id += 1;
        let server_id = 10 + state.next_server_id;

        let variables = [
            ("gtid_mode", "ON"),
            ("enforce_gtid_consistency", "ON"),
            ("log_replica_updates", "ON"),
            ("binlog_format", "ROW"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        state.nodes.insert(
            addr.clone(),
            MemoryNode {
                server_uuid: uuid::Uuid::new_v4().to_string(),
                server_id,
                version,
                reachable: true,
                gtid_executed: GtidSet::new(),
                gtid_purged: GtidSet::new(),
                group: None,
                member_state: GroupMemberState::Offline,
                last_group_name: None,
                channels: BTreeMap::new(),
                accounts: BTreeMap::new(),
                super_read_only: false,
                variables,
                applier_stalled: false,
                lock_owner: None,
            },
        );
        log::debug!("[{}] Memory node added (server_id={})", addr, server_id);
        addr
    }

    /// 节点宕机
    pub fn kill(&self, address: &InstanceAddress) {
        self.partition(std::slice::from_ref(address));
    }

    /// 多个节点同时失联
    pub fn partition(&self, addresses: &[InstanceAddress]) {
        let mut state = self.state.lock();
        for address in addresses {
            if let Some(node) = state.nodes.get_mut(address) {
                node.reachable = false;
                log::debug!("[{}] Memory node killed", address);
            }
        }
        state.propagate();
    }

    /// 节点重启：恢复可达，但不会自动回到组内
    pub fn restart(&self, address: &InstanceAddress) {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get_mut(address) {
            node.reachable = true;
            if let Some(group) = node.group.take() {
                node.last_group_name = Some(group);
            }
            node.member_state = GroupMemberState::Offline;
            node.lock_owner = None;
            log::debug!("[{}] Memory node restarted", address);
        }
        state.propagate();
    }

    /// 在节点上执行 `count` 个事务（组成员使用 group_name 作为 uuid）
    pub fn write_transactions(&self, address: &InstanceAddress, count: u64) -> GtidSet {
        let mut state = self.state.lock();
        let written = match state.nodes.get_mut(address) {
            Some(node) => {
                let uuid = node.group.clone().unwrap_or_else(|| node.server_uuid.clone());
                write_local(node, &uuid, count)
            }
            None => GtidSet::new(),
        };
        state.propagate();
        written
    }

    /// 写入只存在于该节点的事务（使用节点自身 server_uuid）
    pub fn inject_errant(&self, address: &InstanceAddress, count: u64) -> GtidSet {
        let mut state = self.state.lock();
        let written = match state.nodes.get_mut(address) {
            Some(node) => {
                let uuid = node.server_uuid.clone();
                write_local(node, &uuid, count)
            }
            None => GtidSet::new(),
        };
        state.propagate();
        written
    }

    /// 清除节点全部 binlog
    pub fn purge_binary_logs(&self, address: &InstanceAddress) {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get_mut(address) {
            node.gtid_purged = node.gtid_executed.clone();
        }
    }

    pub fn stall_applier(&self, address: &InstanceAddress, stalled: bool) {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get_mut(address) {
            node.applier_stalled = stalled;
        }
        state.propagate();
    }

    /// 让通道保存的密码失效，下一次连接返回 1045
    pub fn break_channel_auth(&self, address: &InstanceAddress, channel: &str) {
        let mut state = self.state.lock();
        if let Some(ch) = state
            .nodes
            .get_mut(address)
            .and_then(|n| n.channels.get_mut(channel))
        {
            ch.credentials.password = "invalidated-password".to_string();
        }
        state.propagate();
    }

    pub fn set_variable(&self, address: &InstanceAddress, name: &str, value: &str) {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get_mut(address) {
            node.variables.insert(name.to_string(), value.to_string());
        }
    }

    pub fn set_server_id(&self, address: &InstanceAddress, server_id: u32) {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get_mut(address) {
            node.server_id = server_id;
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // 只读观察（测试断言用）
    // ═══════════════════════════════════════════════════════════════════

    pub fn server_uuid(&self, address: &InstanceAddress) -> Option<String> {
        self.state.lock().nodes.get(address).map(|n| n.server_uuid.clone())
    }

    pub fn gtid_executed(&self, address: &InstanceAddress) -> GtidSet {
        self.state
            .lock()
            .nodes
            .get(address)
            .map(|n| n.gtid_executed.clone())
            .unwrap_or_default()
    }

    pub fn channel_source(&self, address: &InstanceAddress, channel: &str) -> Option<InstanceAddress> {
        self.state
            .lock()
            .nodes
            .get(address)
            .and_then(|n| n.channels.get(channel))
            .map(|c| c.source.clone())
    }

    pub fn channel_state(&self, address: &InstanceAddress, channel: &str) -> Option<ChannelState> {
        self.state
            .lock()
            .nodes
            .get(address)
            .and_then(|n| n.channels.get(channel))
            .map(|c| c.state)
    }

    /// 节点所在组的主节点
    pub fn group_primary(&self, address: &InstanceAddress) -> Option<InstanceAddress> {
        let state = self.state.lock();
        let group = state.nodes.get(address)?.group.as_ref()?;
        state.groups.get(group)?.primary.clone()
    }

    pub fn group_members(&self, address: &InstanceAddress) -> Vec<InstanceAddress> {
        let state = self.state.lock();
        state
            .nodes
            .get(address)
            .and_then(|n| n.group.as_ref())
            .and_then(|g| state.groups.get(g))
            .map(|g| g.members.clone())
            .unwrap_or_default()
    }

    pub fn is_group_member(&self, address: &InstanceAddress) -> bool {
        self.state
            .lock()
            .nodes
            .get(address)
            .map(|n| n.group.is_some())
            .unwrap_or(false)
    }

    pub fn super_read_only(&self, address: &InstanceAddress) -> bool {
        self.state
            .lock()
            .nodes
            .get(address)
            .map(|n| n.super_read_only)
            .unwrap_or(false)
    }

    pub fn has_account(&self, address: &InstanceAddress, user: &str) -> bool {
        self.state
            .lock()
            .nodes
            .get(address)
            .map(|n| n.accounts.contains_key(user))
            .unwrap_or(false)
    }
}

fn write_local(node: &mut MemoryNode, uuid: &str, count: u64) -> GtidSet {
    let start = node.gtid_executed.last_gno(uuid).unwrap_or(0) + 1;
    let mut written = GtidSet::new();
    if count > 0 {
        written.add_interval(uuid, start, start + count - 1);
        node.gtid_executed = node.gtid_executed.union(&written);
    }
    written
}

impl FleetState {
    fn reachable_node(&mut self, address: &InstanceAddress) -> Result<&mut MemoryNode> {
        match self.nodes.get_mut(address) {
            Some(node) if node.reachable => Ok(node),
            Some(_) => Err(TopologyError::unreachable(address, "Can't connect to server (connection refused)")),
            None => Err(TopologyError::unreachable(address, "Unknown host")),
        }
    }

    fn is_present(&self, address: &InstanceAddress, group: &str) -> bool {
        self.nodes
            .get(address)
            .map(|n| n.reachable && n.group.as_deref() == Some(group))
            .unwrap_or(false)
    }

    fn online_present(&self, group_name: &str) -> Vec<InstanceAddress> {
        match self.groups.get(group_name) {
            Some(group) => group
                .members
                .iter()
                .filter(|a| self.is_present(a, group_name))
                .filter(|a| {
                    self.nodes
                        .get(*a)
                        .map(|n| n.member_state == GroupMemberState::Online)
                        .unwrap_or(false)
                })
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    fn group_has_quorum(&self, group_name: &str) -> bool {
        match self.groups.get(group_name) {
            Some(group) => self.online_present(group_name).len() * 2 > group.members.len(),
            None => false,
        }
    }

    /// 组内一个视图变更事件
    fn record_view_change(&mut self, group_name: &str) {
        let online = self.online_present(group_name);
        let Some(group) = self.groups.get_mut(group_name) else {
            return;
        };
        group.view_seq += 1;
        let uuid = group
            .view_change_uuid
            .clone()
            .unwrap_or_else(|| group_name.to_string());
        let next = online
            .iter()
            .filter_map(|a| self.nodes.get(a))
            .filter_map(|n| n.gtid_executed.last_gno(&uuid))
            .max()
            .unwrap_or(0)
            + 1;
        for address in online {
            if let Some(node) = self.nodes.get_mut(&address) {
                if !node.applier_stalled {
                    node.gtid_executed.add(&uuid, next);
                }
            }
        }
    }

    fn leave_group(&mut self, address: &InstanceAddress) {
        let Some(node) = self.nodes.get_mut(address) else {
            return;
        };
        let Some(group_name) = node.group.take() else {
            return;
        };
        node.member_state = GroupMemberState::Offline;
        node.last_group_name = Some(group_name.clone());
        if let Some(group) = self.groups.get_mut(&group_name) {
            group.members.retain(|a| a != address);
            if group.primary.as_ref() == Some(address) {
                group.primary = None;
            }
            if group.members.is_empty() {
                self.groups.remove(&group_name);
                return;
            }
        }
        self.record_view_change(&group_name);
    }

    // ═══════════════════════════════════════════════════════════════════
    // 复制传播
    // ═══════════════════════════════════════════════════════════════════

    /// 反复推进组复制与异步通道，直到状态稳定
    fn propagate(&mut self) {
        for _ in 0..MAX_PROPAGATION_ROUNDS {
            let mut changed = self.propagate_groups();
            changed |= self.relocate_managed_channels();
            changed |= self.propagate_channels();
            if !changed {
                return;
            }
        }
        log::warn!("Memory fleet propagation did not settle");
    }

    fn propagate_groups(&mut self) -> bool {
        let mut changed = false;
        let names: Vec<String> = self.groups.keys().cloned().collect();

        for name in names {
            if !self.group_has_quorum(&name) {
                continue;
            }

            // 有多数派时驱逐失联成员
            let listed = self.groups.get(&name).map(|g| g.members.clone()).unwrap_or_default();
            let absent: Vec<InstanceAddress> = listed
                .iter()
                .filter(|a| !self.is_present(a, &name))
                .cloned()
                .collect();
            if !absent.is_empty() {
                if let Some(group) = self.groups.get_mut(&name) {
                    group.members.retain(|a| !absent.contains(a));
                    if group.primary.as_ref().map(|p| absent.contains(p)).unwrap_or(false) {
                        group.primary = None;
                    }
                }
                for address in &absent {
                    if let Some(node) = self.nodes.get_mut(address) {
                        if node.group.as_deref() == Some(name.as_str()) {
                            node.group = None;
                            node.last_group_name = Some(name.clone());
                        }
                    }
                }
                self.record_view_change(&name);
                changed = true;
            }

            let online = self.online_present(&name);

            // 选主
            if let Some(group) = self.groups.get_mut(&name) {
                let primary_ok = group
                    .primary
                    .as_ref()
                    .map(|p| online.contains(p))
                    .unwrap_or(false);
                if group.single_primary && !primary_ok {
                    group.primary = online.first().cloned();
                    if group.primary.is_some() {
                        changed = true;
                    }
                }
            }

            // 恢复中的成员追上后转为 ONLINE
            let members = self.groups.get(&name).map(|g| g.members.clone()).unwrap_or_default();
            let mut merged = GtidSet::new();
            for address in &online {
                if let Some(node) = self.nodes.get(address) {
                    merged = merged.union(&node.gtid_executed);
                }
            }
            let accounts = self.group_accounts(&name, &online);
            for address in &members {
                if !self.is_present(address, &name) {
                    continue;
                }
                if let Some(node) = self.nodes.get_mut(address) {
                    if node.applier_stalled {
                        continue;
                    }
                    if !merged.is_subset_of(&node.gtid_executed) {
                        node.gtid_executed = node.gtid_executed.union(&merged);
                        changed = true;
                    }
                    if node.member_state == GroupMemberState::Recovering {
                        node.member_state = GroupMemberState::Online;
                        changed = true;
                    }
                    if node.accounts != accounts {
                        node.accounts = accounts.clone();
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    /// 单主模式下以主节点的账号为准，多主模式取并集
    fn group_accounts(&self, name: &str, online: &[InstanceAddress]) -> BTreeMap<String, String> {
        let primary = self.groups.get(name).and_then(|g| g.primary.clone());
        if let Some(node) = primary.as_ref().and_then(|p| self.nodes.get(p)) {
            return node.accounts.clone();
        }
        let mut accounts = BTreeMap::new();
        for address in online {
            if let Some(node) = self.nodes.get(address) {
                accounts.extend(node.accounts.clone());
            }
        }
        accounts
    }

    /// managed 通道：接收端跟随本组主节点，源端跟随源组主节点
    fn relocate_managed_channels(&mut self) -> bool {
        let mut changed = false;

        let mut moves = Vec::new();
        for (address, node) in &self.nodes {
            let Some(group_name) = &node.group else {
                continue;
            };
            let Some(primary) = self.groups.get(group_name).and_then(|g| g.primary.clone()) else {
                continue;
            };
            if &primary == address {
                continue;
            }
            for (name, channel) in &node.channels {
                if channel.managed {
                    moves.push((address.clone(), primary.clone(), name.clone()));
                }
            }
        }
        for (from, to, name) in moves {
            let target_has = self
                .nodes
                .get(&to)
                .map(|n| n.channels.contains_key(&name))
                .unwrap_or(true);
            if target_has {
                continue;
            }
            let channel = self.nodes.get_mut(&from).and_then(|n| n.channels.remove(&name));
            if let (Some(channel), Some(target)) = (channel, self.nodes.get_mut(&to)) {
                log::debug!("[{}] Managed channel '{}' moved from {}", to, name, from);
                target.channels.insert(name, channel);
                changed = true;
            }
        }

        let primaries: BTreeMap<String, InstanceAddress> = self
            .groups
            .iter()
            .filter_map(|(name, g)| g.primary.clone().map(|p| (name.clone(), p)))
            .collect();
        for node in self.nodes.values_mut() {
            for channel in node.channels.values_mut() {
                if !channel.managed {
                    continue;
                }
                if let Some(primary) = channel.source_group.as_ref().and_then(|g| primaries.get(g)) {
                    if primary != &channel.source {
                        channel.source = primary.clone();
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    fn propagate_channels(&mut self) -> bool {
        let mut changed = false;
        let receivers: Vec<InstanceAddress> = self.nodes.keys().cloned().collect();

        for receiver in receivers {
            let channel_names: Vec<String> = match self.nodes.get(&receiver) {
                Some(node) if node.reachable => node.channels.keys().cloned().collect(),
                _ => continue,
            };

            for name in channel_names {
                let (source_addr, user, password, running) = match self
                    .nodes
                    .get(&receiver)
                    .and_then(|n| n.channels.get(&name))
                {
                    Some(c) => (
                        c.source.clone(),
                        c.credentials.user.clone(),
                        c.credentials.password.clone(),
                        c.running,
                    ),
                    None => continue,
                };

                let source = self
                    .nodes
                    .get(&source_addr)
                    .filter(|n| n.reachable)
                    .map(|n| (n.gtid_executed.clone(), n.gtid_purged.clone(), n.accounts.clone()));

                let receiver_exec = self
                    .nodes
                    .get(&receiver)
                    .map(|n| n.gtid_executed.clone())
                    .unwrap_or_default();

                let (state, error, payload) = if !running {
                    (ChannelState::Off, None, None)
                } else {
                    match source {
                        None => (
                            ChannelState::Connecting,
                            Some(ChannelError {
                                code: 2003,
                                message: format!("Can't connect to source {}", source_addr),
                            }),
                            None,
                        ),
                        Some((_, _, ref accounts)) if accounts.get(&user) != Some(&password) => (
                            ChannelState::Error,
                            Some(ChannelError {
                                code: ChannelError::ACCESS_DENIED,
                                message: format!("Access denied for user '{}'", user),
                            }),
                            None,
                        ),
                        Some((exec, purged, accounts)) => {
                            let missing = exec.subtract(&receiver_exec);
                            let lost = missing.intersection(&purged);
                            if !lost.is_empty() {
                                (
                                    ChannelState::Error,
                                    Some(ChannelError {
                                        code: ChannelError::SOURCE_PURGED,
                                        message: format!(
                                            "Source has purged required transactions: {}",
                                            lost
                                        ),
                                    }),
                                    None,
                                )
                            } else {
                                (ChannelState::On, None, Some((exec, accounts)))
                            }
                        }
                    }
                };

                let Some(node) = self.nodes.get_mut(&receiver) else {
                    continue;
                };
                // 接收线程不受 applier 停滞影响；applier 只回放 relay log
                let mut relay = GtidSet::new();
                if let Some(channel) = node.channels.get_mut(&name) {
                    if channel.state != state || channel.last_error != error {
                        channel.state = state;
                        channel.last_error = error;
                    }
                    if let Some((exec, _)) = &payload {
                        let fetched = exec.subtract(&receiver_exec);
                        if !fetched.is_subset_of(&channel.received) {
                            channel.received = channel.received.union(&fetched);
                            changed = true;
                        }
                    }
                    if running {
                        relay = channel.received.clone();
                    }
                }
                if node.applier_stalled {
                    continue;
                }
                if !relay.is_subset_of(&node.gtid_executed) {
                    node.gtid_executed = node.gtid_executed.union(&relay);
                    changed = true;
                }
                if let Some((_, accounts)) = payload {
                    for (user, password) in accounts {
                        if node.accounts.get(&user) != Some(&password) {
                            node.accounts.insert(user, password);
                            changed = true;
                        }
                    }
                }
            }
        }
        changed
    }

    // ═══════════════════════════════════════════════════════════════════
    // 控制命令
    // ═══════════════════════════════════════════════════════════════════

    fn start_group_replication(
        &mut self,
        address: &InstanceAddress,
        group_name: String,
        view_change_uuid: Option<String>,
        bootstrap: bool,
        single_primary: bool,
        recovery: Option<RecoveryMethod>,
    ) -> Result<()> {
        if let Some(current) = &self.reachable_node(address)?.group {
            return Err(TopologyError::InvalidState(format!(
                "Instance {} is already a member of group {}",
                address, current
            )));
        }

        if bootstrap {
            if !self.online_present(&group_name).is_empty() {
                return Err(TopologyError::InvalidState(format!(
                    "Group {} is already running; cannot bootstrap it again",
                    group_name
                )));
            }
            self.groups.insert(
                group_name.clone(),
                MemoryGroup {
                    view_change_uuid,
                    single_primary,
                    members: vec![address.clone()],
                    primary: single_primary.then(|| address.clone()),
                    view_seq: 0,
                },
            );
            let node = self.reachable_node(address)?;
            node.group = Some(group_name.clone());
            node.last_group_name = Some(group_name.clone());
            node.member_state = GroupMemberState::Online;
            self.record_view_change(&group_name);
            return Ok(());
        }

        if !self.group_has_quorum(&group_name) {
            return Err(TopologyError::unreachable(
                address,
                format!("no reachable members of group {} with quorum", group_name),
            ));
        }

        let online = self.online_present(&group_name);
        let donor = self
            .groups
            .get(&group_name)
            .and_then(|g| g.primary.clone())
            .filter(|p| online.contains(p))
            .or_else(|| online.first().cloned())
            .ok_or_else(|| TopologyError::InternalError("group has no donor".to_string()))?;
        let (donor_exec, donor_purged, donor_accounts) = match self.nodes.get(&donor) {
            Some(n) => (n.gtid_executed.clone(), n.gtid_purged.clone(), n.accounts.clone()),
            None => return Err(TopologyError::InternalError("donor vanished".to_string())),
        };

        let node = self.reachable_node(address)?;
        match recovery {
            Some(RecoveryMethod::Clone) => {
                node.gtid_executed = donor_exec.clone();
                node.gtid_purged = donor_exec.clone();
                node.accounts = donor_accounts;
            }
            _ => {
                let errant = node.gtid_executed.subtract(&donor_exec);
                if !errant.is_empty() {
                    return Err(TopologyError::RecoveryStateError(format!(
                        "The instance {} contains transactions not present in the group: {}",
                        address, errant
                    )));
                }
                let gap = donor_purged.subtract(&node.gtid_executed);
                if !gap.is_empty() {
                    node.member_state = GroupMemberState::Error;
                    return Err(TopologyError::RecoveryStateError(format!(
                        "Distributed recovery of {} failed: transactions {} were purged from donor {}",
                        address, gap, donor
                    )));
                }
            }
        }

        node.group = Some(group_name.clone());
        node.last_group_name = Some(group_name.clone());
        node.member_state = if node.applier_stalled {
            GroupMemberState::Recovering
        } else {
            GroupMemberState::Online
        };
        if let Some(group) = self.groups.get_mut(&group_name) {
            group.members.retain(|a| a != address);
            group.members.push(address.clone());
        }
        self.record_view_change(&group_name);
        Ok(())
    }

    fn apply(&mut self, address: &InstanceAddress, command: ControlCommand) -> Result<()> {
        match command {
            ControlCommand::StartGroupReplication {
                group_name,
                view_change_uuid,
                bootstrap,
                single_primary,
                recovery,
            } => self.start_group_replication(
                address,
                group_name,
                view_change_uuid,
                bootstrap,
                single_primary,
                recovery,
            )?,
            ControlCommand::StopGroupReplication => {
                self.reachable_node(address)?;
                self.leave_group(address);
            }
            ControlCommand::SetPrimary { server_uuid } => {
                let group_name = self.reachable_node(address)?.group.clone().ok_or_else(|| {
                    TopologyError::InvalidState(format!("Instance {} is not a group member", address))
                })?;
                let online = self.online_present(&group_name);
                let target = online
                    .iter()
                    .find(|a| {
                        self.nodes
                            .get(*a)
                            .map(|n| n.server_uuid.eq_ignore_ascii_case(&server_uuid))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .ok_or_else(|| {
                        TopologyError::InvalidState(format!(
                            "Member {} is not ONLINE in group {}",
                            server_uuid, group_name
                        ))
                    })?;
                if let Some(group) = self.groups.get_mut(&group_name) {
                    if !group.single_primary {
                        return Err(TopologyError::InvalidState(
                            "Group is running in multi-primary mode".to_string(),
                        ));
                    }
                    group.primary = Some(target);
                }
                self.record_view_change(&group_name);
            }
            ControlCommand::ForceMembers { members } => {
                let group_name = self.reachable_node(address)?.group.clone().ok_or_else(|| {
                    TopologyError::InvalidState(format!("Instance {} is not a group member", address))
                })?;
                let online = self.online_present(&group_name);
                if let Some(bad) = members.iter().find(|m| !online.contains(m)) {
                    return Err(TopologyError::InvalidState(format!(
                        "Instance {} is not ONLINE in the reachable partition",
                        bad
                    )));
                }
                let dropped: Vec<InstanceAddress> = match self.groups.get_mut(&group_name) {
                    Some(group) => {
                        let dropped = group
                            .members
                            .iter()
                            .filter(|a| !members.contains(a))
                            .cloned()
                            .collect();
                        group.members = members.clone();
                        if group.primary.as_ref().map(|p| !members.contains(p)).unwrap_or(true) {
                            group.primary = None;
                        }
                        dropped
                    }
                    None => Vec::new(),
                };
                for a in dropped {
                    if let Some(node) = self.nodes.get_mut(&a) {
                        if node.group.as_deref() == Some(group_name.as_str()) {
                            node.group = None;
                            node.member_state = GroupMemberState::Offline;
                            node.last_group_name = Some(group_name.clone());
                        }
                    }
                }
                self.record_view_change(&group_name);
            }
            ControlCommand::CreateReplicationAccount { credentials }
            | ControlCommand::SetReplicationPassword { credentials } => {
                self.reachable_node(address)?
                    .accounts
                    .insert(credentials.user, credentials.password);
            }
            ControlCommand::DropReplicationAccount { user } => {
                self.reachable_node(address)?.accounts.remove(&user);
            }
            ControlCommand::ChangeReplicationSource {
                channel,
                source,
                credentials,
                delay,
                managed,
            } => {
                let source_group = self
                    .nodes
                    .get(&source)
                    .and_then(|n| n.group.clone().or_else(|| n.last_group_name.clone()));
                let node = self.reachable_node(address)?;
                if node.group.is_some() && !managed {
                    return Err(TopologyError::InvalidState(format!(
                        "Instance {} is a group member; only managed channels are allowed",
                        address
                    )));
                }
                node.channels.insert(
                    channel,
                    MemoryChannel {
                        source,
                        source_group,
                        credentials,
                        delay,
                        running: false,
                        managed,
                        state: ChannelState::Off,
                        last_error: None,
                        received: GtidSet::new(),
                    },
                );
            }
            ControlCommand::StartReplica { channel } => {
                let node = self.reachable_node(address)?;
                let ch = node.channels.get_mut(&channel).ok_or_else(|| {
                    TopologyError::ReplicationChannelError(format!(
                        "Replication channel '{}' does not exist on {}",
                        channel, address
                    ))
                })?;
                ch.running = true;
            }
            ControlCommand::StopReplica { channel } => {
                if let Some(ch) = self.reachable_node(address)?.channels.get_mut(&channel) {
                    ch.running = false;
                    ch.state = ChannelState::Off;
                    ch.last_error = None;
                }
            }
            ControlCommand::ResetReplica { channel } => {
                self.reachable_node(address)?.channels.remove(&channel);
            }
            ControlCommand::Clone { donor } => {
                let (exec, accounts) = match self.nodes.get(&donor) {
                    Some(n) if n.reachable => (n.gtid_executed.clone(), n.accounts.clone()),
                    _ => return Err(TopologyError::unreachable(&donor, "clone donor is not reachable")),
                };
                let node = self.reachable_node(address)?;
                if node.group.is_some() {
                    return Err(TopologyError::InvalidState(format!(
                        "Cannot clone into {} while it is a group member",
                        address
                    )));
                }
                node.gtid_executed = exec.clone();
                node.gtid_purged = exec;
                node.accounts = accounts;
            }
            ControlCommand::SetSuperReadOnly { enabled } => {
                self.reachable_node(address)?.super_read_only = enabled;
            }
            ControlCommand::AcquireLock { owner } => {
                let node = self.reachable_node(address)?;
                match &node.lock_owner {
                    Some(current) if current != &owner => {
                        return Err(TopologyError::InvalidState(format!(
                            "Instance {} is locked by another operation ({})",
                            address, current
                        )));
                    }
                    _ => node.lock_owner = Some(owner),
                }
            }
            ControlCommand::ReleaseLock { owner } => {
                let node = self.reachable_node(address)?;
                if node.lock_owner.as_deref() == Some(owner.as_str()) {
                    node.lock_owner = None;
                }
            }
            ControlCommand::SetVariable { name, value } => {
                self.reachable_node(address)?.variables.insert(name, value);
            }
        }
        Ok(())
    }

    fn status(&self, address: &InstanceAddress) -> Result<InstanceStatus> {
        let node = match self.nodes.get(address) {
            Some(node) if node.reachable => node,
            Some(_) => {
                return Err(TopologyError::unreachable(
                    address,
                    "Can't connect to server (connection refused)",
                ))
            }
            None => return Err(TopologyError::unreachable(address, "Unknown host")),
        };

        let group = node.group.as_ref().and_then(|name| {
            let g = self.groups.get(name)?;
            let members = g
                .members
                .iter()
                .map(|a| {
                    let (uuid, state) = match self.nodes.get(a) {
                        Some(n) if self.is_present(a, name) => (n.server_uuid.clone(), n.member_state),
                        Some(n) => (n.server_uuid.clone(), GroupMemberState::Unreachable),
                        None => (String::new(), GroupMemberState::Unreachable),
                    };
                    let role = if !g.single_primary || g.primary.as_ref() == Some(a) {
                        MemberRole::Primary
                    } else {
                        MemberRole::Secondary
                    };
                    GroupMember {
                        address: a.clone(),
                        server_uuid: uuid,
                        state,
                        role,
                    }
                })
                .collect();
            Some(GroupView {
                group_name: name.clone(),
                view_change_uuid: g.view_change_uuid.clone(),
                view_id: format!("1:{}", g.view_seq),
                single_primary: g.single_primary,
                members,
            })
        });

        let channels = node
            .channels
            .iter()
            .map(|(name, c)| {
                let (receiver, applier) = match c.state {
                    ChannelState::On => (ThreadState::On, ThreadState::On),
                    ChannelState::Connecting => (ThreadState::Connecting, ThreadState::On),
                    ChannelState::Error => (ThreadState::Off, ThreadState::On),
                    ChannelState::Off => (ThreadState::Off, ThreadState::Off),
                };
                ChannelStatus {
                    name: name.clone(),
                    source: c.source.clone(),
                    state: c.state,
                    receiver,
                    applier: if node.applier_stalled { ThreadState::Off } else { applier },
                    delay: c.delay,
                    last_error: c.last_error.clone(),
                    user: c.credentials.user.clone(),
                    managed: c.managed,
                    received_gtid_set: c.received.clone(),
                }
            })
            .collect();

        Ok(InstanceStatus {
            address: address.clone(),
            server_uuid: node.server_uuid.clone(),
            server_id: node.server_id,
            version: node.version,
            gtid_executed: node.gtid_executed.clone(),
            gtid_purged: node.gtid_purged.clone(),
            group,
            member_state: node.member_state,
            last_group_name: node.last_group_name.clone(),
            channels,
            super_read_only: node.super_read_only,
            variables: node.variables.clone(),
        })
    }
}

impl NodeClient for MemoryFleet {
    fn get_status(&self, instance: &InstanceAddress) -> Result<InstanceStatus> {
        self.state.lock().status(instance)
    }

    fn apply_control(&self, instance: &InstanceAddress, command: ControlCommand) -> Result<()> {
        log::trace!("[{}] {}", instance, command.name());
        let mut state = self.state.lock();
        let result = state.apply(instance, command);
        state.propagate();
        result
    }

    /// 内存实现不阻塞：直接判断当前是否已应用
    fn wait_applied(
        &self,
        instance: &InstanceAddress,
        gtids: &GtidSet,
        _timeout: Option<Duration>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        state.propagate();
        let node = state.reachable_node(instance)?;
        Ok(gtids.is_subset_of(&node.gtid_executed))
    }
}
